use burn::backend::NdArray;
use burn::prelude::*;
use ndarray::{Array3, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tumorseg::data::{
    k_fold_splits, AugmentationConfig, AugmentationEngine, Case, LabelMap, NormalizationMode,
    Normalizer, PatchPair, PatchSampler, Volume,
};
use tumorseg::model::{LossConfig, SegmentationLoss};
use tumorseg::training::dice_score;

type TestBackend = NdArray;

fn cube_pair(size: usize, lo: usize, hi: usize) -> PatchPair {
    let label = Array3::from_shape_fn((size, size, size), |(z, y, x)| {
        u8::from((lo..hi).contains(&z) && (lo..hi).contains(&y) && (lo..hi).contains(&x))
    });
    let image = Array4::from_shape_fn((1, size, size, size), |(_, z, y, x)| {
        f32::from(label[[z, y, x]])
    });
    PatchPair {
        image,
        label,
        offset: [0; 3],
    }
}

fn only(config: AugmentationConfig) -> AugmentationConfig {
    AugmentationConfig {
        enabled: true,
        intensity_scale_prob: 0.0,
        intensity_shift_prob: 0.0,
        noise_prob: 0.0,
        ..config
    }
}

#[test]
fn test_patch_larger_than_volume_is_padded() {
    let image = Array4::from_elem((2, 5, 6, 7), 3.0);
    let mut label = Array3::zeros((5, 6, 7));
    label[[2, 3, 3]] = 1;
    let case = Case::new(
        "small",
        Volume::new(image, [1.0; 3]),
        LabelMap::new(label, [1.0; 3]),
    );

    let sampler = PatchSampler::new([16, 16, 16], 0.5, -5.0);
    let patch = sampler.sample(&case, &mut StdRng::seed_from_u64(0));

    assert_eq!(patch.image.shape(), &[2, 16, 16, 16]);
    assert_eq!(patch.spatial_shape(), [16, 16, 16]);
    let inside = patch.image.iter().filter(|&&v| v == 3.0).count();
    assert_eq!(inside, 2 * 5 * 6 * 7);
    assert!(patch.image.iter().all(|&v| v == 3.0 || v == -5.0));
    assert_eq!(patch.label.iter().filter(|&&v| v == 1).count(), 1);

    // before-padding (16-5)/2 = 5, (16-6)/2 = 5, (16-7)/2 = 4
    assert_eq!(patch.label[[7, 8, 7]], 1);
    assert_eq!(patch.image[[0, 5, 5, 4]], 3.0);
    assert_eq!(patch.image[[0, 4, 5, 4]], -5.0);
}

#[test]
fn test_normalizing_twice_matches_once() {
    let mut rng = StdRng::seed_from_u64(11);
    let data = Array4::from_shape_fn((3, 10, 10, 10), |(c, z, y, x)| {
        let brain = (2..8).contains(&z) && (2..8).contains(&y) && (2..8).contains(&x);
        if brain {
            50.0 * (c + 1) as f32 + rng.gen_range(1.0..100.0)
        } else {
            0.0
        }
    });
    let volume = Volume::new(data, [1.0; 3]);

    for sentinel in [0.0, -1.0, 2.5] {
        let normalizer = Normalizer::new(NormalizationMode::ZScore, sentinel);
        let once = normalizer.normalize(&volume);
        let twice = normalizer.normalize(&once);
        for (a, b) in once.data().iter().zip(twice.data().iter()) {
            assert!((a - b).abs() < 1e-4, "sentinel {}: {} vs {}", sentinel, a, b);
        }

        let stats = normalizer.compute_stats(&once);
        assert_eq!(stats.foreground_voxels, 6 * 6 * 6);
        for c in 0..3 {
            assert!(stats.mean[c].abs() < 1e-4);
            assert!((stats.std[c] - 1.0).abs() < 1e-4);
        }
    }
}

#[test]
fn test_min_max_maps_foreground_to_unit_range() {
    let data = Array4::from_shape_fn((1, 6, 6, 6), |(_, z, y, x)| {
        if z > 0 { (z * 36 + y * 6 + x) as f32 } else { 0.0 }
    });
    let volume = Volume::new(data, [1.0; 3]);
    let scaled = Normalizer::new(NormalizationMode::MinMax, -1.0).normalize(&volume);

    for ((_, z, _, _), &v) in scaled.data().indexed_iter() {
        if z == 0 {
            assert_eq!(v, -1.0);
        } else {
            assert!((0.0..=1.0).contains(&v));
        }
    }
    assert_eq!(scaled.data()[[0, 5, 5, 5]], 1.0);
    assert_eq!(scaled.data()[[0, 1, 0, 0]], 0.0);
}

#[test]
fn test_flips_keep_voxel_correspondence() {
    let mut pair = cube_pair(12, 1, 5);
    pair.image[[0, 1, 1, 1]] = 0.75;
    let engine = AugmentationEngine::new(
        only(AugmentationConfig {
            flip_prob: 1.0,
            rotation_prob: 0.0,
            affine_prob: 0.0,
            elastic_prob: 0.0,
            ..AugmentationConfig::default()
        }),
        0.0,
    );

    let out = engine.apply(pair, &mut StdRng::seed_from_u64(2));
    for ((z, y, x), &l) in out.label.indexed_iter() {
        assert_eq!(out.image[[0, z, y, x]] > 0.0, l == 1);
    }
    // all three axes flipped
    assert_eq!(out.image[[0, 10, 10, 10]], 0.75);
}

#[test]
fn test_rotations_keep_voxel_correspondence() {
    let engine = AugmentationEngine::new(
        only(AugmentationConfig {
            flip_prob: 0.0,
            rotation_prob: 1.0,
            max_rotation_deg: 15.0,
            affine_prob: 1.0,
            elastic_prob: 0.0,
            ..AugmentationConfig::default()
        }),
        0.0,
    );
    let mut rng = StdRng::seed_from_u64(5);

    for _ in 0..5 {
        let out = engine.apply(cube_pair(20, 4, 16), &mut rng);
        let from_image = out.image.index_axis(ndarray::Axis(0), 0).mapv(|v| v >= 0.5);
        let from_label = out.label.mapv(|l| l == 1);
        assert!(from_label.iter().any(|&m| m));
        let overlap = dice_score(from_image.view(), from_label.view());
        assert!(overlap > 0.9, "image/label overlap {}", overlap);
    }
}

#[test]
fn test_dice_loss_properties() {
    let device = Default::default();
    let loss = SegmentationLoss::new(LossConfig {
        background_weight: 1.0,
        ..LossConfig::default()
    });

    let labels: Vec<usize> = (0..2 * 4 * 4 * 4).map(|i| (i * 7) % 3).collect();
    let mut one_hot = vec![0.0f32; 2 * 3 * 64];
    for (i, &class) in labels.iter().enumerate() {
        let (b, voxel) = (i / 64, i % 64);
        one_hot[b * 3 * 64 + class * 64 + voxel] = 1.0;
    }
    let targets = Tensor::<TestBackend, 5>::from_data(TensorData::new(one_hot, [2, 3, 4, 4, 4]), &device);

    let perfect = loss
        .dice_loss(targets.clone(), targets.clone())
        .into_scalar()
        .elem::<f32>();
    assert!(perfect.abs() < 1e-5);

    let logits = Tensor::<TestBackend, 5>::random(
        [2, 3, 4, 4, 4],
        burn::tensor::Distribution::Normal(0.0, 3.0),
        &device,
    );
    let probs = burn::tensor::activation::softmax(logits.clone(), 1);
    let per_class: Vec<f32> = loss
        .dice_per_class(probs, targets.clone())
        .into_data()
        .to_vec()
        .unwrap();
    assert!(per_class.iter().all(|&d| (0.0..=1.0).contains(&d)));

    let (total, dice, ce) = loss.forward(logits, targets).values();
    assert!(ce >= 0.0);
    assert!((0.0..=1.0).contains(&dice));
    assert!((total - (dice + ce)).abs() < 1e-4);
}

#[test]
fn test_k_fold_partitions_cases() {
    let folds = k_fold_splits(23, 5, 42).unwrap();
    assert_eq!(folds.len(), 5);

    let mut seen: Vec<usize> = folds.iter().flat_map(|f| f.val.clone()).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..23).collect::<Vec<_>>());

    for fold in &folds {
        assert_eq!(fold.train.len() + fold.val.len(), 23);
        assert!(fold.val.iter().all(|v| !fold.train.contains(v)));
    }
    assert_eq!(folds, k_fold_splits(23, 5, 42).unwrap());
    assert!(k_fold_splits(3, 5, 42).is_err());
}
