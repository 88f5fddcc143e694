use burn::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::data::dataset::VolumeSource;
use crate::data::normalize::Normalizer;
use crate::data::sampler::{PatchPair, PatchSampler};
use crate::data::volume::Case;
use crate::data::transforms::AugmentationEngine;
use crate::error::{Result, SegError};
use crate::training::state::CancelToken;

/// Patch pairs stacked on the host, ready for upload.
#[derive(Debug, Clone)]
pub struct HostBatch {
    /// `[batch, channels, d, h, w]`, row-major.
    pub images: Vec<f32>,
    /// `[batch, d, h, w]`, row-major.
    pub labels: Vec<u8>,
    pub batch_size: usize,
    pub channels: usize,
    pub patch_size: [usize; 3],
    pub case_ids: Vec<String>,
}

impl HostBatch {
    /// Stack pairs of identical shape.
    pub fn from_pairs(pairs: Vec<(String, PatchPair)>) -> Result<Self> {
        let Some((_, first)) = pairs.first() else {
            return Err(SegError::config("cannot build an empty batch"));
        };
        let channels = first.image.shape()[0];
        let patch_size = first.spatial_shape();
        let voxels: usize = patch_size.iter().product();

        let mut images = Vec::with_capacity(pairs.len() * channels * voxels);
        let mut labels = Vec::with_capacity(pairs.len() * voxels);
        let mut case_ids = Vec::with_capacity(pairs.len());

        for (id, pair) in &pairs {
            if pair.image.shape()[0] != channels || pair.spatial_shape() != patch_size {
                return Err(SegError::integrity(
                    id,
                    format!(
                        "patch shape {:?} differs from batch shape {:?}",
                        pair.image.shape(),
                        patch_size
                    ),
                ));
            }
            // iter() walks logical order, so flipped (negative stride) patches are fine
            images.extend(pair.image.iter().copied());
            labels.extend(pair.label.iter().copied());
            case_ids.push(id.clone());
        }

        Ok(Self {
            images,
            labels,
            batch_size: pairs.len(),
            channels,
            patch_size,
            case_ids,
        })
    }

    pub fn image_dims(&self) -> [usize; 5] {
        let [d, h, w] = self.patch_size;
        [self.batch_size, self.channels, d, h, w]
    }

    /// One-hot targets, `[batch, num_classes, d, h, w]`.
    ///
    /// A label outside `0..num_classes` is an integrity error for its case.
    pub fn one_hot(&self, num_classes: usize) -> Result<Vec<f32>> {
        let voxels: usize = self.patch_size.iter().product();
        let mut out = vec![0.0; self.batch_size * num_classes * voxels];
        for (i, &class) in self.labels.iter().enumerate() {
            let b = i / voxels;
            let v = i % voxels;
            let class = class as usize;
            if class >= num_classes {
                return Err(SegError::integrity(
                    &self.case_ids[b],
                    format!("label value {} outside of 0..{}", class, num_classes),
                ));
            }
            out[(b * num_classes + class) * voxels + v] = 1.0;
        }
        Ok(out)
    }

    pub fn images_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 5> {
        Tensor::from_data(TensorData::new(self.images.clone(), self.image_dims()), device)
    }

    pub fn targets_tensor<B: Backend>(
        &self,
        num_classes: usize,
        device: &B::Device,
    ) -> Result<Tensor<B, 5>> {
        let [b, _, d, h, w] = self.image_dims();
        Ok(Tensor::from_data(
            TensorData::new(self.one_hot(num_classes)?, [b, num_classes, d, h, w]),
            device,
        ))
    }

    pub fn foreground_fraction(&self) -> f32 {
        if self.labels.is_empty() {
            return 0.0;
        }
        self.labels.iter().filter(|&&v| v != 0).count() as f32 / self.labels.len() as f32
    }
}

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    /// Cases must carry this many modalities.
    pub in_channels: usize,
    /// Labels must lie in `0..num_classes`.
    pub num_classes: usize,
    pub batch_size: usize,
    pub samples_per_volume: usize,
    pub prefetch_batches: usize,
    pub skip_corrupt_cases: bool,
}

/// Produces shuffled, augmented patch batches on a background thread.
#[derive(Clone)]
pub struct PatchLoader {
    source: Arc<dyn VolumeSource>,
    normalizer: Normalizer,
    sampler: PatchSampler,
    augmentation: AugmentationEngine,
    settings: LoaderSettings,
}

impl PatchLoader {
    pub fn new(
        source: Arc<dyn VolumeSource>,
        normalizer: Normalizer,
        sampler: PatchSampler,
        augmentation: AugmentationEngine,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            source,
            normalizer,
            sampler,
            augmentation,
            settings,
        }
    }

    /// Number of batches one pass over `num_cases` cases yields.
    pub fn batches_per_epoch(&self, num_cases: usize) -> usize {
        let patches = num_cases * self.settings.samples_per_volume;
        patches.div_ceil(self.settings.batch_size.max(1))
    }

    /// Start the worker for one epoch over `ids`.
    ///
    /// All randomness (case order, patch offsets, augmentation) derives from `seed`.
    pub fn epoch(&self, ids: Vec<String>, seed: u64, cancel: CancelToken) -> Result<EpochBatches> {
        let depth = self.settings.prefetch_batches.max(1);
        let (tx, rx) = sync_channel(depth);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = self.clone();
        let worker_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("patch-prefetch".to_string())
            .spawn(move || worker.run(ids, seed, tx, cancel, worker_stop))?;

        Ok(EpochBatches {
            receiver: rx,
            handle: Some(handle),
            stop,
        })
    }

    fn run(
        &self,
        mut ids: Vec<String>,
        seed: u64,
        tx: SyncSender<Result<HostBatch>>,
        cancel: CancelToken,
        stop: Arc<AtomicBool>,
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        ids.shuffle(&mut rng);

        let batch_size = self.settings.batch_size.max(1);
        let mut pending: Vec<(String, PatchPair)> = Vec::with_capacity(batch_size);
        let halted = || cancel.is_cancelled() || stop.load(Ordering::Relaxed);

        for id in ids {
            if halted() {
                return;
            }

            let loaded = self.source.load(&id).and_then(|case| {
                case.validate(self.settings.in_channels, self.settings.num_classes)?;
                Ok(case)
            });
            let case = match loaded {
                Ok(case) => case,
                Err(e) if self.settings.skip_corrupt_cases && e.is_sample_local() => {
                    log::warn!("skipping case {}: {}", id, e);
                    continue;
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };

            let volume = self.normalizer.normalize(&case.volume);
            let case = Case::new(case.id, volume, case.label);

            for _ in 0..self.settings.samples_per_volume {
                let pair = self.sampler.sample(&case, &mut rng);
                let pair = self.augmentation.apply(pair, &mut rng);
                pending.push((case.id.clone(), pair));

                if pending.len() == batch_size {
                    let batch = HostBatch::from_pairs(std::mem::take(&mut pending));
                    if tx.send(batch).is_err() {
                        return;
                    }
                }
            }
        }

        if !pending.is_empty() && !halted() {
            let _ = tx.send(HostBatch::from_pairs(pending));
        }
    }
}

/// Batches of one epoch, in production order.
///
/// Dropping it stops the worker.
pub struct EpochBatches {
    receiver: Receiver<Result<HostBatch>>,
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Iterator for EpochBatches {
    type Item = Result<HostBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // drain until the worker hangs up so it never blocks on a full channel
        while self.receiver.recv().is_ok() {}
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("prefetch worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::InMemoryDataset;
    use crate::data::transforms::AugmentationConfig;
    use crate::data::volume::{LabelMap, Volume};
    use ndarray::{Array3, Array4};

    fn case(id: &str, shape: usize) -> Case {
        let image = Array4::from_elem((2, shape, shape, shape), 1.0);
        let mut label = Array3::zeros((shape, shape, shape));
        label[[1, 1, 1]] = 1;
        Case::new(id, Volume::new(image, [1.0; 3]), LabelMap::new(label, [1.0; 3]))
    }

    fn loader(cases: Vec<Case>, skip: bool) -> PatchLoader {
        PatchLoader::new(
            Arc::new(InMemoryDataset::from_cases(cases)),
            Normalizer::default(),
            PatchSampler::new([4, 4, 4], 0.5, 0.0),
            AugmentationEngine::new(AugmentationConfig::default(), 0.0),
            LoaderSettings {
                in_channels: 2,
                num_classes: 2,
                batch_size: 3,
                samples_per_volume: 2,
                prefetch_batches: 1,
                skip_corrupt_cases: skip,
            },
        )
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_batches_cover_all_patches() {
        let loader = loader(vec![case("a", 6), case("b", 5), case("c", 4)], false);
        let batches: Vec<HostBatch> = loader
            .epoch(ids(&["a", "b", "c"]), 1, CancelToken::new())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(batches.len(), loader.batches_per_epoch(3));
        assert_eq!(batches.iter().map(|b| b.batch_size).sum::<usize>(), 6);
        assert_eq!(batches[0].image_dims(), [3, 2, 4, 4, 4]);
        assert_eq!(batches[0].images.len(), 3 * 2 * 64);
    }

    #[test]
    fn test_same_seed_same_batches() {
        let loader = loader(vec![case("a", 6), case("b", 7)], false);
        let run = |seed| -> Vec<Vec<f32>> {
            loader
                .epoch(ids(&["a", "b"]), seed, CancelToken::new())
                .unwrap()
                .map(|b| b.unwrap().images)
                .collect()
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn test_missing_case_aborts_without_skip() {
        let loader = loader(vec![case("a", 6)], false);
        let results: Vec<_> = loader
            .epoch(ids(&["a", "ghost"]), 0, CancelToken::new())
            .unwrap()
            .collect();
        assert!(results.iter().any(|r| r.is_err()));
    }

    #[test]
    fn test_missing_case_skipped_when_allowed() {
        let loader = loader(vec![case("a", 6)], true);
        let batches: Vec<HostBatch> = loader
            .epoch(ids(&["a", "ghost"]), 0, CancelToken::new())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(batches.iter().map(|b| b.batch_size).sum::<usize>(), 2);
    }

    #[test]
    fn test_cancelled_epoch_yields_nothing() {
        let loader = loader(vec![case("a", 6)], false);
        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(loader.epoch(ids(&["a"]), 0, cancel).unwrap().count(), 0);
    }

    #[test]
    fn test_early_drop_does_not_hang() {
        let cases: Vec<Case> = (0..8).map(|i| case(&format!("c{}", i), 6)).collect();
        let names: Vec<String> = cases.iter().map(|c| c.id.clone()).collect();
        let loader = loader(cases, false);
        let mut epoch = loader.epoch(names, 0, CancelToken::new()).unwrap();
        assert!(epoch.next().is_some());
        drop(epoch);
    }

    #[test]
    fn test_one_hot_layout() {
        let pair = PatchPair {
            image: Array4::zeros((1, 1, 1, 2)),
            label: Array3::from_shape_vec((1, 1, 2), vec![0, 2]).unwrap(),
            offset: [0, 0, 0],
        };
        let batch = HostBatch::from_pairs(vec![("x".to_string(), pair)]).unwrap();
        assert_eq!(batch.one_hot(3).unwrap(), vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        assert!(matches!(
            batch.one_hot(2),
            Err(SegError::DataIntegrity { .. })
        ));
    }

    #[test]
    fn test_out_of_range_label_is_integrity_error() {
        let mut bad = case("bad", 6);
        bad.label = LabelMap::new(Array3::from_elem((6, 6, 6), 7), [1.0; 3]);

        let strict = loader(vec![bad.clone(), case("a", 6)], false);
        let results: Vec<_> = strict
            .epoch(ids(&["bad", "a"]), 3, CancelToken::new())
            .unwrap()
            .collect();
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(SegError::DataIntegrity { .. }))));

        let lenient = loader(vec![bad, case("a", 6)], true);
        let batches: Vec<HostBatch> = lenient
            .epoch(ids(&["bad", "a"]), 3, CancelToken::new())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert!(batches.iter().all(|b| b.case_ids.iter().all(|id| id == "a")));
        assert!(batches.iter().all(|b| b.labels.iter().all(|&l| l < 2)));
    }
}
