use burn::prelude::*;
use ndarray::{s, Array3, Array4, ArrayView5};

use crate::data::dataset::VolumeSource;
use crate::data::normalize::Normalizer;
use crate::data::sampler::{pad_image, padding_before};
use crate::data::volume::Case;
use crate::error::{Result, SegError};
use crate::model::UNet3d;
use crate::training::metrics::{CaseMetrics, MetricReport};

/// Floor for probabilities in the validation cross-entropy.
const PROB_EPS: f32 = 1e-7;

/// Patch-wise inference over a whole volume with overlap averaging.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    patch_size: [usize; 3],
    overlap: f32,
    batch_size: usize,
}

impl SlidingWindow {
    pub fn new(patch_size: [usize; 3], overlap: f32, batch_size: usize) -> Self {
        Self {
            patch_size,
            overlap: overlap.clamp(0.0, 0.95),
            batch_size: batch_size.max(1),
        }
    }

    /// Window starts along one axis; the last window is flush with the end.
    pub fn starts(&self, extent: usize, patch: usize) -> Vec<usize> {
        if extent <= patch {
            return vec![0];
        }
        let step = ((patch as f32 * (1.0 - self.overlap)).round() as usize).max(1);
        let mut starts: Vec<usize> = (0..=extent - patch).step_by(step).collect();
        if starts.last() != Some(&(extent - patch)) {
            starts.push(extent - patch);
        }
        starts
    }

    /// Averaged class probabilities `[K, D, H, W]` over the original extent.
    pub fn predict_probs<B: Backend>(
        &self,
        model: &UNet3d<B>,
        image: &Array4<f32>,
        num_classes: usize,
        fill: f32,
        device: &B::Device,
    ) -> Result<Array4<f32>> {
        let channels = image.shape()[0];
        let src = [image.shape()[1], image.shape()[2], image.shape()[3]];
        let padded = pad_image(image, self.patch_size, fill);
        let (_, d, h, w) = padded.dim();
        let [pd, ph, pw] = self.patch_size;

        let mut windows = Vec::new();
        for &z in &self.starts(d, pd) {
            for &y in &self.starts(h, ph) {
                for &x in &self.starts(w, pw) {
                    windows.push([z, y, x]);
                }
            }
        }

        let mut sum = Array4::<f32>::zeros((num_classes, d, h, w));
        let mut count = Array3::<f32>::zeros((d, h, w));

        for chunk in windows.chunks(self.batch_size) {
            let mut input = Vec::with_capacity(chunk.len() * channels * pd * ph * pw);
            for &[z, y, x] in chunk {
                input.extend(padded.slice(s![.., z..z + pd, y..y + ph, x..x + pw]).iter().copied());
            }
            let batch = Tensor::<B, 5>::from_data(
                TensorData::new(input, [chunk.len(), channels, pd, ph, pw]),
                device,
            );
            let probs: Vec<f32> = model
                .forward(batch)
                .into_data()
                .convert::<f32>()
                .to_vec()
                .map_err(|e| SegError::Tensor(format!("{:?}", e)))?;
            let probs = ArrayView5::from_shape((chunk.len(), num_classes, pd, ph, pw), &probs)
                .map_err(|e| SegError::Tensor(e.to_string()))?;

            for (window, &[z, y, x]) in probs.outer_iter().zip(chunk) {
                sum.slice_mut(s![.., z..z + pd, y..y + ph, x..x + pw])
                    .zip_mut_with(&window, |acc, &p| *acc += p);
                count
                    .slice_mut(s![z..z + pd, y..y + ph, x..x + pw])
                    .mapv_inplace(|c| c + 1.0);
            }
        }

        for mut class in sum.outer_iter_mut() {
            class.zip_mut_with(&count, |p, &c| {
                if c > 0.0 {
                    *p /= c;
                }
            });
        }

        let [bz, by, bx] = padding_before(src, self.patch_size);
        Ok(sum
            .slice(s![.., bz..bz + src[0], by..by + src[1], bx..bx + src[2]])
            .to_owned())
    }
}

/// Per-voxel argmax over the class axis.
pub fn argmax_classes(probs: &Array4<f32>) -> Array3<u8> {
    let (_, d, h, w) = probs.dim();
    Array3::from_shape_fn((d, h, w), |(z, y, x)| {
        let mut best = 0;
        let mut best_p = f32::NEG_INFINITY;
        for (c, &p) in probs.slice(s![.., z, y, x]).iter().enumerate() {
            if p > best_p {
                best_p = p;
                best = c;
            }
        }
        best as u8
    })
}

/// Full-volume validation: normalise, slide, argmax, score.
#[derive(Debug, Clone)]
pub struct Evaluator {
    window: SlidingWindow,
    normalizer: Normalizer,
    num_classes: usize,
}

/// Prediction and scores for one case.
#[derive(Debug, Clone)]
pub struct CasePrediction {
    pub prediction: Array3<u8>,
    pub metrics: CaseMetrics,
    /// Mean voxel-wise cross-entropy of the averaged probabilities.
    pub cross_entropy: f32,
}

impl Evaluator {
    pub fn new(window: SlidingWindow, normalizer: Normalizer, num_classes: usize) -> Self {
        Self {
            window,
            normalizer,
            num_classes,
        }
    }

    pub fn predict<B: Backend>(
        &self,
        model: &UNet3d<B>,
        case: &Case,
        device: &B::Device,
    ) -> Result<Array4<f32>> {
        let volume = self.normalizer.normalize(&case.volume);
        self.window.predict_probs(
            model,
            volume.data(),
            self.num_classes,
            self.normalizer.sentinel(),
            device,
        )
    }

    pub fn evaluate_case<B: Backend>(
        &self,
        model: &UNet3d<B>,
        case: &Case,
        device: &B::Device,
    ) -> Result<CasePrediction> {
        case.validate(case.volume.channels(), self.num_classes)?;
        let probs = self.predict(model, case, device)?;
        let prediction = argmax_classes(&probs);
        let truth = case.label.data();

        let mut ce = 0.0f64;
        for ((z, y, x), &class) in truth.indexed_iter() {
            let p = probs[[class as usize, z, y, x]];
            ce -= (p.max(PROB_EPS) as f64).ln();
        }
        let cross_entropy = (ce / truth.len().max(1) as f64) as f32;

        let metrics = CaseMetrics::compute(
            &case.id,
            prediction.view(),
            truth.view(),
            self.num_classes,
            case.volume.spacing(),
        );

        Ok(CasePrediction {
            prediction,
            metrics,
            cross_entropy,
        })
    }

    /// Score every listed case; corrupt cases are skipped only when allowed.
    pub fn evaluate<B: Backend>(
        &self,
        model: &UNet3d<B>,
        source: &dyn VolumeSource,
        ids: &[String],
        skip_corrupt: bool,
        device: &B::Device,
    ) -> Result<MetricReport> {
        self.evaluate_with(model, source, ids, skip_corrupt, device, |_, _| Ok(()))
    }

    /// Like [`Evaluator::evaluate`], handing each scored case to `on_case`.
    pub fn evaluate_with<B, F>(
        &self,
        model: &UNet3d<B>,
        source: &dyn VolumeSource,
        ids: &[String],
        skip_corrupt: bool,
        device: &B::Device,
        mut on_case: F,
    ) -> Result<MetricReport>
    where
        B: Backend,
        F: FnMut(&Case, &CasePrediction) -> Result<()>,
    {
        let mut cases = Vec::with_capacity(ids.len());
        let mut ce_sum = 0.0;

        for id in ids {
            let loaded = source.load(id).and_then(|case| {
                case.validate(case.volume.channels(), self.num_classes)?;
                Ok(case)
            });
            let case = match loaded {
                Ok(case) => case,
                Err(e) if skip_corrupt && e.is_sample_local() => {
                    log::warn!("skipping validation case {}: {}", id, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let result = self.evaluate_case(model, &case, device)?;
            log::debug!(
                "validated {}: dice {:?}, ce {:.4}",
                id,
                result.metrics.dice,
                result.cross_entropy
            );
            on_case(&case, &result)?;
            ce_sum += result.cross_entropy;
            cases.push(result.metrics);
        }

        if cases.is_empty() {
            return Err(SegError::config("no usable validation cases"));
        }

        let loss = ce_sum / cases.len() as f32;
        Ok(MetricReport::aggregate(&cases, Some(loss)))
    }
}
