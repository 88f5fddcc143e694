use serde::{Deserialize, Serialize};

use crate::data::volume::Volume;

/// Standard deviations below this are treated as 1.
const MIN_STD: f32 = 1e-8;

/// How foreground intensities are rescaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationMode {
    /// `(x - mean) / std` over foreground voxels.
    #[default]
    ZScore,
    /// `(x - min) / (max - min)` over foreground voxels.
    MinMax,
}

/// Per-channel statistics over the foreground (see [`Volume::foreground_mask`]).
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStats {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
    pub min: Vec<f32>,
    pub max: Vec<f32>,
    pub foreground_voxels: usize,
}

/// Per-channel intensity normalization restricted to brain voxels.
#[derive(Debug, Clone)]
pub struct Normalizer {
    mode: NormalizationMode,
    sentinel: f32,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(NormalizationMode::ZScore, 0.0)
    }
}

impl Normalizer {
    pub fn new(mode: NormalizationMode, sentinel: f32) -> Self {
        Self { mode, sentinel }
    }

    /// Value written to background voxels.
    pub fn sentinel(&self) -> f32 {
        self.sentinel
    }

    pub fn compute_stats(&self, volume: &Volume) -> ChannelStats {
        let mask = volume.foreground_mask(self.sentinel);
        let channels = volume.channels();
        let count = mask.iter().filter(|&&m| m).count();

        let mut mean = vec![0.0; channels];
        let mut std = vec![1.0; channels];
        let mut min = vec![0.0; channels];
        let mut max = vec![0.0; channels];

        if count == 0 {
            return ChannelStats {
                mean,
                std,
                min,
                max,
                foreground_voxels: 0,
            };
        }

        for (c, channel) in volume.data().outer_iter().enumerate() {
            let mut sum = 0.0f64;
            let mut lo = f32::INFINITY;
            let mut hi = f32::NEG_INFINITY;
            for (&v, _) in channel.iter().zip(mask.iter()).filter(|(_, &m)| m) {
                sum += v as f64;
                lo = lo.min(v);
                hi = hi.max(v);
            }
            let mu = sum / count as f64;

            let mut sq = 0.0f64;
            for (&v, _) in channel.iter().zip(mask.iter()).filter(|(_, &m)| m) {
                let d = v as f64 - mu;
                sq += d * d;
            }

            mean[c] = mu as f32;
            std[c] = (sq / count as f64).sqrt() as f32;
            min[c] = lo;
            max[c] = hi;
        }

        ChannelStats {
            mean,
            std,
            min,
            max,
            foreground_voxels: count,
        }
    }

    /// Rescale foreground voxels with precomputed statistics.
    ///
    /// The foreground mask is taken from `volume` itself.
    pub fn apply_with_stats(&self, volume: &Volume, stats: &ChannelStats) -> Volume {
        let mask = volume.foreground_mask(self.sentinel);
        let mut data = volume.data().clone();

        for (c, mut channel) in data.outer_iter_mut().enumerate() {
            let (offset, scale) = match self.mode {
                NormalizationMode::ZScore => (stats.mean[c], stats.std[c]),
                NormalizationMode::MinMax => (stats.min[c], stats.max[c] - stats.min[c]),
            };
            let scale = if scale.abs() < MIN_STD { 1.0 } else { scale };

            for (v, &m) in channel.iter_mut().zip(mask.iter()) {
                *v = if m { (*v - offset) / scale } else { self.sentinel };
            }
        }

        Volume::new(data, volume.spacing())
    }

    pub fn normalize(&self, volume: &Volume) -> Volume {
        let stats = self.compute_stats(volume);
        self.apply_with_stats(volume, &stats)
    }
}
