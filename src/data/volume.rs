//! In-memory scan volumes and label maps.

use ndarray::{Array3, Array4};

use crate::error::{Result, SegError};

/// Tolerance used when comparing voxel spacings of co-registered arrays.
const SPACING_TOLERANCE: f32 = 1e-4;

/// Multi-channel intensity volume, `[channels, depth, height, width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array4<f32>,
    spacing: [f32; 3],
}

impl Volume {
    /// Wrap an intensity array with its voxel spacing (mm).
    pub fn new(data: Array4<f32>, spacing: [f32; 3]) -> Self {
        Self { data, spacing }
    }

    /// Raw intensities.
    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    /// Consume the volume and return its intensities.
    pub fn into_data(self) -> Array4<f32> {
        self.data
    }

    /// Number of modalities.
    pub fn channels(&self) -> usize {
        self.data.shape()[0]
    }

    /// `[depth, height, width]`.
    pub fn spatial_shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[1], s[2], s[3]]
    }

    /// Voxel spacing in mm.
    pub fn spacing(&self) -> [f32; 3] {
        self.spacing
    }

    /// Brain mask: some channel is non-zero and not every channel equals `background`.
    ///
    /// Voxels already filled with a background sentinel stay background.
    pub fn foreground_mask(&self, background: f32) -> Array3<bool> {
        let [d, h, w] = self.spatial_shape();
        let mut any_nonzero = Array3::from_elem((d, h, w), false);
        let mut all_background = Array3::from_elem((d, h, w), true);
        for ((_, z, y, x), &v) in self.data.indexed_iter() {
            if v != 0.0 {
                any_nonzero[[z, y, x]] = true;
            }
            if v != background {
                all_background[[z, y, x]] = false;
            }
        }
        any_nonzero.zip_mut_with(&all_background, |m, &bg| *m = *m && !bg);
        any_nonzero
    }
}

/// Integer class map, `[depth, height, width]`, co-registered with a [`Volume`].
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMap {
    data: Array3<u8>,
    spacing: [f32; 3],
}

impl LabelMap {
    /// Wrap a class-index array with its voxel spacing (mm).
    pub fn new(data: Array3<u8>, spacing: [f32; 3]) -> Self {
        Self { data, spacing }
    }

    /// Raw class indices.
    pub fn data(&self) -> &Array3<u8> {
        &self.data
    }

    /// `[depth, height, width]`.
    pub fn spatial_shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    /// Voxel spacing in mm.
    pub fn spacing(&self) -> [f32; 3] {
        self.spacing
    }

    /// Largest class index present.
    pub fn max_label(&self) -> u8 {
        self.data.iter().copied().max().unwrap_or(0)
    }

    /// Coordinates of every non-background voxel.
    pub fn foreground_voxels(&self) -> Vec<[usize; 3]> {
        self.data
            .indexed_iter()
            .filter(|(_, &v)| v != 0)
            .map(|((z, y, x), _)| [z, y, x])
            .collect()
    }
}

/// One training case: a volume and its label map.
#[derive(Debug, Clone)]
pub struct Case {
    /// Shared identifier of the image/label files.
    pub id: String,
    /// Intensities.
    pub volume: Volume,
    /// Ground truth.
    pub label: LabelMap,
}

impl Case {
    /// Pair a volume with its label map.
    pub fn new(id: impl Into<String>, volume: Volume, label: LabelMap) -> Self {
        Self {
            id: id.into(),
            volume,
            label,
        }
    }

    /// Check channel count, spatial agreement, spacing agreement and label range.
    ///
    /// Mismatches are never repaired here.
    pub fn validate(&self, expected_channels: usize, num_classes: usize) -> Result<()> {
        if self.volume.channels() != expected_channels {
            return Err(SegError::integrity(
                &self.id,
                format!(
                    "expected {} channels, found {}",
                    expected_channels,
                    self.volume.channels()
                ),
            ));
        }

        let image_shape = self.volume.spatial_shape();
        let label_shape = self.label.spatial_shape();
        if image_shape != label_shape {
            return Err(SegError::integrity(
                &self.id,
                format!(
                    "image spatial shape {:?} does not match label shape {:?}",
                    image_shape, label_shape
                ),
            ));
        }

        let spacing_matches = self
            .volume
            .spacing()
            .iter()
            .zip(self.label.spacing().iter())
            .all(|(a, b)| (a - b).abs() <= SPACING_TOLERANCE * a.abs().max(1.0));
        if !spacing_matches {
            return Err(SegError::integrity(
                &self.id,
                format!(
                    "image spacing {:?} does not match label spacing {:?}",
                    self.volume.spacing(),
                    self.label.spacing()
                ),
            ));
        }

        let max_label = self.label.max_label() as usize;
        if max_label >= num_classes {
            return Err(SegError::integrity(
                &self.id,
                format!(
                    "label value {} outside of 0..{}",
                    max_label, num_classes
                ),
            ));
        }

        Ok(())
    }
}
