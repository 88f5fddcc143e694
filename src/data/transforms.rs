use ndarray::{Array3, Array4, ArrayView3, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::data::sampler::PatchPair;
use crate::error::{Result, SegError};

/// Sample positions this close outside the volume still count as inside.
const EDGE_TOLERANCE: f32 = 1e-3;

/// Probabilities and magnitudes of the random patch transforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    pub enabled: bool,

    /// Probability of flipping, drawn independently per axis.
    pub flip_prob: f64,

    pub rotation_prob: f64,
    pub max_rotation_deg: f32,

    pub affine_prob: f64,
    /// Isotropic scale is drawn from `1 ± scale_range`.
    pub scale_range: f32,
    pub max_shear: f32,

    pub elastic_prob: f64,
    /// Control points per axis of the coarse displacement grid.
    pub elastic_grid: usize,
    /// Standard deviation of control point displacements, in voxels.
    pub elastic_magnitude: f32,

    pub intensity_scale_prob: f64,
    pub intensity_scale: f32,
    pub intensity_shift_prob: f64,
    pub intensity_shift: f32,
    pub noise_prob: f64,
    pub noise_std: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flip_prob: 0.5,
            rotation_prob: 0.2,
            max_rotation_deg: 15.0,
            affine_prob: 0.2,
            scale_range: 0.1,
            max_shear: 0.05,
            elastic_prob: 0.1,
            elastic_grid: 4,
            elastic_magnitude: 2.0,
            intensity_scale_prob: 0.3,
            intensity_scale: 0.1,
            intensity_shift_prob: 0.3,
            intensity_shift: 0.1,
            noise_prob: 0.1,
            noise_std: 0.05,
        }
    }
}

impl AugmentationConfig {
    /// Everything off; patches pass through unchanged.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let probs = [
            ("flip_prob", self.flip_prob),
            ("rotation_prob", self.rotation_prob),
            ("affine_prob", self.affine_prob),
            ("elastic_prob", self.elastic_prob),
            ("intensity_scale_prob", self.intensity_scale_prob),
            ("intensity_shift_prob", self.intensity_shift_prob),
            ("noise_prob", self.noise_prob),
        ];
        for (name, p) in probs {
            if !(0.0..=1.0).contains(&p) {
                return Err(SegError::config(format!("{} must be in [0, 1], got {}", name, p)));
            }
        }
        let magnitudes = [
            ("max_rotation_deg", self.max_rotation_deg),
            ("scale_range", self.scale_range),
            ("max_shear", self.max_shear),
            ("elastic_magnitude", self.elastic_magnitude),
            ("intensity_scale", self.intensity_scale),
            ("intensity_shift", self.intensity_shift),
            ("noise_std", self.noise_std),
        ];
        for (name, m) in magnitudes {
            if !m.is_finite() || m < 0.0 {
                return Err(SegError::config(format!("{} must be non-negative, got {}", name, m)));
            }
        }
        if self.scale_range >= 1.0 {
            return Err(SegError::config("scale_range must be below 1"));
        }
        if self.elastic_grid < 2 {
            return Err(SegError::config("elastic_grid needs at least 2 control points"));
        }
        Ok(())
    }
}

/// Label-preserving random transforms on patch pairs.
///
/// Spatial transforms act on image and label together: trilinear sampling for
/// the image, nearest neighbour for the label. Intensity transforms touch the
/// image only and leave background (sentinel) voxels alone.
#[derive(Debug, Clone)]
pub struct AugmentationEngine {
    config: AugmentationConfig,
    sentinel: f32,
}

type Matrix3 = [[f32; 3]; 3];

const IDENTITY: Matrix3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

impl AugmentationEngine {
    pub fn new(config: AugmentationConfig, sentinel: f32) -> Self {
        Self { config, sentinel }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    pub fn apply<R: Rng + ?Sized>(&self, pair: PatchPair, rng: &mut R) -> PatchPair {
        if !self.config.enabled {
            return pair;
        }

        let PatchPair {
            mut image,
            mut label,
            offset,
        } = pair;

        for axis in 0..3 {
            if rng.gen_bool(self.config.flip_prob) {
                image.invert_axis(Axis(axis + 1));
                label.invert_axis(Axis(axis));
            }
        }

        let mut matrix = IDENTITY;
        let mut warped = false;

        if rng.gen_bool(self.config.rotation_prob) {
            let axis = rng.gen_range(0..3);
            let max = self.config.max_rotation_deg.to_radians();
            let angle = if max > 0.0 { rng.gen_range(-max..=max) } else { 0.0 };
            matrix = matmul(&matrix, &rotation(axis, angle));
            warped = true;
        }

        if rng.gen_bool(self.config.affine_prob) {
            matrix = matmul(&matrix, &self.random_affine(rng));
            warped = true;
        }

        let displacement = if rng.gen_bool(self.config.elastic_prob) {
            warped = true;
            Some(self.random_displacement(label.dim(), rng))
        } else {
            None
        };

        if warped {
            let (warped_image, warped_label) =
                self.resample(&image, &label, &matrix, displacement.as_ref());
            image = warped_image;
            label = warped_label;
        }

        self.augment_intensity(&mut image, rng);

        PatchPair {
            image,
            label,
            offset,
        }
    }

    fn random_affine<R: Rng + ?Sized>(&self, rng: &mut R) -> Matrix3 {
        let range = self.config.scale_range;
        let scale = if range > 0.0 {
            1.0 + rng.gen_range(-range..=range)
        } else {
            1.0
        };
        let shear = self.config.max_shear;
        let mut m = [[0.0; 3]; 3];
        for (r, row) in m.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = if r == c {
                    scale
                } else if shear > 0.0 {
                    rng.gen_range(-shear..=shear)
                } else {
                    0.0
                };
            }
        }
        m
    }

    /// Smooth displacement field `[3, d, h, w]` interpolated from a coarse grid.
    fn random_displacement<R: Rng + ?Sized>(
        &self,
        shape: (usize, usize, usize),
        rng: &mut R,
    ) -> Array4<f32> {
        let g = self.config.elastic_grid;
        let sigma = self.config.elastic_magnitude;
        let coarse = Array4::from_shape_simple_fn((3, g, g, g), || {
            rng.sample::<f32, _>(StandardNormal) * sigma
        });

        let (d, h, w) = shape;
        let to_grid = |i: usize, n: usize| {
            if n > 1 {
                i as f32 * (g - 1) as f32 / (n - 1) as f32
            } else {
                0.0
            }
        };

        Array4::from_shape_fn((3, d, h, w), |(a, z, y, x)| {
            let p = [to_grid(z, d), to_grid(y, h), to_grid(x, w)];
            trilinear(coarse.index_axis(Axis(0), a), p).unwrap_or(0.0)
        })
    }

    /// Pull every output voxel from `M · (p - c) + c + u(p)` in the source.
    fn resample(
        &self,
        image: &Array4<f32>,
        label: &Array3<u8>,
        matrix: &Matrix3,
        displacement: Option<&Array4<f32>>,
    ) -> (Array4<f32>, Array3<u8>) {
        let (d, h, w) = label.dim();
        let channels = image.shape()[0];
        let center = [
            (d as f32 - 1.0) / 2.0,
            (h as f32 - 1.0) / 2.0,
            (w as f32 - 1.0) / 2.0,
        ];

        let mut out_image = Array4::from_elem((channels, d, h, w), self.sentinel);
        let mut out_label = Array3::<u8>::zeros((d, h, w));

        for z in 0..d {
            for y in 0..h {
                for x in 0..w {
                    let rel = [
                        z as f32 - center[0],
                        y as f32 - center[1],
                        x as f32 - center[2],
                    ];
                    let mut src = [0.0f32; 3];
                    for (a, s) in src.iter_mut().enumerate() {
                        *s = matrix[a][0] * rel[0]
                            + matrix[a][1] * rel[1]
                            + matrix[a][2] * rel[2]
                            + center[a];
                        if let Some(field) = displacement {
                            *s += field[[a, z, y, x]];
                        }
                    }

                    // image and label share one in/out decision
                    if !inside([d, h, w], src) {
                        continue;
                    }
                    for c in 0..channels {
                        if let Some(v) = trilinear(image.index_axis(Axis(0), c), src) {
                            out_image[[c, z, y, x]] = v;
                        }
                    }
                    out_label[[z, y, x]] = nearest(label.view(), src);
                }
            }
        }

        (out_image, out_label)
    }

    fn augment_intensity<R: Rng + ?Sized>(&self, image: &mut Array4<f32>, rng: &mut R) {
        let sentinel = self.sentinel;
        let channels = image.shape()[0];

        if rng.gen_bool(self.config.intensity_scale_prob) {
            let s = self.config.intensity_scale;
            for c in 0..channels {
                let factor = if s > 0.0 { 1.0 + rng.gen_range(-s..=s) } else { 1.0 };
                image
                    .index_axis_mut(Axis(0), c)
                    .iter_mut()
                    .filter(|v| **v != sentinel)
                    .for_each(|v| *v *= factor);
            }
        }

        if rng.gen_bool(self.config.intensity_shift_prob) {
            let s = self.config.intensity_shift;
            for c in 0..channels {
                let delta = if s > 0.0 { rng.gen_range(-s..=s) } else { 0.0 };
                image
                    .index_axis_mut(Axis(0), c)
                    .iter_mut()
                    .filter(|v| **v != sentinel)
                    .for_each(|v| *v += delta);
            }
        }

        if rng.gen_bool(self.config.noise_prob) {
            let std = self.config.noise_std;
            for v in image.iter_mut().filter(|v| **v != sentinel) {
                *v += rng.sample::<f32, _>(StandardNormal) * std;
            }
        }
    }
}

fn rotation(axis: usize, angle: f32) -> Matrix3 {
    let (sin, cos) = angle.sin_cos();
    let (i, j) = match axis {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    };
    let mut m = IDENTITY;
    m[i][i] = cos;
    m[i][j] = -sin;
    m[j][i] = sin;
    m[j][j] = cos;
    m
}

fn matmul(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut out = [[0.0; 3]; 3];
    for (r, row) in out.iter_mut().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = (0..3).map(|k| a[r][k] * b[k][c]).sum();
        }
    }
    out
}

/// Whether `p` lies within the voxel grid of `shape`, up to `EDGE_TOLERANCE`.
fn inside(shape: [usize; 3], p: [f32; 3]) -> bool {
    (0..3).all(|a| {
        let max = (shape[a] - 1) as f32;
        p[a] >= -EDGE_TOLERANCE && p[a] <= max + EDGE_TOLERANCE
    })
}

/// Trilinear sample; `None` outside the volume.
pub(crate) fn trilinear(data: ArrayView3<f32>, p: [f32; 3]) -> Option<f32> {
    let shape = data.shape();
    if !inside([shape[0], shape[1], shape[2]], p) {
        return None;
    }
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut t = [0.0f32; 3];

    for a in 0..3 {
        let max = (shape[a] - 1) as f32;
        let c = p[a].clamp(0.0, max);
        let f = c.floor();
        lo[a] = f as usize;
        hi[a] = (lo[a] + 1).min(shape[a] - 1);
        t[a] = c - f;
    }

    let mut acc = 0.0;
    for corner in 0..8 {
        let mut weight = 1.0;
        let mut idx = [0usize; 3];
        for a in 0..3 {
            if (corner >> a) & 1 == 1 {
                idx[a] = hi[a];
                weight *= t[a];
            } else {
                idx[a] = lo[a];
                weight *= 1.0 - t[a];
            }
        }
        if weight != 0.0 {
            acc += weight * data[idx];
        }
    }
    Some(acc)
}

/// Nearest-neighbour sample of a point already known to be `inside`.
fn nearest(data: ArrayView3<u8>, p: [f32; 3]) -> u8 {
    let shape = data.shape();
    let mut idx = [0usize; 3];
    for a in 0..3 {
        let max = (shape[a] - 1) as f32;
        idx[a] = p[a].round().clamp(0.0, max) as usize;
    }
    data[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pair() -> PatchPair {
        let image = Array4::from_shape_fn((2, 6, 5, 4), |(c, z, y, x)| {
            (c * 1000 + z * 100 + y * 10 + x) as f32 + 1.0
        });
        let label = Array3::from_shape_fn((6, 5, 4), |(z, y, x)| ((z + y + x) % 3) as u8);
        PatchPair {
            image,
            label,
            offset: [1, 2, 3],
        }
    }

    fn only(config: AugmentationConfig) -> AugmentationConfig {
        AugmentationConfig {
            enabled: true,
            ..config
        }
    }

    fn nothing() -> AugmentationConfig {
        AugmentationConfig {
            flip_prob: 0.0,
            rotation_prob: 0.0,
            affine_prob: 0.0,
            elastic_prob: 0.0,
            intensity_scale_prob: 0.0,
            intensity_shift_prob: 0.0,
            noise_prob: 0.0,
            ..AugmentationConfig::default()
        }
    }

    #[test]
    fn test_disabled_is_identity() {
        let engine = AugmentationEngine::new(AugmentationConfig::disabled(), 0.0);
        let out = engine.apply(pair(), &mut StdRng::seed_from_u64(0));
        assert_eq!(out, pair());
    }

    #[test]
    fn test_flip_all_axes_is_exact() {
        let config = only(AugmentationConfig {
            flip_prob: 1.0,
            ..nothing()
        });
        let engine = AugmentationEngine::new(config, 0.0);
        let src = pair();
        let out = engine.apply(src.clone(), &mut StdRng::seed_from_u64(0));

        for ((z, y, x), &l) in out.label.indexed_iter() {
            let (sz, sy, sx) = (5 - z, 4 - y, 3 - x);
            assert_eq!(l, src.label[[sz, sy, sx]]);
            assert_eq!(out.image[[1, z, y, x]], src.image[[1, sz, sy, sx]]);
        }
        assert_eq!(out.offset, src.offset);
    }

    #[test]
    fn test_zero_angle_rotation_is_identity() {
        let config = only(AugmentationConfig {
            rotation_prob: 1.0,
            max_rotation_deg: 0.0,
            ..nothing()
        });
        let engine = AugmentationEngine::new(config, 0.0);
        let out = engine.apply(pair(), &mut StdRng::seed_from_u64(5));
        assert_eq!(out.label, pair().label);
        for (a, b) in out.image.iter().zip(pair().image.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn test_same_seed_same_transform() {
        let engine = AugmentationEngine::new(AugmentationConfig::default(), 0.0);
        let a = engine.apply(pair(), &mut StdRng::seed_from_u64(11));
        let b = engine.apply(pair(), &mut StdRng::seed_from_u64(11));
        assert_eq!(a, b);
    }

    #[test]
    fn test_warps_keep_labels_in_range() {
        let config = only(AugmentationConfig {
            rotation_prob: 1.0,
            affine_prob: 1.0,
            elastic_prob: 1.0,
            ..nothing()
        });
        let engine = AugmentationEngine::new(config, -9.0);
        let out = engine.apply(pair(), &mut StdRng::seed_from_u64(2));
        assert_eq!(out.image.shape(), &[2, 6, 5, 4]);
        assert!(out.label.iter().all(|&v| v <= 2));
        assert!(out.image.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_rotated_border_pads_image_and_label_together() {
        let config = only(AugmentationConfig {
            rotation_prob: 1.0,
            max_rotation_deg: 15.0,
            ..nothing()
        });
        let engine = AugmentationEngine::new(config, -9.0);
        let mut rng = StdRng::seed_from_u64(8);
        let full = PatchPair {
            image: Array4::from_elem((1, 16, 16, 16), 1.0),
            label: Array3::from_elem((16, 16, 16), 1),
            offset: [0; 3],
        };

        for _ in 0..5 {
            let out = engine.apply(full.clone(), &mut rng);
            for ((z, y, x), &l) in out.label.indexed_iter() {
                let padded = out.image[[0, z, y, x]] == -9.0;
                assert_eq!(l == 1, !padded, "voxel {:?}", (z, y, x));
            }
        }
    }

    #[test]
    fn test_intensity_leaves_label_and_background() {
        let config = only(AugmentationConfig {
            intensity_scale_prob: 1.0,
            intensity_shift_prob: 1.0,
            noise_prob: 1.0,
            ..nothing()
        });
        let mut src = pair();
        src.image[[0, 0, 0, 0]] = 0.0;
        let engine = AugmentationEngine::new(config, 0.0);
        let out = engine.apply(src.clone(), &mut StdRng::seed_from_u64(4));
        assert_eq!(out.label, src.label);
        assert_eq!(out.image[[0, 0, 0, 0]], 0.0);
        assert_ne!(out.image, src.image);
    }

    #[test]
    fn test_trilinear_midpoint() {
        let data = Array3::from_shape_fn((2, 2, 2), |(z, _, _)| z as f32);
        assert_eq!(trilinear(data.view(), [0.5, 0.5, 0.5]), Some(0.5));
        assert_eq!(trilinear(data.view(), [1.5, 0.0, 0.0]), None);
    }

    #[test]
    fn test_validate_rejects_bad_probability() {
        let config = AugmentationConfig {
            flip_prob: 1.5,
            ..AugmentationConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(AugmentationConfig::default().validate().is_ok());
    }
}
