use ndarray::{s, Array3, Array4, ArrayView3, ArrayView4};
use rand::Rng;

use crate::data::volume::Case;

/// Aligned image/label crop taken at one offset.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchPair {
    /// `[channels, d, h, w]`
    pub image: Array4<f32>,
    /// `[d, h, w]`
    pub label: Array3<u8>,
    /// Start of the window in the (padded) source volume.
    pub offset: [usize; 3],
}

impl PatchPair {
    pub fn spatial_shape(&self) -> [usize; 3] {
        let s = self.label.shape();
        [s[0], s[1], s[2]]
    }

    pub fn has_foreground(&self) -> bool {
        self.label.iter().any(|&v| v != 0)
    }
}

/// Foreground/background balanced patch extraction.
#[derive(Debug, Clone)]
pub struct PatchSampler {
    patch_size: [usize; 3],
    foreground_prob: f64,
    sentinel: f32,
}

impl PatchSampler {
    pub fn new(patch_size: [usize; 3], foreground_prob: f64, sentinel: f32) -> Self {
        Self {
            patch_size,
            foreground_prob: foreground_prob.clamp(0.0, 1.0),
            sentinel,
        }
    }

    pub fn patch_size(&self) -> [usize; 3] {
        self.patch_size
    }

    /// Draw one patch pair from `case`.
    ///
    /// Volumes smaller than the patch are padded symmetrically first, so the
    /// returned pair always has the configured size.
    pub fn sample<R: Rng + ?Sized>(&self, case: &Case, rng: &mut R) -> PatchPair {
        let src = case.label.spatial_shape();
        let needs_padding = (0..3).any(|a| src[a] < self.patch_size[a]);

        let padded;
        let (image, label) = if needs_padding {
            padded = pad_to_fit(
                case.volume.data(),
                case.label.data(),
                self.patch_size,
                self.sentinel,
            );
            (padded.0.view(), padded.1.view())
        } else {
            (case.volume.data().view(), case.label.data().view())
        };
        let (d, h, w) = label.dim();
        let shape = [d, h, w];

        let offset = if rng.gen_bool(self.foreground_prob) {
            let foreground: Vec<[usize; 3]> = label
                .indexed_iter()
                .filter(|(_, &v)| v != 0)
                .map(|((z, y, x), _)| [z, y, x])
                .collect();
            if foreground.is_empty() {
                self.uniform_offset(shape, rng)
            } else {
                let center = foreground[rng.gen_range(0..foreground.len())];
                self.centred_offset(shape, center)
            }
        } else {
            self.uniform_offset(shape, rng)
        };

        crop(image, label, offset, self.patch_size)
    }

    fn uniform_offset<R: Rng + ?Sized>(&self, shape: [usize; 3], rng: &mut R) -> [usize; 3] {
        let mut offset = [0; 3];
        for axis in 0..3 {
            let span = shape[axis] - self.patch_size[axis];
            offset[axis] = rng.gen_range(0..=span);
        }
        offset
    }

    fn centred_offset(&self, shape: [usize; 3], center: [usize; 3]) -> [usize; 3] {
        let mut offset = [0; 3];
        for axis in 0..3 {
            let half = self.patch_size[axis] / 2;
            let max_start = shape[axis] - self.patch_size[axis];
            offset[axis] = center[axis].saturating_sub(half).min(max_start);
        }
        offset
    }
}

/// Leading padding per axis that centres `src` inside `max(src, size)`.
pub fn padding_before(src: [usize; 3], size: [usize; 3]) -> [usize; 3] {
    [
        size[0].saturating_sub(src[0]) / 2,
        size[1].saturating_sub(src[1]) / 2,
        size[2].saturating_sub(src[2]) / 2,
    ]
}

/// Pad every axis shorter than `size` symmetrically with `fill`.
pub fn pad_image(image: &Array4<f32>, size: [usize; 3], fill: f32) -> Array4<f32> {
    let shape = image.shape();
    let src = [shape[1], shape[2], shape[3]];
    let padded = [src[0].max(size[0]), src[1].max(size[1]), src[2].max(size[2])];
    if padded == src {
        return image.clone();
    }

    let [bz, by, bx] = padding_before(src, size);
    let mut out = Array4::from_elem((shape[0], padded[0], padded[1], padded[2]), fill);
    out.slice_mut(s![.., bz..bz + src[0], by..by + src[1], bx..bx + src[2]])
        .assign(image);
    out
}

/// Pad every axis shorter than `size` symmetrically with background.
pub fn pad_label(label: &Array3<u8>, size: [usize; 3]) -> Array3<u8> {
    let (d, h, w) = label.dim();
    let src = [d, h, w];
    let padded = [src[0].max(size[0]), src[1].max(size[1]), src[2].max(size[2])];
    if padded == src {
        return label.clone();
    }

    let [bz, by, bx] = padding_before(src, size);
    let mut out = Array3::zeros((padded[0], padded[1], padded[2]));
    out.slice_mut(s![bz..bz + src[0], by..by + src[1], bx..bx + src[2]])
        .assign(label);
    out
}

/// Pad image (with `sentinel`) and label (with background) to at least `size`.
pub fn pad_to_fit(
    image: &Array4<f32>,
    label: &Array3<u8>,
    size: [usize; 3],
    sentinel: f32,
) -> (Array4<f32>, Array3<u8>) {
    (pad_image(image, size, sentinel), pad_label(label, size))
}

fn crop(
    image: ArrayView4<f32>,
    label: ArrayView3<u8>,
    offset: [usize; 3],
    size: [usize; 3],
) -> PatchPair {
    let [z, y, x] = offset;
    let [d, h, w] = size;
    PatchPair {
        image: image.slice(s![.., z..z + d, y..y + h, x..x + w]).to_owned(),
        label: label.slice(s![z..z + d, y..y + h, x..x + w]).to_owned(),
        offset,
    }
}
