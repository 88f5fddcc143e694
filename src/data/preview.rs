use image::{Rgb, RgbImage};
use ndarray::{s, Array3, Array4};
use std::path::Path;

use crate::error::{Result, SegError};

/// Overlay colours for classes 1.. (class 0 is left transparent).
const PALETTE: [[u8; 3]; 6] = [
    [230, 60, 60],
    [60, 200, 80],
    [70, 110, 240],
    [240, 200, 50],
    [200, 80, 220],
    [60, 210, 210],
];

const OVERLAY_ALPHA: f32 = 0.45;

/// Write one axial slice (fixed last axis) of `image[channel]` as a PNG,
/// optionally blended with a class map.
pub fn write_slice_png(
    path: impl AsRef<Path>,
    image: &Array4<f32>,
    channel: usize,
    slice: usize,
    overlay: Option<&Array3<u8>>,
) -> Result<()> {
    let path = path.as_ref();
    let shape = image.shape();
    if channel >= shape[0] || slice >= shape[3] {
        return Err(SegError::config(format!(
            "slice ({}, {}) out of range for image shape {:?}",
            channel, slice, shape
        )));
    }
    if let Some(labels) = overlay {
        if labels.shape() != &shape[1..] {
            return Err(SegError::config(format!(
                "overlay shape {:?} does not match image shape {:?}",
                labels.shape(),
                &shape[1..]
            )));
        }
    }

    let plane = image.slice(s![channel, .., .., slice]);
    let (width, height) = (plane.shape()[0], plane.shape()[1]);

    let lo = plane.iter().cloned().fold(f32::INFINITY, f32::min);
    let hi = plane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let range = if hi > lo { hi - lo } else { 1.0 };

    let mut img = RgbImage::new(width as u32, height as u32);
    for ((x, y), &v) in plane.indexed_iter() {
        let gray = ((v - lo) / range * 255.0).clamp(0.0, 255.0);
        let mut rgb = [gray; 3];

        if let Some(labels) = overlay {
            let class = labels[[x, y, slice]] as usize;
            if class > 0 {
                let colour = PALETTE[(class - 1) % PALETTE.len()];
                for (c, out) in rgb.iter_mut().enumerate() {
                    *out = *out * (1.0 - OVERLAY_ALPHA) + colour[c] as f32 * OVERLAY_ALPHA;
                }
            }
        }

        // radiological view: rows run along y, flipped so anterior is up
        img.put_pixel(
            x as u32,
            (height - 1 - y) as u32,
            Rgb([rgb[0] as u8, rgb[1] as u8, rgb[2] as u8]),
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    img.save(path)
        .map_err(|e| SegError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    log::debug!("wrote preview {}", path.display());
    Ok(())
}
