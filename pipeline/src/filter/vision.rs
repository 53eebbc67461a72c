//! Image primitives used by the motion detector.
//!
//! Thin wrappers over `image` and `imageproc` so the detector reads as the
//! fixed sequence of steps it is.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contours::find_contours;
use imageproc::contrast::{threshold, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use platewatch_common::geometry::BoundingRect;

/// Resize by averaging the source area under each output pixel.
///
/// Downscaling weighs every source pixel by how much of it the output pixel
/// covers, which smooths sensor noise instead of aliasing it. Upscaling has
/// no area to average and falls back to bilinear filtering.
pub fn resize_area(src: &RgbImage, width: u32, height: u32) -> RgbImage {
    if width == 0 || height == 0 {
        return RgbImage::new(width, height);
    }
    if width > src.width() || height > src.height() {
        return imageops::resize(src, width, height, FilterType::Triangle);
    }
    if width == src.width() && height == src.height() {
        return src.clone();
    }

    let x_taps = area_taps(src.width(), width);
    let y_taps = area_taps(src.height(), height);

    // Horizontal pass into a float buffer of width x src.height.
    let mut rows = vec![[0f32; 3]; (width * src.height()) as usize];
    for y in 0..src.height() {
        for (dx, taps) in x_taps.iter().enumerate() {
            let mut acc = [0f32; 3];
            for &(sx, weight) in taps {
                let p = src.get_pixel(sx, y);
                for c in 0..3 {
                    acc[c] += p[c] as f32 * weight;
                }
            }
            rows[(y * width) as usize + dx] = acc;
        }
    }

    // Vertical pass.
    let mut out = RgbImage::new(width, height);
    for (dy, taps) in y_taps.iter().enumerate() {
        for dx in 0..width {
            let mut acc = [0f32; 3];
            for &(sy, weight) in taps {
                let p = rows[(sy * width + dx) as usize];
                for c in 0..3 {
                    acc[c] += p[c] * weight;
                }
            }
            out.put_pixel(
                dx,
                dy as u32,
                Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8)),
            );
        }
    }
    out
}

/// For each destination index, the source indices it covers and the share
/// of the destination pixel each one contributes. Requires `dst <= src`.
fn area_taps(src: u32, dst: u32) -> Vec<Vec<(u32, f32)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let start = d as f64 * scale;
            let end = (start + scale).min(src as f64);
            let mut taps = Vec::with_capacity(scale.ceil() as usize + 1);
            let mut s = start.floor() as u32;
            while (s as f64) < end && s < src {
                let lo = (s as f64).max(start);
                let hi = ((s + 1) as f64).min(end);
                if hi > lo {
                    taps.push((s, ((hi - lo) / scale) as f32));
                }
                s += 1;
            }
            taps
        })
        .collect()
}

pub fn grayscale(src: &RgbImage) -> GrayImage {
    imageops::grayscale(src)
}

/// Gaussian blur with the given standard deviation.
pub fn gaussian_blur(src: &GrayImage, sigma: f32) -> GrayImage {
    imageops::blur(src, sigma)
}

/// Per-pixel `|a - b|`. Both images must have the same dimensions.
pub fn abs_diff(a: &GrayImage, b: &GrayImage) -> GrayImage {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    GrayImage::from_fn(a.width(), a.height(), |x, y| {
        Luma([a.get_pixel(x, y)[0].abs_diff(b.get_pixel(x, y)[0])])
    })
}

/// Pixels strictly above `cutoff` become 255, the rest 0.
pub fn binarize(src: &GrayImage, cutoff: u8) -> GrayImage {
    threshold(src, cutoff, ThresholdType::Binary)
}

/// One dilation pass with a `(2 * radius + 1)` square structuring element.
pub fn dilate_square(src: &GrayImage, radius: u8) -> GrayImage {
    dilate(src, Norm::LInf, radius)
}

/// Bounding rectangle of every contour border, outer and hole alike, in the
/// order the borders are discovered (raster order of their first pixel).
pub fn contour_bounds(mask: &GrayImage) -> Vec<BoundingRect> {
    find_contours::<u32>(mask)
        .iter()
        .filter_map(|contour| BoundingRect::enclosing(contour.points.iter().map(|p| (p.x, p.y))))
        .collect()
}
