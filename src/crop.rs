//! Face crop metadata and paste-back compositing.
//!
//! Face detection and landmark extraction live behind the [`Cropper`] trait; the pipeline only
//! needs the crop's inverse affine transform and crop-space landmarks. This module also
//! implements the compositor that warps a generated crop-space frame back into the original
//! image and alpha-blends it there ("paste-back"), plus a side-by-side debug frame for visual QA.

use image::{imageops, imageops::FilterType, RgbImage};
use nalgebra::{Matrix2x3, Matrix3, Point2};
use ndarray::Array2;

use crate::error::Error;

/// Crop metadata, produced once per source image and read-only for the whole session.
#[derive(Debug, Clone)]
pub struct CropInfo {
    /// Affine transform from crop space to original image space.
    pub m_c2o: Matrix2x3<f32>,
    /// Facial landmarks in crop space (203 points).
    pub lmk_crop: Vec<Point2<f32>>,
    /// The cropped face, at the resolution the crop was made at.
    pub img_crop: RgbImage,
}

/// Face detection, cropping and landmark extraction.
///
/// Implementations typically wrap an external face detector and landmark network; the pipeline
/// treats them as opaque.
pub trait Cropper {
    /// Detects the face in `image` and returns the crop metadata.
    ///
    /// Fails with [`Error::NoFaceDetected`] when no face is found; there is no retry.
    fn crop(&self, image: &RgbImage) -> Result<CropInfo, Error>;

    /// Extracts the 203-point landmarks of a (driving) frame.
    fn landmarks(&self, image: &RgbImage) -> anyhow::Result<Vec<Point2<f32>>>;
}

/// Applies an affine transform to a point.
fn apply_affine(m: &Matrix2x3<f32>, x: f32, y: f32) -> (f32, f32) {
    (
        m[(0, 0)] * x + m[(0, 1)] * y + m[(0, 2)],
        m[(1, 0)] * x + m[(1, 1)] * y + m[(1, 2)],
    )
}

/// Inverts a 2×3 affine transform.
///
/// Returns `None` for degenerate transforms.
pub fn invert_affine(m: &Matrix2x3<f32>) -> Option<Matrix2x3<f32>> {
    #[rustfmt::skip]
    let full = Matrix3::new(
        m[(0, 0)], m[(0, 1)], m[(0, 2)],
        m[(1, 0)], m[(1, 1)], m[(1, 2)],
        0.0,       0.0,       1.0,
    );
    let inv = full.try_inverse()?;
    Some(Matrix2x3::new(
        inv[(0, 0)],
        inv[(0, 1)],
        inv[(0, 2)],
        inv[(1, 0)],
        inv[(1, 1)],
        inv[(1, 2)],
    ))
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Option<[f32; 3]> {
    let (w, h) = image.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return None;
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let mut out = [0.0; 3];
    for c in 0..3 {
        let p00 = image.get_pixel(x0, y0)[c] as f32;
        let p10 = image.get_pixel(x1, y0)[c] as f32;
        let p01 = image.get_pixel(x0, y1)[c] as f32;
        let p11 = image.get_pixel(x1, y1)[c] as f32;
        let top = p00 + (p10 - p00) * fx;
        let bottom = p01 + (p11 - p01) * fx;
        out[c] = top + (bottom - top) * fy;
    }
    Some(out)
}

/// Warps `src` with the affine transform `m` (mapping source to destination coordinates) into an
/// image of size `dsize`, sampling bilinearly. Unmapped pixels stay black.
pub fn warp_affine(src: &RgbImage, m: &Matrix2x3<f32>, dsize: (u32, u32)) -> Option<RgbImage> {
    let inv = invert_affine(m)?;
    let mut dst = RgbImage::new(dsize.0, dsize.1);
    for (x, y, pixel) in dst.enumerate_pixels_mut() {
        let (sx, sy) = apply_affine(&inv, x as f32, y as f32);
        if let Some(rgb) = sample_bilinear(src, sx, sy) {
            *pixel = image::Rgb(rgb.map(|v| v.round() as u8));
        }
    }
    Some(dst)
}

/// Computes the paste-back blend mask, once per session.
///
/// `mask_crop` is an optional crop-space mask with values in 0..=1 (shape `(h, w)`); without one,
/// the whole crop rectangle of size `crop_size` is used. The mask is warped into original image
/// space via `m_c2o`; pixels outside the crop end up fully transparent.
pub fn prepare_paste_back(
    mask_crop: Option<&Array2<f32>>,
    crop_size: (u32, u32),
    m_c2o: &Matrix2x3<f32>,
    dsize: (u32, u32),
) -> Option<Array2<f32>> {
    let inv = invert_affine(m_c2o)?;
    let (cw, ch) = match mask_crop {
        Some(m) => (m.ncols(), m.nrows()),
        None => (crop_size.0 as usize, crop_size.1 as usize),
    };

    let mut mask = Array2::zeros((dsize.1 as usize, dsize.0 as usize));
    for y in 0..dsize.1 as usize {
        for x in 0..dsize.0 as usize {
            let (sx, sy) = apply_affine(&inv, x as f32, y as f32);
            if sx < 0.0 || sy < 0.0 || sx > (cw - 1) as f32 || sy > (ch - 1) as f32 {
                continue;
            }
            mask[(y, x)] = match mask_crop {
                Some(m) => {
                    // Nearest-neighbor is plenty for a soft blend mask.
                    m[(sy.round() as usize, sx.round() as usize)]
                }
                None => 1.0,
            };
        }
    }
    Some(mask)
}

/// Warps a generated crop-space frame into the original image and alpha-blends it using the
/// precomputed mask.
///
/// `generated` must be in the same coordinate space as the crop `m_c2o` was computed for.
pub fn paste_back(
    generated: &RgbImage,
    m_c2o: &Matrix2x3<f32>,
    original: &RgbImage,
    mask: &Array2<f32>,
) -> Option<RgbImage> {
    let (w, h) = original.dimensions();
    debug_assert_eq!(mask.dim(), (h as usize, w as usize));

    let warped = warp_affine(generated, m_c2o, (w, h))?;
    let mut out = original.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let alpha = mask[(y as usize, x as usize)];
        if alpha <= 0.0 {
            continue;
        }
        let gen = warped.get_pixel(x, y);
        for c in 0..3 {
            let blended = alpha * gen[c] as f32 + (1.0 - alpha) * pixel[c] as f32;
            pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
        }
    }
    Some(out)
}

/// Assembles a side-by-side debug frame: driving frame | crop-space input | generated crop.
///
/// All tiles are resized to the generated frame's dimensions. Purely diagnostic; does not affect
/// the primary output.
pub fn concat_frame(driving: &RgbImage, source_crop: &RgbImage, generated: &RgbImage) -> RgbImage {
    let (w, h) = generated.dimensions();
    let mut out = RgbImage::new(w * 3, h);
    for (i, tile) in [driving, source_crop, generated].into_iter().enumerate() {
        let resized;
        let tile = if tile.dimensions() == (w, h) {
            tile
        } else {
            resized = imageops::resize(tile, w, h, FilterType::Triangle);
            &resized
        };
        imageops::replace(&mut out, tile, (i as u32 * w) as i64, 0);
    }
    out
}

/// Shrinks an image so that neither dimension exceeds `max_dim`, then trims both dimensions to
/// multiples of `division`.
pub fn resize_to_limit(image: &RgbImage, max_dim: u32, division: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let scale = if w.max(h) > max_dim {
        max_dim as f32 / w.max(h) as f32
    } else {
        1.0
    };
    let (mut new_w, mut new_h) = (
        (w as f32 * scale) as u32,
        (h as f32 * scale) as u32,
    );
    let division = division.max(1);
    new_w -= new_w % division;
    new_h -= new_h % division;

    if (new_w, new_h) == (w, h) {
        image.clone()
    } else {
        let resized = imageops::resize(image, new_w.max(1), new_h.max(1), FilterType::Triangle);
        log::debug!("resized source image from {w}x{h} to {new_w}x{new_h}");
        resized
    }
}
