//! Wrappers around the LivePortrait ONNX networks.
//!
//! The render pipeline only sees the [`ModelSuite`] trait; [`OnnxModelSuite`] implements it on
//! top of the publicly released LivePortrait ONNX export (appearance feature extractor, motion
//! extractor, warping module, SPADE generator, and the three stitching/retargeting heads).
//!
//! Everything in here is an opaque tensor-in/tensor-out collaborator as far as the keypoint
//! algebra is concerned.

use std::path::{Path, PathBuf};

use image::{imageops, imageops::FilterType, RgbImage};
use ndarray::{Array1, Array2, Array3, Array4, ArrayD};

use crate::keypoint::{keypoints_from_rows, keypoints_to_rows, KeypointInfo, KeypointSet};
use crate::nn::NeuralNetwork;
use crate::num::softmax_in_place;
use crate::retarget::{EyeRatio, LipRatio};

/// Identity feature volume extracted from the source portrait.
pub type Feature = ArrayD<f32>;

/// The set of externally trained networks the pipeline depends on.
///
/// All calls are blocking and failures are fatal to the current render; nothing here is retried.
pub trait ModelSuite {
    /// Runs the motion extractor on a portrait/frame image.
    fn extract_motion(&self, image: &RgbImage) -> anyhow::Result<KeypointInfo>;

    /// Extracts the source identity feature.
    fn extract_feature(&self, image: &RgbImage) -> anyhow::Result<Feature>;

    /// Reconciles a candidate keypoint set with the source keypoints.
    fn stitch(&self, x_s: &KeypointSet, x_candidate: &KeypointSet) -> anyhow::Result<KeypointSet>;

    /// Computes the eye retargeting delta for the given combined ratio.
    fn retarget_eye(&self, x_s: &KeypointSet, ratio: EyeRatio) -> anyhow::Result<KeypointSet>;

    /// Computes the lip retargeting delta for the given combined ratio.
    fn retarget_lip(&self, x_s: &KeypointSet, ratio: LipRatio) -> anyhow::Result<KeypointSet>;

    /// Warps the identity feature from `x_s` to `x_new` and decodes the result into an image.
    fn warp_decode(
        &self,
        feature: &Feature,
        x_s: &KeypointSet,
        x_new: &KeypointSet,
    ) -> anyhow::Result<RgbImage>;
}

/// File locations of the seven ONNX networks.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub appearance_feature_extractor: PathBuf,
    pub motion_extractor: PathBuf,
    pub warping: PathBuf,
    pub spade_generator: PathBuf,
    pub stitching: PathBuf,
    pub stitching_eye: PathBuf,
    pub stitching_lip: PathBuf,
}

impl ModelPaths {
    /// Locates the networks in a directory, using the file names of the public ONNX export.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            appearance_feature_extractor: dir.join("appearance_feature_extractor.onnx"),
            motion_extractor: dir.join("motion_extractor.onnx"),
            warping: dir.join("warping.onnx"),
            spade_generator: dir.join("spade_generator.onnx"),
            stitching: dir.join("stitching_retargeting.onnx"),
            stitching_eye: dir.join("stitching_retargeting_eye.onnx"),
            stitching_lip: dir.join("stitching_retargeting_lip.onnx"),
        }
    }
}

/// [`ModelSuite`] backed by the LivePortrait ONNX export, running on the CPU via tract.
pub struct OnnxModelSuite {
    motion: NeuralNetwork,
    appearance: NeuralNetwork,
    warping: NeuralNetwork,
    generator: NeuralNetwork,
    stitching: NeuralNetwork,
    stitching_eye: NeuralNetwork,
    stitching_lip: NeuralNetwork,
    input_shape: (u32, u32),
}

// Output node order of the motion extractor export.
const OUT_PITCH: usize = 0;
const OUT_YAW: usize = 1;
const OUT_ROLL: usize = 2;
const OUT_T: usize = 3;
const OUT_EXP: usize = 4;
const OUT_SCALE: usize = 5;
const OUT_KP: usize = 6;

impl OnnxModelSuite {
    /// Loads all networks from `paths`.
    pub fn load(paths: &ModelPaths, input_shape: (u32, u32)) -> anyhow::Result<Self> {
        log::info!("loading networks from {:?}", paths.motion_extractor.parent());
        Ok(Self {
            motion: NeuralNetwork::from_path(&paths.motion_extractor)?.load()?,
            appearance: NeuralNetwork::from_path(&paths.appearance_feature_extractor)?.load()?,
            warping: NeuralNetwork::from_path(&paths.warping)?.load()?,
            generator: NeuralNetwork::from_path(&paths.spade_generator)?.load()?,
            stitching: NeuralNetwork::from_path(&paths.stitching)?.load()?,
            stitching_eye: NeuralNetwork::from_path(&paths.stitching_eye)?.load()?,
            stitching_lip: NeuralNetwork::from_path(&paths.stitching_lip)?.load()?,
            input_shape,
        })
    }

    fn keypoint_tensor(kp: &KeypointSet) -> ArrayD<f32> {
        let rows = keypoints_to_rows(kp);
        Array3::from_shape_vec((1, kp.nrows(), 3), rows)
            .expect("row buffer length matches keypoint count")
            .into_dyn()
    }

    /// Runs one of the retargeting heads: input is the flattened source keypoints concatenated
    /// with the combined ratio, output is a flattened keypoint delta.
    fn retarget(
        net: &NeuralNetwork,
        x_s: &KeypointSet,
        ratio: &[f32],
    ) -> anyhow::Result<KeypointSet> {
        let mut input = keypoints_to_rows(x_s);
        input.extend_from_slice(ratio);
        let len = input.len();
        let input = Array2::from_shape_vec((1, len), input)?.into_dyn();
        let outputs = net.estimate(&[input])?;
        let delta = outputs[0].as_slice().ok_or_else(|| {
            anyhow::anyhow!("retargeting output is not contiguous")
        })?;
        Ok(keypoints_from_rows(delta))
    }
}

/// Converts head-pose network output (a distribution over 66 bins of 3° each) to degrees.
fn bins_to_degrees(logits: &ArrayD<f32>) -> anyhow::Result<f32> {
    let mut bins: Vec<f32> = logits.iter().copied().collect();
    anyhow::ensure!(bins.len() == 66, "expected 66 head-pose bins, got {}", bins.len());
    softmax_in_place(&mut bins);
    let expectation: f32 = bins.iter().enumerate().map(|(i, p)| p * i as f32).sum();
    Ok(expectation * 3.0 - 97.5)
}

/// Samples an image into a NCHW tensor with values in 0..=1, resizing if necessary.
pub fn image_to_tensor(image: &RgbImage, (w, h): (u32, u32)) -> ArrayD<f32> {
    let resized;
    let image = if image.dimensions() == (w, h) {
        image
    } else {
        resized = imageops::resize(image, w, h, FilterType::Triangle);
        &resized
    };
    Array4::from_shape_fn((1, 3, h as usize, w as usize), |(_, c, y, x)| {
        image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    })
    .into_dyn()
}

/// Converts a decoded `[1, 3, H, W]` tensor back into an image, clamping to 0..=1.
pub fn tensor_to_image(tensor: &ArrayD<f32>) -> anyhow::Result<RgbImage> {
    let shape = tensor.shape();
    anyhow::ensure!(
        shape.len() == 4 && shape[0] == 1 && shape[1] == 3,
        "expected [1, 3, H, W] output, got {shape:?}"
    );
    let (h, w) = (shape[2], shape[3]);
    let mut image = RgbImage::new(w as u32, h as u32);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        for c in 0..3 {
            let v = tensor[[0, c, y as usize, x as usize]].clamp(0.0, 1.0);
            pixel[c] = (v * 255.0).round() as u8;
        }
    }
    Ok(image)
}

impl ModelSuite for OnnxModelSuite {
    fn extract_motion(&self, image: &RgbImage) -> anyhow::Result<KeypointInfo> {
        let input = image_to_tensor(image, self.input_shape);
        let outputs = self.motion.estimate(&[input])?;
        anyhow::ensure!(outputs.len() == 7, "motion extractor returned {} outputs", outputs.len());

        let t = Array1::from_iter(outputs[OUT_T].iter().copied());
        anyhow::ensure!(t.len() == 3, "translation output has length {}", t.len());

        let exp: Vec<f32> = outputs[OUT_EXP].iter().copied().collect();
        let kp: Vec<f32> = outputs[OUT_KP].iter().copied().collect();

        Ok(KeypointInfo {
            kp: keypoints_from_rows(&kp),
            pitch: bins_to_degrees(&outputs[OUT_PITCH])?,
            yaw: bins_to_degrees(&outputs[OUT_YAW])?,
            roll: bins_to_degrees(&outputs[OUT_ROLL])?,
            exp: keypoints_from_rows(&exp),
            scale: *outputs[OUT_SCALE]
                .iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("scale output is empty"))?,
            t: nalgebra::Vector3::new(t[0], t[1], t[2]),
        })
    }

    fn extract_feature(&self, image: &RgbImage) -> anyhow::Result<Feature> {
        let input = image_to_tensor(image, self.input_shape);
        let mut outputs = self.appearance.estimate(&[input])?;
        anyhow::ensure!(!outputs.is_empty(), "appearance extractor returned no outputs");
        Ok(outputs.remove(0))
    }

    fn stitch(&self, x_s: &KeypointSet, x_candidate: &KeypointSet) -> anyhow::Result<KeypointSet> {
        let mut input = keypoints_to_rows(x_s);
        input.extend(keypoints_to_rows(x_candidate));
        let len = input.len();
        let input = Array2::from_shape_vec((1, len), input)?.into_dyn();
        let outputs = self.stitching.estimate(&[input])?;

        // The stitching head predicts a per-keypoint expression delta followed by a 2D offset
        // that is applied to the X/Y of every keypoint.
        let n = x_candidate.nrows();
        let delta: Vec<f32> = outputs[0].iter().copied().collect();
        anyhow::ensure!(
            delta.len() == n * 3 + 2,
            "stitching output has length {}, expected {}",
            delta.len(),
            n * 3 + 2
        );
        let mut stitched = x_candidate + keypoints_from_rows(&delta[..n * 3]);
        let (tx, ty) = (delta[n * 3], delta[n * 3 + 1]);
        for mut row in stitched.row_iter_mut() {
            row[0] += tx;
            row[1] += ty;
        }
        Ok(stitched)
    }

    fn retarget_eye(&self, x_s: &KeypointSet, ratio: EyeRatio) -> anyhow::Result<KeypointSet> {
        Self::retarget(&self.stitching_eye, x_s, &ratio.as_array())
    }

    fn retarget_lip(&self, x_s: &KeypointSet, ratio: LipRatio) -> anyhow::Result<KeypointSet> {
        Self::retarget(&self.stitching_lip, x_s, &ratio.as_array())
    }

    fn warp_decode(
        &self,
        feature: &Feature,
        x_s: &KeypointSet,
        x_new: &KeypointSet,
    ) -> anyhow::Result<RgbImage> {
        let outputs = self.warping.estimate(&[
            feature.clone(),
            Self::keypoint_tensor(x_s),
            Self::keypoint_tensor(x_new),
        ])?;
        anyhow::ensure!(!outputs.is_empty(), "warping module returned no outputs");

        let mut decoded = self.generator.estimate(&outputs[..1])?;
        anyhow::ensure!(!decoded.is_empty(), "generator returned no outputs");
        tensor_to_image(&decoded.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array1;

    #[test]
    fn bin_expectation_maps_to_degrees() {
        // All mass on bin 32 (the 33rd) gives 32 * 3 - 97.5 = -1.5°.
        let mut logits = vec![0.0; 66];
        logits[32] = 50.0;
        let deg = bins_to_degrees(&Array1::from_vec(logits).into_dyn()).unwrap();
        assert_relative_eq!(deg, -1.5, epsilon = 1e-3);
    }

    #[test]
    fn image_tensor_is_normalized_nchw() {
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(1, 0, image::Rgb([255, 0, 128]));
        let t = image_to_tensor(&img, (2, 2));
        assert_eq!(t.shape(), &[1, 3, 2, 2]);
        assert_relative_eq!(t[[0, 0, 0, 1]], 1.0);
        assert_relative_eq!(t[[0, 1, 0, 1]], 0.0);
        assert_relative_eq!(t[[0, 2, 0, 1]], 128.0 / 255.0, epsilon = 1e-3);
    }

    #[test]
    fn decoded_tensor_round_trips_to_image() {
        let mut t = ndarray::Array4::<f32>::zeros((1, 3, 2, 2));
        t[[0, 0, 0, 0]] = 1.5; // clamped to 1.0
        t[[0, 1, 1, 1]] = 0.5;
        let img = tensor_to_image(&t.into_dyn()).unwrap();
        assert_eq!(img.get_pixel(0, 0)[0], 255);
        assert_eq!(img.get_pixel(1, 1)[1], 128);
    }
}
