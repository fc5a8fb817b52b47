//! Session orchestration: source preparation and the frame-by-frame render loop.
//!
//! A [`Pipeline`] owns the model suite and the cropper. [`Pipeline::begin`] runs the keypoint
//! normalizer once per source portrait and yields a [`RenderSession`]; the session can then
//! render any number of driving sequences against the same source.
//!
//! Rendering is single-threaded and strictly ordered: relative-mode deltas are measured against
//! driving frame 0, which the motion composer captures on the first iteration. A failed frame
//! aborts the whole render; there is no per-frame skip-and-continue.

use std::path::Path;

use image::RgbImage;
use nalgebra::Matrix3;
use ndarray::Array2;

use crate::config::InferenceConfig;
use crate::crop::{
    concat_frame, paste_back, prepare_paste_back, resize_to_limit, CropInfo, Cropper,
};
use crate::dispatch::{Dispatcher, FrameCorrections, Policy};
use crate::error::Error;
use crate::keypoint::{KeypointInfo, KeypointSet};
use crate::models::{Feature, ModelSuite};
use crate::motion::{DrivingMotion, MotionComposer, SourceMotion};
use crate::retarget::{combined_eye_ratio, combined_lip_ratio, eye_close_ratio, lip_close_ratio};
use crate::template::DrivingTemplate;
use crate::timer::Timer;

/// Maximum dimension of the original source image; larger images are shrunk on load.
const REF_MAX_SHAPE: u32 = 1280;
/// Source image dimensions are trimmed to multiples of this.
const REF_SHAPE_N: u32 = 2;

/// Everything derived from the source portrait, computed once per session and read-only
/// afterwards.
#[derive(Debug)]
pub struct SourceContext {
    /// Keypoint info of the source (`x_s_info`).
    pub x_s_info: KeypointInfo,
    /// Source rotation (`r_s`).
    pub rotation: Matrix3<f32>,
    /// Canonical source keypoints (`x_c_s`).
    pub x_c_s: KeypointSet,
    /// Posed source keypoints (`x_s`).
    pub x_s: KeypointSet,
    /// Identity feature (`f_s`).
    pub feature: Feature,
    /// Crop metadata, including the crop-space landmarks used by the ratio engine.
    pub crop_info: CropInfo,
    /// The (possibly resized) original image, for paste-back.
    pub img_rgb: RgbImage,
    /// Lip-closure correction, reused on every frame while lip-zero is active.
    pub lip_delta: Option<KeypointSet>,
}

/// An ordered driving sequence: live frames or a pre-baked template.
pub enum DrivingSource {
    /// Live frames; keypoint info is extracted per frame.
    Frames(Vec<RgbImage>),
    /// Pre-baked absolute keypoint data; no extractor call is made.
    Template(DrivingTemplate),
}

impl DrivingSource {
    /// Loads a driving source from a path: a directory of image frames (ordered by file name) or
    /// a `.json` template.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        if path.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(path)?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|e| e.path())
                .filter(|p| {
                    matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("png" | "jpg" | "jpeg")
                    )
                })
                .collect();
            entries.sort();
            if entries.is_empty() {
                return Err(Error::UnsupportedDrivingSource(format!(
                    "directory {} contains no image frames",
                    path.display()
                )));
            }
            log::info!("loading {} driving frames from {}", entries.len(), path.display());
            let frames = entries
                .iter()
                .map(|p| {
                    image::open(p)
                        .map(|i| i.to_rgb8())
                        .map_err(|e| Error::UnsupportedDrivingSource(format!("{}: {e}", p.display())))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Self::Frames(frames))
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            Ok(Self::Template(DrivingTemplate::load(path)?))
        } else {
            Err(Error::UnsupportedDrivingSource(format!(
                "{} is neither a frame directory nor a template",
                path.display()
            )))
        }
    }

    /// Number of driving frames.
    pub fn len(&self) -> usize {
        match self {
            Self::Frames(frames) => frames.len(),
            Self::Template(template) => template.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Output of one render call.
#[derive(Debug)]
pub struct RenderOutput {
    /// Generated frames in crop space.
    pub crops: Vec<RgbImage>,
    /// Generated frames composited into the original image. Empty when paste-back is disabled.
    pub composited: Vec<RgbImage>,
    /// Side-by-side debug frames (driving | source crop | generated). Only produced for live
    /// driving frames.
    pub debug: Vec<RgbImage>,
}

/// Portrait animation pipeline.
pub struct Pipeline<M, C> {
    models: M,
    cropper: C,
}

impl<M: ModelSuite, C: Cropper> Pipeline<M, C> {
    pub fn new(models: M, cropper: C) -> Self {
        Self { models, cropper }
    }

    /// Prepares a render session from a source portrait.
    ///
    /// This runs the keypoint normalizer: cropping, motion extraction, identity feature
    /// extraction and the canonical keypoint transform. When `flag_lip_zero` is set, the lip
    /// ratio is probed against a fully closed target; if the source's mouth is already closer
    /// than `lip_zero_threshold`, the flag is disabled for the whole session, otherwise the
    /// correction delta is computed once and reused on every frame.
    pub fn begin(
        &self,
        image: &RgbImage,
        mut cfg: InferenceConfig,
    ) -> Result<RenderSession<'_, M, C>, Error> {
        let img_rgb = resize_to_limit(image, REF_MAX_SHAPE, REF_SHAPE_N);
        let crop_info = self.cropper.crop(&img_rgb)?;

        let net_input = if cfg.flag_do_crop {
            &crop_info.img_crop
        } else {
            &img_rgb
        };

        let x_s_info = self
            .models
            .extract_motion(net_input)
            .map_err(|e| Error::inference(None, e))?;
        let rotation = x_s_info.rotation();
        let feature = self
            .models
            .extract_feature(net_input)
            .map_err(|e| Error::inference(None, e))?;
        let x_c_s = x_s_info.kp.clone();
        let x_s = x_s_info.transform();

        let mut lip_delta = None;
        if cfg.flag_lip_zero {
            // Probe against a fully closed mouth (driving ratio 0).
            let probe = combined_lip_ratio(0.0, &crop_info.lmk_crop);
            if probe.source < cfg.lip_zero_threshold {
                log::debug!(
                    "source lips are already closed (ratio {:.4} < {:.4}), disabling lip-zero",
                    probe.source,
                    cfg.lip_zero_threshold
                );
                cfg.flag_lip_zero = false;
            } else {
                lip_delta = Some(
                    self.models
                        .retarget_lip(&x_s, probe)
                        .map_err(|e| Error::inference(None, e))?,
                );
            }
        }

        let mask = if cfg.flag_pasteback {
            let mask = prepare_paste_back(
                None,
                crop_info.img_crop.dimensions(),
                &crop_info.m_c2o,
                img_rgb.dimensions(),
            );
            if mask.is_none() {
                log::warn!("crop transform is degenerate, disabling paste-back");
            }
            mask
        } else {
            None
        };

        Ok(RenderSession {
            models: &self.models,
            cropper: &self.cropper,
            cfg,
            mask,
            source: SourceContext {
                x_s_info,
                rotation,
                x_c_s,
                x_s,
                feature,
                crop_info,
                img_rgb,
                lip_delta,
            },
        })
    }
}

/// A prepared source portrait plus session-scoped configuration.
///
/// All state in here is read-only across frame iterations; concurrent renders of different
/// sources each own an independent session.
#[derive(Debug)]
pub struct RenderSession<'a, M, C> {
    models: &'a M,
    cropper: &'a C,
    cfg: InferenceConfig,
    source: SourceContext,
    mask: Option<Array2<f32>>,
}

impl<M: ModelSuite, C: Cropper> RenderSession<'_, M, C> {
    /// The session's effective configuration (after the lip-zero probe).
    pub fn config(&self) -> &InferenceConfig {
        &self.cfg
    }

    pub fn source(&self) -> &SourceContext {
        &self.source
    }

    /// Animates the source with the given driving sequence.
    ///
    /// Frames are processed strictly in order; the first frame becomes the relative-mode anchor.
    /// Any model failure aborts the render with the offending frame index.
    pub fn render(&self, driving: &DrivingSource) -> Result<RenderOutput, Error> {
        if driving.is_empty() {
            return Err(Error::UnsupportedDrivingSource(
                "driving source contains no frames".into(),
            ));
        }
        let n = driving.len();

        // Retargeting needs per-frame driving landmarks, which only live frames provide.
        let mut eye_on = self.cfg.flag_eye_retargeting;
        let mut lip_on = self.cfg.flag_lip_retargeting;
        if (eye_on || lip_on) && matches!(driving, DrivingSource::Template(_)) {
            log::warn!("driving template carries no landmarks, disabling eye/lip retargeting");
            eye_on = false;
            lip_on = false;
        }

        let (mut eye_ratios, mut lip_ratios) = (Vec::new(), Vec::new());
        if let (true, DrivingSource::Frames(frames)) = (eye_on || lip_on, driving) {
            for (i, frame) in frames.iter().enumerate() {
                let lmk = self
                    .cropper
                    .landmarks(frame)
                    .map_err(|e| Error::inference(i, e))?;
                eye_ratios.push(eye_close_ratio(&lmk));
                lip_ratios.push(lip_close_ratio(&lmk));
            }
        }

        let policy = Policy::from_flags(self.cfg.flag_stitching, eye_on, lip_on);
        log::debug!("rendering {n} frames with policy {policy:?}");
        let dispatcher = Dispatcher::new(self.models, policy, self.cfg.flag_relative);
        let mut composer = MotionComposer::new(self.cfg.flag_relative);
        let source_motion = SourceMotion {
            info: &self.source.x_s_info,
            rotation: self.source.rotation,
            canonical: &self.source.x_c_s,
        };

        let t_motion = Timer::new("motion");
        let t_dispatch = Timer::new("dispatch");
        let t_decode = Timer::new("decode");
        let t_paste = Timer::new("paste");

        let mut out = RenderOutput {
            crops: Vec::with_capacity(n),
            composited: Vec::new(),
            debug: Vec::new(),
        };

        for i in 0..n {
            let driving_motion = match driving {
                DrivingSource::Frames(frames) => {
                    let info = t_motion
                        .time(|| self.models.extract_motion(&frames[i]))
                        .map_err(|e| Error::inference(i, e))?;
                    DrivingMotion::live(info)
                }
                DrivingSource::Template(template) => {
                    let frame = &template.frames[i];
                    DrivingMotion::from_template(frame.info.clone(), frame.rotation)
                }
            };

            let x_new = composer.compose(&source_motion, &driving_motion);

            let corrections = FrameCorrections {
                lip_zero: if self.cfg.flag_lip_zero {
                    self.source.lip_delta.as_ref()
                } else {
                    None
                },
                eye_ratio: eye_on
                    .then(|| combined_eye_ratio(eye_ratios[i], &self.source.crop_info.lmk_crop)),
                lip_ratio: lip_on
                    .then(|| combined_lip_ratio(lip_ratios[i], &self.source.crop_info.lmk_crop)),
            };

            let x_final = t_dispatch
                .time(|| dispatcher.apply(&self.source.x_s, x_new, &corrections))
                .map_err(|e| Error::inference(i, e))?;

            let crop_frame = t_decode
                .time(|| {
                    self.models
                        .warp_decode(&self.source.feature, &self.source.x_s, &x_final)
                })
                .map_err(|e| Error::inference(i, e))?;

            if let Some(mask) = &self.mask {
                let _guard = t_paste.start();
                if let Some(blended) = paste_back(
                    &crop_frame,
                    &self.source.crop_info.m_c2o,
                    &self.source.img_rgb,
                    mask,
                ) {
                    out.composited.push(blended);
                }
            }

            if let DrivingSource::Frames(frames) = driving {
                out.debug.push(concat_frame(
                    &frames[i],
                    &self.source.crop_info.img_crop,
                    &crop_frame,
                ));
            }

            out.crops.push(crop_frame);
        }

        log::debug!("render finished: {n} frames ({t_motion}, {t_dispatch}, {t_decode}, {t_paste})");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypoint::{keypoints_from_rows, zero_keypoints};
    use crate::retarget::{EyeRatio, LipRatio};
    use crate::template::TemplateFrame;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix2x3, Point2, Vector3};
    use std::sync::Mutex;

    fn source_info() -> KeypointInfo {
        KeypointInfo {
            kp: keypoints_from_rows(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]),
            pitch: 10.0,
            yaw: -5.0,
            roll: 2.0,
            exp: zero_keypoints(3),
            scale: 1.1,
            t: Vector3::new(0.2, -0.1, 0.4),
        }
    }

    /// Deterministic stand-in for the network suite. `extract_motion` always reports the source
    /// pose, so a "driving" frame is identical in pose to the source.
    #[derive(Debug)]
    struct StubModels {
        /// Keypoint sets passed to `warp_decode`, for inspection.
        decoded: Mutex<Vec<KeypointSet>>,
        /// When set, `warp_decode` fails once this many frames were decoded.
        fail_decode_at: Option<usize>,
    }

    impl StubModels {
        fn new() -> Self {
            Self {
                decoded: Mutex::new(Vec::new()),
                fail_decode_at: None,
            }
        }
    }

    const LIP_DELTA: f32 = 0.5;

    impl ModelSuite for StubModels {
        fn extract_motion(&self, _: &RgbImage) -> anyhow::Result<KeypointInfo> {
            Ok(source_info())
        }
        fn extract_feature(&self, _: &RgbImage) -> anyhow::Result<Feature> {
            Ok(ndarray::ArrayD::zeros(ndarray::IxDyn(&[1, 4])))
        }
        fn stitch(&self, _: &KeypointSet, x: &KeypointSet) -> anyhow::Result<KeypointSet> {
            Ok(x.clone())
        }
        fn retarget_eye(&self, x_s: &KeypointSet, _: EyeRatio) -> anyhow::Result<KeypointSet> {
            Ok(zero_keypoints(x_s.nrows()))
        }
        fn retarget_lip(&self, x_s: &KeypointSet, _: LipRatio) -> anyhow::Result<KeypointSet> {
            Ok(keypoints_from_rows(&vec![LIP_DELTA; x_s.nrows() * 3]))
        }
        fn warp_decode(
            &self,
            _: &Feature,
            _: &KeypointSet,
            x_new: &KeypointSet,
        ) -> anyhow::Result<RgbImage> {
            let mut decoded = self.decoded.lock().unwrap();
            if Some(decoded.len()) == self.fail_decode_at {
                anyhow::bail!("decoder exploded");
            }
            decoded.push(x_new.clone());
            Ok(RgbImage::new(2, 2))
        }
    }

    /// Cropper stub with configurable lip-openness.
    #[derive(Debug)]
    struct StubCropper {
        open_lips: bool,
        face: bool,
    }

    fn landmarks(open_lips: bool) -> Vec<Point2<f32>> {
        let mut lmk = vec![Point2::new(0.0, 0.0); 203];
        // Mouth 20 wide; lip distance 5 (ratio 0.25) or 0.2 (ratio 0.01).
        lmk[48] = Point2::new(0.0, 10.0);
        lmk[66] = Point2::new(20.0, 10.0);
        lmk[90] = Point2::new(10.0, 8.0);
        let gap = if open_lips { 5.0 } else { 0.2 };
        lmk[102] = Point2::new(10.0, 8.0 + gap);
        lmk
    }

    impl Cropper for StubCropper {
        fn crop(&self, image: &RgbImage) -> Result<CropInfo, Error> {
            if !self.face {
                return Err(Error::NoFaceDetected);
            }
            Ok(CropInfo {
                m_c2o: Matrix2x3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0),
                lmk_crop: landmarks(self.open_lips),
                img_crop: image.clone(),
            })
        }
        fn landmarks(&self, _: &RgbImage) -> anyhow::Result<Vec<Point2<f32>>> {
            Ok(landmarks(true))
        }
    }

    fn portrait() -> RgbImage {
        RgbImage::new(4, 4)
    }

    #[test]
    fn no_face_aborts_session() {
        let pipeline = Pipeline::new(
            StubModels::new(),
            StubCropper {
                open_lips: true,
                face: false,
            },
        );
        let err = pipeline
            .begin(&portrait(), InferenceConfig::default())
            .unwrap_err();
        assert!(matches!(err, Error::NoFaceDetected));
    }

    #[test]
    fn closed_lips_disable_lip_zero_for_the_session() {
        let pipeline = Pipeline::new(
            StubModels::new(),
            StubCropper {
                open_lips: false,
                face: true,
            },
        );
        let session = pipeline
            .begin(&portrait(), InferenceConfig::default())
            .unwrap();

        assert!(!session.config().flag_lip_zero);
        assert!(session.source().lip_delta.is_none());

        // With identity driving and no lip-zero delta, the decoder sees exactly `x_s`.
        let driving = DrivingSource::Frames(vec![portrait()]);
        session.render(&driving).unwrap();
        let decoded = pipeline.models.decoded.lock().unwrap();
        assert_relative_eq!(decoded[0], session.source().x_s, epsilon = 1e-5);
    }

    #[test]
    fn open_lips_keep_lip_zero_and_apply_it_after_stitching() {
        let pipeline = Pipeline::new(
            StubModels::new(),
            StubCropper {
                open_lips: true,
                face: true,
            },
        );
        let session = pipeline
            .begin(&portrait(), InferenceConfig::default())
            .unwrap();

        assert!(session.config().flag_lip_zero);
        let lip_delta = session.source().lip_delta.clone().unwrap();

        let driving = DrivingSource::Frames(vec![portrait()]);
        session.render(&driving).unwrap();
        let decoded = pipeline.models.decoded.lock().unwrap();
        let expected = &session.source().x_s + lip_delta;
        assert_relative_eq!(decoded[0], expected, epsilon = 1e-5);
    }

    #[test]
    fn template_renders_without_motion_extraction() {
        let pipeline = Pipeline::new(
            StubModels::new(),
            StubCropper {
                open_lips: false,
                face: true,
            },
        );
        let mut cfg = InferenceConfig::default();
        cfg.flag_relative = false;
        cfg.flag_stitching = false;
        cfg.flag_pasteback = false;
        let session = pipeline.begin(&portrait(), cfg).unwrap();

        let info = source_info();
        let template = DrivingTemplate {
            frames: vec![
                TemplateFrame {
                    rotation: info.rotation(),
                    info: info.clone(),
                },
                TemplateFrame {
                    rotation: info.rotation(),
                    info,
                },
            ],
        };
        let out = session.render(&DrivingSource::Template(template)).unwrap();
        assert_eq!(out.crops.len(), 2);
        assert!(out.composited.is_empty());
        assert!(out.debug.is_empty(), "templates produce no debug frames");
    }

    #[test]
    fn decoder_failure_reports_frame_index() {
        let mut models = StubModels::new();
        models.fail_decode_at = Some(1);
        let pipeline = Pipeline::new(
            models,
            StubCropper {
                open_lips: false,
                face: true,
            },
        );
        let session = pipeline
            .begin(&portrait(), InferenceConfig::default())
            .unwrap();

        let driving = DrivingSource::Frames(vec![portrait(), portrait(), portrait()]);
        let err = session.render(&driving).unwrap_err();
        match err {
            Error::Inference { frame, .. } => assert_eq!(frame, Some(1)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_driving_source_is_rejected() {
        let pipeline = Pipeline::new(
            StubModels::new(),
            StubCropper {
                open_lips: false,
                face: true,
            },
        );
        let session = pipeline
            .begin(&portrait(), InferenceConfig::default())
            .unwrap();
        let err = session
            .render(&DrivingSource::Frames(Vec::new()))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDrivingSource(_)));
    }

    #[test]
    fn pasteback_composites_every_frame() {
        let pipeline = Pipeline::new(
            StubModels::new(),
            StubCropper {
                open_lips: false,
                face: true,
            },
        );
        let session = pipeline
            .begin(&portrait(), InferenceConfig::default())
            .unwrap();
        let driving = DrivingSource::Frames(vec![portrait(), portrait()]);
        let out = session.render(&driving).unwrap();
        assert_eq!(out.crops.len(), 2);
        assert_eq!(out.composited.len(), 2);
        assert_eq!(out.debug.len(), 2);
        assert_eq!(
            out.composited[0].dimensions(),
            session.source().img_rgb.dimensions()
        );
    }
}
