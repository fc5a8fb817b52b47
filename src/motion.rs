//! Frame-wise motion composition.
//!
//! Per driving frame, the composer combines the source's canonical keypoints with the driving
//! frame's pose, expression, scale and translation into a raw new keypoint set. In relative mode
//! every quantity is expressed as a delta against driving frame 0 (the *anchor*) and added onto
//! the source's own values; in absolute mode the driving values are copied directly.
//!
//! The anchor is captured exactly once, from the first composed frame, and is never recomputed.
//! Frames must therefore be composed strictly in driving order.

use nalgebra::Matrix3;

use crate::keypoint::{translate_xy, KeypointInfo, KeypointSet};

/// The driving signal for one frame.
#[derive(Debug, Clone)]
pub struct DrivingMotion {
    pub info: KeypointInfo,
    /// Rotation for this frame. Computed from `info`'s Euler angles for live driving video;
    /// pre-baked templates carry their own matrix.
    pub rotation: Matrix3<f32>,
    /// Whether this frame comes from a pre-baked template with absolute data.
    pub from_template: bool,
}

impl DrivingMotion {
    /// Builds the driving motion for a live frame, deriving the rotation from the extracted
    /// Euler angles.
    pub fn live(info: KeypointInfo) -> Self {
        let rotation = info.rotation();
        Self {
            info,
            rotation,
            from_template: false,
        }
    }

    /// Builds the driving motion for a template frame with a precomputed rotation.
    pub fn from_template(info: KeypointInfo, rotation: Matrix3<f32>) -> Self {
        Self {
            info,
            rotation,
            from_template: true,
        }
    }
}

/// The source side of the composition: outputs of the keypoint normalizer that stay fixed for the
/// whole session.
#[derive(Debug, Clone)]
pub struct SourceMotion<'a> {
    /// Source keypoint info (`x_s_info`).
    pub info: &'a KeypointInfo,
    /// Source rotation (`r_s`).
    pub rotation: Matrix3<f32>,
    /// Canonical source keypoints (`x_c_s`).
    pub canonical: &'a KeypointSet,
}

/// Driving frame 0's rotation and keypoint info, held read-only once captured.
#[derive(Debug, Clone)]
struct Anchor {
    rotation: Matrix3<f32>,
    info: KeypointInfo,
}

/// Composes new keypoint sets frame by frame.
///
/// Stateful across the frame loop: the first composed frame becomes the anchor (unless the
/// driving data is a pre-baked absolute template, which needs none).
#[derive(Debug)]
pub struct MotionComposer {
    relative: bool,
    anchor: Option<Anchor>,
}

impl MotionComposer {
    pub fn new(relative: bool) -> Self {
        Self {
            relative,
            anchor: None,
        }
    }

    /// Whether the frame-0 anchor has been captured.
    pub fn has_anchor(&self) -> bool {
        self.anchor.is_some()
    }

    /// Composes the raw new keypoint set for one driving frame.
    ///
    /// Must be called with frames in driving order; the first call captures the anchor. The
    /// translation's depth component is zeroed before the keypoints are formed, for every frame
    /// and in both modes.
    pub fn compose(&mut self, source: &SourceMotion<'_>, driving: &DrivingMotion) -> KeypointSet {
        if self.anchor.is_none() && (self.relative || !driving.from_template) {
            log::trace!("capturing driving anchor frame");
            self.anchor = Some(Anchor {
                rotation: driving.rotation,
                info: driving.info.clone(),
            });
        }

        let (r_new, delta_new, scale_new, mut t_new);
        if self.relative {
            let anchor = self.anchor.as_ref().expect("anchor captured above");
            r_new = driving.rotation * anchor.rotation.transpose() * source.rotation;
            delta_new = &source.info.exp + (&driving.info.exp - &anchor.info.exp);
            scale_new = source.info.scale * (driving.info.scale / anchor.info.scale);
            t_new = source.info.t + (driving.info.t - anchor.info.t);
        } else {
            r_new = driving.rotation;
            delta_new = driving.info.exp.clone();
            scale_new = source.info.scale;
            t_new = driving.info.t;
        }

        // Hard post-condition: no depth translation, ever.
        t_new.z = 0.0;

        let mut x_new = (source.canonical * r_new + delta_new) * scale_new;
        translate_xy(&mut x_new, t_new);
        x_new
    }
}
