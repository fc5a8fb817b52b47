//! Stitching/retargeting dispatch.
//!
//! After motion composition, each frame's raw keypoint set passes through one of three corrective
//! policies, selected from the stitching and eye/lip retargeting flags. The ordering of the
//! corrective steps is load-bearing — most notably, the lip-zero delta is added *after* the
//! stitching pass — so each policy carries its steps as an explicit ordered table rather than as
//! nested control flow.
//!
//! Lip-zero and lip retargeting are mutually exclusive by construction: the lip-zero step only
//! exists in the two policies without active retargeting.

use crate::keypoint::{zero_keypoints, KeypointSet};
use crate::models::ModelSuite;
use crate::retarget::{EyeRatio, LipRatio};

/// One corrective operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Replace the keypoints with the retargeting base plus the eye/lip deltas.
    RetargetDeltas,
    /// Pass the keypoints through the stitching network, anchored to the source keypoints.
    Stitch,
    /// Add the session's lip-zero delta, if one was computed.
    ApplyLipZero,
}

/// Corrective policy for one (stitching, eye, lip) flag combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// No stitching, no retargeting: keypoints pass through untouched except for lip-zero.
    Direct,
    /// Stitching without retargeting. Lip-zero applies to the *stitched* result.
    StitchOnly,
    /// Eye and/or lip retargeting, with optional stitching last.
    Retarget { stitch: bool },
}

impl Policy {
    /// Selects the policy for a flag combination.
    pub fn from_flags(stitching: bool, eye: bool, lip: bool) -> Self {
        match (stitching, eye || lip) {
            (false, false) => Self::Direct,
            (true, false) => Self::StitchOnly,
            (stitch, true) => Self::Retarget { stitch },
        }
    }

    /// The ordered corrective steps of this policy.
    pub fn steps(self) -> &'static [Step] {
        match self {
            Self::Direct => &[Step::ApplyLipZero],
            Self::StitchOnly => &[Step::Stitch, Step::ApplyLipZero],
            Self::Retarget { stitch: false } => &[Step::RetargetDeltas],
            Self::Retarget { stitch: true } => &[Step::RetargetDeltas, Step::Stitch],
        }
    }
}

/// Per-frame inputs to the corrective steps.
pub struct FrameCorrections<'a> {
    /// Session-level lip-zero delta. `None` when the flag is off or was disabled by the
    /// threshold probe.
    pub lip_zero: Option<&'a KeypointSet>,
    /// This frame's combined eye ratio, when eye retargeting is on.
    pub eye_ratio: Option<EyeRatio>,
    /// This frame's combined lip ratio, when lip retargeting is on.
    pub lip_ratio: Option<LipRatio>,
}

/// Applies a [`Policy`] to one frame's composed keypoints.
pub struct Dispatcher<'a, M: ModelSuite> {
    models: &'a M,
    policy: Policy,
    /// In relative mode, retargeting deltas rebase onto the source keypoints; in absolute mode,
    /// onto the composed keypoints.
    relative: bool,
}

impl<'a, M: ModelSuite> Dispatcher<'a, M> {
    pub fn new(models: &'a M, policy: Policy, relative: bool) -> Self {
        Self {
            models,
            policy,
            relative,
        }
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Runs the policy's steps in order and returns the corrected keypoint set.
    pub fn apply(
        &self,
        x_s: &KeypointSet,
        mut x: KeypointSet,
        corrections: &FrameCorrections<'_>,
    ) -> anyhow::Result<KeypointSet> {
        for step in self.policy.steps() {
            x = match step {
                Step::RetargetDeltas => {
                    let n = x_s.nrows();
                    let eye_delta = match corrections.eye_ratio {
                        Some(ratio) => self.models.retarget_eye(x_s, ratio)?,
                        None => zero_keypoints(n),
                    };
                    let lip_delta = match corrections.lip_ratio {
                        Some(ratio) => self.models.retarget_lip(x_s, ratio)?,
                        None => zero_keypoints(n),
                    };
                    let base = if self.relative { x_s.clone() } else { x };
                    base + eye_delta + lip_delta
                }
                Step::Stitch => self.models.stitch(x_s, &x)?,
                Step::ApplyLipZero => match corrections.lip_zero {
                    Some(delta) => x + delta,
                    None => x,
                },
            };
        }
        Ok(x)
    }
}
