//! Inference configuration.

/// Configuration for a render session.
///
/// A [`RenderSession`][crate::pipeline::RenderSession] owns a private copy of this value; the
/// one-time lip-zero disable (when the source's resting mouth is already closed) mutates the
/// session copy only, never a caller-shared value.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceConfig {
    /// Express driving motion relative to driving frame 0, added onto the source's own
    /// pose/expression. When `false`, the driving pose/expression is copied directly.
    pub flag_relative: bool,
    /// Reconcile the new keypoints with the source identity through the stitching network.
    /// Recommended.
    pub flag_stitching: bool,
    /// Retarget eye openness from the driving frames onto the source.
    pub flag_eye_retargeting: bool,
    /// Retarget lip openness from the driving frames onto the source.
    pub flag_lip_retargeting: bool,
    /// Treat the source's resting mouth state as fully closed before any animation is applied.
    /// Only takes effect when both retargeting flags are off.
    pub flag_lip_zero: bool,
    /// If the source's closed-lip ratio is already below this value, `flag_lip_zero` is disabled
    /// for the session.
    pub lip_zero_threshold: f32,
    /// Composite the generated crop back into the original image.
    pub flag_pasteback: bool,
    /// Crop the source portrait to the face region before feeding it to the networks.
    pub flag_do_crop: bool,
    /// Input resolution of the motion/appearance networks.
    pub input_shape: (u32, u32),
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            flag_relative: true,
            flag_stitching: true,
            flag_eye_retargeting: false,
            flag_lip_retargeting: false,
            flag_lip_zero: true,
            lip_zero_threshold: 0.03,
            flag_pasteback: true,
            flag_do_crop: true,
            input_shape: (256, 256),
        }
    }
}
