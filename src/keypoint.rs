//! Keypoint data model.
//!
//! The motion extractor describes a face as a bundle of canonical keypoints plus pose
//! (pitch/yaw/roll), an expression offset, a uniform scale and a translation. The posed keypoint
//! set is a deterministic function of that bundle, implemented by [`KeypointInfo::transform`] —
//! no network is involved.

use nalgebra::{Const, Dyn, Matrix3, OMatrix, Vector3, U3};
use serde::{Deserialize, Serialize};

use crate::pose::rotation_matrix;

/// A set of 3D keypoints, one per row.
pub type KeypointSet = OMatrix<f32, Dyn, U3>;

/// Number of facial keypoints predicted by the motion extractor.
pub const NUM_KEYPOINTS: usize = 21;

/// Per-frame output of the motion extractor.
///
/// Immutable once computed for a given frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeypointInfo {
    /// Canonical keypoints, before any pose or expression is applied.
    pub kp: KeypointSet,
    /// Head pitch in degrees.
    pub pitch: f32,
    /// Head yaw in degrees.
    pub yaw: f32,
    /// Head roll in degrees.
    pub roll: f32,
    /// Expression offset, same shape as `kp`.
    pub exp: KeypointSet,
    /// Uniform scale.
    pub scale: f32,
    /// Translation. The Z component is ignored by [`KeypointInfo::transform`] and zeroed by the
    /// motion composer.
    pub t: Vector3<f32>,
}

impl KeypointInfo {
    /// Returns the rotation matrix for this frame's head pose.
    pub fn rotation(&self) -> Matrix3<f32> {
        rotation_matrix(self.pitch, self.yaw, self.roll)
    }

    /// Applies pose, expression, scale and translation to the canonical keypoints:
    /// `x = scale · (kp · R + exp)`, then the X/Y components of `t` are added.
    ///
    /// The Z component of `t` is deliberately not applied; depth translation carries no meaning
    /// for the warping module.
    pub fn transform(&self) -> KeypointSet {
        let mut x = (&self.kp * self.rotation() + &self.exp) * self.scale;
        translate_xy(&mut x, self.t);
        x
    }
}

/// Adds the X/Y components of `t` to every keypoint row.
pub fn translate_xy(kp: &mut KeypointSet, t: Vector3<f32>) {
    for mut row in kp.row_iter_mut() {
        row[0] += t.x;
        row[1] += t.y;
    }
}

/// Returns a [`KeypointSet`] of `n` keypoints, all at the origin.
pub fn zero_keypoints(n: usize) -> KeypointSet {
    KeypointSet::zeros_generic(Dyn(n), Const)
}

/// Builds a [`KeypointSet`] from row-major coordinate triples.
///
/// This is the layout the ONNX networks use for their flattened keypoint inputs and outputs.
pub fn keypoints_from_rows(data: &[f32]) -> KeypointSet {
    assert!(
        data.len() % 3 == 0,
        "keypoint buffer length {} is not a multiple of 3",
        data.len()
    );
    KeypointSet::from_row_slice(data)
}

/// Flattens a [`KeypointSet`] into row-major coordinate triples.
pub fn keypoints_to_rows(kp: &KeypointSet) -> Vec<f32> {
    let mut out = Vec::with_capacity(kp.nrows() * 3);
    for row in kp.row_iter() {
        out.extend_from_slice(&[row[0], row[1], row[2]]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_info(scale: f32, t: Vector3<f32>) -> KeypointInfo {
        let kp = keypoints_from_rows(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);
        KeypointInfo {
            exp: zero_keypoints(kp.nrows()),
            kp,
            pitch: 0.0,
            yaw: 0.0,
            roll: 0.0,
            scale,
            t,
        }
    }

    #[test]
    fn transform_applies_scale_and_xy_translation() {
        let info = test_info(2.0, Vector3::new(10.0, -5.0, 99.0));
        let x = info.transform();
        // First keypoint (1, 0, 0): scaled to (2, 0, 0), then translated in X/Y only.
        assert_relative_eq!(x[(0, 0)], 12.0);
        assert_relative_eq!(x[(0, 1)], -5.0);
        assert_relative_eq!(x[(0, 2)], 0.0); // Z translation never applies
    }

    #[test]
    fn row_round_trip() {
        let kp = keypoints_from_rows(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(kp.nrows(), 2);
        assert_eq!(kp[(1, 0)], 4.0);
        assert_eq!(keypoints_to_rows(&kp), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }
}
