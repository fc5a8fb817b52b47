//! Head pose to rotation matrix conversion.
//!
//! The motion extractor predicts head pose as Euler angles in degrees. This module turns them
//! into the 3×3 rotation matrix consumed by the keypoint algebra. The matrix uses the row-vector
//! convention (`x * R`), matching the layout of [`KeypointSet`][crate::keypoint::KeypointSet].

use nalgebra::Matrix3;

/// Computes a rotation matrix from pitch, yaw and roll, given in degrees.
///
/// The composition order is fixed: yaw · pitch · roll (pitch rotates around X, yaw around Y,
/// roll around Z). The result is transposed so that it applies to keypoint *rows*.
pub fn rotation_matrix(pitch: f32, yaw: f32, roll: f32) -> Matrix3<f32> {
    let (x, y, z) = (pitch.to_radians(), yaw.to_radians(), roll.to_radians());

    #[rustfmt::skip]
    let rot_x = Matrix3::new(
        1.0, 0.0,      0.0,
        0.0, x.cos(), -x.sin(),
        0.0, x.sin(),  x.cos(),
    );
    #[rustfmt::skip]
    let rot_y = Matrix3::new(
         y.cos(), 0.0, y.sin(),
         0.0,     1.0, 0.0,
        -y.sin(), 0.0, y.cos(),
    );
    #[rustfmt::skip]
    let rot_z = Matrix3::new(
        z.cos(), -z.sin(), 0.0,
        z.sin(),  z.cos(), 0.0,
        0.0,      0.0,     1.0,
    );

    (rot_z * rot_y * rot_x).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::RowVector3;

    #[test]
    fn zero_pose_is_identity() {
        assert_relative_eq!(rotation_matrix(0.0, 0.0, 0.0), Matrix3::identity());
    }

    #[test]
    fn rotation_is_orthonormal() {
        let r = rotation_matrix(12.5, -30.0, 4.0);
        assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-5);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn roll_rotates_in_image_plane() {
        // 90° roll maps the X unit row vector onto Y (row-vector convention).
        let r = rotation_matrix(0.0, 0.0, 90.0);
        let v = RowVector3::new(1.0, 0.0, 0.0) * r;
        assert_relative_eq!(v, RowVector3::new(0.0, 1.0, 0.0), epsilon = 1e-6);
    }

    #[test]
    fn composition_order_is_yaw_pitch_roll() {
        let pitch = 20.0_f32;
        let yaw = -35.0_f32;
        let roll = 10.0_f32;
        let composed = rotation_matrix(pitch, yaw, roll);
        let manual = (rotation_matrix(0.0, 0.0, roll).transpose()
            * rotation_matrix(0.0, yaw, 0.0).transpose()
            * rotation_matrix(pitch, 0.0, 0.0).transpose())
        .transpose();
        assert_relative_eq!(composed, manual, epsilon = 1e-6);
    }
}
