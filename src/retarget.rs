//! Eye and lip retargeting ratios.
//!
//! Retargeting transfers eye and lip *openness* from the driving subject onto the source,
//! independently of the head motion. The retargeting networks consume a small "combined ratio"
//! vector mixing source and driving landmark geometry; this module computes those ratios from the
//! 203-point crop-space landmarks produced by the cropper.
//!
//! All functions here are pure and deterministic; the resulting ratios are consumed immediately
//! and never persisted.

use nalgebra::Point2;

const EPS: f32 = 1e-6;

/// Combined eye-openness ratio, fed to the eye retargeting network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeRatio {
    /// Source openness, left and right eye.
    pub source: [f32; 2],
    /// Driving openness (left/right average).
    pub driving: f32,
}

impl EyeRatio {
    /// Returns the ratio in the layout the retargeting network expects.
    pub fn as_array(&self) -> [f32; 3] {
        [self.source[0], self.source[1], self.driving]
    }
}

/// Combined lip-openness ratio, fed to the lip retargeting network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LipRatio {
    /// Source openness.
    pub source: f32,
    /// Driving openness. Fixed at `0.0` for the one-time lip-zero probe.
    pub driving: f32,
}

impl LipRatio {
    pub fn as_array(&self) -> [f32; 2] {
        [self.source, self.driving]
    }
}

/// Ratio of the distances |a−b| / |c−d| between landmark points.
fn distance_ratio(lmk: &[Point2<f32>], a: usize, b: usize, c: usize, d: usize) -> f32 {
    let num = (lmk[a] - lmk[b]).norm();
    let den = (lmk[c] - lmk[d]).norm();
    num / (den + EPS)
}

/// Eye-openness of both eyes: vertical lid distance over horizontal eye width.
///
/// Landmark indices follow the 203-point layout of the cropper's landmark network.
pub fn eye_close_ratio(lmk: &[Point2<f32>]) -> [f32; 2] {
    let left = distance_ratio(lmk, 6, 18, 0, 12);
    let right = distance_ratio(lmk, 30, 42, 24, 36);
    [left, right]
}

/// Lip-openness: vertical lip distance over mouth width.
pub fn lip_close_ratio(lmk: &[Point2<f32>]) -> f32 {
    distance_ratio(lmk, 90, 102, 48, 66)
}

/// Combines a driving frame's eye-openness with the source landmarks.
pub fn combined_eye_ratio(driving: [f32; 2], source_lmk: &[Point2<f32>]) -> EyeRatio {
    EyeRatio {
        source: eye_close_ratio(source_lmk),
        driving: (driving[0] + driving[1]) / 2.0,
    }
}

/// Combines a driving frame's lip-openness with the source landmarks.
///
/// Used both for per-frame lip retargeting and, with `driving = 0.0`, for the one-time lip-zero
/// probe against the source's own landmarks.
pub fn combined_lip_ratio(driving: f32, source_lmk: &[Point2<f32>]) -> LipRatio {
    LipRatio {
        source: lip_close_ratio(source_lmk),
        driving,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// 203 landmarks with a few indices pinned to known geometry.
    fn synthetic_landmarks() -> Vec<Point2<f32>> {
        let mut lmk = vec![Point2::new(0.0, 0.0); 203];
        // Left eye: 10 wide, 2 open.
        lmk[0] = Point2::new(0.0, 0.0);
        lmk[12] = Point2::new(10.0, 0.0);
        lmk[6] = Point2::new(5.0, -1.0);
        lmk[18] = Point2::new(5.0, 1.0);
        // Right eye: 10 wide, 4 open.
        lmk[24] = Point2::new(20.0, 0.0);
        lmk[36] = Point2::new(30.0, 0.0);
        lmk[30] = Point2::new(25.0, -2.0);
        lmk[42] = Point2::new(25.0, 2.0);
        // Mouth: 20 wide, 5 open.
        lmk[48] = Point2::new(0.0, 10.0);
        lmk[66] = Point2::new(20.0, 10.0);
        lmk[90] = Point2::new(10.0, 8.0);
        lmk[102] = Point2::new(10.0, 13.0);
        lmk
    }

    #[test]
    fn eye_ratio_from_known_geometry() {
        let lmk = synthetic_landmarks();
        let [left, right] = eye_close_ratio(&lmk);
        assert_relative_eq!(left, 0.2, epsilon = 1e-4);
        assert_relative_eq!(right, 0.4, epsilon = 1e-4);
    }

    #[test]
    fn lip_ratio_from_known_geometry() {
        let lmk = synthetic_landmarks();
        assert_relative_eq!(lip_close_ratio(&lmk), 0.25, epsilon = 1e-4);
    }

    #[test]
    fn combined_ratios_are_deterministic() {
        let lmk = synthetic_landmarks();
        let a = combined_eye_ratio([0.3, 0.5], &lmk);
        let b = combined_eye_ratio([0.3, 0.5], &lmk);
        assert_eq!(a, b);
        assert_relative_eq!(a.driving, 0.4);
        assert_eq!(a.as_array(), [a.source[0], a.source[1], 0.4]);

        let probe = combined_lip_ratio(0.0, &lmk);
        assert_eq!(probe.driving, 0.0);
        assert_relative_eq!(probe.source, 0.25, epsilon = 1e-4);
    }
}
