//! Pre-baked driving templates.
//!
//! A template stores, per frame, the motion extractor's keypoint info together with the frame's
//! rotation matrix — absolute data, so animating from a template needs no motion extractor and no
//! driving video. Templates are stored as JSON.

use std::fs;
use std::path::Path;

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::keypoint::KeypointInfo;

/// One pre-baked driving frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateFrame {
    pub info: KeypointInfo,
    /// The frame's rotation matrix, baked in at template creation time.
    pub rotation: Matrix3<f32>,
}

/// An ordered sequence of pre-baked driving frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrivingTemplate {
    pub frames: Vec<TemplateFrame>,
}

impl DrivingTemplate {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let data = serde_json::to_string(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypoint::{keypoints_from_rows, zero_keypoints};
    use nalgebra::Vector3;

    #[test]
    fn template_serializes_and_loads() {
        let info = KeypointInfo {
            kp: keypoints_from_rows(&[0.5, -0.5, 0.0]),
            pitch: 3.0,
            yaw: -1.0,
            roll: 0.5,
            exp: zero_keypoints(1),
            scale: 1.2,
            t: Vector3::new(0.1, 0.2, 0.0),
        };
        let template = DrivingTemplate {
            frames: vec![TemplateFrame {
                rotation: info.rotation(),
                info,
            }],
        };

        let json = serde_json::to_string(&template).unwrap();
        let parsed: DrivingTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, template);
    }

    #[test]
    fn garbage_is_an_invalid_template() {
        let err = serde_json::from_str::<DrivingTemplate>("not json").unwrap_err();
        assert!(matches!(Error::from(err), Error::InvalidTemplate(_)));
    }
}
