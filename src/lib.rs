//! Liveface portrait animation library.
//!
//! Animates a still portrait so that it follows the head pose and facial expression of a driving
//! sequence, frame by frame, and composites the result back into the original image.
//!
//! The heavy lifting (motion extraction, warping, generation, stitching and retargeting) is done
//! by a set of externally trained ONNX networks; this crate implements the per-frame keypoint
//! algebra that ties them together:
//!
//! * [`pipeline`] prepares a [`pipeline::SourceContext`] from a portrait and drives the render
//!   loop.
//! * [`motion`] composes source and driving pose/expression into new keypoints, anchored to
//!   driving frame 0.
//! * [`dispatch`] decides which stitching/retargeting corrections apply, and in which order.
//! * [`retarget`] turns eye/lip landmark geometry into retargeting ratios.
//! * [`crop`] pastes generated crops back into the original image.
//!
//! # Coordinates
//!
//! Keypoints are stored as N×3 row matrices in the coordinate system of the motion extractor's
//! output: X and Y follow the input image (Y points *down*), Z points into the scene. Rotation
//! matrices use the matching row-vector convention, i.e. they are applied as `x * R`.

use log::LevelFilter;

pub mod config;
pub mod crop;
pub mod dispatch;
pub mod error;
pub mod keypoint;
pub mod models;
pub mod motion;
pub mod nn;
pub mod num;
pub mod pipeline;
pub mod pose;
pub mod retarget;
pub mod template;
pub mod timer;

pub use error::Error;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = LevelFilter::Debug;
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("tract"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// The calling crate and liveface will log at *debug* level, `tract` at *warn* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
