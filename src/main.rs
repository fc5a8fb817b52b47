use std::path::{Path, PathBuf};
use std::process::exit;

use anyhow::{bail, Context};
use image::RgbImage;
use nalgebra::{Matrix2x3, Point2};
use serde::Deserialize;

use liveface::config::InferenceConfig;
use liveface::crop::{invert_affine, warp_affine, CropInfo, Cropper};
use liveface::models::{ModelPaths, OnnxModelSuite};
use liveface::pipeline::{DrivingSource, Pipeline};
use liveface::Error;

const USAGE: &str = "\
usage: liveface <models-dir> <source-image> <driving> <crop-json> <output-dir> [options]

  <driving> is a directory of image frames or a .json driving template.
  <crop-json> holds the source crop produced by an external cropping tool:
      { \"m_c2o\": [[a, b, tx], [c, d, ty]], \"lmk_crop\": [[x, y], ...] }

options:
  --absolute        use absolute driving motion instead of relative deltas
  --no-stitching    skip the stitching network
  --no-lip-zero     keep the source's lip openness as-is
  --no-pasteback    output crop-space frames only
  --debug-frames    also write side-by-side debug frames";

struct Args {
    models_dir: PathBuf,
    source: PathBuf,
    driving: PathBuf,
    crop_json: PathBuf,
    output_dir: PathBuf,
    cfg: InferenceConfig,
    debug_frames: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut positional = Vec::new();
    let mut cfg = InferenceConfig::default();
    let mut debug_frames = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--absolute" => cfg.flag_relative = false,
            "--no-stitching" => cfg.flag_stitching = false,
            "--no-lip-zero" => cfg.flag_lip_zero = false,
            "--no-pasteback" => cfg.flag_pasteback = false,
            "--debug-frames" => debug_frames = true,
            "--help" | "-h" => {
                println!("{USAGE}");
                exit(0);
            }
            flag if flag.starts_with('-') => bail!("unknown option `{flag}`\n{USAGE}"),
            _ => positional.push(PathBuf::from(arg)),
        }
    }
    let [models_dir, source, driving, crop_json, output_dir] = <[PathBuf; 5]>::try_from(positional)
        .map_err(|args| anyhow::anyhow!("expected 5 arguments, got {}\n{USAGE}", args.len()))?;
    Ok(Args {
        models_dir,
        source,
        driving,
        crop_json,
        output_dir,
        cfg,
        debug_frames,
    })
}

/// Crop data computed ahead of time by an external cropping tool.
///
/// Face detection and landmark extraction are not part of this binary, so the source crop is
/// loaded from a JSON sidecar file instead; the crop image itself is recovered by warping the
/// source with the inverse of `m_c2o`.
#[derive(Deserialize)]
struct PrecomputedCrop {
    m_c2o: [[f32; 3]; 2],
    lmk_crop: Vec<[f32; 2]>,
}

struct PrecomputedCropper {
    m_c2o: Matrix2x3<f32>,
    lmk_crop: Vec<Point2<f32>>,
    crop_size: (u32, u32),
}

impl PrecomputedCropper {
    fn load(path: &Path, crop_size: (u32, u32)) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading crop data from {}", path.display()))?;
        let crop: PrecomputedCrop = serde_json::from_str(&data)?;
        let [[a, b, tx], [c, d, ty]] = crop.m_c2o;
        Ok(Self {
            m_c2o: Matrix2x3::new(a, b, tx, c, d, ty),
            lmk_crop: crop
                .lmk_crop
                .iter()
                .map(|&[x, y]| Point2::new(x, y))
                .collect(),
            crop_size,
        })
    }
}

impl Cropper for PrecomputedCropper {
    fn crop(&self, image: &RgbImage) -> Result<CropInfo, Error> {
        let m_o2c = invert_affine(&self.m_c2o).ok_or(Error::NoFaceDetected)?;
        let img_crop = warp_affine(image, &m_o2c, self.crop_size).ok_or(Error::NoFaceDetected)?;
        Ok(CropInfo {
            m_c2o: self.m_c2o,
            lmk_crop: self.lmk_crop.clone(),
            img_crop,
        })
    }

    fn landmarks(&self, _image: &RgbImage) -> anyhow::Result<Vec<Point2<f32>>> {
        bail!("no landmark network configured; eye/lip retargeting is unavailable")
    }
}

fn main() -> anyhow::Result<()> {
    liveface::init_logger!();

    let args = parse_args()?;

    let models = OnnxModelSuite::load(
        &ModelPaths::from_dir(&args.models_dir),
        args.cfg.input_shape,
    )?;
    let cropper = PrecomputedCropper::load(&args.crop_json, args.cfg.input_shape)?;
    let pipeline = Pipeline::new(models, cropper);

    let source = image::open(&args.source)
        .with_context(|| format!("reading source image from {}", args.source.display()))?
        .to_rgb8();
    let driving = DrivingSource::load(&args.driving)?;

    let session = pipeline.begin(&source, args.cfg)?;
    log::info!("session prepared, rendering {} frames", driving.len());
    let output = session.render(&driving)?;

    std::fs::create_dir_all(&args.output_dir)?;
    let frames = if output.composited.is_empty() {
        &output.crops
    } else {
        &output.composited
    };
    for (i, frame) in frames.iter().enumerate() {
        frame.save(args.output_dir.join(format!("frame_{i:05}.png")))?;
    }
    if args.debug_frames {
        for (i, frame) in output.debug.iter().enumerate() {
            frame.save(args.output_dir.join(format!("debug_{i:05}.png")))?;
        }
    }
    log::info!("wrote {} frames to {}", frames.len(), args.output_dir.display());

    Ok(())
}
