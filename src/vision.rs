//! Camera eye-state loop: detect eye regions, score each with a small CNN.

use crate::artifact::{resolve_artifact, HubSource};
use crate::camera::{CameraSession, FrameSource};
use crate::cascade::{HaarCascade, Region, EYE_MIN_NEIGHBORS, EYE_SCALE_FACTOR};
use crate::classifier::EyeState;
use crate::error::{Error, Result};
use candle_core::{Device, Tensor};
use candle_onnx::{onnx, read_file, simple_eval};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, trace, warn};

/// Side of the square tile fed to the network.
pub const TILE_SIZE: u32 = 64;
pub const OPEN_THRESHOLD: f32 = 0.5;

/// Only a score strictly above the threshold counts as open.
pub fn state_for_score(score: f32) -> EyeState {
    if score > OPEN_THRESHOLD {
        EyeState::Open
    } else {
        EyeState::Closed
    }
}

pub trait RegionDetector {
    fn detect(&self, gray: &GrayImage) -> Vec<Region>;
}

impl RegionDetector for HaarCascade {
    fn detect(&self, gray: &GrayImage) -> Vec<Region> {
        self.detect_multi_scale(gray, EYE_SCALE_FACTOR, EYE_MIN_NEIGHBORS)
    }
}

/// Scores a `TILE_SIZE` square grayscale tile; higher means more open.
pub trait TileClassifier {
    fn score(&self, tile: &GrayImage) -> Result<f32>;
}

/// Crops the region and resizes it to the network's square input.
pub fn extract_tile(gray: &GrayImage, region: &Region) -> GrayImage {
    let x = region.x.min(gray.width().saturating_sub(1));
    let y = region.y.min(gray.height().saturating_sub(1));
    let w = region.width.min(gray.width() - x).max(1);
    let h = region.height.min(gray.height() - y).max(1);
    let crop = imageops::crop_imm(gray, x, y, w, h).to_image();
    imageops::resize(&crop, TILE_SIZE, TILE_SIZE, FilterType::Triangle)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `(1, H, W, 1)`, as exported from Keras.
    #[default]
    Nhwc,
    /// `(1, 1, H, W)`.
    Nchw,
}

/// Tile pixels scaled to `[0, 1]` in a batch of one.
pub fn tile_tensor(tile: &GrayImage, layout: TensorLayout, device: &Device) -> Result<Tensor> {
    let (w, h) = (tile.width() as usize, tile.height() as usize);
    let data: Vec<f32> = tile.pixels().map(|p| f32::from(p[0]) / 255.0).collect();
    let tensor = match layout {
        TensorLayout::Nhwc => Tensor::from_vec(data, (1, h, w, 1), device)?,
        TensorLayout::Nchw => Tensor::from_vec(data, (1, 1, h, w), device)?,
    };
    Ok(tensor)
}

pub struct OnnxEyeClassifier {
    model: onnx::ModelProto,
    input_name: String,
    output_name: String,
    layout: TensorLayout,
    device: Device,
}

impl OnnxEyeClassifier {
    pub fn load(path: &Path, layout: TensorLayout, hub: Option<&HubSource>) -> Result<Self> {
        let path = resolve_artifact(path, hub)?;
        let model = read_file(&path).map_err(|e| {
            Error::Configuration(format!("failed to load {}: {e}", path.display()))
        })?;
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| Error::Configuration("model graph missing".into()))?;
        let input_name = graph
            .input
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| Error::Configuration("model has no inputs".into()))?;
        let output_name = graph
            .output
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| Error::Configuration("model has no outputs".into()))?;
        info!(path = %path.display(), input = %input_name, output = %output_name, "eye model loaded");
        Ok(Self {
            model,
            input_name,
            output_name,
            layout,
            device: Device::Cpu,
        })
    }
}

impl TileClassifier for OnnxEyeClassifier {
    fn score(&self, tile: &GrayImage) -> Result<f32> {
        let input = tile_tensor(tile, self.layout, &self.device)?;
        let mut inputs = HashMap::new();
        inputs.insert(self.input_name.clone(), input);
        let mut outputs = simple_eval(&self.model, inputs)?;
        let output = outputs
            .remove(&self.output_name)
            .ok_or_else(|| Error::Inference("model output missing".into()))?;
        let values = output.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?;
        values
            .first()
            .copied()
            .ok_or_else(|| Error::Inference("model output is empty".into()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EyeObservation {
    pub region: Region,
    pub score: f32,
    pub state: EyeState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
}

pub struct VisionLoop<D, C> {
    detector: D,
    classifier: C,
    state: LoopState,
}

impl<D: RegionDetector, C: TileClassifier> VisionLoop<D, C> {
    pub fn new(detector: D, classifier: C) -> Self {
        Self {
            detector,
            classifier,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Detects and classifies every eye region in one frame.
    pub fn process_frame(&self, frame: &RgbImage) -> Result<Vec<EyeObservation>> {
        let gray = DynamicImage::ImageRgb8(frame.clone()).into_luma8();
        let regions = self.detector.detect(&gray);
        trace!(regions = regions.len(), "eye regions detected");
        regions
            .into_iter()
            .map(|region| {
                let score = self.classifier.score(&extract_tile(&gray, &region))?;
                Ok(EyeObservation {
                    region,
                    score,
                    state: state_for_score(score),
                })
            })
            .collect()
    }

    /// Runs until `keep_running` is cleared or the source fails.
    ///
    /// The source is released on every exit path. Returns the number of
    /// frames processed; a read failure ends the session with `Error::Device`.
    pub fn run<S, F>(&mut self, source: S, keep_running: &AtomicBool, mut on_frame: F) -> Result<usize>
    where
        S: FrameSource,
        F: FnMut(&RgbImage, &[EyeObservation]),
    {
        let mut session = CameraSession::new(source);
        self.state = LoopState::Running;
        info!("vision loop running");
        let result = self.drive(&mut session, keep_running, &mut on_frame);
        drop(session);
        self.state = LoopState::Idle;
        match &result {
            Ok(frames) => info!(frames, "vision loop stopped"),
            Err(e) => warn!("vision loop aborted: {e}"),
        }
        result
    }

    fn drive<S, F>(
        &self,
        session: &mut CameraSession<S>,
        keep_running: &AtomicBool,
        on_frame: &mut F,
    ) -> Result<usize>
    where
        S: FrameSource,
        F: FnMut(&RgbImage, &[EyeObservation]),
    {
        let mut frames = 0;
        while keep_running.load(Ordering::Relaxed) {
            let frame = session.next_frame()?;
            let observations = self.process_frame(&frame)?;
            debug!(frame = frames, eyes = observations.len(), "frame processed");
            on_frame(&frame, &observations);
            frames += 1;
        }
        Ok(frames)
    }
}

/// Draws a box per observation: green for open, red for closed.
pub fn annotate(frame: &mut RgbImage, observations: &[EyeObservation]) {
    for obs in observations {
        let color = match obs.state {
            EyeState::Open => Rgb([0, 255, 0]),
            EyeState::Closed => Rgb([255, 0, 0]),
        };
        draw_box(frame, &obs.region, color);
    }
}

fn draw_box(frame: &mut RgbImage, r: &Region, color: Rgb<u8>) {
    let (w, h) = frame.dimensions();
    if r.width == 0 || r.height == 0 || r.x >= w || r.y >= h {
        return;
    }
    let x1 = (r.x + r.width - 1).min(w - 1);
    let y1 = (r.y + r.height - 1).min(h - 1);
    for x in r.x..=x1 {
        frame.put_pixel(x, r.y, color);
        frame.put_pixel(x, y1, color);
    }
    for y in r.y..=y1 {
        frame.put_pixel(r.x, y, color);
        frame.put_pixel(x1, y, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_strict() {
        assert_eq!(state_for_score(0.5), EyeState::Closed);
        assert_eq!(state_for_score(0.51), EyeState::Open);
        assert_eq!(state_for_score(0.49), EyeState::Closed);
        assert_eq!(state_for_score(1.0), EyeState::Open);
        assert_eq!(state_for_score(0.0), EyeState::Closed);
    }

    #[test]
    fn tile_is_square_and_normalized() {
        let gray = GrayImage::from_fn(120, 80, |x, _| image::Luma([(x * 2) as u8]));
        let region = Region {
            x: 10,
            y: 10,
            width: 30,
            height: 20,
        };
        let tile = extract_tile(&gray, &region);
        assert_eq!(tile.dimensions(), (TILE_SIZE, TILE_SIZE));

        let t = tile_tensor(&tile, TensorLayout::Nhwc, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 64, 64, 1]);
        let values = t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));

        let t = tile_tensor(&tile, TensorLayout::Nchw, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 1, 64, 64]);
    }

    #[test]
    fn region_past_the_edge_is_clamped() {
        let gray = GrayImage::new(50, 50);
        let region = Region {
            x: 40,
            y: 45,
            width: 30,
            height: 30,
        };
        assert_eq!(extract_tile(&gray, &region).dimensions(), (64, 64));
    }

    #[test]
    fn annotation_marks_region_border() {
        let mut frame = RgbImage::new(20, 20);
        let obs = EyeObservation {
            region: Region {
                x: 2,
                y: 3,
                width: 5,
                height: 4,
            },
            score: 0.9,
            state: EyeState::Open,
        };
        annotate(&mut frame, &[obs]);
        assert_eq!(*frame.get_pixel(2, 3), Rgb([0, 255, 0]));
        assert_eq!(*frame.get_pixel(6, 6), Rgb([0, 255, 0]));
        assert_eq!(*frame.get_pixel(4, 4), Rgb([0, 0, 0]));
    }
}
