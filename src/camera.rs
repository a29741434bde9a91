use crate::error::{Error, Result};
use image::RgbImage;
use nokhwa::{
    pixel_format::RgbFormat,
    utils::{CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    Camera,
};
use tracing::{debug, error, info};

/// A device that yields RGB frames until it fails or is released.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<RgbImage>;
    fn release(&mut self);
}

/// Holds an acquired frame source and releases it exactly once on drop,
/// whichever path leaves the session.
pub struct CameraSession<S: FrameSource> {
    source: S,
}

impl<S: FrameSource> CameraSession<S> {
    pub fn new(source: S) -> Self {
        debug!("camera session started");
        Self { source }
    }

    pub fn next_frame(&mut self) -> Result<RgbImage> {
        self.source.next_frame()
    }
}

impl<S: FrameSource> Drop for CameraSession<S> {
    fn drop(&mut self) {
        self.source.release();
        debug!("camera session released");
    }
}

pub struct NokhwaCamera {
    camera: Camera,
}

impl NokhwaCamera {
    pub fn open(index: u32) -> Result<Self> {
        let mut cam = None;
        for (w, h) in [(1280, 720), (640, 480)] {
            for fmt in [FrameFormat::RAWRGB, FrameFormat::MJPEG, FrameFormat::YUYV] {
                let req = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(
                    CameraFormat::new_from(w, h, fmt, 30),
                ));
                if let Ok(c) = Camera::new(CameraIndex::Index(index), req) {
                    cam = Some(c);
                    break;
                }
            }
            if cam.is_some() {
                break;
            }
        }
        let mut camera = match cam {
            Some(c) => c,
            None => {
                let any = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
                Camera::new(CameraIndex::Index(index), any)
                    .map_err(|e| Error::Device(format!("failed to open camera {index}: {e}")))?
            }
        };
        camera
            .open_stream()
            .map_err(|e| Error::Device(format!("failed to open camera stream: {e}")))?;
        info!(index, format = ?camera.camera_format(), "camera stream opened");
        Ok(Self { camera })
    }
}

impl FrameSource for NokhwaCamera {
    fn next_frame(&mut self) -> Result<RgbImage> {
        let frame = self.camera.frame()?;
        Ok(frame.decode_image::<RgbFormat>()?)
    }

    fn release(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            error!("failed to stop camera stream: {e}");
        }
    }
}
