//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use image::RgbImage;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Mmap buffers queued per capture.
const CAPTURE_BUFFERS: u32 = 4;
/// Highest /dev/videoN checked by [`Camera::list_devices`].
const MAX_VIDEO_NODES: u32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("{0} is not a video capture device")]
    NotCaptureDevice(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
}

/// An open device that yields frames.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Opens the camera the live session reads from.
pub trait CameraOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// A discovered V4L2 capture node.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera may settle on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, the format we ask for.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    /// Decode one raw buffer into RGB.
    pub fn decode(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
            Self::Y16 => {
                let gray = frame::y16_to_grey(buf, width, height)?;
                frame::grey_to_rgb(&gray, width, height)
            }
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
    /// Poll timeout for dequeueing a buffer, unbounded when `None`.
    read_timeout: Option<Duration>,
}

impl Camera {
    /// Open a capture device (e.g. "/dev/video0") and ask for YUYV at the
    /// given size. The driver may settle on another size or format.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
            Some(16) => CameraError::DeviceBusy(device_path.to_string()),
            _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("querying capabilities: {e}")))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }

        let mut requested = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("reading format: {e}")))?;
        requested.fourcc = FourCC::new(b"YUYV");
        requested.width = width;
        requested.height = height;
        let format = device
            .set_format(&requested)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("setting format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(format.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "driver offered {}, need YUYV, GREY or Y16",
                format.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            driver = %caps.driver,
            width = format.width,
            height = format.height,
            ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            device,
            width: format.width,
            height: format.height,
            device_path: device_path.to_string(),
            fourcc: format.fourcc,
            pixel_format,
            read_timeout: None,
        })
    }

    /// Fail a capture with [`CameraError::CaptureFailed`] instead of waiting
    /// longer than `timeout` for a buffer.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = Some(timeout);
    }

    /// Dequeue one frame and convert it to RGB.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, CAPTURE_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("mapping buffers: {e}")))?;
        if let Some(timeout) = self.read_timeout {
            stream.set_timeout(timeout);
        }

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeueing buffer: {e}")))?;

        let image = self
            .pixel_format
            .decode(buf, self.width, self.height)
            .map_err(|e| CameraError::CaptureFailed(format!("{:?} frame: {e}", self.pixel_format)))?;

        Ok(Frame {
            image,
            timestamp: Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// Capture nodes among /dev/video0../dev/video15.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..MAX_VIDEO_NODES)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

/// Opens a [`Camera`] at a fixed device path and size.
#[derive(Debug, Clone)]
pub struct V4l2Opener {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub read_timeout: Duration,
}

impl CameraOpener for V4l2Opener {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        let mut camera = Camera::open(&self.device_path, self.width, self.height)?;
        camera.set_read_timeout(self.read_timeout);
        Ok(Box::new(camera))
    }
}
