//! rollcall-hw: Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access behind the [`FrameSource`] and
//! [`CameraOpener`] seams so the live session can run against any device.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraOpener, DeviceInfo, FrameSource, PixelFormat, V4l2Opener};
pub use frame::{Frame, FrameError};
