pub mod decimate;
pub mod decoder;
pub mod device;
pub mod fps;
pub mod frame;
pub mod stream;
pub mod synthetic;
pub mod v4l2;

pub use device::{CameraDevice, CameraOpener};
pub use fps::{FpsGauge, FpsTracker};
pub use frame::{CapturedFrame, FrameBuffer, PixelFormat, Resolution};
pub use stream::{CaptureItem, CaptureLoop, CaptureSettings};
pub use synthetic::SyntheticCamera;
pub use v4l2::V4l2Camera;
