//! Camera handle boundary: open, read, set-resolution, release

use super::frame::{CapturedFrame, Resolution};
use crate::error::Result;

/// A camera the pipeline can drive.
///
/// Exactly one component owns the handle at a time (the calibrator, the
/// capture loop or the controller), so implementations need `Send` but not
/// `Sync`.
pub trait CameraDevice: Send {
    /// Human readable identifier for logs
    fn name(&self) -> &str;

    /// Resolution the device is currently configured for
    fn resolution(&self) -> Resolution;

    /// Ask the device for `resolution`.
    ///
    /// Drivers may silently pick a nearby mode; callers that need the exact
    /// size must verify it against the next frame read.
    fn set_resolution(&mut self, resolution: Resolution) -> Result<()>;

    /// Block until the next frame is available and decode it
    fn read(&mut self) -> Result<CapturedFrame>;

    /// Free the underlying hardware; further reads fail
    fn release(&mut self) -> Result<()>;
}

/// Opens a camera at the requested default resolution
pub type CameraOpener = Box<dyn FnMut(Resolution) -> Result<Box<dyn CameraDevice>> + Send>;
