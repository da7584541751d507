use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CamError, Result};

/// Bytes per pixel of every decoded frame (RGB24)
pub const CHANNELS: usize = 3;

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size of one RGB24 frame at this resolution
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Row-major RGB24 pixel buffer sized to exactly one resolution
#[derive(Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    data: Vec<u8>,
    resolution: Resolution,
}

impl FrameBuffer {
    /// Zero-filled buffer for `resolution`
    pub fn new(resolution: Resolution) -> Self {
        Self {
            data: vec![0; resolution.byte_len()],
            resolution,
        }
    }

    /// Wrap already decoded pixels, checking the byte footprint
    pub fn from_raw(resolution: Resolution, data: Vec<u8>) -> Result<Self> {
        if data.len() != resolution.byte_len() {
            return Err(CamError::Decode(format!(
                "expected {} bytes for {}, got {}",
                resolution.byte_len(),
                resolution,
                data.len()
            )));
        }
        Ok(Self { data, resolution })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy pixels from a frame of identical resolution.
    ///
    /// Returns `false` and leaves `self` untouched when the sizes differ.
    pub fn copy_from(&mut self, other: &FrameBuffer) -> bool {
        if self.resolution != other.resolution {
            return false;
        }
        self.data.copy_from_slice(&other.data);
        true
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("resolution", &self.resolution)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// One decoded frame as delivered by a camera read
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub buffer: FrameBuffer,

    /// Time the read completed
    pub timestamp: Instant,

    /// Device-local read counter
    pub sequence: u64,
}

/// Undecoded payload straight from the driver
#[derive(Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub format: PixelFormat,
    pub resolution: Resolution,
}

/// Pixel formats we can decode to RGB24
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Yuyv4,
    Mjpeg,
}
