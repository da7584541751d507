//! Software camera producing a paced test pattern
//!
//! Behaves like a simple UVC driver: it only streams the resolutions it
//! advertises and snaps any other request to the nearest supported mode,
//! it paces reads to its native delivery rate, and it can be told to fail
//! or stall at a given read for failure-path testing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::device::CameraDevice;
use super::frame::{CapturedFrame, FrameBuffer, Resolution, CHANNELS};
use crate::error::{CamError, Result};

/// Resolutions advertised when none are given
pub const DEFAULT_MODES: [Resolution; 3] = [
    Resolution::new(320, 240),
    Resolution::new(640, 480),
    Resolution::new(1280, 720),
];

pub struct SyntheticCamera {
    name: String,
    resolution: Resolution,
    supported: Vec<Resolution>,
    interval: Duration,
    next_due: Option<Instant>,
    fail_at: Option<u64>,
    stall: Option<(u64, Duration)>,
    reads: Arc<AtomicU64>,
    released: bool,
}

impl SyntheticCamera {
    /// Camera delivering 30 frames/s at `resolution`
    pub fn new(resolution: Resolution) -> Self {
        let mut camera = Self {
            name: "synthetic".into(),
            resolution,
            supported: DEFAULT_MODES.to_vec(),
            interval: Duration::from_secs_f64(1.0 / 30.0),
            next_due: None,
            fail_at: None,
            stall: None,
            reads: Arc::new(AtomicU64::new(0)),
            released: false,
        };
        camera.resolution = camera.snap(resolution);
        camera
    }

    /// Restrict the modes the camera will actually stream
    pub fn with_supported(mut self, supported: Vec<Resolution>) -> Self {
        self.supported = supported;
        self.resolution = self.snap(self.resolution);
        self
    }

    /// Native delivery rate; `0` disables pacing
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.interval = if fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::ZERO
        };
        self
    }

    /// Every read from the `read_index`-th (zero based) on returns an error
    pub fn fail_at(mut self, read_index: u64) -> Self {
        self.fail_at = Some(read_index);
        self
    }

    /// The `read_index`-th read blocks for `duration` before returning
    pub fn stall_at(mut self, read_index: u64, duration: Duration) -> Self {
        self.stall = Some((read_index, duration));
        self
    }

    /// Shared read counter, usable after the camera has been moved away
    pub fn read_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.reads)
    }

    fn snap(&self, requested: Resolution) -> Resolution {
        if self.supported.is_empty() || self.supported.contains(&requested) {
            return requested;
        }
        self.supported
            .iter()
            .copied()
            .min_by_key(|mode| mode.pixel_count().abs_diff(requested.pixel_count()))
            .unwrap_or(requested)
    }

    fn pace(&mut self) {
        if self.interval.is_zero() {
            return;
        }
        let now = Instant::now();
        let due = match self.next_due {
            // Fell far behind (e.g. after a stall); restart the cadence
            Some(due) if now.saturating_duration_since(due) > self.interval * 4 => now,
            Some(due) => due,
            None => now,
        };
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due + self.interval);
    }

    fn pattern(&self, sequence: u64) -> FrameBuffer {
        let mut frame = FrameBuffer::new(self.resolution);
        let width = self.resolution.width as usize;
        let shade = (sequence % 256) as u8;
        for (i, px) in frame.as_bytes_mut().chunks_exact_mut(CHANNELS).enumerate() {
            let x = i % width;
            px[0] = shade;
            px[1] = (x % 256) as u8;
            px[2] = shade;
        }
        frame
    }
}

impl CameraDevice for SyntheticCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn set_resolution(&mut self, resolution: Resolution) -> Result<()> {
        if self.released {
            return Err(CamError::Device("camera released".into()));
        }
        self.resolution = self.snap(resolution);
        self.next_due = None;
        debug!(requested = %resolution, actual = %self.resolution, "synthetic mode set");
        Ok(())
    }

    fn read(&mut self) -> Result<CapturedFrame> {
        if self.released {
            return Err(CamError::Device("camera released".into()));
        }
        let sequence = self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_at.is_some_and(|k| sequence >= k) {
            return Err(CamError::Device(format!("injected read failure at {}", sequence)));
        }

        self.pace();
        if let Some((k, duration)) = self.stall {
            if sequence == k {
                thread::sleep(duration);
            }
        }

        Ok(CapturedFrame {
            buffer: self.pattern(sequence),
            timestamp: Instant::now(),
            sequence,
        })
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;
        Ok(())
    }
}
