pub mod calibrate;
pub mod capture;
pub mod controller;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod settings;
pub mod utils;
pub mod writer;

use std::time::Duration;

use capture::frame::PixelFormat;
use capture::{CaptureSettings, Resolution};
use serde::{Deserialize, Serialize};

pub use calibrate::{Calibration, CalibrationSettings};
pub use controller::{CamModel, CamModelHandle};
pub use error::{CamError, Result};
pub use protocol::{Command, Event, Language};
pub use writer::SinkKind;

/// Device name that selects the built-in test-pattern camera
pub const SYNTHETIC_DEVICE: &str = "synthetic";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub preview: PreviewConfig,
    pub writer: WriterConfig,
    #[cfg(feature = "gstreamer-pipeline")]
    pub gstreamer: GStreamerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// V4L2 node, empty for auto-detection, or `"synthetic"`
    pub device: String,
    /// Resolution opened at initialization
    pub width: u32,
    pub height: u32,
    /// Target rate used until calibration has measured the real one
    pub fps: f64,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub read_timeout_margin_ms: u64,
    /// Per-read bound while priming, before the real timeout is measured
    pub priming_timeout_ms: u64,
    pub priming_reads: u32,
    pub calibration_reads: u32,
    /// Pin the capture thread to this core
    pub cpu_core: Option<usize>,
    /// Delivery rate of the synthetic camera
    pub synthetic_fps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub slot_count: usize,
    /// Upper bound on how long the controller waits for a command
    pub poll_interval_ms: u64,
    /// Characters of the condition name shown in the overlay
    pub overlay_text_width: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub width: u32,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub sink: SinkKind,
}

#[cfg(feature = "gstreamer-pipeline")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GStreamerConfig {
    /// Encoder element, with properties
    pub encoder: String,
    /// Muxer element
    pub container: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 640,
            height: 480,
            fps: 30.0,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
            read_timeout_margin_ms: 1500,
            priming_timeout_ms: 5000,
            priming_reads: 10,
            calibration_reads: 240,
            cpu_core: None,
            synthetic_fps: 30.0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            slot_count: 2,
            poll_interval_ms: 50,
            overlay_text_width: 16,
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            width: 320,
            queue_depth: 8,
        }
    }
}

#[cfg(feature = "gstreamer-pipeline")]
impl Default for GStreamerConfig {
    fn default() -> Self {
        Self {
            encoder: "x264enc tune=zerolatency speed-preset=ultrafast".into(),
            container: "matroskamux".into(),
        }
    }
}

impl CaptureConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            priming_reads: self.priming_reads,
            timeout_margin: Duration::from_millis(self.read_timeout_margin_ms),
            priming_timeout: Duration::from_millis(self.priming_timeout_ms),
            cpu_core: self.cpu_core,
            ..Default::default()
        }
    }

    pub fn calibration_settings(&self) -> CalibrationSettings {
        CalibrationSettings {
            priming_reads: self.priming_reads,
            timed_reads: self.calibration_reads,
            ..Default::default()
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
