use std::path::Path;

use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::error::{CamError, Result};

/// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

/// Pick the first video node that can capture MJPEG, falling back to YUYV
pub fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    let mut fallback = None;
    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("{} has no capture capability", path);
            continue;
        }
        let Ok(formats) = dev.enum_formats() else {
            continue;
        };

        for fmt in formats {
            if fmt.fourcc == FourCC::new(b"MJPG") {
                info!("Found MJPEG device: {} - {}", path, caps.card);
                return Ok(FoundDevice {
                    path,
                    format: PixelFormat::Mjpeg,
                });
            }
            if fmt.fourcc == FourCC::new(b"YUYV") && fallback.is_none() {
                info!("Found YUYV device: {} - {}", path, caps.card);
                fallback = Some(FoundDevice {
                    path: path.clone(),
                    format: PixelFormat::Yuyv4,
                });
            }
        }
    }

    fallback.ok_or_else(|| CamError::Device("No suitable capture device found".into()))
}
