//! V4L2 camera backend with memory-mapped streaming

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::decoder::decode_frame;
use super::device::CameraDevice;
use super::frame::{CapturedFrame, PixelFormat, RawFrame, Resolution};
use crate::error::{CamError, Result};

fn fourcc_for(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
    }
}

fn format_for(fourcc: FourCC) -> Option<PixelFormat> {
    [PixelFormat::Mjpeg, PixelFormat::Yuyv4, PixelFormat::Rgb24]
        .into_iter()
        .find(|f| fourcc_for(*f) == fourcc)
}

/// Camera backed by a `/dev/video*` node
pub struct V4l2Camera {
    path: String,
    device: Device,
    stream: Option<MmapStream<'static>>,
    format: PixelFormat,
    resolution: Resolution,
    buffer_count: u32,
    sequence: u64,
}

impl V4l2Camera {
    /// Open `path` and negotiate `format` at `resolution`
    pub fn open(
        path: &str,
        resolution: Resolution,
        format: PixelFormat,
        buffer_count: u32,
    ) -> Result<Self> {
        info!("Opening V4L2 camera: {}", path);
        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CamError::Device(format!(
                "{} doesn't support video capture",
                path
            )));
        }

        let mut camera = Self {
            path: path.to_string(),
            device,
            stream: None,
            format,
            resolution,
            buffer_count,
            sequence: 0,
        };
        camera.configure(resolution)?;
        Ok(camera)
    }

    fn configure(&mut self, resolution: Resolution) -> Result<()> {
        // The driver refuses format changes while buffers are mapped
        self.stream = None;

        let mut fmt = self.device.format()?;
        fmt.width = resolution.width;
        fmt.height = resolution.height;
        fmt.fourcc = fourcc_for(self.format);
        let actual = self.device.set_format(&fmt)?;

        self.format = format_for(actual.fourcc).ok_or_else(|| {
            CamError::Unsupported(format!("driver selected pixel format {}", actual.fourcc))
        })?;
        self.resolution = Resolution::new(actual.width, actual.height);
        debug!(requested = %resolution, actual = %self.resolution, format = ?self.format, "format negotiated");
        Ok(())
    }

    fn ensure_stream(&mut self) -> Result<&mut MmapStream<'static>> {
        if self.stream.is_none() {
            let stream =
                MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)?;
            info!("Capture stream started with {} buffers", self.buffer_count);
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| CamError::Device("stream not started".into()))
    }
}

impl CameraDevice for V4l2Camera {
    fn name(&self) -> &str {
        &self.path
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn set_resolution(&mut self, resolution: Resolution) -> Result<()> {
        self.configure(resolution)
    }

    #[instrument(skip(self), level = "trace")]
    fn read(&mut self) -> Result<CapturedFrame> {
        let data = {
            let stream = self.ensure_stream()?;
            let (buf, _meta) = stream.next()?;
            Bytes::copy_from_slice(buf)
        };
        let timestamp = Instant::now();

        let raw = RawFrame {
            data,
            format: self.format,
            resolution: self.resolution,
        };
        let buffer = decode_frame(&raw)?;
        self.sequence += 1;

        Ok(CapturedFrame {
            buffer,
            timestamp,
            sequence: self.sequence,
        })
    }

    fn release(&mut self) -> Result<()> {
        self.stream = None;
        info!("Released V4L2 camera {}", self.path);
        Ok(())
    }
}
