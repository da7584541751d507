//! Headerless RGB24 stream: `ffmpeg -f rawvideo -pix_fmt rgb24 -s WxH -r FPS -i file`

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use super::VideoSink;
use crate::capture::{FrameBuffer, Resolution};
use crate::error::{CamError, Result};

pub struct RawVideoSink {
    out: BufWriter<File>,
    resolution: Resolution,
    frames: u64,
}

impl RawVideoSink {
    pub fn create(path: &Path, resolution: Resolution) -> Result<Self> {
        let file = File::create(path)?;
        info!("Raw RGB24 recording to {} at {}", path.display(), resolution);
        Ok(Self {
            out: BufWriter::with_capacity(resolution.byte_len().max(8192), file),
            resolution,
            frames: 0,
        })
    }
}

impl VideoSink for RawVideoSink {
    fn write_frame(&mut self, frame: &FrameBuffer) -> Result<()> {
        if frame.resolution() != self.resolution {
            return Err(CamError::Sink(format!(
                "frame is {} but the recording is {}",
                frame.resolution(),
                self.resolution
            )));
        }
        self.out.write_all(frame.as_bytes())?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        info!("Raw recording closed after {} frames", self.frames);
        Ok(())
    }
}
