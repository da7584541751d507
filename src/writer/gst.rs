//! GStreamer-encoded recording: appsrc ! videoconvert ! encoder ! muxer ! filesink

use std::path::Path;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{info, warn};

use super::VideoSink;
use crate::capture::{FrameBuffer, Resolution};
use crate::error::{CamError, Result};
use crate::GStreamerConfig;

fn gst_err(e: impl std::fmt::Display) -> CamError {
    CamError::Sink(e.to_string())
}

pub struct GstVideoSink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    resolution: Resolution,
    frame_duration: gst::ClockTime,
    frames: u64,
}

impl GstVideoSink {
    pub fn create(
        path: &Path,
        resolution: Resolution,
        fps: f64,
        config: &GStreamerConfig,
    ) -> Result<Self> {
        gst::init().map_err(|e| gst_err(format!("Failed to initialize GStreamer: {}", e)))?;

        let pipeline_str = format!(
            "appsrc name=src format=time is-live=false ! \
             videoconvert ! \
             {} ! \
             {} ! \
             filesink location=\"{}\"",
            config.encoder,
            config.container,
            path.display()
        );
        info!("Pipeline: {}", pipeline_str);

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(gst_err)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| gst_err("Failed to create pipeline"))?;
        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| gst_err("Failed to find appsrc element"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| gst_err("Failed to cast to AppSrc"))?;

        let millis = (fps * 1000.0).round().max(1.0) as i32;
        let info = gst_video::VideoInfo::builder(
            gst_video::VideoFormat::Rgb,
            resolution.width,
            resolution.height,
        )
        .fps(gst::Fraction::new(millis, 1000))
        .build()
        .map_err(gst_err)?;
        let caps = info.to_caps().map_err(gst_err)?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gst::Format::Time);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| gst_err(format!("Failed to start pipeline: {:?}", e)))?;

        Ok(Self {
            pipeline,
            appsrc,
            resolution,
            frame_duration: gst::ClockTime::from_nseconds((1e9 / fps.max(0.001)).round() as u64),
            frames: 0,
        })
    }
}

impl VideoSink for GstVideoSink {
    fn write_frame(&mut self, frame: &FrameBuffer) -> Result<()> {
        if frame.resolution() != self.resolution {
            return Err(CamError::Sink(format!(
                "frame is {} but the recording is {}",
                frame.resolution(),
                self.resolution
            )));
        }
        let mut buffer = gst::Buffer::from_mut_slice(frame.as_bytes().to_vec());
        if let Some(buf) = buffer.get_mut() {
            buf.set_pts(self.frame_duration * self.frames);
            buf.set_duration(self.frame_duration);
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| gst_err(format!("appsrc refused buffer: {:?}", e)))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.appsrc
            .end_of_stream()
            .map_err(|e| gst_err(format!("EOS failed: {:?}", e)))?;

        let mut outcome = Ok(());
        if let Some(bus) = self.pipeline.bus() {
            let msg = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(10),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
            match msg.as_ref().map(|m| m.view()) {
                Some(gst::MessageView::Error(err)) => {
                    outcome = Err(gst_err(err.error()));
                }
                Some(_) => {}
                None => warn!("Timed out waiting for end of stream"),
            }
        }
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| gst_err(format!("Failed to stop pipeline: {:?}", e)))?;
        info!("Encoded recording closed after {} frames", self.frames);
        outcome
    }
}
