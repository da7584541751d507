//! Recording writer: drains the write queue into one video file
//!
//! The writer thread pops frames in arrival order. Stopping drops the
//! controller's handle on the queue; once the pipeline consumer has
//! released its handle too the channel disconnects, the thread finishes
//! whatever is still queued and closes the file. With `discard` the
//! backlog is thrown away instead.

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst;
pub mod raw;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::capture::{FrameBuffer, Resolution};
use crate::error::{CamError, Result};
use crate::pipeline::stats::PipelineStats;
use crate::Config;

pub use raw::RawVideoSink;

/// Destination for recorded frames (the external encoder)
pub trait VideoSink: Send {
    fn write_frame(&mut self, frame: &FrameBuffer) -> Result<()>;

    /// Flush and close the file
    fn finish(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SinkKind {
    #[default]
    Raw,
    Gstreamer,
}

/// Open the configured sink for a recording at `resolution` and nominal `fps`
pub fn open_sink(
    config: &Config,
    path: &Path,
    resolution: Resolution,
    fps: f64,
) -> Result<Box<dyn VideoSink>> {
    match config.writer.sink {
        SinkKind::Raw => Ok(Box::new(RawVideoSink::create(path, resolution)?)),
        #[cfg(feature = "gstreamer-pipeline")]
        SinkKind::Gstreamer => Ok(Box::new(gst::GstVideoSink::create(
            path,
            resolution,
            fps,
            &config.gstreamer,
        )?)),
        #[cfg(not(feature = "gstreamer-pipeline"))]
        SinkKind::Gstreamer => {
            let _ = fps;
            Err(CamError::Unsupported(
                "built without the gstreamer-pipeline feature".into(),
            ))
        }
    }
}

/// Producer side of the write queue
pub struct WriteQueue {
    tx: Sender<FrameBuffer>,
    stats: Arc<PipelineStats>,
}

impl WriteQueue {
    /// Append a frame; `false` once the writer has gone away
    pub fn push(&self, frame: FrameBuffer) -> bool {
        let accepted = self.tx.send(frame).is_ok();
        if accepted {
            self.stats.record_enqueued(1);
        }
        accepted
    }

    /// Frames waiting to be written
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub frames_written: u64,
    pub frames_discarded: u64,
}

pub struct Writer {
    path: PathBuf,
    queue: Option<Arc<WriteQueue>>,
    discard: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<WriterStats>>>,
}

impl Writer {
    /// Spawn the writer thread with a fresh, empty queue
    pub fn start(
        sink: Box<dyn VideoSink>,
        path: PathBuf,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let (tx, rx) = flume::unbounded();
        let discard = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        let thread = {
            let discard = Arc::clone(&discard);
            let failed = Arc::clone(&failed);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name("labcam-writer".into())
                .spawn(move || drain(sink, rx, discard, failed, stats))?
        };
        info!("Writer started: {}", path.display());

        Ok(Self {
            path,
            queue: Some(Arc::new(WriteQueue { tx, stats })),
            discard,
            failed,
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn queue(&self) -> Option<Arc<WriteQueue>> {
        self.queue.clone()
    }

    /// The sink reported an error and the thread gave up
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Close the queue and wait for the thread.
    ///
    /// Every other holder of the queue must have dropped it, otherwise this
    /// blocks until they do.
    pub fn stop(mut self, discard: bool) -> Result<WriterStats> {
        self.discard.store(discard, Ordering::Release);
        self.queue = None;
        let thread = self
            .thread
            .take()
            .ok_or_else(|| CamError::Sink("writer already stopped".into()))?;
        let outcome = thread
            .join()
            .map_err(|_| CamError::Sink("writer thread panicked".into()))?;
        info!(
            discard,
            path = %self.path.display(),
            "Writer stopped"
        );
        outcome
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.discard.store(true, Ordering::Release);
            self.queue = None;
            let _ = thread.join();
        }
    }
}

#[instrument(skip_all, name = "writer")]
fn drain(
    mut sink: Box<dyn VideoSink>,
    rx: Receiver<FrameBuffer>,
    discard: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
) -> Result<WriterStats> {
    let started = Instant::now();
    let mut out = WriterStats::default();

    while let Ok(frame) = rx.recv() {
        if discard.load(Ordering::Acquire) {
            out.frames_discarded = 1 + rx.drain().count() as u64;
            break;
        }
        if let Err(e) = sink.write_frame(&frame) {
            error!("Write failed after {} frames: {}", out.frames_written, e);
            failed.store(true, Ordering::Release);
            let _ = sink.finish();
            return Err(e);
        }
        out.frames_written += 1;
        stats.record_written();
    }

    if let Err(e) = sink.finish() {
        error!("Closing recording failed: {}", e);
        failed.store(true, Ordering::Release);
        return Err(e);
    }
    info!(
        frames = out.frames_written,
        discarded = out.frames_discarded,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Recording drained"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records what it was given, optionally failing or slowing down
    #[derive(Clone, Default)]
    struct MemorySink {
        frames: Arc<Mutex<Vec<u8>>>,
        finished: Arc<AtomicBool>,
        fail_after: Option<usize>,
        delay: Duration,
    }

    impl VideoSink for MemorySink {
        fn write_frame(&mut self, frame: &FrameBuffer) -> Result<()> {
            let mut frames = self.frames.lock().unwrap();
            if self.fail_after.is_some_and(|n| frames.len() >= n) {
                return Err(CamError::Sink("disk full".into()));
            }
            thread::sleep(self.delay);
            frames.push(frame.as_bytes()[0]);
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn frame(tag: u8) -> FrameBuffer {
        FrameBuffer::from_raw(Resolution::new(2, 1), vec![tag; 6]).unwrap()
    }

    #[test]
    fn stop_drains_everything_in_order() {
        let sink = MemorySink {
            delay: Duration::from_millis(2),
            ..Default::default()
        };
        let stats = Arc::new(PipelineStats::new(1));
        let writer = Writer::start(Box::new(sink.clone()), "mem".into(), Arc::clone(&stats)).unwrap();
        let queue = writer.queue().unwrap();
        for tag in 0..20 {
            assert!(queue.push(frame(tag)));
        }
        drop(queue);

        let result = writer.stop(false).unwrap();
        assert_eq!(result.frames_written, 20);
        assert_eq!(*sink.frames.lock().unwrap(), (0..20).collect::<Vec<u8>>());
        assert!(sink.finished.load(Ordering::SeqCst));
        let snap = stats.snapshot();
        assert_eq!(snap.frames_enqueued, 20);
        assert_eq!(snap.frames_written, 20);
    }

    #[test]
    fn discard_skips_backlog_but_closes_file() {
        let sink = MemorySink {
            delay: Duration::from_millis(20),
            ..Default::default()
        };
        let writer =
            Writer::start(Box::new(sink.clone()), "mem".into(), Arc::new(PipelineStats::new(1)))
                .unwrap();
        let queue = writer.queue().unwrap();
        for tag in 0..50 {
            queue.push(frame(tag));
        }
        drop(queue);

        let result = writer.stop(true).unwrap();
        assert!(result.frames_written < 50);
        assert_eq!(result.frames_written + result.frames_discarded, 50);
        assert!(sink.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn sink_error_marks_writer_failed() {
        let sink = MemorySink {
            fail_after: Some(3),
            ..Default::default()
        };
        let writer =
            Writer::start(Box::new(sink.clone()), "mem".into(), Arc::new(PipelineStats::new(1)))
                .unwrap();
        let queue = writer.queue().unwrap();
        for tag in 0..10 {
            queue.push(frame(tag));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while !writer.has_failed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(writer.has_failed());
        // Pushing after the thread died is refused, not a panic
        assert!(!queue.push(frame(99)));
        drop(queue);
        assert!(matches!(writer.stop(false), Err(CamError::Sink(_))));
    }

    #[test]
    fn gstreamer_sink_requires_feature_or_opens() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.writer.sink = SinkKind::Raw;
        let sink = open_sink(&config, &dir.path().join("a.rgb"), Resolution::new(2, 2), 30.0);
        assert!(sink.is_ok());

        #[cfg(not(feature = "gstreamer-pipeline"))]
        {
            config.writer.sink = SinkKind::Gstreamer;
            let sink = open_sink(&config, &dir.path().join("b.mkv"), Resolution::new(2, 2), 30.0);
            assert!(matches!(sink, Err(CamError::Unsupported(_))));
        }
    }
}
