//! Slot ring between the capture loop and the outputs
//!
//! A fixed set of N slots cycles through three hand-off channels per slot:
//!
//! ```text
//!   free[i] ──► Distributor ──► overlay[i] ──► Worker i ──► output[i] ──► Consumer ──┐
//!      ▲                                                                               │
//!      └───────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A slot is a boxed value moved through `bounded(1)` channels, so exactly one
//! stage owns its buffer at any time. The Distributor and the Consumer both
//! visit slots in the order `0, 1, .., N-1, 0, ..`, which keeps frame order
//! intact even though the overlay workers run independently.
//!
//! Shutdown cascades by disconnection: once the capture queue is closed and
//! empty the Distributor returns and drops the overlay senders, each worker
//! finishes its slot and returns, and the Consumer drains the remaining
//! output slots in order before it sees its channels disconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam::channel::{bounded, Receiver, Sender};
use flume::RecvTimeoutError;
use tracing::{debug, info, instrument, warn};

use super::overlay::{self, OverlayLine};
use super::preview::PreviewSender;
use super::state::SharedState;
use super::stats::PipelineStats;
use crate::capture::{CaptureItem, FpsGauge, FrameBuffer, Resolution};
use crate::error::{CamError, Result};
use crate::writer::WriteQueue;

const INPUT_POLL: Duration = Duration::from_millis(20);

/// One in-flight frame and its stamp
#[derive(Debug)]
pub struct Slot {
    pub frame: FrameBuffer,
    pub overlay: OverlayLine,
    pub render_overlay: bool,
    pub replication: u32,
    pub sequence: u64,
    pub captured_at: Instant,
}

impl Slot {
    fn new(resolution: Resolution) -> Self {
        Self {
            frame: FrameBuffer::new(resolution),
            overlay: OverlayLine::default(),
            render_overlay: false,
            replication: 0,
            sequence: 0,
            captured_at: Instant::now(),
        }
    }
}

/// Where finished slots go, swappable while the ring runs
#[derive(Default)]
pub struct Outputs {
    write_queue: ArcSwapOption<WriteQueue>,
}

impl Outputs {
    pub fn set_write_queue(&self, queue: Option<Arc<WriteQueue>>) {
        self.write_queue.store(queue);
    }

    pub fn write_queue(&self) -> Option<Arc<WriteQueue>> {
        self.write_queue.load_full()
    }
}

/// Everything the ring threads share
pub struct SlotContext {
    pub resolution: Resolution,
    pub slot_count: usize,
    pub state: Arc<SharedState>,
    pub fps: FpsGauge,
    pub stats: Arc<PipelineStats>,
    pub outputs: Arc<Outputs>,
    pub preview: Option<PreviewSender>,
    /// Condition name is cut or padded to this many characters
    pub condition_width: usize,
    /// Stream time zero for the overlay clock when no experiment runs
    pub origin: Instant,
}

struct Lane {
    free_tx: Sender<Box<Slot>>,
    free_rx: Receiver<Box<Slot>>,
    overlay_tx: Sender<Box<Slot>>,
    overlay_rx: Receiver<Box<Slot>>,
    output_tx: Sender<Box<Slot>>,
    output_rx: Receiver<Box<Slot>>,
}

impl Lane {
    fn new() -> Self {
        let (free_tx, free_rx) = bounded(1);
        let (overlay_tx, overlay_rx) = bounded(1);
        let (output_tx, output_rx) = bounded(1);
        Self {
            free_tx,
            free_rx,
            overlay_tx,
            overlay_rx,
            output_tx,
            output_rx,
        }
    }
}

/// Handle to the running ring
pub struct SlotPipeline {
    resolution: Resolution,
    abort: Arc<AtomicBool>,
    distributor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    consumer: Option<JoinHandle<Option<PreviewSender>>>,
}

impl SlotPipeline {
    /// Allocate `slot_count` buffers at `ctx.resolution` and start the
    /// Distributor, one overlay worker per slot and the Consumer
    pub fn start(input: flume::Receiver<CaptureItem>, ctx: SlotContext) -> Result<Self> {
        if ctx.slot_count == 0 {
            return Err(CamError::InvalidConfig("slot_count must be at least 1".into()));
        }
        let resolution = ctx.resolution;
        let slot_count = ctx.slot_count;
        let abort = Arc::new(AtomicBool::new(false));

        let lanes: Vec<Lane> = (0..slot_count).map(|_| Lane::new()).collect();
        for lane in &lanes {
            lane.free_tx
                .send(Box::new(Slot::new(resolution)))
                .map_err(|_| CamError::Channel("slot ring closed during setup".into()))?;
        }

        let mut free_rx = Vec::with_capacity(slot_count);
        let mut overlay_tx = Vec::with_capacity(slot_count);
        let mut free_tx = Vec::with_capacity(slot_count);
        let mut output_rx = Vec::with_capacity(slot_count);
        let mut workers = Vec::with_capacity(slot_count);

        for (index, lane) in lanes.into_iter().enumerate() {
            free_rx.push(lane.free_rx);
            overlay_tx.push(lane.overlay_tx);
            free_tx.push(lane.free_tx);
            output_rx.push(lane.output_rx);

            let rx = lane.overlay_rx;
            let tx = lane.output_tx;
            let stats = Arc::clone(&ctx.stats);
            workers.push(
                thread::Builder::new()
                    .name(format!("labcam-overlay-{}", index))
                    .spawn(move || overlay_worker(index, rx, tx, stats))?,
            );
        }

        let distributor = {
            let stage = Distributor {
                input,
                free: free_rx,
                overlay: overlay_tx,
                state: Arc::clone(&ctx.state),
                fps: ctx.fps.clone(),
                stats: Arc::clone(&ctx.stats),
                resolution,
                condition_width: ctx.condition_width,
                origin: ctx.origin,
                abort: Arc::clone(&abort),
            };
            thread::Builder::new()
                .name("labcam-distributor".into())
                .spawn(move || stage.run())?
        };

        let consumer = {
            let stage = Consumer {
                output: output_rx,
                free: free_tx,
                state: Arc::clone(&ctx.state),
                stats: Arc::clone(&ctx.stats),
                outputs: Arc::clone(&ctx.outputs),
                preview: ctx.preview,
            };
            thread::Builder::new()
                .name("labcam-consumer".into())
                .spawn(move || stage.run())?
        };

        info!(slots = slot_count, %resolution, "Slot pipeline started");
        Ok(Self {
            resolution,
            abort,
            distributor: Some(distributor),
            workers,
            consumer: Some(consumer),
        })
    }

    /// Size every slot buffer was allocated at
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Join every stage and hand back the preview producer.
    ///
    /// With `drain` the Distributor keeps going until the capture queue is
    /// closed and empty, so the capture loop must be stopped first. Without
    /// it the queued captures are dropped; slots already in flight are still
    /// delivered.
    pub fn stop(mut self, drain: bool) -> Result<Option<PreviewSender>> {
        if !drain {
            self.abort.store(true, Ordering::Release);
        }
        self.join()
    }

    fn join(&mut self) -> Result<Option<PreviewSender>> {
        let mut panicked = false;
        if let Some(distributor) = self.distributor.take() {
            panicked |= distributor.join().is_err();
        }
        for worker in self.workers.drain(..) {
            panicked |= worker.join().is_err();
        }
        let preview = match self.consumer.take() {
            Some(consumer) => match consumer.join() {
                Ok(preview) => preview,
                Err(_) => {
                    panicked = true;
                    None
                }
            },
            None => None,
        };
        if panicked {
            return Err(CamError::Channel("slot pipeline thread panicked".into()));
        }
        info!(resolution = %self.resolution, "Slot pipeline stopped");
        Ok(preview)
    }
}

impl Drop for SlotPipeline {
    fn drop(&mut self) {
        if self.distributor.is_some() || self.consumer.is_some() {
            self.abort.store(true, Ordering::Release);
            let _ = self.join();
        }
    }
}

struct Distributor {
    input: flume::Receiver<CaptureItem>,
    free: Vec<Receiver<Box<Slot>>>,
    overlay: Vec<Sender<Box<Slot>>>,
    state: Arc<SharedState>,
    fps: FpsGauge,
    stats: Arc<PipelineStats>,
    resolution: Resolution,
    condition_width: usize,
    origin: Instant,
    abort: Arc<AtomicBool>,
}

impl Distributor {
    #[instrument(skip_all, name = "distributor")]
    fn run(self) {
        let n = self.free.len();
        let mut index = 0;
        let mut sequence = 0u64;

        loop {
            if self.abort.load(Ordering::Acquire) {
                break;
            }
            let item = match self.input.recv_timeout(INPUT_POLL) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let captured = item.frame.buffer.resolution();
            if captured != self.resolution {
                warn!(%captured, expected = %self.resolution, "Dropping stale-size frame");
                self.stats.record_stale();
                continue;
            }

            // Only backpressure point: wait for the Consumer to return slot i
            let Ok(mut slot) = self.free[index].recv() else {
                debug!("Consumer gone, distributor exiting");
                break;
            };
            self.stats.slot_acquired(index);

            let copied = slot.frame.copy_from(&item.frame.buffer);
            debug_assert!(copied, "slot size diverged from the stream");
            let state = self.state.load();
            let elapsed = overlay::frame_elapsed(&state, item.frame.timestamp, self.origin);
            overlay::format_overlay(
                &mut slot.overlay,
                &state,
                elapsed,
                self.fps.get(),
                self.condition_width,
            );
            slot.render_overlay = state.overlay;
            slot.replication = item.replication;
            slot.sequence = sequence;
            slot.captured_at = item.frame.timestamp;

            self.stats.slot_released(index);
            if self.overlay[index].send(slot).is_err() {
                debug!(slot = index, "Overlay worker gone, distributor exiting");
                break;
            }
            sequence += 1;
            index = (index + 1) % n;
        }
        debug!(frames = sequence, "Distributor finished");
    }
}

#[instrument(skip_all, fields(slot = index))]
fn overlay_worker(
    index: usize,
    input: Receiver<Box<Slot>>,
    output: Sender<Box<Slot>>,
    stats: Arc<PipelineStats>,
) {
    while let Ok(mut slot) = input.recv() {
        stats.slot_acquired(index);
        if slot.render_overlay {
            let Slot { frame, overlay, .. } = slot.as_mut();
            overlay::render_strip(frame, overlay.as_str());
        }
        stats.slot_released(index);
        if output.send(slot).is_err() {
            break;
        }
    }
}

struct Consumer {
    output: Vec<Receiver<Box<Slot>>>,
    free: Vec<Sender<Box<Slot>>>,
    state: Arc<SharedState>,
    stats: Arc<PipelineStats>,
    outputs: Arc<Outputs>,
    preview: Option<PreviewSender>,
}

impl Consumer {
    #[instrument(skip_all, name = "consumer")]
    fn run(mut self) -> Option<PreviewSender> {
        let n = self.output.len();
        let mut index = 0;
        let mut delivered = 0u64;

        while let Ok(slot) = self.output[index].recv() {
            self.stats.slot_acquired(index);
            self.deliver(&slot);
            delivered += 1;
            self.stats.slot_released(index);
            self.stats.slot_cycled(index);
            // The Distributor may already be gone during shutdown
            let _ = self.free[index].send(slot);
            index = (index + 1) % n;
        }
        debug!(frames = delivered, "Consumer finished");
        self.preview
    }

    fn deliver(&mut self, slot: &Slot) {
        let state = self.state.load();

        if state.writing {
            if let Some(queue) = self.outputs.write_queue() {
                for _ in 0..slot.replication {
                    if !queue.push(slot.frame.clone()) {
                        warn!(sequence = slot.sequence, "Write queue closed");
                        break;
                    }
                }
            }
        }

        if state.preview {
            if let Some(preview) = self.preview.as_mut() {
                match preview.publish(&slot.frame, slot.sequence) {
                    Ok(sent) => self.stats.record_preview(sent),
                    Err(e) => warn!("Preview downscale failed: {}", e),
                }
            }
        }
    }
}
