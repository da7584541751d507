//! Continuously running capture loop
//!
//! Owns the camera for as long as it runs and hands it back on stop. Every
//! read is timed against a per-device timeout calibrated from priming reads;
//! the first failure is latched in a [`FailureSignal`] and ends the loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use flume::Sender;
use tracing::{debug, error, info, instrument, warn};

use super::decimate::{Decision, Decimator};
use super::device::CameraDevice;
use super::fps::{FpsGauge, FpsTracker};
use super::frame::CapturedFrame;
use crate::error::{CamError, Result};
use crate::pipeline::state::SharedState;
use crate::pipeline::stats::PipelineStats;

/// Frame accepted by decimation, standing in for `replication` logical frames
#[derive(Debug, Clone)]
pub struct CaptureItem {
    pub frame: CapturedFrame,
    pub replication: u32,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Reads used to calibrate the read timeout
    pub priming_reads: u32,
    /// Added to the slowest priming read
    pub timeout_margin: Duration,
    /// Watchdog bound for each priming read, before the real timeout is known
    pub priming_timeout: Duration,
    pub fps_window: usize,
    pub cpu_core: Option<usize>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            priming_reads: 10,
            timeout_margin: Duration::from_millis(1500),
            priming_timeout: Duration::from_secs(5),
            fps_window: super::fps::DEFAULT_WINDOW,
            cpu_core: None,
        }
    }
}

/// Error latch that only ever accepts its first reason
#[derive(Debug, Default)]
pub struct FailureSignal {
    raised: AtomicBool,
    reason: ArcSwapOption<String>,
}

impl FailureSignal {
    /// Returns `true` if this call raised the signal
    pub fn raise(&self, reason: impl Into<String>) -> bool {
        if self
            .raised
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let reason = reason.into();
        error!("Capture failure: {}", reason);
        self.reason.store(Some(Arc::new(reason)));
        true
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.load_full().map(|r| r.as_ref().clone())
    }
}

/// Lets another thread notice a read that never returns
#[derive(Debug)]
pub struct Heartbeat {
    epoch: Instant,
    /// Microseconds since `epoch` when the current read began, 0 when idle
    read_started_us: AtomicU64,
    /// Current watchdog bound, 0 when disarmed
    timeout_us: AtomicU64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
            read_started_us: AtomicU64::new(0),
            timeout_us: AtomicU64::new(0),
        }
    }
}

impl Heartbeat {
    fn now_us(&self) -> u64 {
        (self.epoch.elapsed().as_micros() as u64).max(1)
    }

    fn arm(&self, timeout: Duration) {
        self.timeout_us
            .store((timeout.as_micros() as u64).max(1), Ordering::Release);
    }

    fn disarm(&self) {
        self.timeout_us.store(0, Ordering::Release);
    }

    fn begin_read(&self) {
        self.read_started_us.store(self.now_us(), Ordering::Release);
    }

    fn end_read(&self) {
        self.read_started_us.store(0, Ordering::Release);
    }

    /// How long the current read has been blocked, once past the timeout
    pub fn stalled(&self) -> Option<Duration> {
        let timeout = self.timeout_us.load(Ordering::Acquire);
        let started = self.read_started_us.load(Ordering::Acquire);
        if timeout == 0 || started == 0 {
            return None;
        }
        let blocked = self.now_us().saturating_sub(started);
        (blocked > timeout).then(|| Duration::from_micros(blocked))
    }
}

struct LoopContext {
    output: Sender<CaptureItem>,
    state: Arc<SharedState>,
    fps: FpsGauge,
    stats: Arc<PipelineStats>,
    settings: CaptureSettings,
    stop: Arc<AtomicBool>,
    failure: Arc<FailureSignal>,
    heartbeat: Arc<Heartbeat>,
}

/// Handle to the running capture thread
pub struct CaptureLoop {
    stop: Arc<AtomicBool>,
    failure: Arc<FailureSignal>,
    heartbeat: Arc<Heartbeat>,
    thread: Option<JoinHandle<Box<dyn CameraDevice>>>,
}

impl CaptureLoop {
    /// Move `camera` onto a dedicated thread and start streaming into `output`
    pub fn spawn(
        camera: Box<dyn CameraDevice>,
        output: Sender<CaptureItem>,
        state: Arc<SharedState>,
        fps: FpsGauge,
        stats: Arc<PipelineStats>,
        settings: CaptureSettings,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(FailureSignal::default());
        let heartbeat = Arc::new(Heartbeat::default());

        let ctx = LoopContext {
            output,
            state,
            fps,
            stats,
            settings,
            stop: Arc::clone(&stop),
            failure: Arc::clone(&failure),
            heartbeat: Arc::clone(&heartbeat),
        };
        let thread = thread::Builder::new()
            .name("labcam-capture".into())
            .spawn(move || run(camera, ctx))?;

        Ok(Self {
            stop,
            failure,
            heartbeat,
            thread: Some(thread),
        })
    }

    pub fn failure(&self) -> &Arc<FailureSignal> {
        &self.failure
    }

    /// Raise the failure signal if a read has been blocked past the timeout
    pub fn check_stall(&self) -> bool {
        match self.heartbeat.stalled() {
            Some(blocked) => self
                .failure
                .raise(format!("camera read stalled for {:?}", blocked)),
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop and take the camera back, or detach the thread if its current
    /// read stalls past the watchdog bound. `None` when the camera was lost.
    pub fn stop_or_abandon(self, poll: Duration) -> Option<Box<dyn CameraDevice>> {
        self.stop.store(true, Ordering::Release);
        while !self.is_finished() {
            self.check_stall();
            if self.heartbeat.stalled().is_some() {
                self.abandon();
                return None;
            }
            thread::sleep(poll);
        }
        match self.stop() {
            Ok(camera) => Some(camera),
            Err(e) => {
                error!("Stopping capture failed: {}", e);
                None
            }
        }
    }

    /// Stop after the current read and take the camera back
    pub fn stop(mut self) -> Result<Box<dyn CameraDevice>> {
        self.stop.store(true, Ordering::Release);
        let thread = self
            .thread
            .take()
            .ok_or_else(|| CamError::Device("capture loop already stopped".into()))?;
        thread
            .join()
            .map_err(|_| CamError::Device("capture thread panicked".into()))
    }

    /// Signal stop without joining; the camera is lost with the thread.
    ///
    /// For a loop stuck in a read that may never return.
    pub fn abandon(mut self) {
        self.stop.store(true, Ordering::Release);
        if self.thread.take().is_some() {
            warn!("Capture thread detached while blocked in a read");
        }
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);
    if pinned {
        debug!("Capture thread pinned to core {}", core);
    } else {
        warn!("Could not pin capture thread to core {}", core);
    }
}

/// Time the priming reads; the slowest one plus the margin becomes the timeout.
///
/// Each priming read is watched against `priming_timeout` already, so a
/// device that hangs on its first frames is still caught.
fn prime(camera: &mut dyn CameraDevice, ctx: &LoopContext) -> Result<Duration> {
    let bound = ctx.settings.priming_timeout;
    ctx.heartbeat.arm(bound);
    let mut slowest = Duration::ZERO;
    for _ in 0..ctx.settings.priming_reads {
        if ctx.stop.load(Ordering::Acquire) {
            break;
        }
        ctx.heartbeat.begin_read();
        let started = Instant::now();
        let result = camera.read();
        let elapsed = started.elapsed();
        ctx.heartbeat.end_read();
        result?;
        if elapsed > bound {
            return Err(CamError::Timeout(bound));
        }
        slowest = slowest.max(elapsed);
    }
    Ok(slowest + ctx.settings.timeout_margin)
}

#[instrument(skip_all, fields(camera = camera.name()))]
fn run(mut camera: Box<dyn CameraDevice>, ctx: LoopContext) -> Box<dyn CameraDevice> {
    if let Some(core) = ctx.settings.cpu_core {
        pin_to_core(core);
    }

    let timeout = match prime(camera.as_mut(), &ctx) {
        Ok(timeout) => timeout,
        Err(e) => {
            ctx.heartbeat.disarm();
            ctx.failure.raise(format!("priming read failed: {}", e));
            return camera;
        }
    };
    ctx.heartbeat.arm(timeout);

    let snapshot = ctx.state.load();
    let mut rate_epoch = snapshot.rate_epoch;
    let mut decimator = Decimator::new(snapshot.target_fps);
    let mut tracker = FpsTracker::new(ctx.settings.fps_window, ctx.fps.clone());
    info!(
        timeout_ms = timeout.as_millis() as u64,
        target_fps = snapshot.target_fps,
        resolution = %camera.resolution(),
        "Capture loop running"
    );

    while !ctx.stop.load(Ordering::Acquire) {
        ctx.heartbeat.begin_read();
        let started = Instant::now();
        let result = camera.read();
        let elapsed = started.elapsed();
        ctx.heartbeat.end_read();

        let frame = match result {
            Ok(frame) if elapsed <= timeout => frame,
            Ok(_) => {
                ctx.failure.raise(CamError::Timeout(timeout).to_string());
                break;
            }
            Err(e) => {
                ctx.failure.raise(e.to_string());
                break;
            }
        };
        ctx.stats.record_capture();
        tracker.update(frame.timestamp);

        let snapshot = ctx.state.load();
        if snapshot.rate_epoch != rate_epoch {
            rate_epoch = snapshot.rate_epoch;
            decimator.reset(snapshot.target_fps);
            debug!(target_fps = snapshot.target_fps, "Decimation clock reset");
        }

        match decimator.decide(frame.timestamp) {
            Decision::Emit { replication } => {
                ctx.stats.record_emitted(replication);
                if ctx.output.send(CaptureItem { frame, replication }).is_err() {
                    debug!("Capture queue closed");
                    break;
                }
            }
            Decision::Drop => ctx.stats.record_decimated(),
        }
    }

    ctx.heartbeat.disarm();
    info!("Capture loop stopped");
    camera
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Resolution, SyntheticCamera};
    use crate::pipeline::state::CameraState;

    fn spawn_with(
        camera: SyntheticCamera,
        target_fps: f64,
    ) -> (CaptureLoop, flume::Receiver<CaptureItem>, Arc<PipelineStats>) {
        let (tx, rx) = flume::unbounded();
        let state = Arc::new(SharedState::new(CameraState::new(
            camera.resolution(),
            target_fps,
        )));
        let stats = Arc::new(PipelineStats::new(2));
        let settings = CaptureSettings {
            priming_reads: 3,
            timeout_margin: Duration::from_millis(200),
            priming_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let handle = CaptureLoop::spawn(
            Box::new(camera),
            tx,
            state,
            FpsGauge::new(0),
            Arc::clone(&stats),
            settings,
        )
        .unwrap();
        (handle, rx, stats)
    }

    #[test]
    fn failure_signal_latches_first_reason() {
        let signal = FailureSignal::default();
        assert!(signal.raise("first"));
        assert!(!signal.raise("second"));
        assert_eq!(signal.reason().as_deref(), Some("first"));
    }

    #[test]
    fn read_failure_stops_loop_once() {
        let camera = SyntheticCamera::new(Resolution::new(320, 240))
            .with_fps(200.0)
            .fail_at(20);
        let reads = camera.read_counter();
        let (handle, rx, _stats) = spawn_with(camera, 200.0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_finished());
        assert!(handle.failure().is_raised());
        // Priming used 3 reads, the 21st read failed and nothing followed it
        assert_eq!(reads.load(Ordering::SeqCst), 21);
        assert!(rx.drain().count() <= 17);
        assert!(handle.stop().is_ok());
    }

    #[test]
    fn slow_read_trips_timeout() {
        let camera = SyntheticCamera::new(Resolution::new(320, 240))
            .with_fps(0.0)
            .stall_at(6, Duration::from_millis(400));
        let (handle, _rx, _stats) = spawn_with(camera, 30.0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let reason = handle.failure().reason().unwrap_or_default();
        assert!(reason.contains("timeout"), "reason = {}", reason);
    }

    #[test]
    fn stalled_priming_read_is_watched() {
        let camera = SyntheticCamera::new(Resolution::new(320, 240))
            .with_fps(0.0)
            .stall_at(1, Duration::from_secs(3));
        let (handle, _rx, _stats) = spawn_with(camera, 30.0);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.check_stall() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(handle.failure().is_raised());
        assert!(!handle.is_finished());

        let began = Instant::now();
        assert!(handle.stop_or_abandon(Duration::from_millis(10)).is_none());
        assert!(began.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn slow_priming_read_fails_startup() {
        let camera = SyntheticCamera::new(Resolution::new(320, 240))
            .with_fps(0.0)
            .stall_at(0, Duration::from_millis(500));
        let (handle, rx, _stats) = spawn_with(camera, 30.0);

        let deadline = Instant::now() + Duration::from_secs(3);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let reason = handle.failure().reason().unwrap_or_default();
        assert!(reason.starts_with("priming read failed"), "reason = {}", reason);
        assert!(rx.try_recv().is_err());
        assert!(handle.stop().is_ok());
    }

    #[test]
    fn stop_or_abandon_returns_camera_from_healthy_loop() {
        let camera = SyntheticCamera::new(Resolution::new(320, 240)).with_fps(100.0);
        let (handle, rx, _stats) = spawn_with(camera, 100.0);
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let camera = handle.stop_or_abandon(Duration::from_millis(5));
        assert_eq!(camera.map(|c| c.resolution()), Some(Resolution::new(320, 240)));
    }

    #[test]
    fn stop_returns_camera() {
        let camera = SyntheticCamera::new(Resolution::new(640, 480)).with_fps(100.0);
        let (handle, rx, stats) = spawn_with(camera, 100.0);
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.frame.buffer.resolution(), Resolution::new(640, 480));

        let camera = handle.stop().unwrap();
        assert_eq!(camera.resolution(), Resolution::new(640, 480));
        assert!(stats.snapshot().frames_captured >= 1);
    }
}
