//! Pipeline controller
//!
//! `CamModel` owns the camera, the calibration task, the capture stream and
//! the writer, and is the only writer of [`SharedState`]. It runs on its own
//! thread, handles one [`Command`] at a time and reports back through
//! [`Event`]s; nothing it does ever fails across the channel.
//!
//! ```text
//!   Idle ──INITIALIZE──► Calibrating ──ok──► Capturing ◄──SET_USE_CAM──► Ready
//!    ▲                        │                   │
//!    └──────── error ─────────┘                   └─ writing / preview are
//!    └──────────────── CLEANUP from anywhere          independent flags
//! ```

use std::mem;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, instrument, warn};

use crate::calibrate::{Calibration, CalibrationTask};
use crate::capture::{CameraDevice, CameraOpener, CaptureLoop, FpsGauge, Resolution};
use crate::error::{CamError, Result};
use crate::pipeline::{
    preview_channel, CameraState, Outputs, PipelineStats, PreviewReceiver, PreviewSender,
    SharedState, SlotContext, SlotPipeline, StatsSnapshot,
};
use crate::protocol::{Command, Event};
use crate::writer::{self, Writer};
use crate::Config;

/// Capture loop plus the slot ring it feeds
struct Stream {
    capture: CaptureLoop,
    pipeline: SlotPipeline,
    failure_reported: bool,
}

enum Phase {
    Idle,
    Calibrating(CalibrationTask),
    /// Calibrated, camera open, not streaming
    Ready(Box<dyn CameraDevice>),
    Capturing(Stream),
    /// The capture loop failed and the camera went with it
    Failed,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Calibrating(_) => "calibrating",
            Phase::Ready(_) => "ready",
            Phase::Capturing(_) => "capturing",
            Phase::Failed => "failed",
        }
    }
}

pub struct CamModel {
    config: Config,
    opener: CameraOpener,
    events: Sender<Event>,
    phase: Phase,
    state: Arc<SharedState>,
    fps: FpsGauge,
    stats: Arc<PipelineStats>,
    outputs: Arc<Outputs>,
    /// Parked here while no stream is running
    preview: Option<PreviewSender>,
    writer: Option<Writer>,
    calibration: Option<Calibration>,
    origin: Instant,
}

/// Caller's side of a running [`CamModel`]
pub struct CamModelHandle {
    commands: Option<Sender<Command>>,
    events: Receiver<Event>,
    preview: Option<PreviewReceiver>,
    state: Arc<SharedState>,
    stats: Arc<PipelineStats>,
    thread: Option<JoinHandle<()>>,
}

impl CamModelHandle {
    pub fn send(&self, command: Command) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or_else(|| CamError::Channel("controller shut down".into()))?
            .send(command)
            .map_err(|_| CamError::Channel("controller thread gone".into()))
    }

    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// The display side of the preview channel; only available once
    pub fn take_preview(&mut self) -> Option<PreviewReceiver> {
        self.preview.take()
    }

    pub fn state(&self) -> Arc<CameraState> {
        self.state.load()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Close the command channel and wait for the controller to tear down
    pub fn shutdown(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        self.commands = None;
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| CamError::Channel("controller thread panicked".into())),
            None => Ok(()),
        }
    }
}

impl Drop for CamModelHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl CamModel {
    pub fn new(config: Config, opener: CameraOpener, events: Sender<Event>) -> Self {
        let initial = CameraState::new(config.capture.resolution(), config.capture.fps);
        let stats = Arc::new(PipelineStats::new(config.pipeline.slot_count));
        Self {
            opener,
            events,
            phase: Phase::Idle,
            state: Arc::new(SharedState::new(initial)),
            fps: FpsGauge::new(0),
            stats,
            outputs: Arc::new(Outputs::default()),
            preview: None,
            writer: None,
            calibration: None,
            origin: Instant::now(),
            config,
        }
    }

    /// Run a controller on its own thread
    pub fn spawn(config: Config, opener: CameraOpener) -> Result<CamModelHandle> {
        let (command_tx, command_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let (preview_tx, preview_rx) =
            preview_channel(config.preview.queue_depth, config.preview.width);

        let mut model = CamModel::new(config, opener, event_tx);
        model.preview = Some(preview_tx);
        let state = Arc::clone(&model.state);
        let stats = Arc::clone(&model.stats);

        let thread = thread::Builder::new()
            .name("labcam-controller".into())
            .spawn(move || model.run(command_rx))?;

        Ok(CamModelHandle {
            commands: Some(command_tx),
            events: event_rx,
            preview: Some(preview_rx),
            state,
            stats,
            thread: Some(thread),
        })
    }

    /// Dispatch until the command channel closes, then tear down
    pub fn run(mut self, commands: Receiver<Command>) {
        let poll = self.config.pipeline.poll_interval();
        info!("Controller running");
        loop {
            match commands.recv_timeout(poll) {
                Ok(command) => self.handle(command),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.poll();
        }
        if !matches!(self.phase, Phase::Idle) || self.writer.is_some() {
            self.teardown(true);
        }
        info!("Controller stopped");
    }

    pub fn shared_state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Event receiver gone");
        }
    }

    fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!("Reporting failure: {}", reason);
        self.emit(Event::Failure(reason));
    }

    #[instrument(skip(self), fields(phase = self.phase.name()))]
    pub fn handle(&mut self, command: Command) {
        debug!("Command received");
        match command {
            Command::Initialize => self.initialize(),
            Command::Cleanup { discard } => self.cleanup(discard),
            Command::Start(path) => self.start_writing(path),
            Command::Stop => self.stop_writing(),
            Command::SetUseCam(enabled) => self.set_use_cam(enabled),
            Command::SetUseFeed(enabled) => {
                self.state.update(|s| s.preview = enabled);
            }
            Command::SetResolution(resolution) => self.set_resolution(resolution),
            Command::GetResolution => self.emit(Event::CurrentResolution(self.state.load().resolution)),
            Command::SetFps(fps) => self.set_fps(fps),
            Command::GetFps => self.emit(Event::CurrentFps(self.fps.get())),
            Command::ConditionName(name) => {
                self.state.update(|s| s.experiment.condition = name);
            }
            Command::BlockNumber(block) => {
                self.state.update(|s| s.experiment.block = block);
            }
            Command::KeyFlag(flag) => {
                self.state.update(|s| s.experiment.key_flag = flag);
            }
            Command::ExperimentStatus(running) => self.set_experiment_running(running),
            Command::Overlay(enabled) => {
                self.state.update(|s| s.overlay = enabled);
            }
            Command::Language(language) => {
                self.state.update(|s| s.language = language);
            }
        }
    }

    /// Background checks run after every dispatch
    pub fn poll(&mut self) {
        if matches!(&self.phase, Phase::Calibrating(task) if task.is_finished()) {
            self.finish_calibration();
        }

        let mut capture_failure = None;
        if let Phase::Capturing(stream) = &mut self.phase {
            stream.capture.check_stall();
            if !stream.failure_reported && stream.capture.failure().is_raised() {
                stream.failure_reported = true;
                capture_failure = Some(
                    stream
                        .capture
                        .failure()
                        .reason()
                        .unwrap_or_else(|| "capture failed".into()),
                );
            }
        }
        if let Some(reason) = capture_failure {
            self.fail(reason);
        }

        if self.writer.as_ref().is_some_and(Writer::has_failed) {
            self.fail("recording failed");
            self.close_writer(true);
        }
    }

    fn initialize(&mut self) {
        if !matches!(self.phase, Phase::Idle) {
            warn!("Already initialized");
            return;
        }
        let resolution = self.config.capture.resolution();
        let camera = match (self.opener)(resolution) {
            Ok(camera) => camera,
            Err(e) => return self.fail(format!("cannot open camera: {}", e)),
        };
        info!(camera = camera.name(), %resolution, "Camera opened, calibrating");
        self.origin = Instant::now();

        match CalibrationTask::spawn(
            camera,
            self.config.capture.calibration_settings(),
            self.events.clone(),
        ) {
            Ok(task) => self.phase = Phase::Calibrating(task),
            Err(e) => self.fail(format!("cannot start calibration: {}", e)),
        }
    }

    fn finish_calibration(&mut self) {
        let Phase::Calibrating(task) = mem::replace(&mut self.phase, Phase::Idle) else {
            return;
        };
        let (mut camera, outcome) = match task.join() {
            Ok(joined) => joined,
            Err(e) => return self.fail(e.to_string()),
        };

        let calibration = match outcome {
            Ok(calibration) => calibration,
            Err(e) => {
                if let Err(e) = camera.release() {
                    warn!("Releasing camera failed: {}", e);
                }
                return self.fail(e.to_string());
            }
        };

        let resolution = camera.resolution();
        let max_fps = calibration.max_fps;
        self.fps.set(max_fps);
        let state = self.state.update(|s| {
            s.resolution = resolution;
            s.target_fps = max_fps as f64;
            s.rate_epoch += 1;
        });
        info!(max_fps, %resolution, modes = ?calibration.resolutions, "Calibration complete");
        self.emit(Event::Started {
            max_fps,
            resolutions: calibration.resolutions.clone(),
        });
        self.calibration = Some(calibration);

        self.phase = if state.camera_enabled {
            self.start_stream(camera)
        } else {
            Phase::Ready(camera)
        };
    }

    /// Bring up the slot ring, then the capture loop feeding it
    fn start_stream(&mut self, camera: Box<dyn CameraDevice>) -> Phase {
        let resolution = camera.resolution();
        let (tx, rx) = flume::unbounded();

        let ctx = SlotContext {
            resolution,
            slot_count: self.config.pipeline.slot_count,
            state: Arc::clone(&self.state),
            fps: self.fps.clone(),
            stats: Arc::clone(&self.stats),
            outputs: Arc::clone(&self.outputs),
            preview: self.preview.take(),
            condition_width: self.config.pipeline.overlay_text_width,
            origin: self.origin,
        };
        let pipeline = match SlotPipeline::start(rx, ctx) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.fail(format!("cannot start slot pipeline: {}", e));
                return Phase::Ready(camera);
            }
        };

        match CaptureLoop::spawn(
            camera,
            tx,
            Arc::clone(&self.state),
            self.fps.clone(),
            Arc::clone(&self.stats),
            self.config.capture.capture_settings(),
        ) {
            Ok(capture) => {
                info!(%resolution, "Streaming");
                Phase::Capturing(Stream {
                    capture,
                    pipeline,
                    failure_reported: false,
                })
            }
            Err(e) => {
                self.fail(format!("cannot start capture loop: {}", e));
                self.park_pipeline(pipeline, false);
                Phase::Failed
            }
        }
    }

    /// Stop capture first so the ring drains every queued frame, then the ring.
    /// Returns the camera unless the capture loop had to be abandoned.
    fn stop_stream(&mut self, stream: Stream) -> Option<Box<dyn CameraDevice>> {
        let Stream {
            capture, pipeline, ..
        } = stream;

        let camera = capture.stop_or_abandon(self.config.pipeline.poll_interval());
        self.park_pipeline(pipeline, camera.is_some());
        camera
    }

    fn park_pipeline(&mut self, pipeline: SlotPipeline, drain: bool) {
        match pipeline.stop(drain) {
            Ok(preview) => {
                if preview.is_some() {
                    self.preview = preview;
                }
            }
            Err(e) => error!("Stopping slot pipeline failed: {}", e),
        }
    }

    fn set_use_cam(&mut self, enabled: bool) {
        self.state.update(|s| s.camera_enabled = enabled);
        self.phase = match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Capturing(stream) if !enabled => {
                info!("Camera disabled");
                match self.stop_stream(stream) {
                    Some(camera) => Phase::Ready(camera),
                    None => Phase::Failed,
                }
            }
            Phase::Ready(camera) if enabled => {
                info!("Camera enabled");
                self.start_stream(camera)
            }
            other => other,
        };
    }

    fn set_resolution(&mut self, resolution: Resolution) {
        let current = self.state.load();
        if current.resolution == resolution {
            return;
        }
        if current.writing {
            warn!(%resolution, "Resolution change refused while recording");
            return;
        }
        if let Some(calibration) = &self.calibration {
            if !calibration.resolutions.contains(&resolution) {
                warn!(%resolution, "Resolution not supported by this camera");
                return;
            }
        }

        let preview = current.preview;
        self.state.update(|s| s.preview = false);

        self.phase = match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Capturing(stream) => match self.stop_stream(stream) {
                Some(mut camera) => match self.reconfigure(camera.as_mut(), resolution) {
                    Ok(()) => self.start_stream(camera),
                    Err(e) => {
                        self.fail(format!("cannot switch to {}: {}", resolution, e));
                        Phase::Ready(camera)
                    }
                },
                None => Phase::Failed,
            },
            Phase::Ready(mut camera) => {
                if let Err(e) = self.reconfigure(camera.as_mut(), resolution) {
                    self.fail(format!("cannot switch to {}: {}", resolution, e));
                }
                Phase::Ready(camera)
            }
            other => {
                warn!(phase = other.name(), "No camera to reconfigure");
                other
            }
        };

        self.state.update(|s| s.preview = preview);
    }

    fn reconfigure(&self, camera: &mut dyn CameraDevice, resolution: Resolution) -> Result<()> {
        camera.set_resolution(resolution)?;
        let actual = camera.resolution();
        if actual != resolution {
            warn!(requested = %resolution, %actual, "Driver picked a different mode");
        }
        self.state.update(|s| s.resolution = actual);
        info!(%actual, "Resolution changed");
        Ok(())
    }

    fn set_fps(&mut self, fps: f64) {
        if !fps.is_finite() || fps <= 0.0 {
            warn!(fps, "Ignoring invalid target rate");
            return;
        }
        self.state.update(|s| {
            s.target_fps = fps;
            s.rate_epoch += 1;
        });
        info!(fps, "Target rate changed");
    }

    fn set_experiment_running(&mut self, running: bool) {
        self.state.update(|s| {
            if running && !s.experiment.running {
                s.experiment.started_at = Some(Instant::now());
            }
            s.experiment.running = running;
        });
        info!(running, "Experiment status");
    }

    fn start_writing(&mut self, path: PathBuf) {
        if self.writer.is_some() {
            warn!(path = %path.display(), "Already recording");
            return;
        }
        if !matches!(self.phase, Phase::Capturing(_) | Phase::Ready(_)) {
            warn!(path = %path.display(), "Cannot record before calibration");
            return;
        }

        let state = self.state.load();
        let sink = match writer::open_sink(&self.config, &path, state.resolution, state.target_fps) {
            Ok(sink) => sink,
            Err(e) => return self.fail(format!("cannot open {}: {}", path.display(), e)),
        };
        match Writer::start(sink, path, Arc::clone(&self.stats)) {
            Ok(writer) => {
                self.outputs.set_write_queue(writer.queue());
                self.writer = Some(writer);
                self.state.update(|s| s.writing = true);
            }
            Err(e) => self.fail(format!("cannot start writer: {}", e)),
        }
    }

    fn stop_writing(&mut self) {
        if self.writer.is_none() {
            debug!("Stop with no active recording");
        } else {
            self.close_writer(false);
        }
        self.emit(Event::Stopped);
    }

    /// Detach the queue from the ring and wait for the writer to finish
    fn close_writer(&mut self, discard: bool) {
        self.state.update(|s| s.writing = false);
        self.outputs.set_write_queue(None);
        let Some(writer) = self.writer.take() else {
            return;
        };
        let path = writer.path().to_path_buf();
        match writer.stop(discard) {
            Ok(stats) => info!(
                path = %path.display(),
                written = stats.frames_written,
                discarded = stats.frames_discarded,
                "Recording closed"
            ),
            Err(e) => error!(path = %path.display(), "Recording ended with error: {}", e),
        }
    }

    fn cleanup(&mut self, discard: bool) {
        self.teardown(discard);
        self.emit(Event::CleanedUp);
    }

    fn teardown(&mut self, discard: bool) {
        info!(discard, phase = self.phase.name(), "Cleaning up");
        let camera = match mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Calibrating(task) => {
                task.cancel();
                match task.join() {
                    Ok((camera, _)) => Some(camera),
                    Err(e) => {
                        error!("{}", e);
                        None
                    }
                }
            }
            Phase::Capturing(stream) => self.stop_stream(stream),
            Phase::Ready(camera) => Some(camera),
            Phase::Idle | Phase::Failed => None,
        };

        self.close_writer(discard);

        if let Some(mut camera) = camera {
            if let Err(e) = camera.release() {
                warn!("Releasing camera failed: {}", e);
            }
        }
        self.calibration = None;
        self.fps.set(0);
    }
}
