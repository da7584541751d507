//! One-shot startup calibration
//!
//! Two phases, both cancellable between steps:
//! 1. resolution sweep: a candidate is usable when the device accepts it and
//!    the next frame really has that size
//! 2. rate probe: at the largest usable mode, time a burst of reads and take
//!    `reads / elapsed` as the maximum sustainable rate
//!
//! The camera is put back at its original resolution after each phase.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use flume::Sender;
use tracing::{debug, info, instrument, warn};

use crate::capture::{CameraDevice, Resolution};
use crate::error::{CamError, Result};
use crate::protocol::Event;

/// Modes tried by the sweep, smallest first
pub const CANDIDATE_RESOLUTIONS: [Resolution; 9] = [
    Resolution::new(160, 120),
    Resolution::new(320, 240),
    Resolution::new(640, 480),
    Resolution::new(800, 600),
    Resolution::new(1024, 768),
    Resolution::new(1280, 720),
    Resolution::new(1280, 960),
    Resolution::new(1600, 1200),
    Resolution::new(1920, 1080),
];

#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    pub candidates: Vec<Resolution>,
    /// Untimed reads before the probe
    pub priming_reads: u32,
    /// Reads timed by the probe
    pub timed_reads: u32,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            candidates: CANDIDATE_RESOLUTIONS.to_vec(),
            priming_reads: 10,
            timed_reads: 240,
        }
    }
}

/// Outcome of a successful calibration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Calibration {
    /// Usable modes, ascending
    pub resolutions: Vec<Resolution>,
    pub max_fps: u32,
}

impl Calibration {
    pub fn largest(&self) -> Option<Resolution> {
        self.resolutions.last().copied()
    }
}

/// Turns step counts into 0-100 and only reports changes
struct Progress<'a> {
    total: u64,
    done: u64,
    last: Option<u8>,
    report: &'a mut dyn FnMut(u8),
}

impl<'a> Progress<'a> {
    fn new(total: u64, report: &'a mut dyn FnMut(u8)) -> Self {
        Self {
            total: total.max(1),
            done: 0,
            last: None,
            report,
        }
    }

    fn step(&mut self) {
        self.done = (self.done + 1).min(self.total);
        self.emit(((self.done * 100) / self.total) as u8);
    }

    fn emit(&mut self, percent: u8) {
        if self.last != Some(percent) {
            self.last = Some(percent);
            (self.report)(percent);
        }
    }
}

fn check_cancel(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Acquire) {
        Err(CamError::Cancelled)
    } else {
        Ok(())
    }
}

/// Run both phases on `camera`, reporting progress through `report`
#[instrument(skip_all, fields(camera = camera.name()))]
pub fn calibrate(
    camera: &mut dyn CameraDevice,
    settings: &CalibrationSettings,
    cancel: &AtomicBool,
    report: &mut dyn FnMut(u8),
) -> Result<Calibration> {
    let total = settings.candidates.len() as u64
        + settings.priming_reads as u64
        + settings.timed_reads.max(1) as u64;
    let mut progress = Progress::new(total, report);
    progress.emit(0);

    let resolutions = sweep(camera, &settings.candidates, cancel, &mut progress)?;
    let largest = resolutions
        .last()
        .copied()
        .ok_or_else(|| CamError::Calibration("no usable resolution".into()))?;
    info!(modes = resolutions.len(), %largest, "Resolution sweep done");

    let max_fps = probe(camera, largest, settings, cancel, &mut progress)?;
    progress.emit(100);
    info!(max_fps, "Rate probe done");

    Ok(Calibration {
        resolutions,
        max_fps,
    })
}

fn sweep(
    camera: &mut dyn CameraDevice,
    candidates: &[Resolution],
    cancel: &AtomicBool,
    progress: &mut Progress,
) -> Result<Vec<Resolution>> {
    let original = camera.resolution();
    let accepted = try_modes(camera, candidates, cancel, progress);
    if let Err(e) = camera.set_resolution(original) {
        warn!("Could not restore {} after sweep: {}", original, e);
        accepted?;
        return Err(e);
    }

    let mut accepted = accepted?;
    accepted.sort();
    accepted.dedup();
    Ok(accepted)
}

fn try_modes(
    camera: &mut dyn CameraDevice,
    candidates: &[Resolution],
    cancel: &AtomicBool,
    progress: &mut Progress,
) -> Result<Vec<Resolution>> {
    let mut accepted = Vec::new();
    for &candidate in candidates {
        check_cancel(cancel)?;
        let usable = camera.set_resolution(candidate).is_ok()
            && camera
                .read()
                .is_ok_and(|frame| frame.buffer.resolution() == candidate);
        debug!(%candidate, usable, "Probed mode");
        if usable {
            accepted.push(candidate);
        }
        progress.step();
    }
    Ok(accepted)
}

fn probe(
    camera: &mut dyn CameraDevice,
    largest: Resolution,
    settings: &CalibrationSettings,
    cancel: &AtomicBool,
    progress: &mut Progress,
) -> Result<u32> {
    let original = camera.resolution();
    camera.set_resolution(largest)?;
    let measured = timed_reads(camera, settings, cancel, progress);
    if let Err(e) = camera.set_resolution(original) {
        warn!("Could not restore {} after probe: {}", original, e);
        measured?;
        return Err(e);
    }
    measured
}

fn timed_reads(
    camera: &mut dyn CameraDevice,
    settings: &CalibrationSettings,
    cancel: &AtomicBool,
    progress: &mut Progress,
) -> Result<u32> {
    for _ in 0..settings.priming_reads {
        check_cancel(cancel)?;
        camera.read()?;
        progress.step();
    }

    let reads = settings.timed_reads.max(1);
    let started = Instant::now();
    for _ in 0..reads {
        check_cancel(cancel)?;
        camera.read()?;
        progress.step();
    }
    let elapsed = started.elapsed().as_secs_f64();
    if elapsed <= 0.0 {
        return Err(CamError::Calibration("non-positive probe duration".into()));
    }

    let fps = (reads as f64 / elapsed).round();
    if fps < 1.0 {
        return Err(CamError::Calibration(format!(
            "measured rate {:.3} fps is unusable",
            reads as f64 / elapsed
        )));
    }
    Ok(fps as u32)
}

/// Calibration running on its own thread so the controller stays responsive
pub struct CalibrationTask {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<(Box<dyn CameraDevice>, Result<Calibration>)>>,
}

impl CalibrationTask {
    /// Take the camera and calibrate it, sending [`Event::Progress`] to `events`
    pub fn spawn(
        mut camera: Box<dyn CameraDevice>,
        settings: CalibrationSettings,
        events: Sender<Event>,
    ) -> Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let thread = {
            let cancel = Arc::clone(&cancel);
            thread::Builder::new()
                .name("labcam-calibrate".into())
                .spawn(move || {
                    let mut report = |percent: u8| {
                        let _ = events.send(Event::Progress(percent));
                    };
                    let outcome = calibrate(camera.as_mut(), &settings, &cancel, &mut report);
                    (camera, outcome)
                })?
        };
        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the thread and take the camera back
    pub fn join(mut self) -> Result<(Box<dyn CameraDevice>, Result<Calibration>)> {
        let thread = self
            .thread
            .take()
            .ok_or_else(|| CamError::Calibration("already joined".into()))?;
        thread
            .join()
            .map_err(|_| CamError::Calibration("calibration thread panicked".into()))
    }
}

impl Drop for CalibrationTask {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.cancel();
            let _ = thread.join();
        }
    }
}
