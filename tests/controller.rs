//! Integration tests for the pipeline controller
//!
//! Every test drives a real controller thread over its command channel with
//! the synthetic camera standing in for hardware.

use std::thread;
use std::time::{Duration, Instant};

use labcam::capture::{CameraDevice, CameraOpener, Resolution, SyntheticCamera};
use labcam::{CamModel, CamModelHandle, Command, Config, Event};

const SMALL: Resolution = Resolution::new(320, 240);
const LARGE: Resolution = Resolution::new(640, 480);

fn test_config() -> Config {
    let mut config = Config::default();
    config.capture.device = "synthetic".into();
    config.capture.width = SMALL.width;
    config.capture.height = SMALL.height;
    config.capture.priming_reads = 2;
    config.capture.calibration_reads = 15;
    config.capture.read_timeout_margin_ms = 300;
    config.capture.priming_timeout_ms = 500;
    config.pipeline.poll_interval_ms = 10;
    config.preview.width = 160;
    config
}

/// Synthetic camera streaming SMALL and LARGE at `fps`, optionally failing
fn opener(fps: f64, fail_at: Option<u64>) -> CameraOpener {
    Box::new(move |resolution| {
        let mut camera = SyntheticCamera::new(resolution)
            .with_supported(vec![SMALL, LARGE])
            .with_fps(fps);
        if let Some(k) = fail_at {
            camera = camera.fail_at(k);
        }
        Ok(Box::new(camera) as Box<dyn CameraDevice>)
    })
}

/// Synthetic camera whose `k`-th read blocks for `stall`
fn stalling_opener(fps: f64, k: u64, stall: Duration) -> CameraOpener {
    Box::new(move |resolution| {
        Ok(Box::new(
            SyntheticCamera::new(resolution)
                .with_supported(vec![SMALL, LARGE])
                .with_fps(fps)
                .stall_at(k, stall),
        ) as Box<dyn CameraDevice>)
    })
}

fn is_failure(event: &Event) -> bool {
    matches!(event, Event::Failure(_))
}

/// Wait for the first event matching `pred`, skipping others
fn wait_for(
    handle: &CamModelHandle,
    timeout: Duration,
    pred: impl Fn(&Event) -> bool,
) -> Option<Event> {
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match handle.events().recv_timeout(left) {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

fn started(fps: f64, fail_at: Option<u64>) -> CamModelHandle {
    let handle = CamModel::spawn(test_config(), opener(fps, fail_at)).unwrap();
    handle.send(Command::Initialize).unwrap();
    let event = wait_for(&handle, Duration::from_secs(10), |e| {
        matches!(e, Event::Started { .. } | Event::Failure(_))
    });
    assert!(
        matches!(event, Some(Event::Started { .. })),
        "initialize produced {:?}",
        event
    );
    handle
}

fn cleanup(handle: CamModelHandle) {
    handle.send(Command::Cleanup { discard: true }).unwrap();
    assert!(wait_for(&handle, Duration::from_secs(5), |e| *e == Event::CleanedUp).is_some());
    handle.shutdown().unwrap();
}

/// Initialize reports progress, then the calibrated modes and rate
#[test]
fn test_initialize_reports_calibration() {
    let handle = CamModel::spawn(test_config(), opener(60.0, None)).unwrap();
    handle.send(Command::Initialize).unwrap();

    let mut progress = Vec::new();
    let started = loop {
        match handle.events().recv_timeout(Duration::from_secs(10)) {
            Ok(Event::Progress(p)) => progress.push(p),
            Ok(event @ Event::Started { .. }) => break event,
            other => panic!("unexpected {:?}", other),
        }
    };

    let Event::Started {
        max_fps,
        resolutions,
    } = started
    else {
        unreachable!()
    };
    assert_eq!(resolutions, vec![SMALL, LARGE]);
    assert!(max_fps > 0);
    assert_eq!(progress.last(), Some(&100));
    assert_eq!(handle.state().target_fps, max_fps as f64);
    assert_eq!(handle.state().resolution, SMALL);

    cleanup(handle);
}

/// A camera with no usable mode fails before capture ever starts
#[test]
fn test_calibration_failure_never_starts_capture() {
    let bad: CameraOpener = Box::new(|resolution| {
        Ok(Box::new(
            SyntheticCamera::new(resolution)
                .with_supported(vec![Resolution::new(333, 222)])
                .with_fps(0.0),
        ) as Box<dyn CameraDevice>)
    });
    let handle = CamModel::spawn(test_config(), bad).unwrap();
    handle.send(Command::Initialize).unwrap();

    let event = wait_for(&handle, Duration::from_secs(5), |e| {
        matches!(e, Event::Started { .. } | Event::Failure(_))
    });
    assert!(matches!(event, Some(Event::Failure(_))));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(handle.stats().frames_captured, 0);
    cleanup(handle);
}

/// START/STOP produces a file of whole frames at the current size
#[test]
fn test_recording_writes_whole_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.rgb");
    let handle = started(60.0, None);

    handle.send(Command::Start(path.clone())).unwrap();
    thread::sleep(Duration::from_millis(600));
    handle.send(Command::Stop).unwrap();
    assert!(wait_for(&handle, Duration::from_secs(5), |e| *e == Event::Stopped).is_some());
    assert!(!handle.state().writing);

    let len = std::fs::metadata(&path).unwrap().len() as usize;
    assert!(len > 0);
    assert_eq!(len % SMALL.byte_len(), 0);

    let stats = handle.stats();
    assert_eq!(stats.frames_written, stats.frames_enqueued);
    assert_eq!(stats.frames_written as usize, len / SMALL.byte_len());
    cleanup(handle);
}

/// Recorded frame count follows the target rate, not the camera rate
#[test]
fn test_decimation_holds_target_rate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rate.rgb");
    let handle = started(60.0, None);
    handle.send(Command::SetFps(20.0)).unwrap();
    thread::sleep(Duration::from_millis(200));

    let began = Instant::now();
    handle.send(Command::Start(path)).unwrap();
    thread::sleep(Duration::from_millis(1500));
    handle.send(Command::Stop).unwrap();
    let elapsed = began.elapsed().as_secs_f64();
    assert!(wait_for(&handle, Duration::from_secs(5), |e| *e == Event::Stopped).is_some());

    let rate = handle.stats().frames_written as f64 / elapsed;
    assert!((12.0..=26.0).contains(&rate), "recorded at {:.1} fps", rate);
    assert!(handle.stats().frames_decimated > 0);
    cleanup(handle);
}

/// SET_RES mid-stream then GET_RES round trips and later frames use the new size
#[test]
fn test_set_resolution_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("large.rgb");
    let handle = started(60.0, None);

    handle.send(Command::SetResolution(LARGE)).unwrap();
    handle.send(Command::GetResolution).unwrap();
    let event = wait_for(&handle, Duration::from_secs(5), |e| {
        matches!(e, Event::CurrentResolution(_))
    });
    assert_eq!(event, Some(Event::CurrentResolution(LARGE)));
    assert!(handle.state().preview);

    handle.send(Command::Start(path.clone())).unwrap();
    thread::sleep(Duration::from_millis(500));
    handle.send(Command::Stop).unwrap();
    assert!(wait_for(&handle, Duration::from_secs(5), |e| *e == Event::Stopped).is_some());

    let len = std::fs::metadata(&path).unwrap().len() as usize;
    assert!(len > 0);
    assert_eq!(len % LARGE.byte_len(), 0);
    cleanup(handle);
}

/// Resolutions outside the calibrated list are ignored
#[test]
fn test_unsupported_resolution_ignored() {
    let handle = started(60.0, None);
    handle
        .send(Command::SetResolution(Resolution::new(1920, 1080)))
        .unwrap();
    handle.send(Command::GetResolution).unwrap();
    let event = wait_for(&handle, Duration::from_secs(5), |e| {
        matches!(e, Event::CurrentResolution(_))
    });
    assert_eq!(event, Some(Event::CurrentResolution(SMALL)));
    cleanup(handle);
}

/// A read failure produces exactly one FAILURE and halts capture
#[test]
fn test_read_failure_reported_once() {
    // Calibration uses 9 + 2 + 15 reads and capture priming 2 more
    let handle = started(100.0, Some(60));

    let first = wait_for(&handle, Duration::from_secs(5), |e| {
        matches!(e, Event::Failure(_))
    });
    assert!(first.is_some());
    let captured = handle.stats().frames_captured;

    let second = wait_for(&handle, Duration::from_millis(500), |e| {
        matches!(e, Event::Failure(_))
    });
    assert!(second.is_none());
    assert_eq!(handle.stats().frames_captured, captured);
    cleanup(handle);
}

/// STOP without an active recording is acknowledged and harmless
#[test]
fn test_stop_is_idempotent() {
    let handle = started(60.0, None);
    for _ in 0..2 {
        handle.send(Command::Stop).unwrap();
        let event = wait_for(&handle, Duration::from_secs(2), |e| {
            matches!(e, Event::Stopped | Event::Failure(_))
        });
        assert_eq!(event, Some(Event::Stopped));
    }
    cleanup(handle);
}

/// Metadata and rate commands land in the shared state
#[test]
fn test_metadata_commands_update_state() {
    let handle = started(60.0, None);
    let epoch = handle.state().rate_epoch;

    handle.send(Command::ConditionName("baseline".into())).unwrap();
    handle.send(Command::BlockNumber(4)).unwrap();
    handle.send(Command::KeyFlag("L".into())).unwrap();
    handle.send(Command::ExperimentStatus(true)).unwrap();
    handle.send(Command::Overlay(false)).unwrap();
    handle.send(Command::SetFps(-5.0)).unwrap();
    handle.send(Command::SetFps(15.0)).unwrap();
    handle.send(Command::GetFps).unwrap();
    assert!(wait_for(&handle, Duration::from_secs(2), |e| matches!(e, Event::CurrentFps(_))).is_some());

    let state = handle.state();
    assert_eq!(state.experiment.condition, "baseline");
    assert_eq!(state.experiment.block, 4);
    assert_eq!(state.experiment.key_flag, "L");
    assert!(state.experiment.running);
    assert!(state.experiment.started_at.is_some());
    assert!(!state.overlay);
    assert_eq!(state.target_fps, 15.0);
    assert_eq!(state.rate_epoch, epoch + 1);
    cleanup(handle);
}

/// Preview frames arrive downscaled while the feed is enabled
#[test]
fn test_preview_feed() {
    let mut handle = started(60.0, None);
    let mut preview = handle.take_preview().unwrap();
    thread::sleep(Duration::from_millis(400));

    let frame = preview.latest().expect("no preview frame");
    assert_eq!(frame.buffer.resolution(), Resolution::new(160, 120));

    handle.send(Command::SetUseFeed(false)).unwrap();
    thread::sleep(Duration::from_millis(200));
    let _ = preview.latest();
    thread::sleep(Duration::from_millis(300));
    assert!(preview.try_recv().is_none());
    cleanup(handle);
}

/// Disabling the camera stops capture without losing the device
#[test]
fn test_camera_toggle() {
    let handle = started(60.0, None);
    handle.send(Command::SetUseCam(false)).unwrap();
    thread::sleep(Duration::from_millis(200));
    let paused = handle.stats().frames_captured;
    thread::sleep(Duration::from_millis(300));
    assert_eq!(handle.stats().frames_captured, paused);

    handle.send(Command::SetUseCam(true)).unwrap();
    thread::sleep(Duration::from_millis(500));
    assert!(handle.stats().frames_captured > paused);
    cleanup(handle);
}

/// CLEANUP during calibration cancels it promptly
#[test]
fn test_cleanup_cancels_calibration() {
    let mut config = test_config();
    config.capture.calibration_reads = 10_000;
    let handle = CamModel::spawn(config, opener(30.0, None)).unwrap();
    handle.send(Command::Initialize).unwrap();
    thread::sleep(Duration::from_millis(200));

    let began = Instant::now();
    handle.send(Command::Cleanup { discard: true }).unwrap();
    let event = wait_for(&handle, Duration::from_secs(5), |e| {
        matches!(e, Event::CleanedUp | Event::Started { .. })
    });
    assert_eq!(event, Some(Event::CleanedUp));
    assert!(began.elapsed() < Duration::from_secs(2));
    handle.shutdown().unwrap();
}

/// A read that blocks mid-stream is reported once, and CLEANUP does not wait for it
#[test]
fn test_stalled_read_reported_and_cleanup_detaches() {
    // Reads 0..=25 calibrate, 26 and 27 prime, 40 is a streaming read
    let stall = Duration::from_secs(6);
    let handle = CamModel::spawn(test_config(), stalling_opener(60.0, 40, stall)).unwrap();
    handle.send(Command::Initialize).unwrap();
    let began = Instant::now();
    assert!(wait_for(&handle, Duration::from_secs(10), |e| matches!(e, Event::Started { .. })).is_some());

    let first = wait_for(&handle, Duration::from_secs(2), is_failure);
    assert!(
        matches!(&first, Some(Event::Failure(reason)) if reason.contains("stalled")),
        "got {:?}",
        first
    );
    let captured = handle.stats().frames_captured;
    assert!(wait_for(&handle, Duration::from_millis(300), is_failure).is_none());
    assert_eq!(handle.stats().frames_captured, captured);

    handle.send(Command::Cleanup { discard: true }).unwrap();
    assert!(wait_for(&handle, Duration::from_secs(2), |e| *e == Event::CleanedUp).is_some());
    assert!(began.elapsed() < stall, "cleanup waited for the stalled read");
    handle.shutdown().unwrap();
}

/// A read that hangs while priming the capture loop is still caught
#[test]
fn test_stall_during_priming_reported() {
    // Reads 0..=25 calibrate; 26 is the first priming read of the stream
    let stall = Duration::from_secs(6);
    let handle = CamModel::spawn(test_config(), stalling_opener(60.0, 26, stall)).unwrap();
    handle.send(Command::Initialize).unwrap();
    let began = Instant::now();
    assert!(wait_for(&handle, Duration::from_secs(10), |e| matches!(e, Event::Started { .. })).is_some());

    let failure = wait_for(&handle, Duration::from_secs(2), is_failure);
    assert!(failure.is_some());
    assert_eq!(handle.stats().frames_captured, 0);

    handle.send(Command::Cleanup { discard: true }).unwrap();
    assert!(wait_for(&handle, Duration::from_secs(2), |e| *e == Event::CleanedUp).is_some());
    assert!(began.elapsed() < stall, "cleanup waited for the stalled read");
    handle.shutdown().unwrap();
}
