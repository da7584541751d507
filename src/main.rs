//! labcam: stream a camera, stamp experiment metadata, record and preview

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::Result;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use labcam::capture::{CameraDevice, CameraOpener, SyntheticCamera, V4l2Camera};
use labcam::{settings, utils, CamModel, CaptureConfig, Command, Event, SYNTHETIC_DEVICE};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("labcam=debug"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

/// Resolve the configured device once; the opener is called at every INITIALIZE
fn camera_opener(capture: &CaptureConfig) -> Result<CameraOpener> {
    if capture.device == SYNTHETIC_DEVICE {
        let fps = capture.synthetic_fps;
        info!("Using synthetic camera at {} fps", fps);
        return Ok(Box::new(move |resolution| {
            Ok(Box::new(SyntheticCamera::new(resolution).with_fps(fps)) as Box<dyn CameraDevice>)
        }));
    }

    let (path, format) = if capture.device.is_empty() {
        let found = utils::auto_detect_device()?;
        (found.path, found.format)
    } else {
        (capture.device.clone(), capture.format)
    };
    info!("Using capture device: {} ({:?})", path, format);

    let buffers = capture.buffer_count;
    Ok(Box::new(move |resolution| {
        Ok(Box::new(V4l2Camera::open(&path, resolution, format, buffers)?) as Box<dyn CameraDevice>)
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("labcam launching...");

    // labcam [config.toml] [recording-path]
    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let mut record_path = args.next().map(PathBuf::from);

    let config = settings::load(config_path.as_deref())?;
    let opener = camera_opener(&config.capture)?;

    let mut handle = CamModel::spawn(config, opener)?;
    let mut preview = handle.take_preview();
    let events = handle.events().clone();
    handle.send(Command::Initialize)?;

    let mut preview_tick = tokio::time::interval(Duration::from_millis(500));
    let mut recording = false;
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                interrupted = true;
                break;
            }
            event = events.recv_async() => match event {
                Ok(Event::Progress(percent)) => debug!("Calibration {}%", percent),
                Ok(Event::Started { max_fps, resolutions }) => {
                    info!(max_fps, ?resolutions, "Camera ready");
                    if let Some(path) = record_path.take() {
                        info!("Recording to {}", path.display());
                        handle.send(Command::Start(path))?;
                        recording = true;
                    }
                }
                Ok(Event::Failure(reason)) => {
                    error!("Pipeline failure: {}", reason);
                    handle.send(Command::Cleanup { discard: true })?;
                }
                Ok(Event::CleanedUp) => break,
                Ok(other) => info!("{:?}", other),
                Err(_) => {
                    warn!("Controller closed its event channel");
                    break;
                }
            },
            _ = preview_tick.tick() => {
                if let Some(frame) = preview.as_mut().and_then(|rx| rx.latest()) {
                    let (sent, _, dropped) = preview.as_ref().map_or((0, 0, 0), |rx| rx.stats());
                    debug!(
                        sequence = frame.sequence,
                        size = %frame.buffer.resolution(),
                        sent,
                        dropped,
                        "Preview"
                    );
                }
            }
        }
    }

    if interrupted {
        if recording {
            handle.send(Command::Stop)?;
        }
        handle.send(Command::Cleanup { discard: false })?;
        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while let Ok(event) = events.recv_async().await {
                if event == Event::CleanedUp {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Timed out waiting for cleanup");
        }
    }

    let stats = handle.stats();
    info!(
        captured = stats.frames_captured,
        dropped = stats.frames_decimated,
        written = stats.frames_written,
        "labcam shutting down"
    );
    handle.shutdown()?;
    Ok(())
}
