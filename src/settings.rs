//! Layered configuration: built-in defaults, an optional TOML file, then
//! `LABCAM__SECTION__KEY` environment variables

use std::path::Path;

use config::{Environment, File, FileFormat};
use tracing::info;

use crate::error::{CamError, Result};
use crate::Config;

pub const ENV_PREFIX: &str = "LABCAM";

/// Build the configuration without publishing it
pub fn build(path: Option<&Path>) -> Result<Config> {
    let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }
    let config: Config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    validate(&config)?;
    Ok(config)
}

/// Build and validate, logging where the settings came from
pub fn load(path: Option<&Path>) -> Result<Config> {
    let config = build(path)?;
    info!(
        file = ?path,
        device = %config.capture.device,
        slots = config.pipeline.slot_count,
        "Configuration loaded"
    );
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let invalid = |msg: &str| Err(CamError::InvalidConfig(msg.into()));

    let capture = &config.capture;
    if capture.width == 0 || capture.height == 0 {
        return invalid("capture.width and capture.height must be positive");
    }
    if !capture.fps.is_finite() || capture.fps <= 0.0 {
        return invalid("capture.fps must be a positive number");
    }
    if capture.priming_timeout_ms == 0 {
        return invalid("capture.priming_timeout_ms must be positive");
    }
    if capture.calibration_reads == 0 {
        return invalid("capture.calibration_reads must be at least 1");
    }
    if config.pipeline.slot_count == 0 {
        return invalid("pipeline.slot_count must be at least 1");
    }
    if config.pipeline.poll_interval_ms == 0 {
        return invalid("pipeline.poll_interval_ms must be positive");
    }
    if config.preview.width == 0 || config.preview.queue_depth == 0 {
        return invalid("preview.width and preview.queue_depth must be positive");
    }
    Ok(())
}
