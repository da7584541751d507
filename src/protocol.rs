//! Tagged messages exchanged with the external controller

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::capture::Resolution;

/// Overlay label language
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    English,
    French,
    German,
    Spanish,
}

/// Inbound commands, one optional payload each
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Initialize,
    Cleanup { discard: bool },
    /// Start recording to the given file
    Start(PathBuf),
    /// Stop recording
    Stop,
    SetUseCam(bool),
    SetUseFeed(bool),
    SetResolution(Resolution),
    GetResolution,
    SetFps(f64),
    GetFps,
    ConditionName(String),
    BlockNumber(i64),
    KeyFlag(String),
    ExperimentStatus(bool),
    Overlay(bool),
    Language(Language),
}

/// Outbound events
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Hardware, calibration or writer failure
    Failure(String),
    /// Calibration progress, 0-100
    Progress(u8),
    /// Calibration finished: maximum sustainable rate and usable resolutions
    Started {
        max_fps: u32,
        resolutions: Vec<Resolution>,
    },
    CurrentFps(u32),
    CurrentResolution(Resolution),
    /// Recording stopped and the file is closed
    Stopped,
    /// Everything torn down and the camera released
    CleanedUp,
}
