//! Camera state shared between the controller and the worker loops
//!
//! The controller is the only writer. Readers load an immutable snapshot
//! once per iteration, so a frame is always stamped from one consistent view.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;

use crate::capture::Resolution;
use crate::protocol::Language;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExperimentMeta {
    pub condition: String,
    pub block: i64,
    pub key_flag: String,
    pub running: bool,
    /// Set when the experiment switches to running
    pub started_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraState {
    pub resolution: Resolution,
    pub target_fps: f64,
    /// Bumped on every rate command so the capture loop restarts its clock
    pub rate_epoch: u64,
    pub overlay: bool,
    pub experiment: ExperimentMeta,
    pub language: Language,
    pub camera_enabled: bool,
    pub writing: bool,
    pub preview: bool,
}

impl CameraState {
    pub fn new(resolution: Resolution, target_fps: f64) -> Self {
        Self {
            resolution,
            target_fps,
            rate_epoch: 0,
            overlay: true,
            experiment: ExperimentMeta::default(),
            language: Language::default(),
            camera_enabled: true,
            writing: false,
            preview: true,
        }
    }
}

/// Atomically swapped snapshot of [`CameraState`]
#[derive(Debug)]
pub struct SharedState(ArcSwap<CameraState>);

impl SharedState {
    pub fn new(state: CameraState) -> Self {
        Self(ArcSwap::from_pointee(state))
    }

    pub fn load(&self) -> Arc<CameraState> {
        self.0.load_full()
    }

    /// Apply `f` to a copy of the current state and publish it
    pub fn update(&self, f: impl FnOnce(&mut CameraState)) -> Arc<CameraState> {
        let mut next = CameraState::clone(&self.0.load());
        f(&mut next);
        let next = Arc::new(next);
        self.0.store(Arc::clone(&next));
        next
    }
}
