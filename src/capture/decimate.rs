//! Converts the camera's irregular delivery rate into the target logical rate
//!
//! Each accepted frame carries a replication count: how many logical ticks
//! of the target clock it stands for. Frames arriving too far ahead of the
//! target clock are dropped.

use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Emit { replication: u32 },
    Drop,
}

#[derive(Debug, Clone)]
pub struct Decimator {
    target_fps: f64,
    seconds_per_frame: f64,
    tolerance: i64,
    start: Option<Instant>,
    emitted: i64,
}

impl Decimator {
    pub fn new(target_fps: f64) -> Self {
        let mut decimator = Self {
            target_fps: 0.0,
            seconds_per_frame: 0.0,
            tolerance: 0,
            start: None,
            emitted: 0,
        };
        decimator.reset(target_fps);
        decimator
    }

    /// Restart the target clock at the next frame, possibly at a new rate
    pub fn reset(&mut self, target_fps: f64) {
        self.target_fps = target_fps;
        self.seconds_per_frame = 1.0 / target_fps;
        self.tolerance = (target_fps / 6.0).floor() as i64;
        self.start = None;
        self.emitted = 0;
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    /// How far ahead of the target clock emission may run before frames drop
    pub fn tolerance(&self) -> i64 {
        self.tolerance
    }

    pub fn decide(&mut self, now: Instant) -> Decision {
        let start = *self.start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start).as_secs_f64();
        let expected = (elapsed / self.seconds_per_frame).floor() as i64;
        let diff = expected - self.emitted;

        if diff > 0 {
            self.emitted = expected;
            Decision::Emit {
                replication: u32::try_from(diff).unwrap_or(u32::MAX),
            }
        } else if diff > -self.tolerance {
            self.emitted += 1;
            Decision::Emit { replication: 1 }
        } else {
            Decision::Drop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Feed `seconds` of frames delivered at `hardware_fps`; returns
    /// (emitted frames, sum of replications, max replication)
    fn simulate(target: f64, hardware_fps: f64, seconds: f64) -> (u64, u64, u32) {
        let mut decimator = Decimator::new(target);
        let start = Instant::now();
        let reads = (hardware_fps * seconds) as u64;
        let (mut emitted, mut logical, mut max_rep) = (0, 0, 0);
        for i in 0..reads {
            let now = start + Duration::from_secs_f64(i as f64 / hardware_fps);
            if let Decision::Emit { replication } = decimator.decide(now) {
                emitted += 1;
                logical += replication as u64;
                max_rep = max_rep.max(replication);
            }
        }
        (emitted, logical, max_rep)
    }

    #[test]
    fn matching_rate_never_drops_or_replicates() {
        let (emitted, logical, max_rep) = simulate(30.0, 30.0, 10.0);
        assert_eq!(emitted, 300);
        assert_eq!(logical, 300);
        assert_eq!(max_rep, 1);
    }

    #[test]
    fn double_rate_drops_about_half() {
        let target = 30.0;
        let (emitted, logical, max_rep) = simulate(target, 60.0, 10.0);
        let tolerance = (target / 6.0).floor() as u64;
        assert_eq!(max_rep, 1);
        assert_eq!(emitted, logical);
        assert!(logical.abs_diff(300) <= tolerance, "logical = {}", logical);
    }

    #[test]
    fn slow_camera_is_replicated_up_to_target() {
        let (emitted, logical, max_rep) = simulate(30.0, 10.0, 10.0);
        assert_eq!(emitted, 100);
        assert!(max_rep >= 3);
        assert!(logical.abs_diff(300) <= 5, "logical = {}", logical);
    }

    #[test]
    fn reset_restarts_the_clock() {
        let mut decimator = Decimator::new(30.0);
        let start = Instant::now();
        assert_eq!(decimator.decide(start), Decision::Emit { replication: 1 });
        let later = start + Duration::from_millis(2010);
        assert_eq!(decimator.decide(later), Decision::Emit { replication: 59 });

        decimator.reset(10.0);
        assert_eq!(decimator.target_fps(), 10.0);
        assert_eq!(decimator.tolerance(), 1);
        // A long gap before the reset must not be back-filled
        let after = later + Duration::from_secs(5);
        assert_eq!(decimator.decide(after), Decision::Emit { replication: 1 });
    }

    #[test]
    fn burst_ahead_of_clock_is_dropped() {
        let mut decimator = Decimator::new(30.0);
        let t = Instant::now();
        let decisions: Vec<_> = (0..8).map(|_| decimator.decide(t)).collect();
        // Tolerance of 5 frames ahead, then drops
        let emitted = decisions
            .iter()
            .filter(|d| matches!(d, Decision::Emit { .. }))
            .count();
        assert_eq!(emitted, 5);
        assert_eq!(decisions[7], Decision::Drop);
    }
}
