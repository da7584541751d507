//! Rolling estimate of the rate frames actually arrive at

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Samples kept in the rolling window
pub const DEFAULT_WINDOW: usize = 60;

/// Read side of the tracker, cheap to clone across threads
#[derive(Debug, Clone, Default)]
pub struct FpsGauge(Arc<AtomicU32>);

impl FpsGauge {
    pub fn new(initial: u32) -> Self {
        Self(Arc::new(AtomicU32::new(initial)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, fps: u32) {
        self.0.store(fps, Ordering::Relaxed);
        metrics::gauge!("labcam_measured_fps").set(fps as f64);
    }
}

/// Owned by the capture loop; publishes every update through its gauge
#[derive(Debug)]
pub struct FpsTracker {
    window: usize,
    deltas: VecDeque<f64>,
    sum: f64,
    last: Option<Instant>,
    gauge: FpsGauge,
}

impl FpsTracker {
    pub fn new(window: usize, gauge: FpsGauge) -> Self {
        let window = window.max(1);
        Self {
            window,
            deltas: VecDeque::with_capacity(window),
            sum: 0.0,
            last: None,
            gauge,
        }
    }

    /// Feed the arrival time of the next frame and return the current estimate
    pub fn update(&mut self, timestamp: Instant) -> u32 {
        if let Some(last) = self.last.replace(timestamp) {
            let delta = timestamp.saturating_duration_since(last).as_secs_f64();
            if self.deltas.len() == self.window {
                if let Some(old) = self.deltas.pop_front() {
                    self.sum -= old;
                }
            }
            self.deltas.push_back(delta);
            self.sum += delta;

            if self.sum > 0.0 {
                let fps = (self.deltas.len() as f64 / self.sum).round() as u32;
                self.gauge.set(fps);
            }
        }
        self.gauge.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn steady_stream_converges_to_rate() {
        let mut tracker = FpsTracker::new(DEFAULT_WINDOW, FpsGauge::new(0));
        let start = Instant::now();
        let mut fps = 0;
        for i in 0..120 {
            fps = tracker.update(start + Duration::from_secs_f64(i as f64 / 25.0));
        }
        assert_eq!(fps, 25);
    }

    #[test]
    fn window_evicts_old_samples() {
        let gauge = FpsGauge::new(0);
        let mut tracker = FpsTracker::new(10, gauge.clone());
        let start = Instant::now();
        let mut t = start;
        for _ in 0..20 {
            t += Duration::from_millis(100);
            tracker.update(t);
        }
        assert_eq!(gauge.get(), 10);
        for _ in 0..10 {
            t += Duration::from_millis(20);
            tracker.update(t);
        }
        assert_eq!(gauge.get(), 50);
    }

    #[test]
    fn identical_timestamps_keep_previous_value() {
        let gauge = FpsGauge::new(30);
        let mut tracker = FpsTracker::new(5, gauge.clone());
        let t = Instant::now();
        tracker.update(t);
        tracker.update(t);
        assert_eq!(gauge.get(), 30);
    }
}
