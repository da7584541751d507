//! Metadata strip burned into the top of every frame

use std::fmt::Write;
use std::time::{Duration, Instant};

use super::font::{self, GLYPH_HEIGHT};
use super::state::CameraState;
use crate::capture::FrameBuffer;
use crate::protocol::Language;

/// Byte capacity of one overlay line
pub const OVERLAY_CAPACITY: usize = 512;

/// Pre-formatted text for one in-flight frame
#[derive(Debug, Clone)]
pub struct OverlayLine {
    text: String,
}

impl Default for OverlayLine {
    fn default() -> Self {
        Self {
            text: String::with_capacity(OVERLAY_CAPACITY),
        }
    }
}

impl OverlayLine {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    /// Cut back to capacity on a character boundary
    fn enforce_capacity(&mut self) {
        if self.text.len() <= OVERLAY_CAPACITY {
            return;
        }
        let mut end = OVERLAY_CAPACITY;
        while !self.text.is_char_boundary(end) {
            end -= 1;
        }
        self.text.truncate(end);
    }
}

struct Labels {
    block: &'static str,
    key: &'static str,
}

fn labels(language: Language) -> Labels {
    match language {
        Language::English => Labels {
            block: "BLOCK",
            key: "KEY",
        },
        Language::French => Labels {
            block: "BLOC",
            key: "TOUCHE",
        },
        Language::German => Labels {
            block: "BLOCK",
            key: "TASTE",
        },
        Language::Spanish => Labels {
            block: "BLOQUE",
            key: "TECLA",
        },
    }
}

/// `HH:MM:SS.mmm`
pub fn format_elapsed(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        millis / 3_600_000,
        (millis / 60_000) % 60,
        (millis / 1000) % 60,
        millis % 1000
    )
}

/// Time stamped on a frame: experiment time while an experiment runs,
/// otherwise time since the stream origin
pub fn frame_elapsed(state: &CameraState, captured_at: Instant, origin: Instant) -> Duration {
    let reference = match state.experiment.started_at {
        Some(started) if state.experiment.running => started,
        _ => origin,
    };
    captured_at.saturating_duration_since(reference)
}

/// Fill `line` with the stamp for one frame.
///
/// The condition name is cut or padded to `condition_width` characters so
/// the remaining fields keep their position from frame to frame.
pub fn format_overlay(
    line: &mut OverlayLine,
    state: &CameraState,
    elapsed: Duration,
    measured_fps: u32,
    condition_width: usize,
) {
    let labels = labels(state.language);
    let condition: String = state
        .experiment
        .condition
        .chars()
        .take(condition_width)
        .collect();

    line.clear();
    // Writing into a String cannot fail
    let _ = write!(
        line.text,
        "{:<width$}  {}  {} {}  {} {}  {}/{}",
        condition,
        format_elapsed(elapsed),
        labels.block,
        state.experiment.block,
        labels.key,
        state.experiment.key_flag,
        measured_fps,
        state.target_fps.round() as i64,
        width = condition_width,
    );
    line.enforce_capacity();
}

/// Glyph scale for a frame width, so the strip stays readable on large frames
pub fn scale_for(width: u32) -> usize {
    (width as usize / 640).clamp(1, 4)
}

/// Height in rows of the strip for a frame width
pub fn strip_height(width: u32) -> usize {
    let scale = scale_for(width);
    GLYPH_HEIGHT * scale + 4 * scale
}

/// Blank the strip at the top of `frame` and draw `text` on it in place
pub fn render_strip(frame: &mut FrameBuffer, text: &str) {
    let started = Instant::now();
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let scale = scale_for(frame.width());
    let rows = strip_height(frame.width()).min(height);

    let strip = &mut frame.as_bytes_mut()[..rows * width * 3];
    strip.fill(0);
    font::draw_text_line(
        strip,
        width,
        rows,
        2 * scale,
        2 * scale,
        text,
        (255, 255, 255),
        scale,
    );
    metrics::histogram!("labcam_overlay_render_us").record(started.elapsed().as_micros() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Resolution;

    fn state() -> CameraState {
        let mut state = CameraState::new(Resolution::new(640, 480), 30.0);
        state.experiment.condition = "baseline-condition-long".into();
        state.experiment.block = 3;
        state.experiment.key_flag = "F".into();
        state
    }

    #[test]
    fn elapsed_formats_hours_minutes_seconds_millis() {
        assert_eq!(format_elapsed(Duration::from_millis(3_723_045)), "01:02:03.045");
        assert_eq!(format_elapsed(Duration::ZERO), "00:00:00.000");
    }

    #[test]
    fn overlay_truncates_condition_and_shows_rates() {
        let mut line = OverlayLine::default();
        format_overlay(&mut line, &state(), Duration::from_secs(61), 29, 8);
        assert_eq!(
            line.as_str(),
            "baseline  00:01:01.000  BLOCK 3  KEY F  29/30"
        );
    }

    #[test]
    fn overlay_pads_short_condition() {
        let mut s = state();
        s.experiment.condition = "A".into();
        s.language = Language::Spanish;
        let mut line = OverlayLine::default();
        format_overlay(&mut line, &s, Duration::ZERO, 0, 4);
        assert!(line.as_str().starts_with("A     00:00:00.000  BLOQUE 3  TECLA F"));
    }

    #[test]
    fn overlay_respects_capacity() {
        let mut s = state();
        s.experiment.key_flag = "é".repeat(400);
        let mut line = OverlayLine::default();
        format_overlay(&mut line, &s, Duration::ZERO, 0, 16);
        assert!(line.as_str().len() <= OVERLAY_CAPACITY);
    }

    #[test]
    fn elapsed_uses_experiment_start_only_while_running() {
        let origin = Instant::now();
        let mut s = state();
        s.experiment.started_at = Some(origin + Duration::from_secs(5));
        let at = origin + Duration::from_secs(8);
        assert_eq!(frame_elapsed(&s, at, origin), Duration::from_secs(8));
        s.experiment.running = true;
        assert_eq!(frame_elapsed(&s, at, origin), Duration::from_secs(3));
    }

    #[test]
    fn render_only_touches_strip() {
        let res = Resolution::new(640, 100);
        let mut frame = FrameBuffer::from_raw(res, vec![77; res.byte_len()]).unwrap();
        render_strip(&mut frame, "12:00");

        let rows = strip_height(640);
        let row_bytes = 640 * 3;
        let (strip, rest) = frame.as_bytes().split_at(rows * row_bytes);
        assert!(strip.iter().all(|&b| b == 0 || b == 255));
        assert!(strip.iter().any(|&b| b == 255));
        assert!(rest.iter().all(|&b| b == 77));
    }

    #[test]
    fn render_survives_tiny_frames() {
        let mut frame = FrameBuffer::new(Resolution::new(4, 2));
        render_strip(&mut frame, "LONG TEXT");
        assert_eq!(frame.as_bytes().len(), 24);
    }
}
