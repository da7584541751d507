//! Lock-free preview feed for the display process

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgb};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::capture::{FrameBuffer, Resolution};
use crate::error::{CamError, Result};

/// Downscaled frame on its way to the display
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub buffer: FrameBuffer,
    /// Position of the source frame in the processed stream
    pub sequence: u64,
}

#[derive(Default)]
struct Stats {
    frames_sent: AtomicU64,
    frames_read: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Producer half, owned by whichever pipeline consumer thread is running
pub struct PreviewSender {
    ring: HeapProd<PreviewFrame>,
    stats: Arc<CachePadded<Stats>>,
    width: u32,
}

/// Consumer half, held by the display side
pub struct PreviewReceiver {
    ring: HeapCons<PreviewFrame>,
    stats: Arc<CachePadded<Stats>>,
}

/// SPSC preview ring holding at most `depth` frames of `width` pixels wide
pub fn preview_channel(depth: usize, width: u32) -> (PreviewSender, PreviewReceiver) {
    let (prod, cons) = HeapRb::new(depth.max(1)).split();
    let stats = Arc::new(CachePadded::new(Stats::default()));
    (
        PreviewSender {
            ring: prod,
            stats: Arc::clone(&stats),
            width: width.max(1),
        },
        PreviewReceiver { ring: cons, stats },
    )
}

/// Size of the preview for a source resolution, keeping the aspect ratio
pub fn preview_size(source: Resolution, target_width: u32) -> Resolution {
    if source.width <= target_width || source.width == 0 {
        return source;
    }
    let height = (source.height as f64 * target_width as f64 / source.width as f64).round();
    Resolution::new(target_width, (height as u32).max(1))
}

/// Aspect-preserving downscale to `target_width`
pub fn downscale(frame: &FrameBuffer, target_width: u32) -> Result<FrameBuffer> {
    let size = preview_size(frame.resolution(), target_width);
    if size == frame.resolution() {
        return Ok(frame.clone());
    }
    let source: ImageBuffer<Rgb<u8>, &[u8]> =
        ImageBuffer::from_raw(frame.width(), frame.height(), frame.as_bytes())
            .ok_or_else(|| CamError::Decode("frame smaller than its resolution".into()))?;
    let scaled = imageops::resize(&source, size.width, size.height, FilterType::Triangle);
    FrameBuffer::from_raw(size, scaled.into_raw())
}

impl PreviewSender {
    /// Downscale and publish one frame; drops it when the display falls behind
    pub fn publish(&mut self, frame: &FrameBuffer, sequence: u64) -> Result<bool> {
        if self.ring.is_full() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        let buffer = downscale(frame, self.width)?;
        match self.ring.try_push(PreviewFrame { buffer, sequence }) {
            Ok(()) => {
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(_) => {
                self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        }
    }
}

impl PreviewReceiver {
    pub fn try_recv(&mut self) -> Option<PreviewFrame> {
        let frame = self.ring.try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    /// Drain everything queued and keep only the newest frame
    pub fn latest(&mut self) -> Option<PreviewFrame> {
        let mut latest = None;
        while let Some(frame) = self.try_recv() {
            latest = Some(frame);
        }
        latest
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// (sent, read, dropped)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.frames_sent.load(Ordering::Relaxed),
            self.stats.frames_read.load(Ordering::Relaxed),
            self.stats.frames_dropped.load(Ordering::Relaxed),
        )
    }
}
