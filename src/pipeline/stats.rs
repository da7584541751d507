//! Counters collected throughout the pipeline

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// Per-slot occupancy: how many stages hold the slot right now
#[derive(Debug, Default)]
struct SlotCounters {
    holders: AtomicUsize,
    max_holders: AtomicUsize,
    cycles: AtomicU64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_decimated: AtomicU64,
    frames_emitted: AtomicU64,
    frames_stale: AtomicU64,
    frames_enqueued: AtomicU64,
    frames_written: AtomicU64,
    preview_sent: AtomicU64,
    preview_dropped: AtomicU64,
}

/// Shared by the capture loop, every slot stage and the writer
#[derive(Debug)]
pub struct PipelineStats {
    counters: CachePadded<Counters>,
    slots: Vec<CachePadded<SlotCounters>>,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    /// Reads discarded by rate decimation
    pub frames_decimated: u64,
    /// Sum of replication counts of accepted frames
    pub frames_emitted: u64,
    /// Frames whose size no longer matched the slot buffers
    pub frames_stale: u64,
    pub frames_enqueued: u64,
    pub frames_written: u64,
    pub preview_sent: u64,
    pub preview_dropped: u64,
    /// Highest number of stages ever holding one slot at once
    pub max_slot_holders: Vec<usize>,
    pub slot_cycles: Vec<u64>,
}

impl PipelineStats {
    pub fn new(slot_count: usize) -> Self {
        Self {
            counters: CachePadded::new(Counters::default()),
            slots: (0..slot_count)
                .map(|_| CachePadded::new(SlotCounters::default()))
                .collect(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn record_capture(&self) {
        self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("labcam_frames_captured").increment(1);
    }

    pub fn record_decimated(&self) {
        self.counters.frames_decimated.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("labcam_frames_dropped").increment(1);
    }

    pub fn record_emitted(&self, replication: u32) {
        self.counters
            .frames_emitted
            .fetch_add(replication as u64, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.counters.frames_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self, count: u64) {
        self.counters.frames_enqueued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.counters.frames_written.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("labcam_frames_written").increment(1);
    }

    pub fn record_preview(&self, delivered: bool) {
        if delivered {
            self.counters.preview_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.preview_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("labcam_preview_dropped").increment(1);
        }
    }

    /// A stage took ownership of slot `index`
    pub fn slot_acquired(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            let now = slot.holders.fetch_add(1, Ordering::AcqRel) + 1;
            slot.max_holders.fetch_max(now, Ordering::AcqRel);
        }
    }

    /// A stage handed slot `index` on
    pub fn slot_released(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.holders.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Slot `index` went back to free
    pub fn slot_cycled(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.cycles.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            frames_captured: c.frames_captured.load(Ordering::Relaxed),
            frames_decimated: c.frames_decimated.load(Ordering::Relaxed),
            frames_emitted: c.frames_emitted.load(Ordering::Relaxed),
            frames_stale: c.frames_stale.load(Ordering::Relaxed),
            frames_enqueued: c.frames_enqueued.load(Ordering::Relaxed),
            frames_written: c.frames_written.load(Ordering::Relaxed),
            preview_sent: c.preview_sent.load(Ordering::Relaxed),
            preview_dropped: c.preview_dropped.load(Ordering::Relaxed),
            max_slot_holders: self
                .slots
                .iter()
                .map(|s| s.max_holders.load(Ordering::Acquire))
                .collect(),
            slot_cycles: self
                .slots
                .iter()
                .map(|s| s.cycles.load(Ordering::Relaxed))
                .collect(),
        }
    }
}
