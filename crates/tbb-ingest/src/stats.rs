use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use crate::error::DiscardReason;

// ---------------------------------------------------------------------------
// IngestStats
// ---------------------------------------------------------------------------

/// Atomic per-session frame counters.
/// All atomic writes use Relaxed ordering; these are counters, not synchronisation.
/// The receiver thread and the ingest thread update disjoint fields.
#[derive(Debug, Default)]
pub struct IngestStats {
    // Receiver
    pub frames_received: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Frames dropped because the receiver→ingest channel was full.
    pub frames_dropped: AtomicU64,

    // Pipeline
    /// Frames whose header CRC was checked, pass or fail.
    pub header_crc_checked: AtomicU64,
    pub frames_processed: AtomicU64,
    discarded: [AtomicU64; DiscardReason::ALL.len()],
}

/// Discard counts broken down by reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscardCounts {
    pub malformed: u64,
    pub header_crc: u64,
    pub payload_crc: u64,
    pub unsupported: u64,
    pub capacity: u64,
    pub negative_offset: u64,
    pub store: u64,
}

impl DiscardCounts {
    pub fn get(&self, reason: DiscardReason) -> u64 {
        match reason {
            DiscardReason::Malformed => self.malformed,
            DiscardReason::HeaderCrc => self.header_crc,
            DiscardReason::PayloadCrc => self.payload_crc,
            DiscardReason::Unsupported => self.unsupported,
            DiscardReason::Capacity => self.capacity,
            DiscardReason::NegativeOffset => self.negative_offset,
            DiscardReason::Store => self.store,
        }
    }

    pub fn total(&self) -> u64 {
        DiscardReason::ALL.iter().map(|&r| self.get(r)).sum()
    }
}

/// Plain-struct snapshot of IngestStats (no atomics).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_dropped: u64,
    pub header_crc_checked: u64,
    pub frames_processed: u64,
    pub discarded: DiscardCounts,
}

/// Final figures of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub processed: u64,
    pub discarded_header_crc: u64,
    /// Fraction of CRC-checked frames that failed the header CRC, or None
    /// when no header CRC was checked.
    pub header_crc_failure_ratio: Option<f64>,
    pub discarded_total: u64,
    pub received: u64,
    pub dropped: u64,
}

impl IngestStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Relaxed);
    }

    pub fn record_header_crc_checked(&self) {
        self.header_crc_checked.fetch_add(1, Relaxed);
    }

    pub fn record_processed(&self) {
        self.frames_processed.fetch_add(1, Relaxed);
    }

    pub fn record_discarded(&self, reason: DiscardReason) {
        self.discarded[reason as usize].fetch_add(1, Relaxed);
    }

    pub fn record_discarded_header_crc(&self) {
        self.record_discarded(DiscardReason::HeaderCrc);
    }

    pub fn processed(&self) -> u64 {
        self.frames_processed.load(Relaxed)
    }

    pub fn discarded(&self, reason: DiscardReason) -> u64 {
        self.discarded[reason as usize].load(Relaxed)
    }

    pub fn discarded_total(&self) -> u64 {
        self.discarded.iter().map(|c| c.load(Relaxed)).sum()
    }

    /// Header-CRC failures over every frame whose header CRC was checked.
    /// Frames that passed the check count even if a later stage discarded
    /// them. None when the check never ran.
    pub fn header_crc_failure_ratio(&self) -> Option<f64> {
        let failed = self.discarded(DiscardReason::HeaderCrc);
        let checked = self.header_crc_checked.load(Relaxed);
        if checked == 0 {
            return None;
        }
        Some(failed as f64 / checked as f64)
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            frames_received: self.frames_received.load(Relaxed),
            bytes_received: self.bytes_received.load(Relaxed),
            frames_dropped: self.frames_dropped.load(Relaxed),
            header_crc_checked: self.header_crc_checked.load(Relaxed),
            frames_processed: self.frames_processed.load(Relaxed),
            discarded: DiscardCounts {
                malformed: self.discarded(DiscardReason::Malformed),
                header_crc: self.discarded(DiscardReason::HeaderCrc),
                payload_crc: self.discarded(DiscardReason::PayloadCrc),
                unsupported: self.discarded(DiscardReason::Unsupported),
                capacity: self.discarded(DiscardReason::Capacity),
                negative_offset: self.discarded(DiscardReason::NegativeOffset),
                store: self.discarded(DiscardReason::Store),
            },
        }
    }

    pub fn report(&self) -> IngestReport {
        let snap = self.snapshot();
        IngestReport {
            processed: snap.frames_processed,
            discarded_header_crc: snap.discarded.header_crc,
            header_crc_failure_ratio: self.header_crc_failure_ratio(),
            discarded_total: snap.discarded.total(),
            received: snap.frames_received,
            dropped: snap.frames_dropped,
        }
    }
}
