//! Error taxonomy for frame ingestion.
//!
//! Every per-frame failure is a [`FrameError`]: it affects only the frame that
//! raised it, is counted by [`crate::stats::IngestStats`] and never ends the
//! session. Only [`SessionError`] (the backing store could not be opened at
//! all) is fatal.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::registry::{CapacityKind, ChannelId};

/// Failure of a backing-store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode attributes for {path}: {source}")]
    Attributes {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("parent group {0} does not exist")]
    MissingParent(String),
    #[error("cannot extend {name} to {requested} samples (limit {limit})")]
    Exhausted { name: String, requested: u64, limit: u64 },
    #[error("write of {count} samples at {offset} outside {name} (length {len})")]
    OutOfBounds { name: String, offset: u64, count: usize, len: u64 },
    #[error("writes to {0} are disabled")]
    WriteRejected(String),
}

/// Fatal failure while setting up an ingestion session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("cannot create backing store: {0}")]
    Store(#[from] StoreError),
}

/// Reason a single frame was discarded.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },
    #[error("header CRC mismatch (declared {declared:#06x}, computed {computed:#06x})")]
    HeaderCrcMismatch { declared: u16, computed: u16 },
    #[error("payload CRC mismatch (declared {declared:#06x}, computed {computed:#06x})")]
    PayloadCrcMismatch { declared: u16, computed: u16 },
    #[error("spectral mode frame with {bands} frequency bands; only transient data is supported")]
    UnsupportedMode { bands: u16 },
    #[error("unknown sample frequency code {0}")]
    UnknownSampleFrequency(u8),
    #[error("{kind} table full ({capacity} entries), cannot register {channel}")]
    RegistryCapacityExceeded {
        kind: CapacityKind,
        capacity: usize,
        channel: ChannelId,
    },
    #[error("frame for {channel} lies {offset} samples before the channel origin")]
    NegativeOffset { channel: ChannelId, offset: i64 },
    #[error("cannot create store node for {channel}: {source}")]
    StoreCreateFailed {
        channel: ChannelId,
        #[source]
        source: StoreError,
    },
    #[error("cannot extend {channel} to {new_len} samples: {source}")]
    StoreExtensionFailed {
        channel: ChannelId,
        new_len: u64,
        #[source]
        source: StoreError,
    },
    #[error("cannot write {channel} at offset {offset}: {source}")]
    StoreWriteFailed {
        channel: ChannelId,
        offset: u64,
        #[source]
        source: StoreError,
    },
}

impl FrameError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        FrameError::MalformedFrame { reason: reason.into() }
    }

    /// Statistics bucket this failure is counted under.
    pub fn discard_reason(&self) -> DiscardReason {
        match self {
            FrameError::MalformedFrame { .. } => DiscardReason::Malformed,
            FrameError::HeaderCrcMismatch { .. } => DiscardReason::HeaderCrc,
            FrameError::PayloadCrcMismatch { .. } => DiscardReason::PayloadCrc,
            FrameError::UnsupportedMode { .. } | FrameError::UnknownSampleFrequency(_) => {
                DiscardReason::Unsupported
            }
            FrameError::RegistryCapacityExceeded { .. } => DiscardReason::Capacity,
            FrameError::NegativeOffset { .. } => DiscardReason::NegativeOffset,
            FrameError::StoreCreateFailed { .. }
            | FrameError::StoreExtensionFailed { .. }
            | FrameError::StoreWriteFailed { .. } => DiscardReason::Store,
        }
    }
}

/// Discard bucket for [`FrameError`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    Malformed,
    HeaderCrc,
    PayloadCrc,
    Unsupported,
    Capacity,
    NegativeOffset,
    Store,
}

impl DiscardReason {
    pub const ALL: [DiscardReason; 7] = [
        DiscardReason::Malformed,
        DiscardReason::HeaderCrc,
        DiscardReason::PayloadCrc,
        DiscardReason::Unsupported,
        DiscardReason::Capacity,
        DiscardReason::NegativeOffset,
        DiscardReason::Store,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DiscardReason::Malformed => "malformed",
            DiscardReason::HeaderCrc => "header_crc",
            DiscardReason::PayloadCrc => "payload_crc",
            DiscardReason::Unsupported => "unsupported",
            DiscardReason::Capacity => "capacity",
            DiscardReason::NegativeOffset => "negative_offset",
            DiscardReason::Store => "store",
        }
    }
}
