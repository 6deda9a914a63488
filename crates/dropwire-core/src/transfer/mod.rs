//! Transfer engine for Dropwire.
//!
//! This module tracks and drives individual file transfers:
//!
//! - [`registry`] - per-transfer state, chunk arenas and progress
//! - [`sender`] - turning a local file into metadata and chunk frames
//! - [`receiver`] - routing inbound frames and reassembling completed files
//!
//! ## Lifecycle
//!
//! ```text
//! pending -> sending | receiving -> complete
//!               \___________________-> error
//! ```
//!
//! Progress is an integer percentage that never decreases while a transfer
//! is active. Transfers are independent: they share one channel and are told
//! apart by their [`TransferId`].

pub mod receiver;
pub mod registry;
pub mod sender;

pub use registry::{ChunkProgress, SharedRegistry, TransferRegistry};
pub use sender::{SendHandle, TransferSender};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::file::ReceivedFile;
use crate::protocol::{TransferId, TransferMetadata};

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Sending a local file
    Outbound,
    /// Receiving a file from the peer
    Inbound,
}

/// Transfer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Queued by a front end before a channel exists.
    ///
    /// The registry never assigns it: outbound records start at `Sending`
    /// and inbound records at `Receiving`. It stays in the wire vocabulary
    /// so view models can show files picked while still disconnected.
    Pending,
    /// Chunks are being emitted
    Sending,
    /// Chunks are being accepted
    Receiving,
    /// Every chunk moved
    Complete,
    /// Failed; see the record's error message
    Error,
}

impl TransferStatus {
    /// Whether the transfer can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome stored on a completed transfer.
#[derive(Debug, Clone)]
pub enum TransferResult {
    /// The file was fully emitted
    Sent,
    /// The file was fully received and reassembled
    Received(ReceivedFile),
}

/// Mutable state of one transfer.
#[derive(Debug)]
pub struct TransferRecord {
    /// Announced metadata
    pub metadata: TransferMetadata,
    /// Direction
    pub direction: TransferDirection,
    /// Current status
    pub status: TransferStatus,
    /// Percentage in `0..=100`
    pub progress: u8,
    /// Failure message when `status` is `Error`
    pub error: Option<String>,
    /// Present only when `status` is `Complete`
    pub result: Option<TransferResult>,
    pub(crate) chunks: Option<registry::ChunkArena>,
    pub(crate) seq: u64,
}

impl TransferRecord {
    fn new(metadata: TransferMetadata, direction: TransferDirection, seq: u64) -> Self {
        let status = match direction {
            TransferDirection::Outbound => TransferStatus::Sending,
            TransferDirection::Inbound => TransferStatus::Receiving,
        };

        Self {
            metadata,
            direction,
            status,
            progress: 0,
            error: None,
            result: None,
            chunks: None,
            seq,
        }
    }

    /// Transfer id.
    #[must_use]
    pub const fn id(&self) -> TransferId {
        self.metadata.id
    }

    /// Whether a chunk arena is currently allocated.
    #[must_use]
    pub const fn has_buffer(&self) -> bool {
        self.chunks.is_some()
    }

    /// Reassembled content, for completed inbound transfers.
    #[must_use]
    pub fn received_file(&self) -> Option<&ReceivedFile> {
        match &self.result {
            Some(TransferResult::Received(file)) => Some(file),
            _ => None,
        }
    }

    /// Snapshot for observers.
    #[must_use]
    pub fn view(&self) -> TransferView {
        TransferView {
            id: self.metadata.id,
            name: self.metadata.name.clone(),
            size: self.metadata.size,
            mime_type: self.metadata.mime_type.clone(),
            last_modified: self.metadata.last_modified,
            direction: self.direction,
            status: self.status,
            progress: self.progress,
            error: self.error.clone(),
            has_result: self.result.is_some(),
        }
    }

    /// Change notification describing the current state.
    #[must_use]
    pub fn update(&self) -> TransferUpdate {
        TransferUpdate {
            id: self.metadata.id,
            direction: self.direction,
            status: self.status,
            progress: self.progress,
            error: self.error.clone(),
        }
    }
}

/// Read-only snapshot of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferView {
    /// Transfer id
    pub id: TransferId,
    /// File name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Source modification time
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_modified: DateTime<Utc>,
    /// Direction
    pub direction: TransferDirection,
    /// Status
    pub status: TransferStatus,
    /// Percentage in `0..=100`
    pub progress: u8,
    /// Failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether a result is available
    pub has_result: bool,
}

/// A status or progress change of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferUpdate {
    /// Transfer id
    pub id: TransferId,
    /// Direction
    pub direction: TransferDirection,
    /// New status
    pub status: TransferStatus,
    /// New progress
    pub progress: u8,
    /// Failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Callback invoked with every transfer update.
pub type UpdateFn = Arc<dyn Fn(&TransferUpdate) + Send + Sync>;

/// Progress after `done` of `total` units, truncated.
#[must_use]
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = done.min(total) * 100 / total;
    #[allow(clippy::cast_possible_truncation)]
    {
        pct as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_truncates() {
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 66);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(0, 7), 0);
        assert_eq!(percent(9, 3), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TransferStatus::Complete.is_terminal());
        assert!(TransferStatus::Error.is_terminal());
        assert!(!TransferStatus::Sending.is_terminal());
        assert!(!TransferStatus::Receiving.is_terminal());
        assert!(!TransferStatus::Pending.is_terminal());
    }

    #[test]
    fn test_update_serializes_lowercase() {
        let update = TransferUpdate {
            id: TransferId::new(),
            direction: TransferDirection::Inbound,
            status: TransferStatus::Receiving,
            progress: 33,
            error: None,
        };
        let json = serde_json::to_value(&update).expect("serialize");
        assert_eq!(json["status"], "receiving");
        assert_eq!(json["direction"], "inbound");
        assert_eq!(json["progress"], 33);
        assert!(json.get("error").is_none());
    }
}
