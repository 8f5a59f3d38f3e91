use std::fmt;

use serde::{Deserialize, Serialize};

use peerdrop_protocol::TransferId;

/// Which side of the connection owns a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    AwaitingAccept,
    Transferring,
    AwaitingRetry,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    /// Returns `true` while the transfer still occupies the connection.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::AwaitingAccept | Self::Transferring | Self::AwaitingRetry
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Point-in-time view of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSnapshot {
    pub transfer_id: TransferId,
    pub direction: Direction,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    /// Zero until the chunk size is known.
    pub chunk_size: u32,
    pub expected_chunks: u32,
    /// Distinct chunk indices stored (incoming) or sent (outgoing).
    pub chunks_done: u32,
    pub bytes_done: u64,
    pub status: TransferStatus,
    pub speed_bps: f64,
    pub eta_seconds: Option<f64>,
    pub error: Option<String>,
}

impl TransferSnapshot {
    pub(crate) fn new(
        transfer_id: TransferId,
        direction: Direction,
        file_name: String,
        file_size: u64,
        mime_type: String,
        status: TransferStatus,
    ) -> Self {
        Self {
            transfer_id,
            direction,
            file_name,
            file_size,
            mime_type,
            chunk_size: 0,
            expected_chunks: 0,
            chunks_done: 0,
            bytes_done: 0,
            status,
            speed_bps: 0.0,
            eta_seconds: None,
            error: None,
        }
    }
}

/// A file offered by the peer, waiting for a local accept or reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFileHandle {
    pub transfer_id: TransferId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// A fully received and verified file.
#[derive(Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub data: Vec<u8>,
    /// Hex-encoded SHA-256 of `data`.
    pub sha256: String,
}

impl fmt::Debug for ReceivedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedFile")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .field("sha256", &self.sha256)
            .finish_non_exhaustive()
    }
}

/// Which pass a progress update belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    /// First pass over every chunk.
    Primary,
    /// Retransmission of requested chunks.
    Retry { done: u32, total: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub direction: Direction,
    pub phase: ProgressPhase,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub percent: f64,
    pub speed_bps: f64,
    pub eta_seconds: Option<f64>,
}

/// Notifications delivered to the host UI.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The peer offered a file; nothing is received until it is accepted.
    IncomingRequest(IncomingFileHandle),
    StatusChanged {
        transfer_id: TransferId,
        direction: Direction,
        status: TransferStatus,
    },
    Progress(TransferProgress),
    /// `file` is set on the receiving side only.
    Completed {
        transfer_id: TransferId,
        direction: Direction,
        file: Option<ReceivedFile>,
    },
    Failed {
        transfer_id: TransferId,
        direction: Direction,
        reason: String,
    },
    Cancelled {
        transfer_id: TransferId,
        direction: Direction,
    },
}

impl TransferEvent {
    pub fn transfer_id(&self) -> &TransferId {
        match self {
            Self::IncomingRequest(h) => &h.transfer_id,
            Self::Progress(p) => &p.transfer_id,
            Self::StatusChanged { transfer_id, .. }
            | Self::Completed { transfer_id, .. }
            | Self::Failed { transfer_id, .. }
            | Self::Cancelled { transfer_id, .. } => transfer_id,
        }
    }
}
