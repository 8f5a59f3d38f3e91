use std::fmt;

use serde::{Deserialize, Serialize};

/// Sender-assigned identifier correlating every message and storage entry
/// of one logical transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TransferId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TransferId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Handshake payloads
// ---------------------------------------------------------------------------

/// Offers a file to the peer. The receiver answers with accept or reject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub transfer_id: TransferId,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
}

/// Receiver agreed to take the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAccept {
    pub transfer_id: TransferId,
}

/// Receiver declined the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReject {
    pub transfer_id: TransferId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Opens the byte stream. `chunk_size` is fixed for the rest of the transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStart {
    pub transfer_id: TransferId,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
    pub chunk_size: u32,
}

impl FileStart {
    /// Number of chunks the stream is split into, `None` if it does not fit
    /// the `u32` index space.
    pub fn expected_chunks(&self) -> Option<u32> {
        expected_chunks(self.size, self.chunk_size)
    }
}

// ---------------------------------------------------------------------------
// Stream payloads
// ---------------------------------------------------------------------------

/// Metadata record that precedes exactly one binary payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub transfer_id: TransferId,
    pub index: u32,
}

/// Marks the end of a primary pass or of a retry round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEnd {
    pub transfer_id: TransferId,
}

/// Asks the sender to retransmit the listed chunk indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRetryRequest {
    pub transfer_id: TransferId,
    pub chunk_indices: Vec<u32>,
}

/// Either side abandoned the transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCancel {
    pub transfer_id: TransferId,
}

/// Receiver verified and reconstructed the file; the sender may drop its state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReceived {
    pub transfer_id: TransferId,
}

// ---------------------------------------------------------------------------
// Control message
// ---------------------------------------------------------------------------

/// Every structured record exchanged on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    FileRequest(FileRequest),
    FileAccept(FileAccept),
    FileReject(FileReject),
    FileStart(FileStart),
    Chunk(ChunkMeta),
    ChunkRetry(ChunkMeta),
    FileEnd(FileEnd),
    ChunkRetryRequest(ChunkRetryRequest),
    FileCancel(FileCancel),
    FileReceived(FileReceived),
}

impl ControlMessage {
    /// The transfer this message belongs to.
    pub fn transfer_id(&self) -> &TransferId {
        match self {
            ControlMessage::FileRequest(m) => &m.transfer_id,
            ControlMessage::FileAccept(m) => &m.transfer_id,
            ControlMessage::FileReject(m) => &m.transfer_id,
            ControlMessage::FileStart(m) => &m.transfer_id,
            ControlMessage::Chunk(m) | ControlMessage::ChunkRetry(m) => &m.transfer_id,
            ControlMessage::FileEnd(m) => &m.transfer_id,
            ControlMessage::ChunkRetryRequest(m) => &m.transfer_id,
            ControlMessage::FileCancel(m) => &m.transfer_id,
            ControlMessage::FileReceived(m) => &m.transfer_id,
        }
    }

    /// Wire tag, useful for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::FileRequest(_) => "file-request",
            ControlMessage::FileAccept(_) => "file-accept",
            ControlMessage::FileReject(_) => "file-reject",
            ControlMessage::FileStart(_) => "file-start",
            ControlMessage::Chunk(_) => "chunk",
            ControlMessage::ChunkRetry(_) => "chunk-retry",
            ControlMessage::FileEnd(_) => "file-end",
            ControlMessage::ChunkRetryRequest(_) => "chunk-retry-request",
            ControlMessage::FileCancel(_) => "file-cancel",
            ControlMessage::FileReceived(_) => "file-received",
        }
    }

    /// Returns `true` for records that announce a binary payload.
    pub fn expects_payload(&self) -> bool {
        matches!(self, ControlMessage::Chunk(_) | ControlMessage::ChunkRetry(_))
    }
}

/// `ceil(size / chunk_size)`; zero for empty files or a zero chunk size.
/// `None` when the count exceeds `u32::MAX`.
pub fn expected_chunks(size: u64, chunk_size: u32) -> Option<u32> {
    if size == 0 || chunk_size == 0 {
        return Some(0);
    }
    u32::try_from(size.div_ceil(chunk_size as u64)).ok()
}
