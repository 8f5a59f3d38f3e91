//! Keyed chunk storage for in-flight transfers.
//!
//! Two interchangeable backends implement [`ChunkStore`]:
//! - [`MemoryStore`]: an ordered buffer list per transfer.
//! - [`DiskStore`]: one directory per transfer, one file per chunk, plus a
//!   `meta.json` record. Used for large files and memory-constrained devices.
//!
//! Writes are idempotent per `(transfer_id, index)`: writing the same index
//! twice replaces the stored bytes.

mod disk;
mod memory;
mod validation;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use peerdrop_protocol::TransferId;

pub use disk::DiskStore;
pub use memory::MemoryStore;
pub use validation::validate_transfer_id;

/// Errors produced by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("chunk {index} out of range (chunk count {count})")]
    IndexOutOfRange { index: u32, count: u32 },

    #[error("chunk {0} missing")]
    MissingChunk(u32),

    #[error("invalid transfer id: {0}")]
    InvalidTransferId(String),
}

/// Which backend holds a transfer's chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    Disk,
}

/// Metadata record stored alongside the chunks of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub mime_type: String,
    pub chunk_count: u32,
}

/// What a [`ChunkStore::put`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// First write at this index.
    Inserted,
    /// The index already held `previous_len` bytes, now replaced.
    Replaced { previous_len: usize },
}

/// Storage contract shared by every backend.
///
/// `put_metadata` must be called before any chunk write; it fixes the chunk
/// count for the transfer.
#[async_trait]
pub trait ChunkStore: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> BackendKind;

    async fn put_metadata(
        &self,
        transfer_id: &TransferId,
        meta: &TransferMetadata,
    ) -> Result<(), StorageError>;

    async fn metadata(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Option<TransferMetadata>, StorageError>;

    async fn put(
        &self,
        transfer_id: &TransferId,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<PutOutcome, StorageError>;

    async fn get(&self, transfer_id: &TransferId, index: u32)
    -> Result<Option<Vec<u8>>, StorageError>;

    /// Concatenates every chunk in index order.
    ///
    /// Fails with [`StorageError::MissingChunk`] on the first gap.
    async fn get_all(&self, transfer_id: &TransferId) -> Result<Vec<u8>, StorageError>;

    /// Removes metadata and chunks. Deleting an unknown transfer is a no-op.
    async fn delete_all(&self, transfer_id: &TransferId) -> Result<(), StorageError>;
}
