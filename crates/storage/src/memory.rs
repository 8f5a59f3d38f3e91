use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use peerdrop_protocol::TransferId;

use crate::{BackendKind, ChunkStore, PutOutcome, StorageError, TransferMetadata};

#[derive(Debug)]
struct Entry {
    meta: TransferMetadata,
    /// Slot `i` holds chunk `i`.
    chunks: Vec<Option<Vec<u8>>>,
}

/// Keeps every chunk in RAM, one buffer per index.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<TransferId, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transfers currently held.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn put_metadata(
        &self,
        transfer_id: &TransferId,
        meta: &TransferMetadata,
    ) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        let count = meta.chunk_count as usize;
        let entry = entries.entry(transfer_id.clone()).or_insert_with(|| Entry {
            meta: meta.clone(),
            chunks: Vec::new(),
        });
        entry.meta = meta.clone();
        entry.chunks.resize_with(count, || None);
        Ok(())
    }

    async fn metadata(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Option<TransferMetadata>, StorageError> {
        let entries = self.entries.read().await;
        Ok(entries.get(transfer_id).map(|e| e.meta.clone()))
    }

    async fn put(
        &self,
        transfer_id: &TransferId,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<PutOutcome, StorageError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(transfer_id)
            .ok_or_else(|| StorageError::UnknownTransfer(transfer_id.to_string()))?;
        let count = entry.meta.chunk_count;
        let slot = entry
            .chunks
            .get_mut(index as usize)
            .ok_or(StorageError::IndexOutOfRange { index, count })?;
        let outcome = match slot.replace(bytes) {
            Some(previous) => PutOutcome::Replaced {
                previous_len: previous.len(),
            },
            None => PutOutcome::Inserted,
        };
        Ok(outcome)
    }

    async fn get(
        &self,
        transfer_id: &TransferId,
        index: u32,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(transfer_id)
            .and_then(|e| e.chunks.get(index as usize))
            .and_then(|slot| slot.clone()))
    }

    async fn get_all(&self, transfer_id: &TransferId) -> Result<Vec<u8>, StorageError> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(transfer_id)
            .ok_or_else(|| StorageError::UnknownTransfer(transfer_id.to_string()))?;
        let mut out = Vec::with_capacity(entry.meta.size as usize);
        for (i, slot) in entry.chunks.iter().enumerate() {
            match slot {
                Some(bytes) => out.extend_from_slice(bytes),
                None => return Err(StorageError::MissingChunk(i as u32)),
            }
        }
        Ok(out)
    }

    async fn delete_all(&self, transfer_id: &TransferId) -> Result<(), StorageError> {
        self.entries.write().await.remove(transfer_id);
        Ok(())
    }
}
