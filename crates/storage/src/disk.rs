//! Persistent chunk store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<transfer_id>/meta.json
//! <root>/<transfer_id>/00000000.chunk
//! <root>/<transfer_id>/00000001.chunk
//! ```
//!
//! Chunk writes go to a uniquely named `.tmp` sibling first and are renamed
//! into place, so a rewritten index is replaced atomically and concurrent
//! writers never share a temp file.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error};
use uuid::Uuid;

use peerdrop_protocol::TransferId;

use crate::{
    BackendKind, ChunkStore, PutOutcome, StorageError, TransferMetadata, validate_transfer_id,
};

const META_FILE: &str = "meta.json";

/// Stores chunks as individual files under a root directory.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    /// Metadata cache, filled on `put_metadata` or first read.
    meta: RwLock<HashMap<TransferId, TransferMetadata>>,
}

impl DiskStore {
    /// Creates a store rooted at `root`. Directories are created lazily.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            meta: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn transfer_dir(&self, transfer_id: &TransferId) -> Result<PathBuf, StorageError> {
        validate_transfer_id(transfer_id.as_str())?;
        Ok(self.root.join(transfer_id.as_str()))
    }

    fn chunk_path(dir: &Path, index: u32) -> PathBuf {
        dir.join(format!("{index:08}.chunk"))
    }

    async fn cached_meta(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Option<TransferMetadata>, StorageError> {
        if let Some(m) = self.meta.read().await.get(transfer_id) {
            return Ok(Some(m.clone()));
        }
        let dir = self.transfer_dir(transfer_id)?;
        let data = match tokio::fs::read(dir.join(META_FILE)).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let parsed: TransferMetadata = serde_json::from_slice(&data)?;
        self.meta
            .write()
            .await
            .insert(transfer_id.clone(), parsed.clone());
        Ok(Some(parsed))
    }

    async fn require_meta(
        &self,
        transfer_id: &TransferId,
    ) -> Result<TransferMetadata, StorageError> {
        self.cached_meta(transfer_id)
            .await?
            .ok_or_else(|| StorageError::UnknownTransfer(transfer_id.to_string()))
    }
}

/// Writes `content` to `path` via a temporary file and rename.
///
/// Last rename wins when several writes target the same path.
async fn atomic_write(path: &Path, content: &[u8]) -> Result<(), StorageError> {
    let tmp_path = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp_path, content).await.map_err(|e| {
        error!(path = %tmp_path.display(), error = %e, "failed to write temp file");
        e
    })?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        error!(
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "failed to rename temp file"
        );
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl ChunkStore for DiskStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Disk
    }

    async fn put_metadata(
        &self,
        transfer_id: &TransferId,
        meta: &TransferMetadata,
    ) -> Result<(), StorageError> {
        let dir = self.transfer_dir(transfer_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(meta)?;
        atomic_write(&dir.join(META_FILE), &json).await?;
        self.meta
            .write()
            .await
            .insert(transfer_id.clone(), meta.clone());
        debug!(transfer_id = %transfer_id, dir = %dir.display(), "disk store opened");
        Ok(())
    }

    async fn metadata(
        &self,
        transfer_id: &TransferId,
    ) -> Result<Option<TransferMetadata>, StorageError> {
        self.cached_meta(transfer_id).await
    }

    async fn put(
        &self,
        transfer_id: &TransferId,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<PutOutcome, StorageError> {
        let meta = self.require_meta(transfer_id).await?;
        if index >= meta.chunk_count {
            return Err(StorageError::IndexOutOfRange {
                index,
                count: meta.chunk_count,
            });
        }
        let path = Self::chunk_path(&self.transfer_dir(transfer_id)?, index);
        let outcome = match tokio::fs::metadata(&path).await {
            Ok(m) => PutOutcome::Replaced {
                previous_len: m.len() as usize,
            },
            Err(e) if e.kind() == ErrorKind::NotFound => PutOutcome::Inserted,
            Err(e) => return Err(e.into()),
        };
        atomic_write(&path, &bytes).await?;
        Ok(outcome)
    }

    async fn get(
        &self,
        transfer_id: &TransferId,
        index: u32,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let path = Self::chunk_path(&self.transfer_dir(transfer_id)?, index);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_all(&self, transfer_id: &TransferId) -> Result<Vec<u8>, StorageError> {
        let meta = self.require_meta(transfer_id).await?;
        let dir = self.transfer_dir(transfer_id)?;
        let mut out = Vec::with_capacity(meta.size as usize);
        for index in 0..meta.chunk_count {
            match tokio::fs::read(Self::chunk_path(&dir, index)).await {
                Ok(data) => out.extend_from_slice(&data),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StorageError::MissingChunk(index));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    async fn delete_all(&self, transfer_id: &TransferId) -> Result<(), StorageError> {
        let dir = self.transfer_dir(transfer_id)?;
        self.meta.write().await.remove(transfer_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(transfer_id = %transfer_id, "disk store removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
