//! Incoming transfer state machine.
//!
//! `AwaitingStart -> Receiving <-> AwaitingRetryChunks -> Verifying ->
//! Completed`. Chunk writes run concurrently on a [`JoinSet`], at most
//! `max_inflight_writes` at a time; verification waits for every write to
//! settle before looking for gaps.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use peerdrop_protocol::{
    ChunkRetryRequest, ControlMessage, FileCancel, FileReceived, FileRequest, FileStart, InboundChunk,
    MAX_RETRY_INDICES, TransferId,
};
use peerdrop_storage::{BackendKind, ChunkStore, MemoryStore, StorageError, TransferMetadata};

use crate::channel::Outbound;
use crate::config::TransferConfig;
use crate::policy::select_backend;
use crate::progress::ProgressMeter;
use crate::registry::Reporter;
use crate::types::{ProgressPhase, ReceivedFile, TransferStatus};
use crate::{TransferError, checksum_bytes};

/// Inputs routed to a receiver by the session manager.
#[derive(Debug)]
pub(crate) enum ReceiverInput {
    Start(FileStart),
    Chunk(InboundChunk),
    End,
    PeerCancelled,
    ChannelClosed,
}

/// Backends available to receivers on one connection.
#[derive(Debug, Clone)]
pub(crate) struct Stores {
    pub memory: Arc<MemoryStore>,
    pub disk: Arc<dyn ChunkStore>,
}

/// Which backend holds the latest copy of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Primary,
    /// Primary write failed; the chunk lives in the memory store.
    Fallback,
}

/// What has been stored so far for one transfer.
#[derive(Debug, Default)]
pub(crate) struct ChunkLedger {
    sizes: BTreeMap<u32, u64>,
    received_bytes: u64,
    fallback: BTreeSet<u32>,
}

impl ChunkLedger {
    /// Records a stored chunk. Returns `true` for a first write; a rewrite
    /// replaces the previous size instead of adding to it.
    pub fn record(&mut self, index: u32, len: u64, placement: Placement) -> bool {
        let first = match self.sizes.insert(index, len) {
            Some(previous) => {
                self.received_bytes = self.received_bytes - previous + len;
                false
            }
            None => {
                self.received_bytes += len;
                true
            }
        };
        match placement {
            Placement::Primary => self.fallback.remove(&index),
            Placement::Fallback => self.fallback.insert(index),
        };
        first
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn received_count(&self) -> u32 {
        self.sizes.len() as u32
    }

    /// Indices in `0..expected` not stored yet, ascending.
    pub fn missing(&self, expected: u32) -> Vec<u32> {
        (0..expected).filter(|i| !self.sizes.contains_key(i)).collect()
    }

    pub fn fallback(&self) -> &BTreeSet<u32> {
        &self.fallback
    }
}

fn lock(ledger: &Mutex<ChunkLedger>) -> std::sync::MutexGuard<'_, ChunkLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

struct RetryRound {
    pending: BTreeSet<u32>,
    total: u32,
    received_bytes: u64,
    meter: ProgressMeter,
}

enum Verdict {
    Retry,
    Done(ReceivedFile),
}

pub(crate) struct ReceiverEngine {
    transfer_id: TransferId,
    request: FileRequest,
    out: Outbound,
    config: Arc<TransferConfig>,
    stores: Stores,
    input: mpsc::Receiver<ReceiverInput>,
    cancel: CancellationToken,
    reporter: Reporter,

    start: Option<FileStart>,
    primary: Option<Arc<dyn ChunkStore>>,
    metadata: Option<TransferMetadata>,
    expected: u32,
    ledger: Arc<Mutex<ChunkLedger>>,
    writes: JoinSet<()>,
    meter: Option<ProgressMeter>,

    retry: Option<RetryRound>,
    rounds: u32,
    stalled: u32,
    last_missing: Option<usize>,
}

impl ReceiverEngine {
    pub fn new(
        request: FileRequest,
        out: Outbound,
        config: Arc<TransferConfig>,
        stores: Stores,
        input: mpsc::Receiver<ReceiverInput>,
        cancel: CancellationToken,
        reporter: Reporter,
    ) -> Self {
        Self {
            transfer_id: request.transfer_id.clone(),
            request,
            out,
            config,
            stores,
            input,
            cancel,
            reporter,
            start: None,
            primary: None,
            metadata: None,
            expected: 0,
            ledger: Arc::new(Mutex::new(ChunkLedger::default())),
            writes: JoinSet::new(),
            meter: None,
            retry: None,
            rounds: 0,
            stalled: 0,
            last_missing: None,
        }
    }

    pub async fn run(mut self) {
        self.reporter.status(TransferStatus::Transferring);
        match self.receive().await {
            Ok(file) => {
                info!(
                    transfer_id = %self.transfer_id,
                    size = file.size,
                    sha256 = %file.sha256,
                    retry_rounds = self.rounds,
                    "file received"
                );
                self.reporter.completed(Some(file)).await;
            }
            Err(e) => {
                self.discard().await;
                if matches!(e, TransferError::Cancelled) {
                    info!(transfer_id = %self.transfer_id, "transfer cancelled");
                    self.reporter.cancelled().await;
                } else {
                    error!(transfer_id = %self.transfer_id, error = %e, "receive failed");
                    if !matches!(e, TransferError::ChannelClosed) {
                        self.notify_abort().await;
                    }
                    self.reporter.failed(&e).await;
                }
            }
        }
        self.reporter.release();
    }

    async fn receive(&mut self) -> Result<ReceivedFile, TransferError> {
        let retry_timeout = self.config.retry_timeout();
        let deadline = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(deadline);
        let mut armed = false;

        loop {
            let input = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                input = self.input.recv() => input,
                _ = &mut deadline, if armed => {
                    return Err(TransferError::Timeout("retried chunks"));
                }
            };
            match input {
                Some(ReceiverInput::Start(start)) => self.begin(start).await?,
                Some(ReceiverInput::Chunk(chunk)) => {
                    if self.store_chunk(chunk).await? && armed {
                        if let Some(t) = retry_timeout {
                            deadline.as_mut().reset(Instant::now() + t);
                        }
                    }
                }
                Some(ReceiverInput::End) => match self.verify().await? {
                    Verdict::Done(file) => return Ok(file),
                    Verdict::Retry => {
                        if let Some(t) = retry_timeout {
                            deadline.as_mut().reset(Instant::now() + t);
                            armed = true;
                        }
                    }
                },
                Some(ReceiverInput::PeerCancelled) => return Err(TransferError::Cancelled),
                Some(ReceiverInput::ChannelClosed) | None => {
                    return Err(TransferError::ChannelClosed);
                }
            }
        }
    }

    async fn begin(&mut self, start: FileStart) -> Result<(), TransferError> {
        if self.start.is_some() {
            warn!(transfer_id = %self.transfer_id, "duplicate file-start ignored");
            return Ok(());
        }
        if start.size > 0 && start.chunk_size == 0 {
            return Err(TransferError::Protocol("file-start with zero chunk size".into()));
        }
        if start.size != self.request.size {
            warn!(
                transfer_id = %self.transfer_id,
                offered = self.request.size,
                announced = start.size,
                "file size changed between request and start"
            );
        }

        let Some(expected) = start.expected_chunks() else {
            return Err(TransferError::Protocol(format!(
                "file-start announces {} bytes in {}-byte chunks, more than {} chunks",
                start.size,
                start.chunk_size,
                u32::MAX
            )));
        };
        let metadata = TransferMetadata {
            name: start.name.clone(),
            size: start.size,
            mime_type: start.mime_type.clone(),
            chunk_count: expected,
        };
        let kind = select_backend(
            self.config.device_class,
            start.size,
            self.config.large_file_threshold,
        );
        let mut store: Arc<dyn ChunkStore> = match kind {
            BackendKind::Memory => self.stores.memory.clone(),
            BackendKind::Disk => Arc::clone(&self.stores.disk),
        };
        if let Err(e) = store.put_metadata(&self.transfer_id, &metadata).await {
            if kind == BackendKind::Memory {
                return Err(TransferError::StorageWrite(e));
            }
            warn!(
                transfer_id = %self.transfer_id,
                error = %e,
                "disk store unavailable, receiving into memory"
            );
            store = self.stores.memory.clone();
            store
                .put_metadata(&self.transfer_id, &metadata)
                .await
                .map_err(TransferError::StorageWrite)?;
        }

        info!(
            transfer_id = %self.transfer_id,
            size = start.size,
            chunk_size = start.chunk_size,
            chunks = expected,
            backend = ?store.kind(),
            "receiving file"
        );
        self.reporter.update(|s| {
            s.chunk_size = start.chunk_size;
            s.expected_chunks = expected;
            s.file_size = start.size;
        });
        self.meter = Some(ProgressMeter::new(start.size, &self.config));
        self.expected = expected;
        self.primary = Some(store);
        self.metadata = Some(metadata);
        self.start = Some(start);
        Ok(())
    }

    /// Queues the chunk for storage. Returns `true` when it was one of the
    /// chunks the current retry round is waiting for.
    async fn store_chunk(&mut self, chunk: InboundChunk) -> Result<bool, TransferError> {
        let index = chunk.meta.index;
        let (Some(primary), Some(metadata)) = (self.primary.clone(), self.metadata.clone()) else {
            warn!(transfer_id = %self.transfer_id, index, "chunk before file-start dropped");
            return Ok(false);
        };
        if index >= self.expected {
            warn!(
                transfer_id = %self.transfer_id,
                index,
                expected = self.expected,
                "chunk index out of range dropped"
            );
            return Ok(false);
        }
        trace!(transfer_id = %self.transfer_id, index, retry = chunk.retry, "chunk received");

        self.make_room().await?;
        let len = chunk.payload.len() as u64;
        self.spawn_write(primary, metadata, index, chunk.payload);

        let mut awaited = false;
        match &mut self.retry {
            Some(round) => {
                if round.pending.remove(&index) {
                    awaited = true;
                    round.received_bytes += len;
                    let done = round.total - round.pending.len() as u32;
                    if let Some(sample) = round.meter.record(round.received_bytes) {
                        self.reporter.progress(
                            ProgressPhase::Retry {
                                done,
                                total: round.total,
                            },
                            &sample,
                            done,
                        );
                    }
                }
            }
            None => {
                let (bytes, count) = {
                    let l = lock(&self.ledger);
                    (l.received_bytes(), l.received_count())
                };
                if let Some(sample) = self.meter.as_mut().and_then(|m| m.record(bytes)) {
                    self.reporter.progress(ProgressPhase::Primary, &sample, count);
                }
            }
        }
        Ok(awaited)
    }

    /// Reaps finished writes and waits while the in-flight limit is reached.
    async fn make_room(&mut self) -> Result<(), TransferError> {
        while let Some(res) = self.writes.try_join_next() {
            self.log_write_task(res);
        }
        let limit = self.config.max_inflight_writes.max(1);
        while self.writes.len() >= limit {
            trace!(transfer_id = %self.transfer_id, in_flight = self.writes.len(), "waiting for chunk writes");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                res = self.writes.join_next() => {
                    if let Some(res) = res {
                        self.log_write_task(res);
                    }
                }
            }
        }
        Ok(())
    }

    fn log_write_task(&self, res: Result<(), tokio::task::JoinError>) {
        if let Err(e) = res {
            error!(transfer_id = %self.transfer_id, error = %e, "chunk write task failed");
        }
    }

    fn spawn_write(
        &mut self,
        primary: Arc<dyn ChunkStore>,
        metadata: TransferMetadata,
        index: u32,
        payload: Vec<u8>,
    ) {
        let ledger = Arc::clone(&self.ledger);
        let memory = Arc::clone(&self.stores.memory);
        let id = self.transfer_id.clone();

        self.writes.spawn(async move {
            let len = payload.len() as u64;
            let backup = (primary.kind() != BackendKind::Memory).then(|| payload.clone());
            let placement = match primary.put(&id, index, payload).await {
                Ok(_) => Some(Placement::Primary),
                Err(e) => match backup {
                    Some(bytes) => {
                        warn!(transfer_id = %id, index, error = %e, "chunk write failed, keeping it in memory");
                        match write_fallback(&memory, &id, &metadata, index, bytes).await {
                            Ok(()) => Some(Placement::Fallback),
                            Err(e) => {
                                error!(transfer_id = %id, index, error = %e, "fallback write failed");
                                None
                            }
                        }
                    }
                    None => {
                        error!(transfer_id = %id, index, error = %e, "chunk write failed");
                        None
                    }
                },
            };
            if let Some(placement) = placement {
                lock(&ledger).record(index, len, placement);
            }
        });
    }

    /// Waits for every in-flight write.
    async fn settle(&mut self) {
        while let Some(res) = self.writes.join_next().await {
            self.log_write_task(res);
        }
    }

    async fn verify(&mut self) -> Result<Verdict, TransferError> {
        self.settle().await;
        let Some(size) = self.start.as_ref().map(|s| s.size) else {
            return Err(TransferError::Protocol("file-end before file-start".into()));
        };

        let (missing, received_bytes, count) = {
            let l = lock(&self.ledger);
            (l.missing(self.expected), l.received_bytes(), l.received_count())
        };
        self.reporter.update(|s| {
            s.chunks_done = count;
            s.bytes_done = s.bytes_done.max(received_bytes);
        });
        debug!(
            transfer_id = %self.transfer_id,
            received = count,
            expected = self.expected,
            missing = missing.len(),
            "verifying"
        );

        if !missing.is_empty() {
            return self.request_retry(missing).await;
        }

        if received_bytes.abs_diff(size) > self.config.size_tolerance_bytes {
            return Err(TransferError::SizeMismatch {
                expected: size,
                received: received_bytes,
            });
        }

        let data = self.reconstruct(size).await?;
        self.finish(data).await.map(Verdict::Done)
    }

    async fn request_retry(&mut self, missing: Vec<u32>) -> Result<Verdict, TransferError> {
        let progressed = self.last_missing.is_none_or(|prev| missing.len() < prev);
        if progressed {
            self.stalled = 0;
        } else {
            self.stalled += 1;
        }
        self.last_missing = Some(missing.len());
        if self.stalled >= self.config.max_retry_rounds {
            return Err(TransferError::ChunkMissing {
                missing: missing.len(),
                rounds: self.rounds,
            });
        }

        self.rounds += 1;
        let batch: Vec<u32> = missing.iter().copied().take(MAX_RETRY_INDICES).collect();
        info!(
            transfer_id = %self.transfer_id,
            round = self.rounds,
            missing = missing.len(),
            requested = batch.len(),
            "requesting missing chunks"
        );
        self.out
            .control(&ControlMessage::ChunkRetryRequest(ChunkRetryRequest {
                transfer_id: self.transfer_id.clone(),
                chunk_indices: batch.clone(),
            }))
            .await?;

        let retry_bytes = batch.iter().map(|&i| self.chunk_len(i)).sum();
        self.retry = Some(RetryRound {
            total: batch.len() as u32,
            pending: batch.into_iter().collect(),
            received_bytes: 0,
            meter: ProgressMeter::new(retry_bytes, &self.config),
        });
        self.reporter.status(TransferStatus::AwaitingRetry);
        Ok(Verdict::Retry)
    }

    fn chunk_len(&self, index: u32) -> u64 {
        let chunk_size = self.start.as_ref().map_or(0, |s| s.chunk_size as u64);
        let size = self.start.as_ref().map_or(0, |s| s.size);
        size.saturating_sub(index as u64 * chunk_size).min(chunk_size)
    }

    /// Concatenates the chunks in index order and checks the length.
    ///
    /// The primary store is read first. If that fails and the memory store
    /// holds copies of chunks whose primary write failed, reassembly is
    /// attempted once more, taking those chunks from memory.
    async fn reconstruct(&self, size: u64) -> Result<Vec<u8>, TransferError> {
        let primary = self
            .primary
            .clone()
            .ok_or_else(|| TransferError::Protocol("no storage for transfer".into()))?;

        let reason = match primary.get_all(&self.transfer_id).await {
            Ok(data) if data.len() as u64 == size => return Ok(data),
            Ok(data) => format!("reassembled {} bytes, expected {size}", data.len()),
            Err(e) => e.to_string(),
        };

        let has_memory_copy = primary.kind() != BackendKind::Memory
            && matches!(self.stores.memory.metadata(&self.transfer_id).await, Ok(Some(_)));
        if !has_memory_copy {
            return Err(TransferError::Reconstruction(reason));
        }

        let fallback = lock(&self.ledger).fallback().clone();
        warn!(
            transfer_id = %self.transfer_id,
            reason = %reason,
            in_memory = fallback.len(),
            "primary reassembly failed, retrying with in-memory copy"
        );
        match self.assemble(&primary, |i| fallback.contains(&i)).await {
            Ok(data) if data.len() as u64 == size => Ok(data),
            Ok(data) => Err(TransferError::Reconstruction(format!(
                "{reason}; with in-memory copy got {} bytes",
                data.len()
            ))),
            Err(e) => Err(TransferError::Reconstruction(format!("{reason}; {e}"))),
        }
    }

    /// Reads every index, trying the memory store first where
    /// `memory_first` says so and the other backend otherwise.
    async fn assemble(
        &self,
        primary: &Arc<dyn ChunkStore>,
        memory_first: impl Fn(u32) -> bool,
    ) -> Result<Vec<u8>, StorageError> {
        let memory: &dyn ChunkStore = self.stores.memory.as_ref();
        let mut out = Vec::new();
        for index in 0..self.expected {
            let (first, second) = if memory_first(index) {
                (memory, primary.as_ref())
            } else {
                (primary.as_ref(), memory)
            };
            let bytes = match first.get(&self.transfer_id, index).await? {
                Some(b) => b,
                None => second
                    .get(&self.transfer_id, index)
                    .await?
                    .ok_or(StorageError::MissingChunk(index))?,
            };
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    async fn finish(&mut self, data: Vec<u8>) -> Result<ReceivedFile, TransferError> {
        let sha256 = checksum_bytes(&data);
        self.delete_storage().await;

        if let Err(e) = self
            .out
            .control(&ControlMessage::FileReceived(FileReceived {
                transfer_id: self.transfer_id.clone(),
            }))
            .await
        {
            debug!(transfer_id = %self.transfer_id, error = %e, "could not confirm receipt");
        }

        if let Some(sample) = self.meter.as_mut().and_then(ProgressMeter::finish) {
            self.reporter
                .progress(ProgressPhase::Primary, &sample, self.expected);
        }

        let start = self.start.as_ref();
        Ok(ReceivedFile {
            name: start.map_or_else(|| self.request.name.clone(), |s| s.name.clone()),
            mime_type: start.map_or_else(|| self.request.mime_type.clone(), |s| s.mime_type.clone()),
            size: data.len() as u64,
            data,
            sha256,
        })
    }

    /// Tells the sender to stop serving this transfer.
    async fn notify_abort(&self) {
        let notice = ControlMessage::FileCancel(FileCancel {
            transfer_id: self.transfer_id.clone(),
        });
        if let Err(e) = self.out.control(&notice).await {
            debug!(transfer_id = %self.transfer_id, error = %e, "could not notify sender");
        }
    }

    /// Waits for in-flight writes to land, then deletes partial storage.
    async fn discard(&mut self) {
        self.settle().await;
        self.delete_storage().await;
        debug!(transfer_id = %self.transfer_id, "partial storage discarded");
    }

    async fn delete_storage(&self) {
        if let Some(primary) = &self.primary {
            if let Err(e) = primary.delete_all(&self.transfer_id).await {
                warn!(transfer_id = %self.transfer_id, error = %e, "failed to delete stored chunks");
            }
        }
        if let Err(e) = self.stores.memory.delete_all(&self.transfer_id).await {
            warn!(transfer_id = %self.transfer_id, error = %e, "failed to delete fallback chunks");
        }
    }
}

async fn write_fallback(
    memory: &MemoryStore,
    id: &TransferId,
    metadata: &TransferMetadata,
    index: u32,
    bytes: Vec<u8>,
) -> Result<(), StorageError> {
    if memory.metadata(id).await?.is_none() {
        memory.put_metadata(id, metadata).await?;
    }
    memory.put(id, index, bytes).await?;
    Ok(())
}
