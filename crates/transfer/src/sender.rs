//! Outgoing transfer state machine.
//!
//! `Requesting -> AwaitingAccept -> Transferring -> Completed`, then a grace
//! window in which late retry requests are still served from the source.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use peerdrop_protocol::{
    ChunkMeta, ControlMessage, FileEnd, FileRequest, FileStart, TransferId, expected_chunks,
};

use crate::channel::Outbound;
use crate::config::TransferConfig;
use crate::policy::chunk_size_for;
use crate::progress::ProgressMeter;
use crate::registry::Reporter;
use crate::source::{ChunkReader, OutgoingFile};
use crate::types::{ProgressPhase, TransferStatus};
use crate::TransferError;

/// Inputs routed to a sender by the session manager.
#[derive(Debug, Clone)]
pub(crate) enum SenderInput {
    Accepted,
    Rejected(Option<String>),
    RetryRequested(Vec<u32>),
    /// Receiver confirmed the file.
    Received,
    PeerCancelled,
    ChannelClosed,
}

pub(crate) struct SenderEngine {
    transfer_id: TransferId,
    file: OutgoingFile,
    chunk_size: u32,
    expected: u32,
    out: Outbound,
    config: Arc<TransferConfig>,
    input: mpsc::Receiver<SenderInput>,
    cancel: CancellationToken,
    reporter: Reporter,
    reader: Option<ChunkReader>,
}

impl SenderEngine {
    pub fn new(
        file: OutgoingFile,
        out: Outbound,
        config: Arc<TransferConfig>,
        input: mpsc::Receiver<SenderInput>,
        cancel: CancellationToken,
        reporter: Reporter,
    ) -> Self {
        let chunk_size = chunk_size_for(config.device_class, file.size(), &config.chunk_sizes);
        Self {
            transfer_id: reporter.transfer_id().clone(),
            expected: expected_chunks(file.size(), chunk_size).unwrap_or(u32::MAX),
            file,
            chunk_size,
            out,
            config,
            input,
            cancel,
            reporter,
            reader: None,
        }
    }

    /// Drives the transfer to a terminal state, then serves the grace window.
    pub async fn run(mut self) {
        match self.transfer().await {
            Ok(()) => {
                info!(
                    transfer_id = %self.transfer_id,
                    chunks = self.expected,
                    "transfer sent"
                );
                self.reporter.completed(None).await;
                self.grace().await;
            }
            Err(TransferError::Cancelled) => {
                info!(transfer_id = %self.transfer_id, "transfer cancelled");
                self.reporter.cancelled().await;
            }
            Err(e) => {
                error!(transfer_id = %self.transfer_id, error = %e, "transfer failed");
                self.reporter.failed(&e).await;
            }
        }
        self.reporter.release();
    }

    async fn transfer(&mut self) -> Result<(), TransferError> {
        if expected_chunks(self.file.size(), self.chunk_size).is_none() {
            return Err(TransferError::Protocol(format!(
                "{} bytes in {}-byte chunks exceeds the chunk index space",
                self.file.size(),
                self.chunk_size
            )));
        }
        self.out
            .control(&ControlMessage::FileRequest(FileRequest {
                transfer_id: self.transfer_id.clone(),
                name: self.file.name().to_string(),
                size: self.file.size(),
                mime_type: self.file.mime_type().to_string(),
            }))
            .await?;
        self.reporter.status(TransferStatus::AwaitingAccept);
        debug!(transfer_id = %self.transfer_id, "awaiting peer acceptance");

        self.await_accept().await?;

        self.reporter.update(|s| {
            s.chunk_size = self.chunk_size;
            s.expected_chunks = self.expected;
        });
        self.reporter.status(TransferStatus::Transferring);
        self.out
            .channel()
            .set_buffered_amount_low_threshold(self.config.low_watermark);
        self.out
            .control(&ControlMessage::FileStart(FileStart {
                transfer_id: self.transfer_id.clone(),
                name: self.file.name().to_string(),
                size: self.file.size(),
                mime_type: self.file.mime_type().to_string(),
                chunk_size: self.chunk_size,
            }))
            .await?;
        info!(
            transfer_id = %self.transfer_id,
            size = self.file.size(),
            chunk_size = self.chunk_size,
            chunks = self.expected,
            "sending file"
        );

        self.send_chunks().await?;
        self.send_end().await
    }

    async fn await_accept(&mut self) -> Result<(), TransferError> {
        let timeout = self.config.accept_timeout();
        let deadline = tokio::time::sleep(timeout.unwrap_or_default());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                input = self.input.recv() => match input {
                    Some(SenderInput::Accepted) => return Ok(()),
                    Some(SenderInput::Rejected(reason)) => {
                        info!(transfer_id = %self.transfer_id, ?reason, "peer rejected transfer");
                        return Err(TransferError::PeerRejected(reason));
                    }
                    Some(SenderInput::PeerCancelled) => return Err(TransferError::Cancelled),
                    Some(SenderInput::ChannelClosed) | None => {
                        return Err(TransferError::ChannelClosed);
                    }
                    Some(other) => {
                        warn!(transfer_id = %self.transfer_id, ?other, "ignoring input before acceptance");
                    }
                },
                _ = &mut deadline, if timeout.is_some() => {
                    return Err(TransferError::Timeout("peer acceptance"));
                }
            }
        }
    }

    async fn send_chunks(&mut self) -> Result<(), TransferError> {
        let mut meter = ProgressMeter::new(self.file.size(), &self.config);
        let mut sent: u64 = 0;

        for index in 0..self.expected {
            self.poll_interrupts()?;
            self.wait_for_drain().await?;

            let payload = self.read(index).await?;
            sent += payload.len() as u64;
            let meta = ControlMessage::Chunk(ChunkMeta {
                transfer_id: self.transfer_id.clone(),
                index,
            });
            self.out.chunk(&meta, payload).await?;
            trace!(transfer_id = %self.transfer_id, index, "chunk sent");

            if let Some(sample) = meter.record(sent) {
                self.reporter.progress(ProgressPhase::Primary, &sample, index + 1);
            }
        }
        if let Some(sample) = meter.finish() {
            self.reporter
                .progress(ProgressPhase::Primary, &sample, self.expected);
        }
        Ok(())
    }

    async fn send_end(&self) -> Result<(), TransferError> {
        self.out
            .control(&ControlMessage::FileEnd(FileEnd {
                transfer_id: self.transfer_id.clone(),
            }))
            .await
    }

    /// Checks for cancellation or peer signals without waiting.
    fn poll_interrupts(&mut self) -> Result<(), TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        while let Ok(input) = self.input.try_recv() {
            self.interrupt(input)?;
        }
        Ok(())
    }

    fn interrupt(&self, input: SenderInput) -> Result<(), TransferError> {
        match input {
            SenderInput::PeerCancelled => Err(TransferError::Cancelled),
            SenderInput::ChannelClosed => Err(TransferError::ChannelClosed),
            other => {
                warn!(transfer_id = %self.transfer_id, ?other, "ignoring input while sending");
                Ok(())
            }
        }
    }

    /// Pauses while the channel buffers more than the high watermark.
    async fn wait_for_drain(&mut self) -> Result<(), TransferError> {
        let channel = Arc::clone(self.out.channel());
        let buffered = channel.buffered_amount();
        if buffered <= self.config.high_watermark {
            return Ok(());
        }
        trace!(transfer_id = %self.transfer_id, buffered, "waiting for channel to drain");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                input = self.input.recv() => match input {
                    Some(input) => self.interrupt(input)?,
                    None => return Err(TransferError::ChannelClosed),
                },
                _ = channel.buffered_amount_low() => break,
            }
        }
        if !self.out.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        Ok(())
    }

    fn chunk_len(&self, index: u32) -> u64 {
        let start = index as u64 * self.chunk_size as u64;
        self.file.size().saturating_sub(start).min(self.chunk_size as u64)
    }

    async fn read(&mut self, index: u32) -> Result<Vec<u8>, TransferError> {
        let reader = match self.reader.take() {
            Some(r) => r,
            None => self.file.reader(self.chunk_size).await?,
        };
        Ok(self.reader.insert(reader).read(index).await?)
    }

    /// Keeps answering retry requests until the receiver confirms, the
    /// window lapses, or the connection goes away.
    async fn grace(&mut self) {
        let window = self.config.sender_grace_period();
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                input = self.input.recv() => match input {
                    Some(SenderInput::RetryRequested(indices)) => {
                        if let Err(e) = self.serve_retry(indices).await {
                            warn!(transfer_id = %self.transfer_id, error = %e, "retry round aborted");
                            break;
                        }
                        deadline.as_mut().reset(Instant::now() + window);
                    }
                    Some(SenderInput::Received) => {
                        debug!(transfer_id = %self.transfer_id, "receiver confirmed file");
                        break;
                    }
                    Some(SenderInput::PeerCancelled | SenderInput::ChannelClosed) | None => break,
                    Some(SenderInput::Accepted | SenderInput::Rejected(_)) => {}
                },
                _ = &mut deadline => {
                    debug!(transfer_id = %self.transfer_id, "grace period elapsed");
                    break;
                }
            }
        }
    }

    async fn serve_retry(&mut self, indices: Vec<u32>) -> Result<(), TransferError> {
        let indices: BTreeSet<u32> = indices.into_iter().filter(|&i| i < self.expected).collect();
        let total = indices.len() as u32;
        info!(transfer_id = %self.transfer_id, chunks = total, "resending requested chunks");

        let retry_bytes: u64 = indices.iter().map(|&i| self.chunk_len(i)).sum();
        let mut meter = ProgressMeter::new(retry_bytes, &self.config);
        let mut resent: u64 = 0;
        for (n, index) in indices.into_iter().enumerate() {
            if n > 0 {
                tokio::time::sleep(self.config.retry_pacing()).await;
            }
            self.poll_interrupts()?;
            self.wait_for_drain().await?;

            let payload = self.read(index).await?;
            resent += payload.len() as u64;
            let meta = ControlMessage::ChunkRetry(ChunkMeta {
                transfer_id: self.transfer_id.clone(),
                index,
            });
            self.out.chunk(&meta, payload).await?;
            trace!(transfer_id = %self.transfer_id, index, "chunk resent");

            let done = n as u32 + 1;
            if let Some(sample) = meter.record(resent) {
                self.reporter
                    .progress(ProgressPhase::Retry { done, total }, &sample, done);
            }
        }
        self.send_end().await
    }
}
