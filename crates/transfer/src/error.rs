use peerdrop_protocol::{CodecError, TransferId};
use peerdrop_storage::StorageError;

use crate::channel::ChannelError;

/// Errors produced by the transfer engines and the session manager.
///
/// Engines never return these past their task; a failed transfer surfaces as
/// [`TransferEvent::Failed`](crate::TransferEvent::Failed) carrying the
/// rendered message.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("an outgoing transfer is already in progress: {0}")]
    TransferInProgress(TransferId),

    #[error("data channel is not open")]
    ChannelNotOpen,

    #[error("peer rejected the transfer{}", .0.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    PeerRejected(Option<String>),

    #[error("size mismatch: expected {expected} bytes, received {received}")]
    SizeMismatch { expected: u64, received: u64 },

    #[error("{missing} chunks still missing after {rounds} retry rounds")]
    ChunkMissing { missing: usize, rounds: u32 },

    #[error("reconstruction failed: {0}")]
    Reconstruction(String),

    #[error("storage write failed: {0}")]
    StorageWrite(#[source] StorageError),

    #[error("data channel closed")]
    ChannelClosed,

    #[error("transfer cancelled")]
    Cancelled,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("unknown transfer: {0}")]
    UnknownTransfer(TransferId),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("failed to read source file: {0}")]
    Source(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<ChannelError> for TransferError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::NotOpen(_) => Self::ChannelNotOpen,
            ChannelError::Closed => Self::ChannelClosed,
        }
    }
}
