//! Resumable chunked file transfer between two peers.
//!
//! A [`SessionManager`] owns every transfer on one connection. Outgoing files
//! are offered, streamed in fixed-size chunks under send-buffer flow control,
//! and kept available for a grace window so the receiver can ask for chunks
//! it is missing. Incoming files are stored chunk by chunk in a
//! [`ChunkStore`](peerdrop_storage::ChunkStore), checked for gaps, and
//! reassembled once complete.

pub mod channel;
pub mod config;
mod error;
pub mod policy;
mod progress;
mod receiver;
mod registry;
mod sender;
mod session;
mod source;
mod types;

#[cfg(test)]
mod scenarios;

use sha2::{Digest, Sha256};

pub use channel::{ChannelError, DataChannel, MemoryChannel, ReadyState};
pub use config::{ChunkSizeTable, ConfigError, DeviceClass, TransferConfig};
pub use error::TransferError;
pub use progress::{ProgressMeter, ProgressSample, ProgressThrottle, SpeedCalculator};
pub use session::SessionManager;
pub use source::{ChunkReader, OutgoingFile};
pub use types::{
    Direction, IncomingFileHandle, ProgressPhase, ReceivedFile, TransferEvent, TransferProgress,
    TransferSnapshot, TransferStatus,
};

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
