//! Wire protocol for PeerDrop chunked transfers.
//!
//! Control records travel as JSON text messages; chunk bytes travel as the
//! binary message immediately after their record.

pub mod assembler;
pub mod codec;
pub mod messages;

pub use assembler::{Assembled, FrameAssembler, InboundChunk};
pub use codec::{
    CodecError, Frame, MAX_CONTROL_MESSAGE_LEN, WireMessage, decode, encode_control, encode_payload,
};
pub use messages::{
    ChunkMeta, ChunkRetryRequest, ControlMessage, FileAccept, FileCancel, FileEnd, FileReceived,
    FileReject, FileRequest, FileStart, TransferId, expected_chunks,
};

/// Most indices a single `chunk-retry-request` may list.
///
/// Keeps the record well under [`MAX_CONTROL_MESSAGE_LEN`]; larger gaps are
/// requested over several rounds.
pub const MAX_RETRY_INDICES: usize = 4096;
