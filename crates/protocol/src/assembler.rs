//! Pairs chunk records with the binary payload that follows them.

use crate::codec::Frame;
use crate::messages::{ChunkMeta, ControlMessage};

/// A chunk record joined with its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundChunk {
    pub meta: ChunkMeta,
    /// `true` when it arrived as `chunk-retry`.
    pub retry: bool,
    pub payload: Vec<u8>,
}

/// Result of feeding one frame into the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    /// A control record that carries no payload.
    Control(ControlMessage),
    /// A complete chunk.
    Chunk(InboundChunk),
    /// A chunk record was stored; its payload is expected next.
    AwaitingPayload,
    /// A binary message arrived with no pending record.
    OrphanPayload { len: usize },
    /// A record was replaced before its payload arrived. The new frame was
    /// still processed; the superseded record is returned for logging.
    Superseded { lost: ChunkMeta, next: Box<Assembled> },
}

/// Stateful pairing of `chunk`/`chunk-retry` records with payloads.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    pending: Option<(ChunkMeta, bool)>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a decoded frame.
    pub fn push(&mut self, frame: Frame) -> Assembled {
        match frame {
            Frame::Control(msg) => {
                let lost = self.pending.take().map(|(meta, _)| meta);
                let next = match msg {
                    ControlMessage::Chunk(meta) => {
                        self.pending = Some((meta, false));
                        Assembled::AwaitingPayload
                    }
                    ControlMessage::ChunkRetry(meta) => {
                        self.pending = Some((meta, true));
                        Assembled::AwaitingPayload
                    }
                    other => Assembled::Control(other),
                };
                match lost {
                    Some(lost) => Assembled::Superseded {
                        lost,
                        next: Box::new(next),
                    },
                    None => next,
                }
            }
            Frame::Payload(payload) => match self.pending.take() {
                Some((meta, retry)) => Assembled::Chunk(InboundChunk {
                    meta,
                    retry,
                    payload,
                }),
                None => Assembled::OrphanPayload { len: payload.len() },
            },
        }
    }

    /// Returns `true` while a record is waiting for its payload.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drops any half-received chunk (e.g. after the channel closed).
    pub fn reset(&mut self) {
        self.pending = None;
    }
}
