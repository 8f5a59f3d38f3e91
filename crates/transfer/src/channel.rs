//! Transport seam.
//!
//! The engines talk to an already-connected, ordered, reliable,
//! message-oriented channel through [`DataChannel`]. [`MemoryChannel`] is an
//! in-process implementation used by tests and the loopback demo.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use peerdrop_protocol::{ControlMessage, WireMessage, encode_control, encode_payload};

use crate::TransferError;

/// Connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Errors reported by a [`DataChannel`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel not open ({0:?})")]
    NotOpen(ReadyState),

    #[error("channel closed")]
    Closed,
}

/// A connected two-party message channel with send-buffer accounting.
#[async_trait]
pub trait DataChannel: Send + Sync + fmt::Debug {
    /// Queues one message. Never waits for the peer.
    async fn send(&self, message: WireMessage) -> Result<(), ChannelError>;

    fn ready_state(&self) -> ReadyState;

    /// Bytes queued locally and not yet handed to the peer.
    fn buffered_amount(&self) -> usize;

    fn set_buffered_amount_low_threshold(&self, threshold: usize);

    /// Resolves once the buffered amount is at or below the low threshold,
    /// or the channel is no longer open.
    async fn buffered_amount_low(&self);
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Serialised writer shared by every engine on one connection.
///
/// A chunk record and its payload are sent under one lock so no other
/// message can slip between them.
#[derive(Debug, Clone)]
pub struct Outbound {
    channel: Arc<dyn DataChannel>,
    lock: Arc<Mutex<()>>,
}

impl Outbound {
    pub fn new(channel: Arc<dyn DataChannel>) -> Self {
        Self {
            channel,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn channel(&self) -> &Arc<dyn DataChannel> {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.channel.ready_state() == ReadyState::Open
    }

    pub async fn control(&self, msg: &ControlMessage) -> Result<(), TransferError> {
        let wire = encode_control(msg)?;
        let _guard = self.lock.lock().await;
        self.ensure_open()?;
        trace!(kind = msg.kind(), transfer_id = %msg.transfer_id(), "sending control");
        self.channel.send(wire).await?;
        Ok(())
    }

    /// Sends a `chunk` or `chunk-retry` record followed by its payload.
    pub async fn chunk(&self, meta: &ControlMessage, payload: Vec<u8>) -> Result<(), TransferError> {
        debug_assert!(meta.expects_payload());
        let wire = encode_control(meta)?;
        let _guard = self.lock.lock().await;
        self.ensure_open()?;
        self.channel.send(wire).await?;
        self.channel.send(encode_payload(payload)).await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), TransferError> {
        match self.channel.ready_state() {
            ReadyState::Open => Ok(()),
            ReadyState::Connecting => Err(TransferError::ChannelNotOpen),
            ReadyState::Closing | ReadyState::Closed => Err(TransferError::ChannelClosed),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SendBuffer {
    amount: AtomicUsize,
    low_threshold: AtomicUsize,
    low: Notify,
}

impl SendBuffer {
    fn is_low(&self) -> bool {
        self.amount.load(Ordering::Acquire) <= self.low_threshold.load(Ordering::Acquire)
    }

    fn release(&self, len: usize) {
        let prev = self.amount.fetch_sub(len, Ordering::AcqRel);
        if prev - len <= self.low_threshold.load(Ordering::Acquire) {
            self.low.notify_waiters();
        }
    }
}

/// One end of an in-process channel pair.
///
/// Messages are handed to the peer's inbound queue by a forwarding task; a
/// message counts toward [`buffered_amount`](DataChannel::buffered_amount)
/// until the peer's queue accepts it, so a slow consumer produces real
/// backpressure.
#[derive(Debug)]
pub struct MemoryChannel {
    outbound: mpsc::UnboundedSender<WireMessage>,
    buffer: Arc<SendBuffer>,
    link: CancellationToken,
}

impl MemoryChannel {
    /// Creates a connected pair. Each end comes with the receiver of the
    /// messages the other end sends; `inbound_capacity` bounds how many
    /// delivered messages may wait unread.
    ///
    /// Must be called inside a tokio runtime.
    pub fn pair(
        inbound_capacity: usize,
    ) -> (
        (MemoryChannel, mpsc::Receiver<WireMessage>),
        (MemoryChannel, mpsc::Receiver<WireMessage>),
    ) {
        let link = CancellationToken::new();
        let (a, b_inbound) = Self::direction(inbound_capacity, link.clone());
        let (b, a_inbound) = Self::direction(inbound_capacity, link);
        ((a, a_inbound), (b, b_inbound))
    }

    fn direction(
        capacity: usize,
        link: CancellationToken,
    ) -> (MemoryChannel, mpsc::Receiver<WireMessage>) {
        let (outbound, mut queued) = mpsc::unbounded_channel::<WireMessage>();
        let (deliver, inbound) = mpsc::channel(capacity.max(1));
        let buffer = Arc::new(SendBuffer::default());

        let fwd_buffer = Arc::clone(&buffer);
        let fwd_link = link.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = fwd_link.cancelled() => break,
                    msg = queued.recv() => match msg {
                        Some(m) => m,
                        None => break,
                    },
                };
                let len = msg.len();
                tokio::select! {
                    biased;
                    _ = fwd_link.cancelled() => break,
                    res = deliver.send(msg) => {
                        if res.is_err() {
                            debug!("memory channel peer dropped its receiver");
                            fwd_link.cancel();
                            break;
                        }
                    }
                }
                fwd_buffer.release(len);
            }
            fwd_buffer.low.notify_waiters();
        });

        (
            MemoryChannel {
                outbound,
                buffer,
                link,
            },
            inbound,
        )
    }

    /// Closes both ends. Pending messages are discarded.
    pub fn close(&self) {
        self.link.cancel();
        self.buffer.low.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_cancelled()
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send(&self, message: WireMessage) -> Result<(), ChannelError> {
        if self.link.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let len = message.len();
        self.buffer.amount.fetch_add(len, Ordering::AcqRel);
        if self.outbound.send(message).is_err() {
            self.buffer.amount.fetch_sub(len, Ordering::AcqRel);
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        if self.link.is_cancelled() {
            ReadyState::Closed
        } else {
            ReadyState::Open
        }
    }

    fn buffered_amount(&self) -> usize {
        self.buffer.amount.load(Ordering::Acquire)
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.buffer.low_threshold.store(threshold, Ordering::Release);
    }

    async fn buffered_amount_low(&self) {
        loop {
            let notified = self.buffer.low.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.buffer.is_low() || self.link.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.link.cancelled() => return,
            }
        }
    }
}
