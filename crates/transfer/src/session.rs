use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use peerdrop_protocol::{
    Assembled, ControlMessage, FileAccept, FileCancel, FileReject, FileRequest, FrameAssembler,
    InboundChunk, TransferId, WireMessage, decode,
};
use peerdrop_storage::{ChunkStore, DiskStore, MemoryStore};

use crate::TransferError;
use crate::channel::{DataChannel, Outbound};
use crate::config::TransferConfig;
use crate::receiver::{ReceiverEngine, ReceiverInput, Stores};
use crate::registry::{Registry, Reporter, Route, Slot};
use crate::sender::{SenderEngine, SenderInput};
use crate::source::OutgoingFile;
use crate::types::{
    Direction, IncomingFileHandle, TransferEvent, TransferSnapshot, TransferStatus,
};

/// Owns every transfer on one peer connection.
///
/// Inbound messages enter through [`handle_message`](Self::handle_message)
/// (or [`run`](Self::run)); outbound traffic is produced by one engine task
/// per transfer. At most one outgoing transfer may be active at a time.
///
/// Methods that start engines spawn tokio tasks and must be called inside a
/// runtime.
#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    out: Outbound,
    config: Arc<TransferConfig>,
    registry: Arc<Registry>,
    events: mpsc::Sender<TransferEvent>,
    stores: Stores,
    assembler: Mutex<FrameAssembler>,
}

impl SessionManager {
    /// Creates a manager whose disk store lives under `config.storage_dir`.
    pub fn new(
        channel: Arc<dyn DataChannel>,
        config: TransferConfig,
    ) -> (Self, mpsc::Receiver<TransferEvent>) {
        let disk = Arc::new(DiskStore::new(&config.storage_dir));
        Self::with_stores(channel, config, Arc::new(MemoryStore::new()), disk)
    }

    /// Creates a manager with caller-provided storage backends.
    pub fn with_stores(
        channel: Arc<dyn DataChannel>,
        config: TransferConfig,
        memory: Arc<MemoryStore>,
        disk: Arc<dyn ChunkStore>,
    ) -> (Self, mpsc::Receiver<TransferEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let manager = Self {
            inner: Arc::new(Inner {
                out: Outbound::new(channel),
                config: Arc::new(config),
                registry: Arc::new(Registry::default()),
                events,
                stores: Stores { memory, disk },
                assembler: Mutex::new(FrameAssembler::new()),
            }),
        };
        (manager, events_rx)
    }

    pub fn config(&self) -> &TransferConfig {
        &self.inner.config
    }

    /// Starts sending `file` and returns its transfer id.
    ///
    /// Fails before any channel traffic if the channel is not open or another
    /// outgoing transfer is still active.
    pub fn send(&self, file: OutgoingFile) -> Result<TransferId, TransferError> {
        let inner = &self.inner;
        if !inner.out.is_open() {
            return Err(TransferError::ChannelNotOpen);
        }

        let id = TransferId::generate();
        let (input_tx, input_rx) = mpsc::channel(inner.config.event_capacity.max(1));
        let cancel = CancellationToken::new();
        let snapshot = TransferSnapshot::new(
            id.clone(),
            Direction::Outgoing,
            file.name().to_string(),
            file.size(),
            file.mime_type().to_string(),
            TransferStatus::Pending,
        );
        inner.registry.insert_outgoing(
            id.clone(),
            Slot {
                snapshot,
                route: Route::Sender(input_tx),
                cancel: cancel.clone(),
            },
        )?;
        info!(transfer_id = %id, name = file.name(), size = file.size(), "outgoing transfer started");

        let reporter = self.reporter(&id, Direction::Outgoing);
        let engine = SenderEngine::new(
            file,
            inner.out.clone(),
            Arc::clone(&inner.config),
            input_rx,
            cancel,
            reporter,
        );
        tokio::spawn(engine.run());
        Ok(id)
    }

    /// Registers a peer's offer and surfaces it to the host.
    ///
    /// Nothing is received until [`accept`](Self::accept) is called.
    pub async fn on_incoming_request(&self, request: FileRequest) -> IncomingFileHandle {
        let handle = IncomingFileHandle {
            transfer_id: request.transfer_id.clone(),
            name: request.name.clone(),
            size: request.size,
            mime_type: request.mime_type.clone(),
        };
        let snapshot = TransferSnapshot::new(
            request.transfer_id.clone(),
            Direction::Incoming,
            request.name.clone(),
            request.size,
            request.mime_type.clone(),
            TransferStatus::AwaitingAccept,
        );
        let inserted = self.inner.registry.insert(
            request.transfer_id.clone(),
            Slot {
                snapshot,
                route: Route::Pending(request),
                cancel: CancellationToken::new(),
            },
        );
        if !inserted {
            warn!(transfer_id = %handle.transfer_id, "duplicate file-request ignored");
            return handle;
        }

        info!(
            transfer_id = %handle.transfer_id,
            name = %handle.name,
            size = handle.size,
            "incoming file offered"
        );
        if self
            .inner
            .events
            .send(TransferEvent::IncomingRequest(handle.clone()))
            .await
            .is_err()
        {
            debug!(transfer_id = %handle.transfer_id, "event receiver dropped");
        }
        handle
    }

    /// Accepts an offer: arms a receiver, then tells the peer to start.
    pub async fn accept(&self, handle: &IncomingFileHandle) -> Result<(), TransferError> {
        let inner = &self.inner;
        let id = &handle.transfer_id;
        let (input_tx, input_rx) = mpsc::channel(inner.config.event_capacity.max(1));
        let cancel = CancellationToken::new();
        let request = inner
            .registry
            .promote_pending(id, input_tx, cancel.clone())
            .ok_or_else(|| TransferError::UnknownTransfer(id.clone()))?;

        let engine = ReceiverEngine::new(
            request,
            inner.out.clone(),
            Arc::clone(&inner.config),
            inner.stores.clone(),
            input_rx,
            cancel.clone(),
            self.reporter(id, Direction::Incoming),
        );
        tokio::spawn(engine.run());

        info!(transfer_id = %id, "accepting incoming file");
        let accept = ControlMessage::FileAccept(FileAccept {
            transfer_id: id.clone(),
        });
        if let Err(e) = inner.out.control(&accept).await {
            cancel.cancel();
            return Err(e);
        }
        Ok(())
    }

    /// Declines an offer and forgets it.
    pub async fn reject(
        &self,
        handle: &IncomingFileHandle,
        reason: Option<String>,
    ) -> Result<(), TransferError> {
        let id = &handle.transfer_id;
        self.inner
            .registry
            .take_pending(id)
            .ok_or_else(|| TransferError::UnknownTransfer(id.clone()))?;
        info!(transfer_id = %id, ?reason, "rejecting incoming file");
        self.inner
            .out
            .control(&ControlMessage::FileReject(FileReject {
                transfer_id: id.clone(),
                reason,
            }))
            .await
    }

    /// Stops a transfer locally and notifies the peer on a best-effort basis.
    ///
    /// The peer may keep sending for a while; frames for transfers that are
    /// no longer tracked are dropped.
    pub async fn cancel(&self, transfer_id: &TransferId) -> Result<(), TransferError> {
        let inner = &self.inner;
        let (token, route) = inner
            .registry
            .mark_cancelled(transfer_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.clone()))?;
        info!(transfer_id = %transfer_id, "cancelling transfer");

        match route {
            Route::Pending(_) => {
                inner.registry.remove(transfer_id);
                self.deliver(TransferEvent::Cancelled {
                    transfer_id: transfer_id.clone(),
                    direction: Direction::Incoming,
                })
                .await;
            }
            Route::Sender(_) | Route::Receiver(_) => token.cancel(),
        }

        let notice = ControlMessage::FileCancel(FileCancel {
            transfer_id: transfer_id.clone(),
        });
        if let Err(e) = inner.out.control(&notice).await {
            debug!(transfer_id = %transfer_id, error = %e, "could not notify peer of cancellation");
        }
        Ok(())
    }

    /// Decodes one inbound message and routes it to its transfer.
    pub async fn handle_message(&self, message: WireMessage) -> Result<(), TransferError> {
        let frame = decode(message)?;
        let assembled = self
            .inner
            .assembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);

        let mut next = Some(assembled);
        while let Some(assembled) = next.take() {
            match assembled {
                Assembled::Control(msg) => self.route_control(msg).await,
                Assembled::Chunk(chunk) => self.route_chunk(chunk).await,
                Assembled::AwaitingPayload => {}
                Assembled::OrphanPayload { len } => {
                    warn!(len, "payload without chunk record dropped");
                }
                Assembled::Superseded { lost, next: n } => {
                    warn!(
                        transfer_id = %lost.transfer_id,
                        index = lost.index,
                        "chunk record without payload dropped"
                    );
                    next = Some(*n);
                }
            }
        }
        Ok(())
    }

    /// Feeds every inbound message to [`handle_message`](Self::handle_message)
    /// until the stream ends, then treats the channel as closed.
    pub async fn run(&self, mut inbound: mpsc::Receiver<WireMessage>) {
        while let Some(message) = inbound.recv().await {
            if let Err(e) = self.handle_message(message).await {
                warn!(error = %e, "dropping malformed message");
            }
        }
        info!("inbound stream ended");
        self.handle_channel_closed().await;
    }

    /// Fails every tracked transfer; receivers discard partial storage.
    pub async fn handle_channel_closed(&self) {
        let inner = &self.inner;
        inner
            .assembler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();

        for (id, route) in inner.registry.routes() {
            match route {
                Route::Sender(tx) => {
                    let _ = tx.send(SenderInput::ChannelClosed).await;
                }
                Route::Receiver(tx) => {
                    let _ = tx.send(ReceiverInput::ChannelClosed).await;
                }
                Route::Pending(_) => {
                    inner.registry.remove(&id);
                    self.deliver(TransferEvent::Failed {
                        transfer_id: id,
                        direction: Direction::Incoming,
                        reason: TransferError::ChannelClosed.to_string(),
                    })
                    .await;
                }
            }
        }
    }

    pub fn snapshot(&self, transfer_id: &TransferId) -> Option<TransferSnapshot> {
        self.inner.registry.snapshot(transfer_id)
    }

    /// Every tracked transfer, ordered by id.
    pub fn transfers(&self) -> Vec<TransferSnapshot> {
        self.inner.registry.snapshots()
    }

    async fn route_control(&self, msg: ControlMessage) {
        let id = msg.transfer_id().clone();
        trace!(kind = msg.kind(), transfer_id = %id, "control received");
        match msg {
            ControlMessage::FileRequest(request) => {
                self.on_incoming_request(request).await;
            }
            ControlMessage::FileAccept(_) => self.to_sender(&id, SenderInput::Accepted).await,
            ControlMessage::FileReject(reject) => {
                self.to_sender(&id, SenderInput::Rejected(reject.reason)).await;
            }
            ControlMessage::FileStart(start) => {
                self.to_receiver(&id, ReceiverInput::Start(start)).await;
            }
            ControlMessage::Chunk(meta) | ControlMessage::ChunkRetry(meta) => {
                warn!(transfer_id = %id, index = meta.index, "chunk record outside assembler dropped");
            }
            ControlMessage::FileEnd(_) => self.to_receiver(&id, ReceiverInput::End).await,
            ControlMessage::ChunkRetryRequest(request) => {
                self.to_sender(&id, SenderInput::RetryRequested(request.chunk_indices))
                    .await;
            }
            ControlMessage::FileCancel(_) => self.peer_cancelled(&id).await,
            ControlMessage::FileReceived(_) => self.to_sender(&id, SenderInput::Received).await,
        }
    }

    async fn route_chunk(&self, chunk: InboundChunk) {
        let id = chunk.meta.transfer_id.clone();
        match self.inner.registry.route(&id) {
            Some(Route::Receiver(tx)) => {
                let _ = tx.send(ReceiverInput::Chunk(chunk)).await;
            }
            _ => trace!(transfer_id = %id, index = chunk.meta.index, "chunk for untracked transfer dropped"),
        }
    }

    async fn to_sender(&self, id: &TransferId, input: SenderInput) {
        match self.inner.registry.route(id) {
            Some(Route::Sender(tx)) => {
                if tx.send(input).await.is_err() {
                    debug!(transfer_id = %id, "sender already finished");
                }
            }
            Some(_) => warn!(transfer_id = %id, ?input, "sender message for incoming transfer"),
            None => debug!(transfer_id = %id, ?input, "message for untracked transfer dropped"),
        }
    }

    async fn to_receiver(&self, id: &TransferId, input: ReceiverInput) {
        match self.inner.registry.route(id) {
            Some(Route::Receiver(tx)) => {
                if tx.send(input).await.is_err() {
                    debug!(transfer_id = %id, "receiver already finished");
                }
            }
            Some(_) => warn!(transfer_id = %id, ?input, "receiver message for unaccepted transfer"),
            None => debug!(transfer_id = %id, "message for untracked transfer dropped"),
        }
    }

    async fn peer_cancelled(&self, id: &TransferId) {
        info!(transfer_id = %id, "peer cancelled transfer");
        match self.inner.registry.route(id) {
            Some(Route::Sender(tx)) => {
                let _ = tx.send(SenderInput::PeerCancelled).await;
            }
            Some(Route::Receiver(tx)) => {
                let _ = tx.send(ReceiverInput::PeerCancelled).await;
            }
            Some(Route::Pending(_)) => {
                self.inner.registry.remove(id);
                self.deliver(TransferEvent::Cancelled {
                    transfer_id: id.clone(),
                    direction: Direction::Incoming,
                })
                .await;
            }
            None => debug!(transfer_id = %id, "cancel for untracked transfer"),
        }
    }

    fn reporter(&self, id: &TransferId, direction: Direction) -> Reporter {
        Reporter::new(
            id.clone(),
            direction,
            Arc::clone(&self.inner.registry),
            self.inner.events.clone(),
        )
    }

    async fn deliver(&self, event: TransferEvent) {
        if self.inner.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }
}
