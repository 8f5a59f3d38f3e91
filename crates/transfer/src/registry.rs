//! Per-connection arena of transfers, keyed by transfer id.
//!
//! Engines only touch their own slot, through a [`Reporter`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use peerdrop_protocol::{FileRequest, TransferId};

use crate::progress::ProgressSample;
use crate::receiver::ReceiverInput;
use crate::sender::SenderInput;
use crate::types::{
    Direction, ProgressPhase, ReceivedFile, TransferEvent, TransferProgress, TransferSnapshot,
    TransferStatus,
};
use crate::TransferError;

/// Where inbound traffic for a transfer goes.
#[derive(Debug, Clone)]
pub(crate) enum Route {
    Sender(mpsc::Sender<SenderInput>),
    /// Offered by the peer, not yet accepted or rejected.
    Pending(FileRequest),
    Receiver(mpsc::Sender<ReceiverInput>),
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub snapshot: TransferSnapshot,
    pub route: Route,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    slots: Mutex<HashMap<TransferId, Slot>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<TransferId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts an outgoing slot unless another outgoing transfer is active.
    ///
    /// Check and insert happen under one guard.
    pub fn insert_outgoing(&self, id: TransferId, slot: Slot) -> Result<(), TransferError> {
        let mut slots = self.lock();
        if let Some((busy, _)) = slots.iter().find(|(_, s)| {
            s.snapshot.direction == Direction::Outgoing && s.snapshot.status.is_active()
        }) {
            return Err(TransferError::TransferInProgress(busy.clone()));
        }
        slots.insert(id, slot);
        Ok(())
    }

    /// Inserts a slot; returns `false` if the id is already tracked.
    pub fn insert(&self, id: TransferId, slot: Slot) -> bool {
        let mut slots = self.lock();
        if slots.contains_key(&id) {
            return false;
        }
        slots.insert(id, slot);
        true
    }

    pub fn remove(&self, id: &TransferId) -> Option<Slot> {
        self.lock().remove(id)
    }

    pub fn update(&self, id: &TransferId, f: impl FnOnce(&mut TransferSnapshot)) {
        if let Some(slot) = self.lock().get_mut(id) {
            f(&mut slot.snapshot);
        }
    }

    pub fn snapshot(&self, id: &TransferId) -> Option<TransferSnapshot> {
        self.lock().get(id).map(|s| s.snapshot.clone())
    }

    pub fn snapshots(&self) -> Vec<TransferSnapshot> {
        let mut all: Vec<_> = self.lock().values().map(|s| s.snapshot.clone()).collect();
        all.sort_by(|a, b| a.transfer_id.cmp(&b.transfer_id));
        all
    }

    pub fn route(&self, id: &TransferId) -> Option<Route> {
        self.lock().get(id).map(|s| s.route.clone())
    }

    /// Swaps a pending offer for a receiver route. Returns the offer.
    pub fn promote_pending(
        &self,
        id: &TransferId,
        route: mpsc::Sender<ReceiverInput>,
        cancel: CancellationToken,
    ) -> Option<FileRequest> {
        let mut slots = self.lock();
        let slot = slots.get_mut(id)?;
        let Route::Pending(request) = &slot.route else {
            return None;
        };
        let request = request.clone();
        slot.route = Route::Receiver(route);
        slot.cancel = cancel;
        slot.snapshot.status = TransferStatus::Transferring;
        Some(request)
    }

    /// Removes and returns a pending offer.
    pub fn take_pending(&self, id: &TransferId) -> Option<FileRequest> {
        let mut slots = self.lock();
        match slots.get(id).map(|s| &s.route) {
            Some(Route::Pending(_)) => match slots.remove(id).map(|s| s.route) {
                Some(Route::Pending(request)) => Some(request),
                _ => None,
            },
            _ => None,
        }
    }

    /// Marks a transfer cancelled and returns its token and route.
    pub fn mark_cancelled(&self, id: &TransferId) -> Option<(CancellationToken, Route)> {
        let mut slots = self.lock();
        let slot = slots.get_mut(id)?;
        if slot.snapshot.status.is_active() {
            slot.snapshot.status = TransferStatus::Cancelled;
        }
        Some((slot.cancel.clone(), slot.route.clone()))
    }

    /// Every tracked id with its route.
    pub fn routes(&self) -> Vec<(TransferId, Route)> {
        self.lock()
            .iter()
            .map(|(id, s)| (id.clone(), s.route.clone()))
            .collect()
    }
}

/// An engine's handle onto its own slot and the event sink.
#[derive(Debug, Clone)]
pub(crate) struct Reporter {
    transfer_id: TransferId,
    direction: Direction,
    registry: Arc<Registry>,
    events: mpsc::Sender<TransferEvent>,
}

impl Reporter {
    pub fn new(
        transfer_id: TransferId,
        direction: Direction,
        registry: Arc<Registry>,
        events: mpsc::Sender<TransferEvent>,
    ) -> Self {
        Self {
            transfer_id,
            direction,
            registry,
            events,
        }
    }

    pub fn transfer_id(&self) -> &TransferId {
        &self.transfer_id
    }

    pub fn update(&self, f: impl FnOnce(&mut TransferSnapshot)) {
        self.registry.update(&self.transfer_id, f);
    }

    pub fn status(&self, status: TransferStatus) {
        self.update(|s| s.status = status);
        self.emit(TransferEvent::StatusChanged {
            transfer_id: self.transfer_id.clone(),
            direction: self.direction,
            status,
        });
    }

    pub fn progress(&self, phase: ProgressPhase, sample: &ProgressSample, chunks_done: u32) {
        if phase == ProgressPhase::Primary {
            self.update(|s| {
                s.bytes_done = sample.bytes_done;
                s.chunks_done = chunks_done;
                s.speed_bps = sample.speed_bps;
                s.eta_seconds = sample.eta_seconds;
            });
        }
        self.emit(TransferEvent::Progress(TransferProgress {
            transfer_id: self.transfer_id.clone(),
            direction: self.direction,
            phase,
            bytes_done: sample.bytes_done,
            bytes_total: sample.bytes_total,
            percent: sample.percent,
            speed_bps: sample.speed_bps,
            eta_seconds: sample.eta_seconds,
        }));
    }

    pub async fn completed(&self, file: Option<ReceivedFile>) {
        self.status(TransferStatus::Completed);
        self.deliver(TransferEvent::Completed {
            transfer_id: self.transfer_id.clone(),
            direction: self.direction,
            file,
        })
        .await;
    }

    pub async fn failed(&self, err: &TransferError) {
        let reason = err.to_string();
        self.update(|s| {
            s.status = TransferStatus::Failed;
            s.error = Some(reason.clone());
        });
        self.deliver(TransferEvent::Failed {
            transfer_id: self.transfer_id.clone(),
            direction: self.direction,
            reason,
        })
        .await;
    }

    pub async fn cancelled(&self) {
        self.update(|s| s.status = TransferStatus::Cancelled);
        self.deliver(TransferEvent::Cancelled {
            transfer_id: self.transfer_id.clone(),
            direction: self.direction,
        })
        .await;
    }

    /// Drops the slot; called when the engine task ends.
    pub fn release(&self) {
        self.registry.remove(&self.transfer_id);
    }

    /// Non-blocking delivery for frequent, droppable events.
    fn emit(&self, event: TransferEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(transfer_id = %self.transfer_id, "failed to send transfer event: {e}");
        }
    }

    /// Waits for room; used for events the host must not miss.
    async fn deliver(&self, event: TransferEvent) {
        if self.events.send(event).await.is_err() {
            debug!(transfer_id = %self.transfer_id, "event receiver dropped");
        }
    }
}
