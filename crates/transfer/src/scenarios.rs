//! Two session managers talking over an in-process channel pair.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use peerdrop_protocol::{
    ControlMessage, FileRequest, FileStart, Frame, TransferId, WireMessage, decode, encode_control,
};
use peerdrop_storage::{
    BackendKind, ChunkStore, DiskStore, MemoryStore, PutOutcome, StorageError, TransferMetadata,
};

use crate::{
    ChannelError, ChunkSizeTable, DataChannel, DeviceClass, IncomingFileHandle, MemoryChannel,
    OutgoingFile, ProgressPhase, ReadyState, ReceivedFile, SessionManager, TransferConfig,
    TransferError, TransferEvent, TransferStatus, checksum_bytes,
};

const CHUNK: u32 = 1024;
const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct Faults {
    /// Primary chunks dropped the first time they are sent.
    drop_once: BTreeSet<u32>,
    /// Chunks dropped on every attempt, retries included.
    drop_always: BTreeSet<u32>,
    /// Chunks delivered twice.
    duplicate: BTreeSet<u32>,
    /// Close the link instead of sending this primary chunk.
    close_at: Option<u32>,
    drop_retry_requests: bool,
}

#[derive(Debug)]
struct FaultyChannel {
    inner: MemoryChannel,
    faults: Mutex<Faults>,
    skip_payload: AtomicBool,
    repeat: Mutex<Option<WireMessage>>,
    /// Every control record this end tried to send.
    log: Mutex<Vec<ControlMessage>>,
}

impl FaultyChannel {
    fn new(inner: MemoryChannel, faults: Faults) -> Self {
        Self {
            inner,
            faults: Mutex::new(faults),
            skip_payload: AtomicBool::new(false),
            repeat: Mutex::new(None),
            log: Mutex::new(Vec::new()),
        }
    }

    fn sent(&self) -> Vec<ControlMessage> {
        self.log.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&ControlMessage) -> bool) -> usize {
        self.sent().iter().filter(|m| pred(m)).count()
    }
}

enum Fate {
    Deliver,
    Drop,
    Close,
}

impl FaultyChannel {
    fn fate(&self, msg: &ControlMessage, raw: &WireMessage) -> Fate {
        let mut faults = self.faults.lock().unwrap();
        match msg {
            ControlMessage::Chunk(meta) => {
                if faults.close_at == Some(meta.index) {
                    return Fate::Close;
                }
                if faults.drop_once.remove(&meta.index) || faults.drop_always.contains(&meta.index)
                {
                    self.skip_payload.store(true, Ordering::SeqCst);
                    return Fate::Drop;
                }
                if faults.duplicate.remove(&meta.index) {
                    *self.repeat.lock().unwrap() = Some(raw.clone());
                }
                Fate::Deliver
            }
            ControlMessage::ChunkRetry(meta) if faults.drop_always.contains(&meta.index) => {
                self.skip_payload.store(true, Ordering::SeqCst);
                Fate::Drop
            }
            ControlMessage::ChunkRetryRequest(_) if faults.drop_retry_requests => Fate::Drop,
            _ => Fate::Deliver,
        }
    }
}

#[async_trait]
impl DataChannel for FaultyChannel {
    async fn send(&self, message: WireMessage) -> Result<(), ChannelError> {
        match &message {
            WireMessage::Text(_) => {
                let Ok(Frame::Control(msg)) = decode(message.clone()) else {
                    panic!("undecodable control record");
                };
                self.log.lock().unwrap().push(msg.clone());
                match self.fate(&msg, &message) {
                    Fate::Deliver => {}
                    Fate::Drop => return Ok(()),
                    Fate::Close => {
                        self.inner.close();
                        return Err(ChannelError::Closed);
                    }
                }
            }
            WireMessage::Binary(_) => {
                if self.skip_payload.swap(false, Ordering::SeqCst) {
                    return Ok(());
                }
                let repeat = self.repeat.lock().unwrap().take();
                if let Some(record) = repeat {
                    self.inner.send(message.clone()).await?;
                    self.inner.send(record).await?;
                }
            }
        }
        self.inner.send(message).await
    }

    fn ready_state(&self) -> ReadyState {
        self.inner.ready_state()
    }

    fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount()
    }

    fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.inner.set_buffered_amount_low_threshold(threshold);
    }

    async fn buffered_amount_low(&self) {
        self.inner.buffered_amount_low().await;
    }
}

/// Disk-kind store with injectable write failures, read failures and
/// latency.
#[derive(Debug, Default)]
struct FlakyStore {
    inner: MemoryStore,
    /// Writes to these indices fail.
    fail: BTreeSet<u32>,
    /// `get_all` fails as if the files were unreadable.
    unreadable: bool,
    /// Time every write takes.
    delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    reassemblies: AtomicUsize,
}

#[async_trait]
impl ChunkStore for FlakyStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Disk
    }

    async fn put_metadata(&self, id: &TransferId, meta: &TransferMetadata) -> Result<(), StorageError> {
        self.inner.put_metadata(id, meta).await
    }

    async fn metadata(&self, id: &TransferId) -> Result<Option<TransferMetadata>, StorageError> {
        self.inner.metadata(id).await
    }

    async fn put(&self, id: &TransferId, index: u32, bytes: Vec<u8>) -> Result<PutOutcome, StorageError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail.contains(&index) {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }
        self.inner.put(id, index, bytes).await
    }

    async fn get(&self, id: &TransferId, index: u32) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(id, index).await
    }

    async fn get_all(&self, id: &TransferId) -> Result<Vec<u8>, StorageError> {
        self.reassemblies.fetch_add(1, Ordering::SeqCst);
        if self.unreadable {
            return Err(StorageError::Io(std::io::Error::other("read error")));
        }
        self.inner.get_all(id).await
    }

    async fn delete_all(&self, id: &TransferId) -> Result<(), StorageError> {
        self.inner.delete_all(id).await
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Peer {
    session: SessionManager,
    events: mpsc::Receiver<TransferEvent>,
    channel: Arc<FaultyChannel>,
    memory: Arc<MemoryStore>,
}

struct Pair {
    alice: Peer,
    bob: Peer,
    _dir: tempfile::TempDir,
}

fn config() -> TransferConfig {
    TransferConfig {
        chunk_sizes: ChunkSizeTable {
            mobile: CHUNK,
            desktop: CHUNK,
            desktop_large: CHUNK,
            desktop_huge: CHUNK,
        },
        high_watermark: 16 * 1024,
        low_watermark: 4 * 1024,
        progress_interval_ms: 0,
        retry_pacing_ms: 1,
        sender_grace_period_ms: 5_000,
        ..TransferConfig::default()
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn pair(alice_faults: Faults, bob_config: TransferConfig) -> Pair {
    pair_with(alice_faults, Faults::default(), config(), bob_config, None)
}

fn pair_with(
    alice_faults: Faults,
    bob_faults: Faults,
    alice_config: TransferConfig,
    mut bob_config: TransferConfig,
    bob_disk: Option<Arc<dyn ChunkStore>>,
) -> Pair {
    let dir = tempfile::tempdir().unwrap();
    bob_config.storage_dir = dir.path().to_path_buf();
    let ((a, a_in), (b, b_in)) = MemoryChannel::pair(8);

    let spawn_peer = |channel: MemoryChannel,
                      inbound: mpsc::Receiver<WireMessage>,
                      faults: Faults,
                      config: TransferConfig,
                      disk: Option<Arc<dyn ChunkStore>>| {
        let channel = Arc::new(FaultyChannel::new(channel, faults));
        let memory = Arc::new(MemoryStore::new());
        let disk = disk.unwrap_or_else(|| Arc::new(DiskStore::new(&config.storage_dir)));
        let (session, events) =
            SessionManager::with_stores(channel.clone(), config, Arc::clone(&memory), disk);
        let pump = session.clone();
        tokio::spawn(async move { pump.run(inbound).await });
        Peer {
            session,
            events,
            channel,
            memory,
        }
    };

    Pair {
        alice: spawn_peer(a, a_in, alice_faults, alice_config, None),
        bob: spawn_peer(b, b_in, bob_faults, bob_config, bob_disk),
        _dir: dir,
    }
}

async fn next_event(events: &mut mpsc::Receiver<TransferEvent>) -> TransferEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn incoming(events: &mut mpsc::Receiver<TransferEvent>) -> IncomingFileHandle {
    loop {
        if let TransferEvent::IncomingRequest(handle) = next_event(events).await {
            return handle;
        }
    }
}

/// Collects events for `id` until its terminal event.
async fn until_terminal(
    events: &mut mpsc::Receiver<TransferEvent>,
    id: &TransferId,
) -> (Vec<TransferEvent>, TransferEvent) {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        if event.transfer_id() != id {
            continue;
        }
        match event {
            TransferEvent::Completed { .. }
            | TransferEvent::Failed { .. }
            | TransferEvent::Cancelled { .. } => return (seen, event),
            other => seen.push(other),
        }
    }
}

fn received(event: TransferEvent) -> ReceivedFile {
    match event {
        TransferEvent::Completed {
            file: Some(file), ..
        } => file,
        other => panic!("expected a received file, got {other:?}"),
    }
}

fn failure(event: TransferEvent) -> String {
    match event {
        TransferEvent::Failed { reason, .. } => reason,
        other => panic!("expected failure, got {other:?}"),
    }
}

/// Sends `data` from alice to bob, bob accepting.
async fn transfer(p: &mut Pair, data: &[u8]) -> (TransferId, TransferEvent, TransferEvent) {
    let file = OutgoingFile::from_bytes("data.bin", "application/octet-stream", data.to_vec());
    let id = p.alice.session.send(file).unwrap();
    let handle = incoming(&mut p.bob.events).await;
    assert_eq!(handle.transfer_id, id);
    assert_eq!(handle.size, data.len() as u64);
    p.bob.session.accept(&handle).await.unwrap();

    let (_, bob_end) = until_terminal(&mut p.bob.events, &id).await;
    let (_, alice_end) = until_terminal(&mut p.alice.events, &id).await;
    (id, alice_end, bob_end)
}

fn retry_requests(peer: &Peer) -> Vec<Vec<u32>> {
    peer.channel
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            ControlMessage::ChunkRetryRequest(r) => Some(r.chunk_indices),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lost_chunk_is_recovered_with_one_retry() {
    let faults = Faults {
        drop_once: BTreeSet::from([4]),
        ..Faults::default()
    };
    let mut p = pair(faults, config());
    let data = payload(10 * CHUNK as usize - 100);

    let (_, alice_end, bob_end) = transfer(&mut p, &data).await;
    assert!(matches!(alice_end, TransferEvent::Completed { file: None, .. }));
    let file = received(bob_end);
    assert_eq!(file.data, data);
    assert_eq!(file.sha256, checksum_bytes(&data));

    assert_eq!(retry_requests(&p.bob), vec![vec![4]]);
    let resent: Vec<u32> = p
        .alice
        .channel
        .sent()
        .into_iter()
        .filter_map(|m| match m {
            ControlMessage::ChunkRetry(meta) => Some(meta.index),
            _ => None,
        })
        .collect();
    assert_eq!(resent, vec![4]);
    assert_eq!(
        p.alice.channel.count(|m| matches!(m, ControlMessage::FileEnd(_))),
        2
    );
    assert!(p.bob.memory.is_empty().await);
}

#[tokio::test]
async fn empty_file_completes_without_chunks() {
    let mut p = pair(Faults::default(), config());
    let (_, alice_end, bob_end) = transfer(&mut p, &[]).await;

    assert!(matches!(alice_end, TransferEvent::Completed { .. }));
    let file = received(bob_end);
    assert!(file.data.is_empty());
    assert_eq!(file.sha256, checksum_bytes(b""));
    assert_eq!(
        p.alice.channel.count(|m| matches!(m, ControlMessage::Chunk(_))),
        0
    );
    assert!(retry_requests(&p.bob).is_empty());
}

#[tokio::test]
async fn rejected_offer_fails_sender_without_chunks() {
    let mut p = pair(Faults::default(), config());
    let file = OutgoingFile::from_bytes("x.bin", "", payload(5000));
    let id = p.alice.session.send(file).unwrap();

    let handle = incoming(&mut p.bob.events).await;
    p.bob
        .session
        .reject(&handle, Some("not now".into()))
        .await
        .unwrap();

    let (_, end) = until_terminal(&mut p.alice.events, &id).await;
    let reason = failure(end);
    assert!(reason.contains("rejected"), "{reason}");
    assert!(reason.contains("not now"), "{reason}");
    assert_eq!(
        p.alice
            .channel
            .count(|m| matches!(m, ControlMessage::Chunk(_) | ControlMessage::FileStart(_))),
        0
    );
    assert!(p.bob.session.snapshot(&id).is_none());
}

#[tokio::test]
async fn channel_close_mid_transfer_fails_both_sides() {
    let faults = Faults {
        close_at: Some(4),
        ..Faults::default()
    };
    let mut p = pair(faults, config());
    let data = payload(10 * CHUNK as usize);
    let file = OutgoingFile::from_bytes("big.bin", "", data);
    let id = p.alice.session.send(file).unwrap();
    let handle = incoming(&mut p.bob.events).await;
    p.bob.session.accept(&handle).await.unwrap();

    let (_, alice_end) = until_terminal(&mut p.alice.events, &id).await;
    assert!(failure(alice_end).contains("closed"));
    let (_, bob_end) = until_terminal(&mut p.bob.events, &id).await;
    assert!(failure(bob_end).contains("closed"));

    assert!(p.bob.memory.is_empty().await);
}

#[tokio::test]
async fn second_send_is_refused_while_first_is_active() {
    let mut p = pair(Faults::default(), config());
    let first = p
        .alice
        .session
        .send(OutgoingFile::from_bytes("a", "", payload(3000)))
        .unwrap();
    let err = p
        .alice
        .session
        .send(OutgoingFile::from_bytes("b", "", payload(3000)))
        .unwrap_err();
    assert!(matches!(err, TransferError::TransferInProgress(ref id) if *id == first));

    let handle = incoming(&mut p.bob.events).await;
    p.bob.session.accept(&handle).await.unwrap();
    let (_, end) = until_terminal(&mut p.alice.events, &first).await;
    assert!(matches!(end, TransferEvent::Completed { .. }));
    assert_eq!(
        p.alice
            .channel
            .count(|m| matches!(m, ControlMessage::FileRequest(_))),
        1
    );
}

#[tokio::test]
async fn send_after_completion_is_allowed() {
    let mut p = pair(Faults::default(), config());
    transfer(&mut p, &payload(2000)).await;
    // The first sender may still be in its grace window; a completed
    // transfer does not occupy the connection.
    let (_, alice_end, bob_end) = transfer(&mut p, &payload(1500)).await;
    assert!(matches!(alice_end, TransferEvent::Completed { .. }));
    assert_eq!(received(bob_end).data, payload(1500));
}

#[tokio::test]
async fn scattered_gaps_converge_in_one_round() {
    let faults = Faults {
        drop_once: BTreeSet::from([0, 5, 7, 19]),
        ..Faults::default()
    };
    let mut p = pair(faults, config());
    let data = payload(20 * CHUNK as usize);

    let (_, _, bob_end) = transfer(&mut p, &data).await;
    assert_eq!(received(bob_end).sha256, checksum_bytes(&data));
    assert_eq!(retry_requests(&p.bob), vec![vec![0, 5, 7, 19]]);
}

#[tokio::test]
async fn permanently_lost_chunk_fails_after_retry_cap() {
    let faults = Faults {
        drop_always: BTreeSet::from([2]),
        ..Faults::default()
    };
    let mut p = pair(faults, config());
    let data = payload(6 * CHUNK as usize);

    let (_, alice_end, bob_end) = transfer(&mut p, &data).await;
    let reason = failure(bob_end);
    assert!(reason.contains("missing"), "{reason}");
    assert_eq!(retry_requests(&p.bob).len(), 3);
    // The sender completed its pass and is told to stop serving retries.
    assert!(matches!(alice_end, TransferEvent::Completed { .. }));
    assert!(p.bob.memory.is_empty().await);
}

#[tokio::test]
async fn duplicated_chunk_is_not_double_counted() {
    let faults = Faults {
        duplicate: BTreeSet::from([1, 3]),
        ..Faults::default()
    };
    let mut cfg = config();
    cfg.size_tolerance_bytes = 0;
    let mut p = pair(faults, cfg);
    let data = payload(5 * CHUNK as usize);

    let (_, _, bob_end) = transfer(&mut p, &data).await;
    let file = received(bob_end);
    assert_eq!(file.size, data.len() as u64);
    assert_eq!(file.data, data);
}

#[tokio::test]
async fn disk_backed_receive_with_loss_roundtrips() {
    let faults = Faults {
        drop_once: BTreeSet::from([1, 2, 9]),
        ..Faults::default()
    };
    let bob_config = TransferConfig {
        device_class: DeviceClass::Mobile,
        ..config()
    };
    let mut p = pair(faults, bob_config);
    let data = payload(12 * CHUNK as usize + 7);

    let (id, _, bob_end) = transfer(&mut p, &data).await;
    let file = received(bob_end);
    assert_eq!(file.sha256, checksum_bytes(&data));
    assert!(!p._dir.path().join(id.as_str()).exists());
}

fn mobile() -> TransferConfig {
    TransferConfig {
        device_class: DeviceClass::Mobile,
        ..config()
    }
}

fn pair_on_store(store: &Arc<FlakyStore>, bob_config: TransferConfig) -> Pair {
    let disk: Arc<dyn ChunkStore> = store.clone();
    pair_with(
        Faults::default(),
        Faults::default(),
        config(),
        bob_config,
        Some(disk),
    )
}

#[tokio::test]
async fn failed_disk_writes_fall_back_to_memory() {
    let flaky = Arc::new(FlakyStore {
        fail: BTreeSet::from([0, 3]),
        ..FlakyStore::default()
    });
    let mut p = pair_on_store(&flaky, mobile());
    let data = payload(5 * CHUNK as usize);

    let (_, _, bob_end) = transfer(&mut p, &data).await;
    assert_eq!(received(bob_end).data, data);
    assert!(retry_requests(&p.bob).is_empty());
    // The disk alone could not reassemble; the in-memory copies filled in.
    assert_eq!(flaky.reassemblies.load(Ordering::SeqCst), 1);
    assert!(p.bob.memory.is_empty().await);
    assert!(flaky.inner.is_empty().await);
}

#[tokio::test]
async fn unreadable_disk_reassembles_from_memory_copy() {
    let flaky = Arc::new(FlakyStore {
        fail: BTreeSet::from([1]),
        unreadable: true,
        ..FlakyStore::default()
    });
    let mut p = pair_on_store(&flaky, mobile());
    let data = payload(4 * CHUNK as usize + 10);

    let (_, _, bob_end) = transfer(&mut p, &data).await;
    let file = received(bob_end);
    assert_eq!(file.sha256, checksum_bytes(&data));
    assert_eq!(flaky.reassemblies.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unreadable_disk_without_memory_copy_fails() {
    let flaky = Arc::new(FlakyStore {
        unreadable: true,
        ..FlakyStore::default()
    });
    let mut p = pair_on_store(&flaky, mobile());

    let (_, _, bob_end) = transfer(&mut p, &payload(3 * CHUNK as usize)).await;
    let reason = failure(bob_end);
    assert!(reason.contains("reconstruction failed"), "{reason}");
    assert!(reason.contains("read error"), "{reason}");
    assert!(p.bob.memory.is_empty().await);
    assert!(flaky.inner.is_empty().await);
}

#[tokio::test]
async fn slow_disk_bounds_writes_in_flight() {
    let flaky = Arc::new(FlakyStore {
        delay: Duration::from_millis(10),
        ..FlakyStore::default()
    });
    let bob_config = TransferConfig {
        max_inflight_writes: 4,
        ..mobile()
    };
    let mut p = pair_on_store(&flaky, bob_config);
    let data = payload(60 * CHUNK as usize);

    let (_, _, bob_end) = transfer(&mut p, &data).await;
    assert_eq!(received(bob_end).data, data);
    let peak = flaky.peak_in_flight.load(Ordering::SeqCst);
    assert!((1..=4).contains(&peak), "peak in-flight writes {peak}");
}

#[tokio::test]
async fn primary_progress_is_monotonic_and_ends_at_full() {
    let mut p = pair(Faults::default(), config());
    let data = payload(40 * CHUNK as usize);
    let file = OutgoingFile::from_bytes("p.bin", "", data.clone());
    let id = p.alice.session.send(file).unwrap();
    let handle = incoming(&mut p.bob.events).await;
    p.bob.session.accept(&handle).await.unwrap();

    for events in [&mut p.bob.events, &mut p.alice.events] {
        let (seen, end) = until_terminal(events, &id).await;
        assert!(matches!(end, TransferEvent::Completed { .. }));
        let progress: Vec<_> = seen
            .into_iter()
            .filter_map(|e| match e {
                TransferEvent::Progress(p) if p.phase == ProgressPhase::Primary => Some(p),
                _ => None,
            })
            .collect();
        assert!(!progress.is_empty());
        assert!(progress.windows(2).all(|w| w[0].bytes_done <= w[1].bytes_done));
        let last = progress.last().unwrap();
        assert_eq!(last.bytes_done, data.len() as u64);
        assert_eq!(last.percent, 100.0);
    }
}

#[tokio::test]
async fn cancelled_offer_is_withdrawn_on_both_sides() {
    let mut p = pair(Faults::default(), config());
    let id = p
        .alice
        .session
        .send(OutgoingFile::from_bytes("c", "", payload(100)))
        .unwrap();
    let handle = incoming(&mut p.bob.events).await;
    assert_eq!(
        p.bob.session.snapshot(&id).map(|s| s.status),
        Some(TransferStatus::AwaitingAccept)
    );

    p.alice.session.cancel(&id).await.unwrap();
    let (_, alice_end) = until_terminal(&mut p.alice.events, &id).await;
    assert!(matches!(alice_end, TransferEvent::Cancelled { .. }));
    let (_, bob_end) = until_terminal(&mut p.bob.events, &id).await;
    assert!(matches!(bob_end, TransferEvent::Cancelled { .. }));

    let err = p.bob.session.accept(&handle).await.unwrap_err();
    assert!(matches!(err, TransferError::UnknownTransfer(_)));
}

#[tokio::test]
async fn unanswered_offer_times_out() {
    let alice_config = TransferConfig {
        accept_timeout_ms: 50,
        ..config()
    };
    let mut p = pair_with(
        Faults::default(),
        Faults::default(),
        alice_config,
        config(),
        None,
    );
    let id = p
        .alice
        .session
        .send(OutgoingFile::from_bytes("t", "", payload(10)))
        .unwrap();
    let (_, end) = until_terminal(&mut p.alice.events, &id).await;
    assert!(failure(end).contains("timed out"));
}

#[tokio::test]
async fn unanswered_retry_request_times_out() {
    let alice_faults = Faults {
        drop_once: BTreeSet::from([1]),
        ..Faults::default()
    };
    let bob_faults = Faults {
        drop_retry_requests: true,
        ..Faults::default()
    };
    let bob_config = TransferConfig {
        retry_timeout_ms: 100,
        ..config()
    };
    let mut p = pair_with(alice_faults, bob_faults, config(), bob_config, None);

    let (_, _, bob_end) = transfer(&mut p, &payload(3 * CHUNK as usize)).await;
    assert!(failure(bob_end).contains("timed out"));
    assert!(p.bob.memory.is_empty().await);
}

#[tokio::test]
async fn slow_retry_round_is_not_cut_off_while_chunks_arrive() {
    let alice_faults = Faults {
        drop_once: (0..15).collect(),
        ..Faults::default()
    };
    let alice_config = TransferConfig {
        retry_pacing_ms: 20,
        ..config()
    };
    // The whole round takes about 280 ms; no single gap comes close to
    // the timeout.
    let bob_config = TransferConfig {
        retry_timeout_ms: 150,
        ..config()
    };
    let mut p = pair_with(alice_faults, Faults::default(), alice_config, bob_config, None);
    let data = payload(20 * CHUNK as usize);

    let (_, _, bob_end) = transfer(&mut p, &data).await;
    assert_eq!(received(bob_end).data, data);
    assert_eq!(retry_requests(&p.bob), vec![(0..15).collect::<Vec<u32>>()]);
}

/// Starts a large disk-backed transfer and waits until bob reports progress.
async fn streaming_transfer(p: &mut Pair) -> TransferId {
    let file = OutgoingFile::from_bytes("long.bin", "", payload(2000 * CHUNK as usize));
    let id = p.alice.session.send(file).unwrap();
    let handle = incoming(&mut p.bob.events).await;
    p.bob.session.accept(&handle).await.unwrap();
    loop {
        match next_event(&mut p.bob.events).await {
            TransferEvent::Progress(progress) if progress.transfer_id == id => return id,
            TransferEvent::Completed { .. } | TransferEvent::Failed { .. } => {
                panic!("transfer ended before it could be cancelled")
            }
            _ => {}
        }
    }
}

/// Both sides end cancelled, nothing is left in storage and late frames
/// produce no further events.
async fn assert_cancelled_and_cleaned(p: &mut Pair, id: &TransferId) {
    let (_, bob_end) = until_terminal(&mut p.bob.events, id).await;
    assert!(matches!(bob_end, TransferEvent::Cancelled { .. }), "{bob_end:?}");
    let (_, alice_end) = until_terminal(&mut p.alice.events, id).await;
    assert!(matches!(alice_end, TransferEvent::Cancelled { .. }), "{alice_end:?}");

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = p.bob.events.try_recv() {
        assert_ne!(event.transfer_id(), id, "late event {event:?}");
    }
    assert!(p.bob.session.snapshot(id).is_none());
    assert!(p.alice.session.snapshot(id).is_none());
    assert!(!p._dir.path().join(id.as_str()).exists());
    assert!(p.bob.memory.is_empty().await);
    assert!(
        p.alice
            .channel
            .count(|m| matches!(m, ControlMessage::Chunk(_)))
            < 2000
    );
}

#[tokio::test]
async fn receiver_cancel_mid_stream_stops_both_sides() {
    let mut p = pair(Faults::default(), mobile());
    let id = streaming_transfer(&mut p).await;

    p.bob.session.cancel(&id).await.unwrap();
    assert_cancelled_and_cleaned(&mut p, &id).await;
}

#[tokio::test]
async fn sender_cancel_mid_stream_stops_both_sides() {
    let mut p = pair(Faults::default(), mobile());
    let id = streaming_transfer(&mut p).await;

    p.alice.session.cancel(&id).await.unwrap();
    assert_cancelled_and_cleaned(&mut p, &id).await;
}

#[tokio::test]
async fn file_start_beyond_chunk_index_space_is_refused() {
    let mut p = pair(Faults::default(), config());
    let id = TransferId::from("huge");
    p.bob
        .session
        .on_incoming_request(FileRequest {
            transfer_id: id.clone(),
            name: "huge.bin".into(),
            size: u64::MAX,
            mime_type: String::new(),
        })
        .await;
    let handle = incoming(&mut p.bob.events).await;
    p.bob.session.accept(&handle).await.unwrap();

    let start = ControlMessage::FileStart(FileStart {
        transfer_id: id.clone(),
        name: "huge.bin".into(),
        size: u64::MAX,
        mime_type: String::new(),
        chunk_size: 1,
    });
    p.bob
        .session
        .handle_message(encode_control(&start).unwrap())
        .await
        .unwrap();

    let (_, end) = until_terminal(&mut p.bob.events, &id).await;
    let reason = failure(end);
    assert!(reason.contains("protocol violation"), "{reason}");
    assert!(reason.contains("chunks"), "{reason}");
}

#[tokio::test]
async fn send_on_closed_channel_is_refused() {
    let p = pair(Faults::default(), config());
    p.alice.channel.inner.close();
    let err = p
        .alice
        .session
        .send(OutgoingFile::from_bytes("n", "", vec![1]))
        .unwrap_err();
    assert!(matches!(err, TransferError::ChannelNotOpen));
    assert!(p.alice.channel.sent().is_empty());
    assert!(p.alice.session.transfers().is_empty());
}
