//! Wires two sessions together and drives one transfer to completion.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use peerdrop_transfer::{
    MemoryChannel, OutgoingFile, ProgressPhase, ReceivedFile, SessionManager, TransferConfig,
    TransferEvent, checksum_bytes,
};

const GENERATED_LEN: usize = 8 * 1024 * 1024 + 123;
const INBOUND_CAPACITY: usize = 256;
const FILLER_SEED: u64 = 0x5045_4552_4452_4f50;

pub struct Digests {
    pub sent: String,
    pub received: String,
}

pub async fn run(config: TransferConfig, file: Option<PathBuf>) -> anyhow::Result<Digests> {
    let ((a, a_inbound), (b, b_inbound)) = MemoryChannel::pair(INBOUND_CAPACITY);
    let (alice, alice_events) = SessionManager::new(Arc::new(a), config.clone());
    let (bob, bob_events) = SessionManager::new(Arc::new(b), config);

    let alice_pump = {
        let alice = alice.clone();
        tokio::spawn(async move { alice.run(a_inbound).await })
    };
    let bob_pump = {
        let bob = bob.clone();
        tokio::spawn(async move { bob.run(b_inbound).await })
    };

    let (outgoing, sent) = match file {
        Some(path) => {
            let outgoing = OutgoingFile::from_path(&path, None)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            let data = tokio::fs::read(&path).await?;
            (outgoing, checksum_bytes(&data))
        }
        None => {
            let data = generate(GENERATED_LEN);
            let sent = checksum_bytes(&data);
            let outgoing = OutgoingFile::from_bytes("loopback.bin", "application/octet-stream", data);
            (outgoing, sent)
        }
    };

    let sender = tokio::spawn(watch_sender(alice_events));
    let transfer_id = alice.send(outgoing)?;
    info!(%transfer_id, "offer sent");

    let received = receive(&bob, bob_events).await?;
    sender.await??;

    alice_pump.abort();
    bob_pump.abort();
    Ok(Digests {
        sent,
        received: received.sha256,
    })
}

/// Accepts the first offer and waits for the file.
async fn receive(
    bob: &SessionManager,
    mut events: mpsc::Receiver<TransferEvent>,
) -> anyhow::Result<ReceivedFile> {
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::IncomingRequest(handle) => {
                info!(name = %handle.name, size = handle.size, "accepting offer");
                bob.accept(&handle).await?;
            }
            TransferEvent::Progress(p) => log_progress("receive", p.phase, p.percent, p.speed_bps),
            TransferEvent::StatusChanged { status, .. } => debug!(?status, "receiver status"),
            TransferEvent::Completed {
                file: Some(file), ..
            } => {
                info!(name = %file.name, size = file.size, "file received");
                return Ok(file);
            }
            TransferEvent::Completed { file: None, .. } => {}
            TransferEvent::Failed { reason, .. } => anyhow::bail!("receive failed: {reason}"),
            TransferEvent::Cancelled { .. } => anyhow::bail!("receive cancelled"),
        }
    }
    anyhow::bail!("receiver session closed")
}

async fn watch_sender(mut events: mpsc::Receiver<TransferEvent>) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Progress(p) => log_progress("send", p.phase, p.percent, p.speed_bps),
            TransferEvent::StatusChanged { status, .. } => debug!(?status, "sender status"),
            TransferEvent::Completed { .. } => return Ok(()),
            TransferEvent::Failed { reason, .. } => anyhow::bail!("send failed: {reason}"),
            TransferEvent::Cancelled { .. } => anyhow::bail!("send cancelled"),
            TransferEvent::IncomingRequest(handle) => {
                warn!(transfer_id = %handle.transfer_id, "unexpected offer on sending side");
            }
        }
    }
    anyhow::bail!("sender session closed")
}

fn log_progress(side: &str, phase: ProgressPhase, percent: f64, speed_bps: f64) {
    match phase {
        ProgressPhase::Primary => {
            let percent = (percent * 10.0).round() / 10.0;
            info!(side, percent, speed_bps = speed_bps as u64, "progress");
        }
        ProgressPhase::Retry { done, total } => info!(side, done, total, "retry progress"),
    }
}

/// Deterministic filler so repeated runs produce the same digest.
fn generate(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(FILLER_SEED).fill_bytes(&mut data);
    data
}
