//! Loopback demo: two sessions in one process, joined by a memory channel.
//!
//! Without a file argument a pseudo-random payload is generated.

mod app;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use peerdrop_transfer::TransferConfig;
use tracing_subscriber::EnvFilter;

/// Sends one file between two in-process PeerDrop sessions.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML file with transfer settings.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// File to send.
    file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            TransferConfig::from_toml_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => TransferConfig::default(),
    };
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        device_class = ?config.device_class,
        "starting loopback transfer"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let digests = rt.block_on(app::run(config, args.file))?;

    println!("sent:     {}", digests.sent);
    println!("received: {}", digests.received);
    anyhow::ensure!(digests.sent == digests.received, "digest mismatch");
    Ok(())
}
