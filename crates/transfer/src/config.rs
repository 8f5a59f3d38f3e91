//! Engine configuration.
//!
//! Every field has a compiled-in default; hosts may override them from TOML:
//!
//! ```toml
//! device_class = "mobile"
//! high_watermark = 1048576
//! accept_timeout_ms = 0   # 0 disables the timeout
//!
//! [chunk_sizes]
//! mobile = 16384
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Class of the local device; drives chunk sizing and backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    /// Small, memory-constrained device.
    Mobile,
    Desktop,
}

/// Chunk sizes per device class and file size band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSizeTable {
    #[serde(default = "default_mobile_chunk")]
    pub mobile: u32,
    #[serde(default = "default_desktop_chunk")]
    pub desktop: u32,
    /// Desktop files above 100 MB.
    #[serde(default = "default_desktop_large_chunk")]
    pub desktop_large: u32,
    /// Desktop files above 500 MB.
    #[serde(default = "default_desktop_huge_chunk")]
    pub desktop_huge: u32,
}

fn default_mobile_chunk() -> u32 {
    16 * 1024
}

fn default_desktop_chunk() -> u32 {
    64 * 1024
}

fn default_desktop_large_chunk() -> u32 {
    128 * 1024
}

fn default_desktop_huge_chunk() -> u32 {
    256 * 1024
}

impl Default for ChunkSizeTable {
    fn default() -> Self {
        Self {
            mobile: default_mobile_chunk(),
            desktop: default_desktop_chunk(),
            desktop_large: default_desktop_large_chunk(),
            desktop_huge: default_desktop_huge_chunk(),
        }
    }
}

/// Errors from loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables shared by the sender and receiver engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_device_class")]
    pub device_class: DeviceClass,

    /// Sending pauses while the channel buffers more than this many bytes.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: usize,

    /// Sending resumes once the channel drains below this many bytes.
    #[serde(default = "default_low_watermark")]
    pub low_watermark: usize,

    #[serde(default)]
    pub chunk_sizes: ChunkSizeTable,

    /// Incoming files above this size go to the disk store.
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,

    /// Allowed difference between received bytes and the announced size.
    #[serde(default = "default_size_tolerance")]
    pub size_tolerance_bytes: u64,

    /// Delay between retransmitted chunks.
    #[serde(default = "default_retry_pacing_ms")]
    pub retry_pacing_ms: u64,

    /// How long a completed sender keeps answering retry requests.
    #[serde(default = "default_sender_grace_ms")]
    pub sender_grace_period_ms: u64,

    /// Minimum time between two progress events.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Minimum progress delta (percent) for files at or below
    /// `progress_bytes_threshold`.
    #[serde(default = "default_progress_min_percent")]
    pub progress_min_percent: f64,

    /// Minimum progress delta (bytes) for files above
    /// `progress_bytes_threshold`.
    #[serde(default = "default_progress_min_bytes")]
    pub progress_min_bytes: u64,

    #[serde(default = "default_progress_bytes_threshold")]
    pub progress_bytes_threshold: u64,

    /// Consecutive retry rounds without progress before the receiver gives up.
    #[serde(default = "default_max_retry_rounds")]
    pub max_retry_rounds: u32,

    /// How long the sender waits for accept/reject (0 = forever).
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,

    /// How long the receiver waits for the next requested chunk during a
    /// retry round (0 = forever). Each arriving chunk restarts the wait.
    #[serde(default = "default_retry_timeout_ms")]
    pub retry_timeout_ms: u64,

    /// Chunk writes a receiver keeps in flight before it stops reading.
    #[serde(default = "default_max_inflight_writes")]
    pub max_inflight_writes: usize,

    /// Root directory of the disk store.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Capacity of the event channel and of each engine's input queue.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_device_class() -> DeviceClass {
    DeviceClass::Desktop
}

fn default_high_watermark() -> usize {
    1024 * 1024
}

fn default_low_watermark() -> usize {
    256 * 1024
}

fn default_large_file_threshold() -> u64 {
    100 * 1024 * 1024
}

fn default_size_tolerance() -> u64 {
    1024
}

fn default_retry_pacing_ms() -> u64 {
    5
}

fn default_sender_grace_ms() -> u64 {
    60_000
}

fn default_progress_interval_ms() -> u64 {
    200
}

fn default_progress_min_percent() -> f64 {
    1.0
}

fn default_progress_min_bytes() -> u64 {
    1024 * 1024
}

fn default_progress_bytes_threshold() -> u64 {
    100 * 1024 * 1024
}

fn default_max_retry_rounds() -> u32 {
    3
}

fn default_accept_timeout_ms() -> u64 {
    120_000
}

fn default_retry_timeout_ms() -> u64 {
    30_000
}

fn default_max_inflight_writes() -> usize {
    32
}

fn default_storage_dir() -> PathBuf {
    std::env::temp_dir().join("peerdrop")
}

fn default_event_capacity() -> usize {
    256
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            device_class: default_device_class(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            chunk_sizes: ChunkSizeTable::default(),
            large_file_threshold: default_large_file_threshold(),
            size_tolerance_bytes: default_size_tolerance(),
            retry_pacing_ms: default_retry_pacing_ms(),
            sender_grace_period_ms: default_sender_grace_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            progress_min_percent: default_progress_min_percent(),
            progress_min_bytes: default_progress_min_bytes(),
            progress_bytes_threshold: default_progress_bytes_threshold(),
            max_retry_rounds: default_max_retry_rounds(),
            accept_timeout_ms: default_accept_timeout_ms(),
            retry_timeout_ms: default_retry_timeout_ms(),
            max_inflight_writes: default_max_inflight_writes(),
            storage_dir: default_storage_dir(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn optional_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TransferConfig {
    /// Parses and validates a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: TransferConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.low_watermark >= self.high_watermark {
            return Err(ConfigError::Invalid(format!(
                "low_watermark ({}) must be below high_watermark ({})",
                self.low_watermark, self.high_watermark
            )));
        }
        let t = &self.chunk_sizes;
        if [t.mobile, t.desktop, t.desktop_large, t.desktop_huge].contains(&0) {
            return Err(ConfigError::Invalid("chunk sizes must be non-zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be non-zero".into()));
        }
        if self.max_inflight_writes == 0 {
            return Err(ConfigError::Invalid("max_inflight_writes must be non-zero".into()));
        }
        Ok(())
    }

    pub fn retry_pacing(&self) -> Duration {
        Duration::from_millis(self.retry_pacing_ms)
    }

    pub fn sender_grace_period(&self) -> Duration {
        Duration::from_millis(self.sender_grace_period_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        optional_ms(self.accept_timeout_ms)
    }

    pub fn retry_timeout(&self) -> Option<Duration> {
        optional_ms(self.retry_timeout_ms)
    }
}
