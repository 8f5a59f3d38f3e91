use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::TransferConfig;

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.unwrap_or(100),
            window_size: window_size.unwrap_or(Duration::from_secs(5)),
        }
    }

    /// Records `bytes` moved at `now`.
    pub fn add_sample(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back(SpeedSample {
            bytes,
            timestamp: now,
        });

        // Prune samples outside the window.
        while self
            .samples
            .front()
            .is_some_and(|s| now.duration_since(s.timestamp) > self.window_size)
        {
            self.samples.pop_front();
        }

        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        if self.samples.len() < 2 {
            return 0.0;
        }
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        // The first sample only anchors the window start.
        let total: u64 = self.samples.iter().skip(1).map(|s| s.bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }
}

// ---------------------------------------------------------------------------
// ProgressThrottle
// ---------------------------------------------------------------------------

/// Decides whether a progress update is worth emitting.
///
/// An update passes only when both the minimum interval has elapsed and the
/// minimum delta has accumulated. The delta is a percentage for files up to
/// `bytes_threshold` and an absolute byte count above it.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    total: u64,
    interval: Duration,
    min_percent: f64,
    min_bytes: u64,
    bytes_threshold: u64,
    last_at: Option<Instant>,
    last_bytes: u64,
}

impl ProgressThrottle {
    pub fn new(total: u64, config: &TransferConfig) -> Self {
        Self {
            total,
            interval: config.progress_interval(),
            min_percent: config.progress_min_percent,
            min_bytes: config.progress_min_bytes,
            bytes_threshold: config.progress_bytes_threshold,
            last_at: None,
            last_bytes: 0,
        }
    }

    /// Returns `true` and records the update if it should be emitted.
    pub fn admit(&mut self, done: u64, now: Instant) -> bool {
        let interval_ok = self
            .last_at
            .is_none_or(|at| now.duration_since(at) >= self.interval);
        if !interval_ok {
            return false;
        }
        let delta = done.saturating_sub(self.last_bytes);
        let delta_ok = if self.total > self.bytes_threshold {
            delta >= self.min_bytes
        } else if self.total == 0 {
            true
        } else {
            delta as f64 * 100.0 / self.total as f64 >= self.min_percent
        };
        if delta_ok {
            self.mark(done, now);
        }
        delta_ok
    }

    /// Records an update emitted regardless of the thresholds.
    pub fn mark(&mut self, done: u64, now: Instant) {
        self.last_at = Some(now);
        self.last_bytes = done;
    }
}

// ---------------------------------------------------------------------------
// ProgressMeter
// ---------------------------------------------------------------------------

/// Values of one emitted progress update.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub percent: f64,
    pub speed_bps: f64,
    pub eta_seconds: Option<f64>,
}

/// Speed tracking plus throttling for one transfer pass.
///
/// Reported byte counts never decrease.
pub struct ProgressMeter {
    total: u64,
    done: u64,
    throttle: ProgressThrottle,
    speed: SpeedCalculator,
    finished: bool,
}

impl ProgressMeter {
    pub fn new(total: u64, config: &TransferConfig) -> Self {
        let mut speed = SpeedCalculator::new(None, None);
        speed.add_sample(0, Instant::now());
        Self {
            total,
            done: 0,
            throttle: ProgressThrottle::new(total, config),
            speed,
            finished: false,
        }
    }

    /// Records that `done` bytes are now complete and returns an update if
    /// one is due. Reaching `total` always produces an update, once.
    pub fn record(&mut self, done: u64) -> Option<ProgressSample> {
        let now = Instant::now();
        let done = done.min(self.total);
        if done > self.done {
            self.speed.add_sample(done - self.done, now);
            self.done = done;
        }
        if self.done >= self.total {
            return self.finish();
        }
        self.throttle.admit(self.done, now).then(|| self.sample())
    }

    /// Forces the final update if it has not been emitted yet.
    pub fn finish(&mut self) -> Option<ProgressSample> {
        if self.finished {
            return None;
        }
        self.finished = true;
        self.done = self.total;
        self.throttle.mark(self.done, Instant::now());
        Some(self.sample())
    }

    pub fn bytes_done(&self) -> u64 {
        self.done
    }

    fn sample(&self) -> ProgressSample {
        let percent = if self.total == 0 {
            100.0
        } else {
            self.done as f64 * 100.0 / self.total as f64
        };
        ProgressSample {
            bytes_done: self.done,
            bytes_total: self.total,
            percent,
            speed_bps: self.speed.bytes_per_second(),
            eta_seconds: self
                .speed
                .eta(self.total - self.done)
                .map(|d| d.as_secs_f64()),
        }
    }
}
