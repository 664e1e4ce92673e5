use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Tuning for [`BitrateTracker`] and its refresh tick.
#[derive(Debug, Clone, PartialEq)]
pub struct BitrateConfig {
    /// Samples older than this are ignored.
    pub window: Duration,
    /// At most this many of the newest samples are considered.
    pub max_samples: usize,
    /// How often owners recompute the estimate.
    pub tick_interval: Duration,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            max_samples: 20,
            tick_interval: Duration::from_secs(1),
        }
    }
}

struct Sample {
    bytes: u64,
    at: Instant,
}

/// Rolling-window throughput estimator.
///
/// Every transferred chunk adds a `(timestamp, size)` sample. On each tick the
/// estimate becomes the byte total of the newest `max_samples` samples that
/// are younger than `window`, divided by the seconds elapsed since the oldest
/// of them.
pub struct BitrateTracker {
    samples: VecDeque<Sample>,
    window: Duration,
    max_samples: usize,
    bitrate: f64,
}

impl BitrateTracker {
    pub fn new(config: &BitrateConfig) -> Self {
        let max_samples = config.max_samples.max(1);
        Self {
            samples: VecDeque::with_capacity(max_samples),
            window: config.window,
            max_samples,
            bitrate: 0.0,
        }
    }

    /// Records `bytes` transferred now.
    pub fn add_sample(&mut self, bytes: u64) {
        self.add_sample_at(bytes, Instant::now());
    }

    /// Records `bytes` transferred at `at`.
    pub fn add_sample_at(&mut self, bytes: u64, at: Instant) {
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { bytes, at });
    }

    /// Recomputes the estimate against the current instant.
    pub fn update(&mut self) -> f64 {
        self.update_at(Instant::now())
    }

    /// Recomputes the estimate as of `now` and returns it in bytes/second.
    pub fn update_at(&mut self, now: Instant) -> f64 {
        let mut recent = self
            .samples
            .iter()
            .filter(|s| now.saturating_duration_since(s.at) < self.window)
            .peekable();

        let Some(oldest) = recent.peek().map(|s| s.at) else {
            self.bitrate = 0.0;
            return 0.0;
        };

        let total: u64 = recent.map(|s| s.bytes).sum();
        let elapsed = now.saturating_duration_since(oldest);
        self.bitrate = if elapsed.is_zero() {
            0.0
        } else {
            total as f64 / elapsed.as_secs_f64()
        };
        self.bitrate
    }

    /// Last computed estimate in bytes/second.
    pub fn bitrate(&self) -> f64 {
        self.bitrate
    }

    /// Number of retained samples.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Drops every sample and zeroes the estimate.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.bitrate = 0.0;
    }
}
