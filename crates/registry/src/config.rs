//! Registry configuration, loadable from JSON.

use std::time::Duration;

use fireside_data_channel::PeerTransferConfig;
use fireside_http_upload::RetryConfig;
use fireside_transfer::BitrateConfig;
use serde::Deserialize;

/// Settings for every transfer a registry creates.
///
/// Every field is optional in JSON; durations are given in milliseconds.
///
/// ```json
/// {
///   "roomId": "r42",
///   "peer": { "chunkSize": 16000, "chunksPerBlock": 64 },
///   "bitrate": { "windowMs": 10000, "maxSamples": 20, "tickIntervalMs": 1000 },
///   "retry": { "initialDelayMs": 100, "maxDelayMs": 30000, "backoffFactor": 1.5 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Room whose transfer list this registry owns.
    pub room_id: String,
    pub peer: PeerTransferConfig,
    pub bitrate: BitrateSettings,
    pub retry: RetrySettings,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            room_id: "default".into(),
            peer: PeerTransferConfig::default(),
            bitrate: BitrateSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl RegistryConfig {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn bitrate_config(&self) -> BitrateConfig {
        BitrateConfig {
            window: Duration::from_millis(self.bitrate.window_ms),
            max_samples: self.bitrate.max_samples,
            tick_interval: Duration::from_millis(self.bitrate.tick_interval_ms),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_factor: self.retry.backoff_factor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BitrateSettings {
    pub window_ms: u64,
    pub max_samples: usize,
    pub tick_interval_ms: u64,
}

impl Default for BitrateSettings {
    fn default() -> Self {
        let defaults = BitrateConfig::default();
        Self {
            window_ms: defaults.window.as_millis() as u64,
            max_samples: defaults.max_samples,
            tick_interval_ms: defaults.tick_interval.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            initial_delay_ms: defaults.initial_delay.as_millis() as u64,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
        }
    }
}
