//! Global streaming configuration: bus parameters and async-write tuning.
//!
//! Loaded from `streaming.yaml` at the instances root, overridable through
//! environment variables. Precedence: environment > file > defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

pub const STREAMING_FILE: &str = "streaming.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub bus: BusConfig,
    pub async_write: AsyncWriteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Prefix applied to every channel name.
    pub namespace: String,
    /// Ring size of each channel; slow subscribers past this skip messages.
    pub channel_capacity: usize,
    /// High-water mark for distinct live channels; exceeding it only warns.
    pub max_channels: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            namespace: "claude".to_string(),
            channel_capacity: 256,
            max_channels: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncWriteConfig {
    /// Records buffered before an immediate flush.
    pub batch_size: usize,
    /// Seconds between timed flushes of a non-empty buffer.
    pub flush_interval: f64,
}

impl Default for AsyncWriteConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_interval: 1.0,
        }
    }
}

impl AsyncWriteConfig {
    pub fn flush_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval.max(0.01))
    }
}

impl StreamingConfig {
    /// Load `streaming.yaml` from the given directory and apply environment
    /// overrides. A missing file falls back to defaults; a malformed file
    /// is logged and ignored.
    pub fn resolve(root: &Path) -> Self {
        let mut config = match Self::load_file(&root.join(STREAMING_FILE)) {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(e) => {
                warn!(error = %e, "Failed to load streaming config, using defaults");
                Self::default()
            }
        };
        config.apply_env();
        config
    }

    fn load_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml_bw::from_str(&content)?;
        debug!(path = %path.display(), "Loaded streaming config");
        Ok(Some(config))
    }

    fn apply_env(&mut self) {
        if let Some(namespace) = env_var("BUS_NAMESPACE") {
            self.bus.namespace = namespace;
        }
        if let Some(capacity) = env_parsed("BUS_CHANNEL_CAPACITY") {
            self.bus.channel_capacity = capacity;
        }
        if let Some(max_channels) = env_parsed("BUS_MAX_CHANNELS") {
            self.bus.max_channels = max_channels;
        }
        if let Some(batch_size) = env_parsed("ASYNC_WRITE_BATCH_SIZE") {
            self.async_write.batch_size = batch_size;
        }
        if let Some(interval) = env_parsed::<f64>("ASYNC_WRITE_FLUSH_INTERVAL") {
            self.async_write.flush_interval = interval;
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    match env_var(name) {
        Some(raw) => match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(var = name, value = %raw, "Ignoring unparseable environment override");
                None
            }
        },
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamingConfig::default();
        assert_eq!(config.bus.namespace, "claude");
        assert_eq!(config.bus.channel_capacity, 256);
        assert_eq!(config.async_write.batch_size, 10);
        assert!((config.async_write.flush_interval - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_resolve_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = StreamingConfig::resolve(dir.path());
        assert_eq!(config.async_write.batch_size, 10);
    }

    #[test]
    fn test_resolve_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(STREAMING_FILE),
            "bus:\n  namespace: test\nasync_write:\n  batch_size: 3\n  flush_interval: 0.2\n",
        )
        .unwrap();

        let config = StreamingConfig::resolve(dir.path());
        assert_eq!(config.bus.namespace, "test");
        assert_eq!(config.async_write.batch_size, 3);
        assert!((config.async_write.flush_interval - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn test_flush_interval_floor() {
        let config = AsyncWriteConfig {
            batch_size: 1,
            flush_interval: 0.0,
        };
        assert!(config.flush_interval_duration() >= Duration::from_millis(10));
    }
}
