//! Engine configuration via `vellum.toml`
//!
//! Every knob of the write pipeline lives here: retry budgets, the shared
//! preparer pool, bulk batching and throttling, and restore parallelism.
//! Missing keys take their defaults, so an empty file is a valid config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use vellum_core::{VellumError, VellumResult, CONFLICT_RETRIES, DB_RETRIES};

/// Config file name placed in the engine data directory.
pub const CONFIG_FILE_NAME: &str = "vellum.toml";

fn default_conflict_retries() -> usize {
    CONFLICT_RETRIES
}

fn default_read_retries() -> usize {
    DB_RETRIES
}

fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_preparer_queue_depth() -> usize {
    64 * 1024
}

fn default_bulk_batch_size() -> usize {
    32
}

fn default_throttle_limit() -> usize {
    16
}

fn default_throttle_signal() -> usize {
    8
}

fn default_dequeue_timeout_ms() -> u64 {
    100
}

fn default_restore_thread_multiplier() -> usize {
    4
}

fn default_progress_interval() -> usize {
    16 * 1024
}

/// Engine configuration loaded from `vellum.toml`.
///
/// # Example
///
/// ```toml
/// conflict_retries = 10
/// bulk_batch_size = 32
/// throttle_limit = 16
/// throttle_signal = 8
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VellumConfig {
    /// Attempts a single-document write makes before a soft conflict is fatal.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: usize,
    /// Extra attempts a document read makes after a concurrent modification.
    #[serde(default = "default_read_retries")]
    pub read_retries: usize,
    /// Worker threads of the shared preparer pool. Defaults to the hardware
    /// concurrency when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preparer_threads: Option<usize>,
    /// Tasks the preparer pool may hold before bulk submissions are rejected.
    #[serde(default = "default_preparer_queue_depth")]
    pub preparer_queue_depth: usize,
    /// Documents per bulk submission.
    #[serde(default = "default_bulk_batch_size")]
    pub bulk_batch_size: usize,
    /// Batches a producer may have in flight before it blocks.
    #[serde(default = "default_throttle_limit")]
    pub throttle_limit: usize,
    /// Permits the consumer hands back at a time.
    #[serde(default = "default_throttle_signal")]
    pub throttle_signal: usize,
    /// How long a consumer waits on an empty queue before re-checking its flags.
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
    /// Restore pool size as a multiple of the hardware concurrency.
    #[serde(default = "default_restore_thread_multiplier")]
    pub restore_thread_multiplier: usize,
    /// Documents between two restore progress lines.
    #[serde(default = "default_progress_interval")]
    pub progress_interval: usize,
}

impl Default for VellumConfig {
    fn default() -> Self {
        Self {
            conflict_retries: default_conflict_retries(),
            read_retries: default_read_retries(),
            preparer_threads: None,
            preparer_queue_depth: default_preparer_queue_depth(),
            bulk_batch_size: default_bulk_batch_size(),
            throttle_limit: default_throttle_limit(),
            throttle_signal: default_throttle_signal(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            restore_thread_multiplier: default_restore_thread_multiplier(),
            progress_interval: default_progress_interval(),
        }
    }
}

impl VellumConfig {
    /// Check the values are usable together.
    ///
    /// # Errors
    ///
    /// Returns a client error naming the first offending key.
    pub fn validate(&self) -> VellumResult<()> {
        let positive = [
            ("conflict_retries", self.conflict_retries),
            ("preparer_queue_depth", self.preparer_queue_depth),
            ("bulk_batch_size", self.bulk_batch_size),
            ("throttle_limit", self.throttle_limit),
            ("throttle_signal", self.throttle_signal),
            ("restore_thread_multiplier", self.restore_thread_multiplier),
            ("progress_interval", self.progress_interval),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(VellumError::client(format!(
                    "Invalid {} in {}: must be greater than zero",
                    key, CONFIG_FILE_NAME
                )));
            }
        }
        if self.dequeue_timeout_ms == 0 {
            return Err(VellumError::client(format!(
                "Invalid dequeue_timeout_ms in {}: must be greater than zero",
                CONFIG_FILE_NAME
            )));
        }
        if self.preparer_threads == Some(0) {
            return Err(VellumError::client(format!(
                "Invalid preparer_threads in {}: must be greater than zero",
                CONFIG_FILE_NAME
            )));
        }
        if self.throttle_signal > self.throttle_limit {
            return Err(VellumError::client(format!(
                "Invalid throttle_signal in {}: {} exceeds throttle_limit {}",
                CONFIG_FILE_NAME, self.throttle_signal, self.throttle_limit
            )));
        }
        Ok(())
    }

    /// Worker threads of the shared preparer pool.
    pub fn preparer_threads(&self) -> usize {
        self.preparer_threads.unwrap_or_else(hardware_concurrency)
    }

    /// Worker threads of a restore pool.
    pub fn restore_threads(&self) -> usize {
        self.restore_thread_multiplier * hardware_concurrency()
    }

    /// Consumer dequeue timeout.
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    /// Processed items between two throttle releases.
    pub fn throttle_interval(&self) -> usize {
        self.throttle_signal * self.bulk_batch_size
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Vellum engine configuration

# Attempts a single-document write makes before a version conflict is fatal.
conflict_retries = 10

# Extra attempts a document read makes when the shard changed underneath it.
read_retries = 3

# Worker threads of the shared bulk preparer pool (default: hardware concurrency).
# preparer_threads = 8

# Tasks the preparer pool may queue before bulk submissions are rejected.
preparer_queue_depth = 65536

# Documents per bulk submission, and batches in flight before producers block.
bulk_batch_size = 32
throttle_limit = 16

# Permits the consumer releases at a time.
throttle_signal = 8

# Consumer wake-up interval in milliseconds.
dequeue_timeout_ms = 100

# Restore pool size, as a multiple of the hardware concurrency.
restore_thread_multiplier = 4

# Documents between two restore progress lines.
progress_interval = 16384
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> VellumResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VellumError::internal(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: VellumConfig = toml::from_str(&content).map_err(|e| {
            VellumError::client(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> VellumResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                VellumError::internal(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> VellumResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VellumError::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            VellumError::internal(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_is_valid() {
        let config = VellumConfig::default();
        config.validate().unwrap();
        assert_eq!(config.conflict_retries, 10);
        assert_eq!(config.throttle_interval(), 256);
        assert_eq!(config.dequeue_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn default_toml_matches_default() {
        let config: VellumConfig = toml::from_str(VellumConfig::default_toml()).unwrap();
        assert_eq!(config, VellumConfig::default());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "").unwrap();

        let config = VellumConfig::from_file(&path).unwrap();
        assert_eq!(config, VellumConfig::default());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config: VellumConfig = toml::from_str("bulk_batch_size = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bulk_batch_size"));
    }

    #[test]
    fn zero_dequeue_timeout_is_rejected() {
        let config: VellumConfig = toml::from_str("dequeue_timeout_ms = 0").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.is_client());
        assert!(err.to_string().contains("dequeue_timeout_ms"));
    }

    #[test]
    fn signal_above_limit_is_rejected() {
        let config: VellumConfig =
            toml::from_str("throttle_limit = 4\nthrottle_signal = 8").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_preparer_threads_is_rejected() {
        let config: VellumConfig = toml::from_str("preparer_threads = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn write_default_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "conflict_retries = 3\n").unwrap();

        VellumConfig::write_default_if_missing(&path).unwrap();

        let config = VellumConfig::from_file(&path).unwrap();
        assert_eq!(config.conflict_retries, 3);
    }

    #[test]
    fn write_to_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = VellumConfig {
            preparer_threads: Some(2),
            bulk_batch_size: 4,
            ..VellumConfig::default()
        };

        config.write_to_file(&path).unwrap();
        assert_eq!(VellumConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    fn unparsable_file_is_client_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "conflict_retries = \"many\"").unwrap();
        assert!(VellumConfig::from_file(&path).unwrap_err().is_client());
    }
}
