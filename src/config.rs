//! Large-object engine configuration.
//!
//! Defaults can be overridden from the environment with [`EngineConfig::from_env`].
//! Unset or unparsable variables keep their default.
//!
//! # Environment Variables
//!
//! | Field | Variable | Default |
//! |-------|----------|---------|
//! | `split_large_objects` | `FERROMPI_SERDE_SPLIT` | `true` |
//! | `buffer_size` | `FERROMPI_SERDE_BUFFER_SIZE` | 16 MiB |
//! | `workers` | `FERROMPI_SERDE_WORKERS` | 16 |
//! | `stale_report_interval` | `FERROMPI_SERDE_STALE_SECS` | 60 |
//!
//! The split flag and the buffer size are part of the wire protocol: every
//! process in a communicator must use the same values.

use std::env;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default chunk size for the streamed tier.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Default number of background workers.
pub const DEFAULT_WORKERS: usize = 16;

/// Default interval between stale-batch reports.
pub const DEFAULT_STALE_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Tuning knobs for serialized transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Stream serialized values in `buffer_size` chunks instead of one message.
    pub split_large_objects: bool,
    /// Chunk size in bytes for the streamed tier.
    pub buffer_size: usize,
    /// Number of background workers, split between send and receive queues.
    pub workers: usize,
    /// How long a batch may run before outstanding transfers are logged.
    pub stale_report_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            split_large_objects: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            workers: DEFAULT_WORKERS,
            stale_report_interval: DEFAULT_STALE_REPORT_INTERVAL,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the defaults and the `FERROMPI_SERDE_*` variables.
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        EngineConfig {
            split_large_objects: env_flag("FERROMPI_SERDE_SPLIT")
                .unwrap_or(defaults.split_large_objects),
            buffer_size: env_parse("FERROMPI_SERDE_BUFFER_SIZE").unwrap_or(defaults.buffer_size),
            workers: env_parse("FERROMPI_SERDE_WORKERS").unwrap_or(defaults.workers),
            stale_report_interval: env_parse("FERROMPI_SERDE_STALE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_report_interval),
        }
    }

    /// Enable or disable chunked streaming.
    pub fn with_split_large_objects(mut self, split: bool) -> Self {
        self.split_large_objects = split;
        self
    }

    /// Set the chunk size in bytes.
    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Set the number of background workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the stale-batch report interval.
    pub fn with_stale_report_interval(mut self, interval: Duration) -> Self {
        self.stale_report_interval = interval;
        self
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::Config("buffer_size must be positive".into()));
        }
        if self.workers < 2 {
            return Err(Error::Config(format!(
                "at least 2 workers are required (one send, one receive), got {}",
                self.workers
            )));
        }
        if self.stale_report_interval.is_zero() {
            return Err(Error::Config(
                "stale_report_interval must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Workers serving the send queue; the rest serve receives.
    pub(crate) fn send_workers(&self) -> usize {
        (self.workers / 2).max(1)
    }

    /// Workers serving the receive queue.
    pub(crate) fn receive_workers(&self) -> usize {
        self.workers.saturating_sub(self.send_workers()).max(1)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|s| match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert!(config.split_large_objects);
        assert_eq!(config.buffer_size, 16 * 1024 * 1024);
        assert_eq!(config.workers, 16);
        assert_eq!(config.stale_report_interval, Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn builders_chain() {
        let config = EngineConfig::default()
            .with_split_large_objects(false)
            .with_buffer_size(64)
            .with_workers(4)
            .with_stale_report_interval(Duration::from_millis(10));
        assert!(!config.split_large_objects);
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.send_workers(), 2);
        assert_eq!(config.receive_workers(), 2);
    }

    #[test]
    fn odd_worker_counts_favor_receives() {
        let config = EngineConfig::default().with_workers(5);
        assert_eq!(config.send_workers(), 2);
        assert_eq!(config.receive_workers(), 3);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(EngineConfig::default().with_buffer_size(0).validate().is_err());
        let err = EngineConfig::default().with_workers(1).validate().unwrap_err();
        assert!(format!("{err}").contains("at least 2 workers"), "got: {err}");
        assert!(EngineConfig::default()
            .with_stale_report_interval(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn flag_parsing_accepts_common_spellings() {
        // Unique names so parallel tests never race on the same variable.
        env::set_var("FERROMPI_SERDE_TEST_FLAG_ON", "Yes");
        env::set_var("FERROMPI_SERDE_TEST_FLAG_OFF", "0");
        env::set_var("FERROMPI_SERDE_TEST_FLAG_BAD", "maybe");
        assert_eq!(env_flag("FERROMPI_SERDE_TEST_FLAG_ON"), Some(true));
        assert_eq!(env_flag("FERROMPI_SERDE_TEST_FLAG_OFF"), Some(false));
        assert_eq!(env_flag("FERROMPI_SERDE_TEST_FLAG_BAD"), None);
        assert_eq!(env_flag("FERROMPI_SERDE_TEST_FLAG_UNSET"), None);
    }

    #[test]
    fn numeric_parsing_ignores_garbage() {
        env::set_var("FERROMPI_SERDE_TEST_NUM", " 128 ");
        env::set_var("FERROMPI_SERDE_TEST_NUM_BAD", "lots");
        assert_eq!(env_parse::<usize>("FERROMPI_SERDE_TEST_NUM"), Some(128));
        assert_eq!(env_parse::<usize>("FERROMPI_SERDE_TEST_NUM_BAD"), None);
    }
}
