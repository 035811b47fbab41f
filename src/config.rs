use std::{path::Path, time::Duration};

use serde::Deserialize;

pub const DEFAULT_ARCHIVE_DIR: &str = "hl7_archives";

pub const DEFAULT_POOL_SIZE: u32 = 8;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

pub const DEFAULT_RETENTION_DAYS: u32 = 365;
pub const DEFAULT_BATCH_SIZE: u32 = 2000;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2000;

/// Number of processed queue items between two resource releases.
pub const DEFAULT_RELEASE_INTERVAL: u64 = 25;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub archive_dir: Option<String>,

    pub pool_size: Option<u32>,
    pub acquire_timeout_ms: Option<u64>,

    pub host: Option<String>,
    pub port: Option<u16>,

    pub retention_days: Option<u32>,
    pub batch_size: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    /// Consecutive recoverable failures tolerated by the migration worker.
    /// Unset means retry until stopped.
    pub max_retries: Option<u32>,

    pub release_interval: Option<u64>,
    pub drain_interval_secs: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("HL7_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("hl7_inbound.db")
    }

    pub fn archive_dir(&self) -> &Path {
        Path::new(
            self.archive_dir
                .as_ref()
                .map(|s| s.as_str())
                .unwrap_or(DEFAULT_ARCHIVE_DIR),
        )
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size.unwrap_or(DEFAULT_POOL_SIZE).max(1)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms.unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_MS))
    }

    pub fn host(&self) -> &str {
        self.host
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("127.0.0.1")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8080)
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS)
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS))
    }

    pub fn release_interval(&self) -> u64 {
        self.release_interval
            .unwrap_or(DEFAULT_RELEASE_INTERVAL)
            .max(1)
    }

    pub fn drain_interval(&self) -> Option<Duration> {
        self.drain_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
