//! Application configuration.

use crate::error::{Error, Result};
use shardflow_core::{AppName, TableName};
use std::time::Duration;

/// Configuration for a consumer application.
///
/// All knobs have working defaults; construct with [`AppConfig::builder`]
/// and override what you need:
///
/// ```rust
/// use shardflow_client::AppConfig;
/// use std::time::Duration;
///
/// let config = AppConfig::builder()
///     .heartbeat(Duration::from_secs(10))
///     .empty_receive_delay(Duration::from_millis(500))
///     .build()
///     .unwrap();
/// assert_eq!(config.heartbeat, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Provisioned read capacity for the state table, when the store
    /// creates it.
    pub state_store_read_capacity: u32,
    /// Provisioned write capacity for the state table.
    pub state_store_write_capacity: u32,
    /// The state table is named `<app_name><table_suffix>`.
    pub table_suffix: String,
    /// Heartbeat emission period.
    pub heartbeat: Duration,
    /// A lease whose heartbeat is older than this is considered abandoned.
    pub heartbeat_timeout: Duration,
    /// Back-off before the next fetch after an empty batch.
    pub empty_receive_delay: Duration,
    /// Internal retry budget for state-store calls.
    pub max_state_store_retries: u32,
    /// Internal retry budget for stream-service calls.
    pub max_stream_retries: u32,
    /// How often the controller reconciles shard topology.
    pub check_stream_changes_frequency: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            state_store_read_capacity: 10,
            state_store_write_capacity: 10,
            table_suffix: "KinesisState".to_string(),
            heartbeat: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(180),
            empty_receive_delay: Duration::from_secs(3),
            max_state_store_retries: 3,
            max_stream_retries: 3,
            check_stream_changes_frequency: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::new()
    }

    /// Name of the state table backing `app_name`.
    pub fn table_name(&self, app_name: &AppName) -> TableName {
        TableName::new(format!("{}{}", app_name, self.table_suffix))
    }

    /// Reject configurations that cannot work. Invalid settings are
    /// programmer errors and surface synchronously at startup.
    pub fn validate(&self) -> Result<()> {
        if self.table_suffix.is_empty() {
            return Err(Error::config("table_suffix must not be empty"));
        }
        if self.heartbeat.is_zero() {
            return Err(Error::config("heartbeat period must be greater than zero"));
        }
        if self.heartbeat >= self.heartbeat_timeout {
            return Err(Error::config(format!(
                "heartbeat period ({:?}) must be shorter than heartbeat_timeout ({:?})",
                self.heartbeat, self.heartbeat_timeout
            )));
        }
        if self.check_stream_changes_frequency.is_zero() {
            return Err(Error::config(
                "check_stream_changes_frequency must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Builder for [`AppConfig`].
#[derive(Debug, Clone)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl AppConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn state_store_read_capacity(mut self, units: u32) -> Self {
        self.config.state_store_read_capacity = units;
        self
    }

    pub fn state_store_write_capacity(mut self, units: u32) -> Self {
        self.config.state_store_write_capacity = units;
        self
    }

    pub fn table_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.table_suffix = suffix.into();
        self
    }

    pub fn heartbeat(mut self, period: Duration) -> Self {
        self.config.heartbeat = period;
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_timeout = timeout;
        self
    }

    pub fn empty_receive_delay(mut self, delay: Duration) -> Self {
        self.config.empty_receive_delay = delay;
        self
    }

    pub fn max_state_store_retries(mut self, retries: u32) -> Self {
        self.config.max_state_store_retries = retries;
        self
    }

    pub fn max_stream_retries(mut self, retries: u32) -> Self {
        self.config.max_stream_retries = retries;
        self
    }

    pub fn check_stream_changes_frequency(mut self, frequency: Duration) -> Self {
        self.config.check_stream_changes_frequency = frequency;
        self
    }

    pub fn build(self) -> Result<AppConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for AppConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
