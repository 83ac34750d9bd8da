//! Error types for the shardflow consumer.
//!
//! The taxonomy mirrors how failures propagate: transient gateway errors
//! are retried inside the gateways, conditional-check failures concede
//! shard ownership and stop the worker cleanly, and configuration errors
//! are raised synchronously to the caller.

use shardflow_core::{AppName, ShardId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// An application with this name is already running in this process.
    #[error("application '{0}' is already running in this process")]
    AppNameAlreadyRunning(AppName),

    /// State-table bootstrap failed terminally during application startup.
    #[error("initialization failed: {source}")]
    InitializationFailed {
        #[source]
        source: anyhow::Error,
    },

    /// A conditional write was rejected: the state row is owned by another
    /// worker. Recoverable only by conceding ownership.
    #[error("conditional check failed: shard lease is held by another worker")]
    ConditionalCheckFailed,

    /// This worker no longer owns the shard lease.
    #[error("ownership of shard '{0}' was lost")]
    OwnershipLost(ShardId),

    /// Transient stream-service error; retried up to `max_stream_retries`.
    #[error("stream service error: {0}")]
    TransientStream(String),

    /// Transient state-store error; retried up to `max_state_store_retries`.
    #[error("state store error: {0}")]
    TransientStateStore(String),

    /// The upstream closed this shard (split/merge); no further records.
    #[error("shard '{0}' was closed by the upstream service")]
    ShardClosed(ShardId),

    /// Invalid configuration or arguments; raised synchronously.
    #[error("configuration error: {0}")]
    Config(String),

    /// The controller or a worker is shutting down.
    #[error("shutting down")]
    Shutdown,
}

impl Error {
    pub fn transient_stream(msg: impl Into<String>) -> Self {
        Self::TransientStream(msg.into())
    }

    pub fn transient_state_store(msg: impl Into<String>) -> Self {
        Self::TransientStateStore(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn initialization(source: impl Into<anyhow::Error>) -> Self {
        Self::InitializationFailed {
            source: source.into(),
        }
    }

    /// Whether the operation may succeed if retried after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStream(_) | Self::TransientStateStore(_))
    }

    /// Whether this failure means the shard lease belongs to someone else.
    pub fn is_ownership_loss(&self) -> bool {
        matches!(self, Self::ConditionalCheckFailed | Self::OwnershipLost(_))
    }
}
