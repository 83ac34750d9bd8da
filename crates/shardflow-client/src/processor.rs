//! The user-supplied record processor capability set.

use async_trait::async_trait;
use shardflow_core::{Record, SequenceNumber};

/// How the worker reacts when [`Processor::process`] keeps failing on a
/// record after the allotted retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandlingMode {
    /// Retry up to `retries` more times, then checkpoint past the record
    /// and continue with the next one.
    RetryAndSkip { retries: u32 },
    /// Retry up to `retries` more times, then stop this shard at the last
    /// successful record. The failing record recurs on the next fetch.
    RetryAndStop { retries: u32 },
}

impl ErrorHandlingMode {
    /// Additional attempts after the first failure.
    pub fn retries(&self) -> u32 {
        match self {
            Self::RetryAndSkip { retries } | Self::RetryAndStop { retries } => *retries,
        }
    }

    /// Whether the record is skipped (checkpointed past) once retries are
    /// exhausted.
    pub fn skips(&self) -> bool {
        matches!(self, Self::RetryAndSkip { .. })
    }
}

impl std::fmt::Display for ErrorHandlingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetryAndSkip { retries } => write!(f, "retry-and-skip({retries})"),
            Self::RetryAndStop { retries } => write!(f, "retry-and-stop({retries})"),
        }
    }
}

/// Outcome of one record's processing, as reported through the worker's
/// event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult {
    Success(SequenceNumber),
    Failure(SequenceNumber, String),
}

/// A record handler supplied by the application.
///
/// `process` runs on the worker's task: a slow processor applies
/// backpressure to its own shard only. Records of one shard are delivered
/// in ascending sequence-number order, at least once.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Handle one record. Returning an error engages the retry policy
    /// chosen by [`Processor::error_handling_mode`].
    async fn process(&self, record: &Record) -> anyhow::Result<()>;

    /// Pick the retry/skip/stop policy for a failed record. Consulted once
    /// per record on its first failure.
    fn error_handling_mode(&self, record: &Record, error: &anyhow::Error) -> ErrorHandlingMode;

    /// Called after the final retry of a record has failed, just before
    /// the mode's skip/stop action is taken. Panics raised here are
    /// swallowed and logged.
    fn on_max_retry_exceeded(&self, record: &Record, mode: ErrorHandlingMode) {
        let _ = (record, mode);
    }
}
