//! # shardflow-client
//!
//! Checkpointed, lease-coordinated consumer for partitioned append-only
//! streams.
//!
//! shardflow runs one worker per shard of a stream. Each worker claims a
//! lease row in an external key/value table, pulls records in batches,
//! hands them to your [`Processor`] in sequence order, persists the last
//! processed sequence number, and refreshes a heartbeat so other nodes
//! can tell the shard is being worked. Leases from crashed workers go
//! stale and are taken over, resuming from the last checkpoint.
//!
//! ## Delivery contract
//!
//! - **At-least-once**: a record is redelivered if its worker dies
//!   between processing and checkpointing. No de-duplication is done.
//! - **Per-shard order**: records of one shard reach the processor in
//!   ascending sequence-number order. No ordering across shards.
//! - **Checkpoint before the next fetch**: a worker never fetches batch
//!   N+1 until batch N's checkpoint write is acknowledged.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use shardflow_client::{App, AppConfig, ErrorHandlingMode, Processor};
//! use shardflow_core::Record;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! #[async_trait::async_trait]
//! impl Processor for Printer {
//!     async fn process(&self, record: &Record) -> anyhow::Result<()> {
//!         println!("{}: {:?}", record.sequence_number, record.data);
//!         Ok(())
//!     }
//!
//!     fn error_handling_mode(
//!         &self,
//!         _record: &Record,
//!         _error: &anyhow::Error,
//!     ) -> ErrorHandlingMode {
//!         ErrorHandlingMode::RetryAndSkip { retries: 2 }
//!     }
//! }
//!
//! # async fn example() -> shardflow_client::Result<()> {
//! let app = App::connect(
//!     shardflow_client::aws::AwsSettings::new("us-east-1"),
//!     "orders",
//!     "order-events",
//!     "worker-1",
//!     Arc::new(Printer),
//!     AppConfig::default(),
//! )
//! .await?;
//!
//! // ... run until shutdown
//! app.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Failure handling
//!
//! A failing record consults [`Processor::error_handling_mode`]:
//! [`ErrorHandlingMode::RetryAndSkip`] retries then checkpoints past the
//! record; [`ErrorHandlingMode::RetryAndStop`] retries then parks the
//! shard at the last good record until an operator intervenes or the
//! lease moves. Transient gateway errors are retried internally with
//! exponential backoff; a rejected conditional write means another worker
//! owns the lease and stops the worker cleanly.
//!
//! ## Feature flags
//!
//! - `aws`: Kinesis/DynamoDB gateway implementations and an
//!   `App::connect` constructor wired to the AWS credential chain.

pub mod app;
#[cfg(feature = "aws")]
pub mod aws;
pub mod config;
pub mod error;
pub mod processor;
pub mod retry;
pub mod state_store;
pub mod stream;
pub mod testing;

mod controller;
mod registry;
mod worker;

pub use app::App;
pub use config::{AppConfig, AppConfigBuilder};
pub use error::{Error, Result};
pub use processor::{ErrorHandlingMode, ProcessResult, Processor};
pub use state_store::{StateStore, StateStoreGateway};
pub use stream::{StreamGateway, StreamService};

// Re-export the data model so most applications only need this crate.
pub use shardflow_core::{
    AppName, Batch, ContinuationToken, IteratorPosition, Record, SequenceNumber, ShardId,
    ShardRow, ShardStatus, StreamName, TableName, WorkerId,
};
