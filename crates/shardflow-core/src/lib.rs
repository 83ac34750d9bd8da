//! # shardflow-core
//!
//! Data model shared by the shardflow consumer library and its gateway
//! implementations: tagged identifier strings, record/batch shapes, shard
//! iterator positions, and the state-store lease snapshot.
//!
//! This crate is deliberately small and dependency-light so gateway
//! implementations (AWS-backed or in-memory) can share it without pulling
//! in the consumer runtime.

pub mod lease;
pub mod types;

pub use lease::{ShardRow, ShardStatus};
pub use types::{
    AppName, Batch, ContinuationToken, IteratorPosition, Record, SequenceNumber, ShardId,
    StreamName, TableName, WorkerId,
};
