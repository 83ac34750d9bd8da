//! State-store gateway.
//!
//! The external key/value store persists one lease row per shard (owner,
//! last heartbeat, last checkpoint). All writes are conditional on the
//! caller still being the recorded owner; a rejected condition surfaces as
//! [`crate::Error::ConditionalCheckFailed`] and is never retried.

use crate::error::Result;
use crate::retry::{retry_transient, RetryConfig};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use shardflow_core::{SequenceNumber, ShardId, ShardRow, ShardStatus, TableName, WorkerId};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Raw operations against the external key/value store.
///
/// Implementations must be safe for concurrent use and must implement the
/// conditional semantics documented on each method; the in-memory fake in
/// [`crate::testing`] is the reference for those semantics.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create the application's state table if it does not exist and block
    /// until it is ready for reads and writes. Idempotent.
    async fn ensure_table(
        &self,
        table: &TableName,
        read_capacity: u32,
        write_capacity: u32,
    ) -> Result<()>;

    /// Claim the lease for `shard` on behalf of `worker`.
    ///
    /// Succeeds when the row does not exist (creating it) or when the
    /// recorded heartbeat is older than `heartbeat_timeout` (taking the
    /// lease over, preserving `last_checkpoint`). A live row owned by
    /// another worker fails with [`crate::Error::ConditionalCheckFailed`].
    async fn claim_shard(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        now: DateTime<Utc>,
        heartbeat_timeout: ChronoDuration,
    ) -> Result<()>;

    /// Read the lease row for `shard`, if present.
    async fn read_shard(&self, table: &TableName, shard: &ShardId) -> Result<Option<ShardRow>>;

    /// Refresh the heartbeat timestamp. Conditional on `worker` being the
    /// recorded owner.
    async fn update_heartbeat(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Persist `sequence_number` as the shard's checkpoint and refresh the
    /// heartbeat. Conditional on `worker` being the recorded owner.
    async fn update_checkpoint(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        sequence_number: &SequenceNumber,
        now: DateTime<Utc>,
    ) -> Result<()>;
}

/// Retrying wrapper bound to one application's table and worker identity.
#[derive(Clone)]
pub struct StateStoreGateway {
    store: Arc<dyn StateStore>,
    table: TableName,
    worker: WorkerId,
    heartbeat_timeout: ChronoDuration,
    retry: RetryConfig,
}

impl StateStoreGateway {
    pub fn new(
        store: Arc<dyn StateStore>,
        table: TableName,
        worker: WorkerId,
        heartbeat_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            table,
            worker,
            heartbeat_timeout: ChronoDuration::from_std(heartbeat_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(180)),
            retry: RetryConfig::with_max_retries(max_retries),
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub async fn ensure_table(&self, read_capacity: u32, write_capacity: u32) -> Result<()> {
        retry_transient(&self.retry, || {
            self.store
                .ensure_table(&self.table, read_capacity, write_capacity)
        })
        .await
    }

    pub async fn claim_shard(&self, shard: &ShardId) -> Result<()> {
        let outcome = retry_transient(&self.retry, || {
            self.store.claim_shard(
                &self.table,
                &self.worker,
                shard,
                Utc::now(),
                self.heartbeat_timeout,
            )
        })
        .await;
        if outcome.is_ok() {
            debug!(shard = %shard, worker = %self.worker, "claimed shard lease");
        }
        outcome
    }

    /// Read and classify the lease row. `Ok(None)` means no row exists and
    /// the caller must claim first.
    pub async fn read_shard_status(&self, shard: &ShardId) -> Result<Option<ShardStatus>> {
        let row = retry_transient(&self.retry, || self.store.read_shard(&self.table, shard)).await?;
        Ok(row.map(|row| row.status(&self.worker, Utc::now(), self.heartbeat_timeout)))
    }

    pub async fn update_heartbeat(&self, shard: &ShardId) -> Result<()> {
        retry_transient(&self.retry, || {
            self.store
                .update_heartbeat(&self.table, &self.worker, shard, Utc::now())
        })
        .await
    }

    pub async fn update_checkpoint(
        &self,
        shard: &ShardId,
        sequence_number: &SequenceNumber,
    ) -> Result<()> {
        retry_transient(&self.retry, || {
            self.store.update_checkpoint(
                &self.table,
                &self.worker,
                shard,
                sequence_number,
                Utc::now(),
            )
        })
        .await?;
        debug!(shard = %shard, checkpoint = %sequence_number, "checkpoint persisted");
        Ok(())
    }

    /// Heartbeat timeout as configured, for callers that need to bound
    /// their own re-check delays.
    pub fn heartbeat_timeout(&self) -> ChronoDuration {
        self.heartbeat_timeout
    }
}

impl std::fmt::Debug for StateStoreGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStoreGateway")
            .field("table", &self.table)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}
