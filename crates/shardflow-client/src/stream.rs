//! Stream-service gateway.
//!
//! [`StreamService`] is the seam to the upstream stream service; the
//! library ships an AWS Kinesis implementation behind the `aws` feature
//! and an in-memory fake in [`crate::testing`]. [`StreamGateway`] layers
//! the internal retry policy on top so callers never retry themselves.

use crate::error::Result;
use crate::retry::{retry_transient, RetryConfig};
use async_trait::async_trait;
use shardflow_core::{Batch, ContinuationToken, IteratorPosition, ShardId, StreamName};
use std::sync::Arc;
use tracing::debug;

/// Raw operations against the upstream stream service.
///
/// Implementations must be safe for concurrent use; one handle is shared
/// by every shard worker of an application.
#[async_trait]
pub trait StreamService: Send + Sync {
    /// All currently open shards of `stream`, in the service's order.
    async fn list_shards(&self, stream: &StreamName) -> Result<Vec<ShardId>>;

    /// Obtain an iterator for `shard` positioned at `position`.
    async fn get_iterator(
        &self,
        stream: &StreamName,
        shard: &ShardId,
        position: &IteratorPosition,
    ) -> Result<ContinuationToken>;

    /// Fetch the next batch behind `token`. The returned
    /// [`Batch::next`] is the only legal continuation; `None` means the
    /// shard is closed.
    async fn get_records(&self, token: &ContinuationToken) -> Result<Batch>;
}

/// Retrying wrapper bound to one stream.
#[derive(Clone)]
pub struct StreamGateway {
    service: Arc<dyn StreamService>,
    stream: StreamName,
    retry: RetryConfig,
}

impl StreamGateway {
    pub fn new(service: Arc<dyn StreamService>, stream: StreamName, max_retries: u32) -> Self {
        Self {
            service,
            stream,
            retry: RetryConfig::with_max_retries(max_retries),
        }
    }

    pub fn stream(&self) -> &StreamName {
        &self.stream
    }

    pub async fn list_shards(&self) -> Result<Vec<ShardId>> {
        let shards = retry_transient(&self.retry, || self.service.list_shards(&self.stream)).await?;
        debug!(stream = %self.stream, count = shards.len(), "listed shards");
        Ok(shards)
    }

    pub async fn get_iterator(
        &self,
        shard: &ShardId,
        position: &IteratorPosition,
    ) -> Result<ContinuationToken> {
        debug!(stream = %self.stream, shard = %shard, position = %position, "requesting iterator");
        retry_transient(&self.retry, || {
            self.service.get_iterator(&self.stream, shard, position)
        })
        .await
    }

    pub async fn get_records(&self, token: &ContinuationToken) -> Result<Batch> {
        retry_transient(&self.retry, || self.service.get_records(token)).await
    }
}
