//! Shard lease snapshot and status classification.
//!
//! The state table holds one row per shard. The row records the current
//! owner, the owner's last heartbeat, and the highest checkpointed
//! sequence number. [`ShardStatus`] is the derived view a worker dispatches
//! on during initialization.

use crate::types::{SequenceNumber, ShardId, WorkerId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One row of the state table, as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRow {
    pub shard_id: ShardId,
    /// Current owner. Conditional updates are keyed on this value.
    pub worker_id: WorkerId,
    /// Timestamp of the owner's most recent heartbeat or checkpoint.
    pub last_heartbeat: DateTime<Utc>,
    /// Highest sequence number whose processing completed, if any.
    pub last_checkpoint: Option<SequenceNumber>,
}

impl ShardRow {
    /// Classify this row from the point of view of `caller` at `now`.
    ///
    /// - owner == caller and never checkpointed: the row was just created
    ///   by this worker, [`ShardStatus::New`].
    /// - heartbeat within `heartbeat_timeout`: the owner is live,
    ///   [`ShardStatus::Processing`].
    /// - otherwise the lease is stale, [`ShardStatus::NotProcessing`].
    pub fn status(
        &self,
        caller: &WorkerId,
        now: DateTime<Utc>,
        heartbeat_timeout: Duration,
    ) -> ShardStatus {
        if self.last_checkpoint.is_none() && self.worker_id == *caller {
            return ShardStatus::New {
                worker: self.worker_id.clone(),
                created_at: self.last_heartbeat,
            };
        }
        if self.is_live(now, heartbeat_timeout) {
            ShardStatus::Processing {
                worker: self.worker_id.clone(),
                checkpoint: self.last_checkpoint.clone(),
            }
        } else {
            ShardStatus::NotProcessing {
                worker: self.worker_id.clone(),
                heartbeat_at: self.last_heartbeat,
                checkpoint: self.last_checkpoint.clone(),
            }
        }
    }

    /// Whether the owner's heartbeat is within `heartbeat_timeout` of `now`.
    pub fn is_live(&self, now: DateTime<Utc>, heartbeat_timeout: Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat) < heartbeat_timeout
    }
}

/// Derived state of a shard lease. See [`ShardRow::status`] for the
/// classification rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardStatus {
    /// Row exists, created by this worker, never checkpointed.
    New {
        worker: WorkerId,
        created_at: DateTime<Utc>,
    },
    /// Row claimed and the owner heartbeated recently.
    Processing {
        worker: WorkerId,
        checkpoint: Option<SequenceNumber>,
    },
    /// Row claimed but the owner's heartbeat is stale; the lease may be
    /// taken over.
    NotProcessing {
        worker: WorkerId,
        heartbeat_at: DateTime<Utc>,
        checkpoint: Option<SequenceNumber>,
    },
}

impl ShardStatus {
    /// The worker recorded as owner in the underlying row.
    pub fn worker(&self) -> &WorkerId {
        match self {
            Self::New { worker, .. }
            | Self::Processing { worker, .. }
            | Self::NotProcessing { worker, .. } => worker,
        }
    }

    /// The recorded checkpoint, if the shard has ever been checkpointed.
    pub fn checkpoint(&self) -> Option<&SequenceNumber> {
        match self {
            Self::New { .. } => None,
            Self::Processing { checkpoint, .. } | Self::NotProcessing { checkpoint, .. } => {
                checkpoint.as_ref()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(worker: &str, age_secs: i64, checkpoint: Option<&str>) -> (ShardRow, DateTime<Utc>) {
        let now = Utc::now();
        let row = ShardRow {
            shard_id: ShardId::from("shard-0"),
            worker_id: WorkerId::from(worker),
            last_heartbeat: now - Duration::seconds(age_secs),
            last_checkpoint: checkpoint.map(SequenceNumber::from),
        };
        (row, now)
    }

    const TIMEOUT_SECS: i64 = 180;

    #[test]
    fn own_row_without_checkpoint_is_new() {
        let (row, now) = row("me", 0, None);
        let status = row.status(&WorkerId::from("me"), now, Duration::seconds(TIMEOUT_SECS));
        assert!(matches!(status, ShardStatus::New { .. }));
    }

    #[test]
    fn fresh_heartbeat_is_processing() {
        let (row, now) = row("other", 10, Some("42"));
        let status = row.status(&WorkerId::from("me"), now, Duration::seconds(TIMEOUT_SECS));
        match status {
            ShardStatus::Processing { worker, checkpoint } => {
                assert_eq!(worker, WorkerId::from("other"));
                assert_eq!(checkpoint, Some(SequenceNumber::from("42")));
            }
            other => panic!("expected Processing, got {other:?}"),
        }
    }

    #[test]
    fn stale_heartbeat_is_not_processing() {
        let (row, now) = row("other", TIMEOUT_SECS + 1, Some("42"));
        let status = row.status(&WorkerId::from("me"), now, Duration::seconds(TIMEOUT_SECS));
        assert!(matches!(status, ShardStatus::NotProcessing { .. }));
    }

    #[test]
    fn someone_elses_uncheckpointed_row_is_not_new() {
        // New is reserved for the caller's own fresh claim; a foreign row
        // without a checkpoint still classifies by heartbeat age.
        let (row, now) = row("other", 0, None);
        let status = row.status(&WorkerId::from("me"), now, Duration::seconds(TIMEOUT_SECS));
        assert!(matches!(status, ShardStatus::Processing { .. }));
    }

    #[test]
    fn heartbeat_exactly_at_timeout_is_stale() {
        let (row, now) = row("other", TIMEOUT_SECS, Some("7"));
        let status = row.status(&WorkerId::from("me"), now, Duration::seconds(TIMEOUT_SECS));
        assert!(matches!(status, ShardStatus::NotProcessing { .. }));
    }
}
