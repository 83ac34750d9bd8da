//! In-memory fakes for testing consumers without external services.
//!
//! [`MockStreamService`] scripts shard topology and record batches;
//! [`MemoryStateStore`] implements the state table's conditional-write
//! semantics and records every checkpoint for invariant assertions;
//! [`ScriptedProcessor`] fails chosen records with chosen policies.
//!
//! # Example
//!
//! ```rust,ignore
//! let stream = MockStreamService::new();
//! stream.add_shard("shard-0", vec![Record::new("a", "1", "x")]);
//! stream.close_shard(&ShardId::from("shard-0"));
//!
//! let store = MemoryStateStore::new();
//! let processor = ScriptedProcessor::succeeding();
//! // drive a worker or an app against the fakes...
//! ```

use crate::error::{Error, Result};
use crate::processor::{ErrorHandlingMode, Processor};
use crate::state_store::StateStore;
use crate::stream::StreamService;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use shardflow_core::{
    Batch, ContinuationToken, IteratorPosition, Record, SequenceNumber, ShardId, ShardRow,
    StreamName, TableName, WorkerId,
};
use std::collections::HashMap;

// ============================================================================
// Mock stream service
// ============================================================================

#[derive(Debug, Default)]
struct ShardData {
    records: Vec<Record>,
    closed: bool,
}

/// Scriptable in-memory stream service.
///
/// Iterator tokens encode `shard#offset`; a fetch returns up to
/// `batch_size` records from the offset. An open shard at its tip returns
/// empty batches with a live continuation, a closed shard returns a final
/// batch with no continuation.
pub struct MockStreamService {
    shards: Mutex<Vec<ShardId>>,
    data: Mutex<HashMap<ShardId, ShardData>>,
    batch_size: Mutex<usize>,
    /// Next N get_records calls fail with a transient error.
    records_faults: Mutex<u32>,
    list_calls: Mutex<u32>,
    fetch_log: Mutex<Vec<ContinuationToken>>,
    iterator_log: Mutex<Vec<(ShardId, IteratorPosition)>>,
}

impl Default for MockStreamService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStreamService {
    pub fn new() -> Self {
        Self {
            shards: Mutex::new(Vec::new()),
            data: Mutex::new(HashMap::new()),
            batch_size: Mutex::new(10),
            records_faults: Mutex::new(0),
            list_calls: Mutex::new(0),
            fetch_log: Mutex::new(Vec::new()),
            iterator_log: Mutex::new(Vec::new()),
        }
    }

    /// Register a shard with its initial records.
    pub fn add_shard(&self, shard: impl Into<ShardId>, records: Vec<Record>) {
        let shard = shard.into();
        self.shards.lock().push(shard.clone());
        self.data.lock().insert(
            shard,
            ShardData {
                records,
                closed: false,
            },
        );
    }

    /// Replace the visible shard topology (existing shard data is kept).
    pub fn set_shards(&self, shards: Vec<ShardId>) {
        let mut data = self.data.lock();
        for shard in &shards {
            data.entry(shard.clone()).or_default();
        }
        *self.shards.lock() = shards;
    }

    /// Append records to a shard's tail.
    pub fn push_records(&self, shard: &ShardId, records: Vec<Record>) {
        if let Some(data) = self.data.lock().get_mut(shard) {
            data.records.extend(records);
        }
    }

    /// Mark a shard closed: once drained, fetches return no continuation.
    pub fn close_shard(&self, shard: &ShardId) {
        if let Some(data) = self.data.lock().get_mut(shard) {
            data.closed = true;
        }
    }

    pub fn set_batch_size(&self, size: usize) {
        *self.batch_size.lock() = size.max(1);
    }

    /// Fail the next `n` `get_records` calls with a transient error.
    pub fn fail_next_fetches(&self, n: u32) {
        *self.records_faults.lock() = n;
    }

    pub fn list_calls(&self) -> u32 {
        *self.list_calls.lock()
    }

    /// Every token passed to `get_records`, in order.
    pub fn fetch_log(&self) -> Vec<ContinuationToken> {
        self.fetch_log.lock().clone()
    }

    /// Every iterator request, in order.
    pub fn iterator_log(&self) -> Vec<(ShardId, IteratorPosition)> {
        self.iterator_log.lock().clone()
    }

    fn token(shard: &ShardId, offset: usize) -> ContinuationToken {
        ContinuationToken::new(format!("{shard}#{offset}"))
    }

    fn parse_token(token: &ContinuationToken) -> Option<(ShardId, usize)> {
        let (shard, offset) = token.as_str().rsplit_once('#')?;
        Some((ShardId::from(shard), offset.parse().ok()?))
    }

    fn numeric(seq: &SequenceNumber) -> Option<u128> {
        seq.as_str().parse().ok()
    }
}

#[async_trait]
impl StreamService for MockStreamService {
    async fn list_shards(&self, _stream: &StreamName) -> Result<Vec<ShardId>> {
        *self.list_calls.lock() += 1;
        Ok(self.shards.lock().clone())
    }

    async fn get_iterator(
        &self,
        _stream: &StreamName,
        shard: &ShardId,
        position: &IteratorPosition,
    ) -> Result<ContinuationToken> {
        self.iterator_log
            .lock()
            .push((shard.clone(), position.clone()));
        let data = self.data.lock();
        let records = &data
            .get(shard)
            .ok_or_else(|| Error::transient_stream(format!("unknown shard {shard}")))?
            .records;

        let offset = match position {
            IteratorPosition::TrimHorizon => 0,
            IteratorPosition::AtSequenceNumber(seq) => {
                index_of(records, seq).unwrap_or(records.len())
            }
            IteratorPosition::AfterSequenceNumber(seq) => match index_of(records, seq) {
                Some(i) => i + 1,
                // checkpointed record already trimmed: resume at the first
                // record with a greater sequence number
                None => first_greater(records, seq).unwrap_or(records.len()),
            },
            IteratorPosition::ContinuationToken(token) => return Ok(token.clone()),
        };
        Ok(Self::token(shard, offset))
    }

    async fn get_records(&self, token: &ContinuationToken) -> Result<Batch> {
        {
            let mut faults = self.records_faults.lock();
            if *faults > 0 {
                *faults -= 1;
                return Err(Error::transient_stream("scripted fetch fault"));
            }
        }
        self.fetch_log.lock().push(token.clone());

        let (shard, offset) = Self::parse_token(token)
            .ok_or_else(|| Error::transient_stream(format!("bad token {token}")))?;
        let data = self.data.lock();
        let shard_data = data
            .get(&shard)
            .ok_or_else(|| Error::transient_stream(format!("unknown shard {shard}")))?;

        let batch_size = *self.batch_size.lock();
        let end = shard_data.records.len().min(offset + batch_size);
        let records: Vec<Record> = shard_data
            .records
            .get(offset..end)
            .unwrap_or(&[])
            .to_vec();

        let at_tip = end >= shard_data.records.len();
        let next = if shard_data.closed && at_tip {
            None
        } else {
            Some(Self::token(&shard, end))
        };
        Ok(Batch::new(records, next))
    }
}

fn index_of(records: &[Record], seq: &SequenceNumber) -> Option<usize> {
    records.iter().position(|r| r.sequence_number == *seq)
}

fn first_greater(records: &[Record], seq: &SequenceNumber) -> Option<usize> {
    let target = MockStreamService::numeric(seq)?;
    records
        .iter()
        .position(|r| MockStreamService::numeric(&r.sequence_number).is_some_and(|n| n > target))
}

// ============================================================================
// In-memory state store
// ============================================================================

/// In-memory state store implementing the conditional-write contract.
pub struct MemoryStateStore {
    tables: Mutex<HashMap<TableName, HashMap<ShardId, ShardRow>>>,
    /// Next N `ensure_table` calls fail with a transient error.
    table_faults: Mutex<u32>,
    /// Next N `update_checkpoint` calls fail with a transient error.
    checkpoint_faults: Mutex<u32>,
    /// Every accepted checkpoint write, in order.
    checkpoint_log: Mutex<Vec<(ShardId, SequenceNumber)>>,
    heartbeat_count: Mutex<u32>,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            table_faults: Mutex::new(0),
            checkpoint_faults: Mutex::new(0),
            checkpoint_log: Mutex::new(Vec::new()),
            heartbeat_count: Mutex::new(0),
        }
    }

    /// Fail the next `n` `ensure_table` calls with a transient error.
    pub fn fail_next_ensure_table(&self, n: u32) {
        *self.table_faults.lock() = n;
    }

    /// Fail the next `n` `update_checkpoint` calls with a transient error.
    pub fn fail_next_checkpoints(&self, n: u32) {
        *self.checkpoint_faults.lock() = n;
    }

    /// Hand the lease to another worker, as a competing node would. All
    /// subsequent conditional writes from the previous owner fail.
    pub fn seize_lease(&self, table: &TableName, shard: &ShardId, new_owner: impl Into<WorkerId>) {
        if let Some(row) = self
            .tables
            .lock()
            .get_mut(table)
            .and_then(|rows| rows.get_mut(shard))
        {
            row.worker_id = new_owner.into();
            row.last_heartbeat = Utc::now();
        }
    }

    /// Seed a pre-existing lease row (for resume/takeover scenarios).
    pub fn seed_row(&self, table: &TableName, row: ShardRow) {
        self.tables
            .lock()
            .entry(table.clone())
            .or_default()
            .insert(row.shard_id.clone(), row);
    }

    /// Current row for a shard, if any.
    pub fn row(&self, table: &TableName, shard: &ShardId) -> Option<ShardRow> {
        self.tables.lock().get(table)?.get(shard).cloned()
    }

    /// Every accepted checkpoint write, in order.
    pub fn checkpoint_log(&self) -> Vec<(ShardId, SequenceNumber)> {
        self.checkpoint_log.lock().clone()
    }

    pub fn heartbeat_count(&self) -> u32 {
        *self.heartbeat_count.lock()
    }

    fn with_owned_row<T>(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        update: impl FnOnce(&mut ShardRow) -> T,
    ) -> Result<T> {
        let mut tables = self.tables.lock();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| Error::transient_state_store(format!("no such table {table}")))?;
        match rows.get_mut(shard) {
            Some(row) if row.worker_id == *worker => Ok(update(row)),
            _ => Err(Error::ConditionalCheckFailed),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn ensure_table(
        &self,
        table: &TableName,
        _read_capacity: u32,
        _write_capacity: u32,
    ) -> Result<()> {
        {
            let mut faults = self.table_faults.lock();
            if *faults > 0 {
                *faults -= 1;
                return Err(Error::transient_state_store("scripted bootstrap fault"));
            }
        }
        self.tables.lock().entry(table.clone()).or_default();
        Ok(())
    }

    async fn claim_shard(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        now: DateTime<Utc>,
        heartbeat_timeout: ChronoDuration,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| Error::transient_state_store(format!("no such table {table}")))?;
        match rows.get_mut(shard) {
            None => {
                rows.insert(
                    shard.clone(),
                    ShardRow {
                        shard_id: shard.clone(),
                        worker_id: worker.clone(),
                        last_heartbeat: now,
                        last_checkpoint: None,
                    },
                );
                Ok(())
            }
            Some(row) if !row.is_live(now, heartbeat_timeout) => {
                // takeover: ownership and heartbeat move, progress stays
                row.worker_id = worker.clone();
                row.last_heartbeat = now;
                Ok(())
            }
            Some(_) => Err(Error::ConditionalCheckFailed),
        }
    }

    async fn read_shard(&self, table: &TableName, shard: &ShardId) -> Result<Option<ShardRow>> {
        let tables = self.tables.lock();
        let rows = tables
            .get(table)
            .ok_or_else(|| Error::transient_state_store(format!("no such table {table}")))?;
        Ok(rows.get(shard).cloned())
    }

    async fn update_heartbeat(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_owned_row(table, worker, shard, |row| {
            row.last_heartbeat = now;
        })?;
        *self.heartbeat_count.lock() += 1;
        Ok(())
    }

    async fn update_checkpoint(
        &self,
        table: &TableName,
        worker: &WorkerId,
        shard: &ShardId,
        sequence_number: &SequenceNumber,
        now: DateTime<Utc>,
    ) -> Result<()> {
        {
            let mut faults = self.checkpoint_faults.lock();
            if *faults > 0 {
                *faults -= 1;
                return Err(Error::transient_state_store("scripted checkpoint fault"));
            }
        }
        self.with_owned_row(table, worker, shard, |row| {
            row.last_checkpoint = Some(sequence_number.clone());
            row.last_heartbeat = now;
        })?;
        self.checkpoint_log
            .lock()
            .push((shard.clone(), sequence_number.clone()));
        Ok(())
    }
}

// ============================================================================
// Scripted processor
// ============================================================================

#[derive(Debug, Clone)]
struct ScriptedFailure {
    /// `None` fails every attempt; `Some(n)` fails the first n attempts.
    remaining: Option<u32>,
    mode: ErrorHandlingMode,
}

/// A processor whose failures are scripted per sequence number.
pub struct ScriptedProcessor {
    calls: Mutex<Vec<SequenceNumber>>,
    failures: Mutex<HashMap<SequenceNumber, ScriptedFailure>>,
    default_mode: ErrorHandlingMode,
    exceeded: Mutex<Vec<(SequenceNumber, ErrorHandlingMode)>>,
}

impl ScriptedProcessor {
    /// A processor that succeeds on every record.
    pub fn succeeding() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            default_mode: ErrorHandlingMode::RetryAndStop { retries: 0 },
            exceeded: Mutex::new(Vec::new()),
        }
    }

    /// Fail every attempt at `seq`, handled with `mode`.
    pub fn fail_always(self, seq: impl Into<SequenceNumber>, mode: ErrorHandlingMode) -> Self {
        self.failures.lock().insert(
            seq.into(),
            ScriptedFailure {
                remaining: None,
                mode,
            },
        );
        self
    }

    /// Fail the first `times` attempts at `seq`, handled with `mode`.
    pub fn fail_times(
        self,
        seq: impl Into<SequenceNumber>,
        times: u32,
        mode: ErrorHandlingMode,
    ) -> Self {
        self.failures.lock().insert(
            seq.into(),
            ScriptedFailure {
                remaining: Some(times),
                mode,
            },
        );
        self
    }

    /// Every `process` invocation, in order (including retries).
    pub fn calls(&self) -> Vec<SequenceNumber> {
        self.calls.lock().clone()
    }

    /// Records whose retries were exhausted, with the applied mode.
    pub fn exceeded(&self) -> Vec<(SequenceNumber, ErrorHandlingMode)> {
        self.exceeded.lock().clone()
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(&self, record: &Record) -> anyhow::Result<()> {
        self.calls.lock().push(record.sequence_number.clone());
        let mut failures = self.failures.lock();
        if let Some(failure) = failures.get_mut(&record.sequence_number) {
            match &mut failure.remaining {
                None => return Err(anyhow::anyhow!("scripted failure")),
                Some(0) => {}
                Some(n) => {
                    *n -= 1;
                    return Err(anyhow::anyhow!("scripted failure"));
                }
            }
        }
        Ok(())
    }

    fn error_handling_mode(&self, record: &Record, _error: &anyhow::Error) -> ErrorHandlingMode {
        self.failures
            .lock()
            .get(&record.sequence_number)
            .map(|f| f.mode)
            .unwrap_or(self.default_mode)
    }

    fn on_max_retry_exceeded(&self, record: &Record, mode: ErrorHandlingMode) {
        self.exceeded
            .lock()
            .push((record.sequence_number.clone(), mode));
    }
}

/// Records with ascending numeric sequence numbers `start..start + count`,
/// one partition key.
pub fn numbered_records(start: u64, count: u64) -> Vec<Record> {
    (start..start + count)
        .map(|n| Record::new("pk", n.to_string(), format!("payload-{n}").into_bytes()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_stream_pages_through_records() {
        let stream = MockStreamService::new();
        stream.add_shard("shard-0", numbered_records(1, 5));
        stream.set_batch_size(2);

        let shard = ShardId::from("shard-0");
        let token = stream
            .get_iterator(
                &StreamName::from("s"),
                &shard,
                &IteratorPosition::TrimHorizon,
            )
            .await
            .unwrap();
        let first = stream.get_records(&token).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.records[0].sequence_number, SequenceNumber::from("1"));

        let second = stream.get_records(first.next.as_ref().unwrap()).await.unwrap();
        assert_eq!(second.records[0].sequence_number, SequenceNumber::from("3"));
    }

    #[tokio::test]
    async fn open_shard_at_tip_returns_live_empty_batches() {
        let stream = MockStreamService::new();
        stream.add_shard("shard-0", vec![]);
        let token = stream
            .get_iterator(
                &StreamName::from("s"),
                &ShardId::from("shard-0"),
                &IteratorPosition::TrimHorizon,
            )
            .await
            .unwrap();
        let batch = stream.get_records(&token).await.unwrap();
        assert!(batch.is_empty());
        assert!(!batch.is_final());
    }

    #[tokio::test]
    async fn closed_shard_ends_with_no_continuation() {
        let stream = MockStreamService::new();
        stream.add_shard("shard-0", numbered_records(1, 1));
        stream.close_shard(&ShardId::from("shard-0"));
        let token = stream
            .get_iterator(
                &StreamName::from("s"),
                &ShardId::from("shard-0"),
                &IteratorPosition::TrimHorizon,
            )
            .await
            .unwrap();
        let batch = stream.get_records(&token).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.is_final());
    }

    #[tokio::test]
    async fn after_sequence_number_skips_past_the_checkpoint() {
        let stream = MockStreamService::new();
        stream.add_shard("shard-0", numbered_records(8, 3)); // 8, 9, 10
        let token = stream
            .get_iterator(
                &StreamName::from("s"),
                &ShardId::from("shard-0"),
                &IteratorPosition::AfterSequenceNumber(SequenceNumber::from("7")),
            )
            .await
            .unwrap();
        let batch = stream.get_records(&token).await.unwrap();
        assert_eq!(batch.records[0].sequence_number, SequenceNumber::from("8"));
    }

    #[tokio::test]
    async fn scripted_processor_fails_then_recovers() {
        let processor = ScriptedProcessor::succeeding().fail_times(
            "2",
            1,
            ErrorHandlingMode::RetryAndSkip { retries: 1 },
        );
        let record = Record::new("pk", "2", "x");
        assert!(processor.process(&record).await.is_err());
        assert!(processor.process(&record).await.is_ok());
        assert_eq!(processor.calls().len(), 2);
    }
}
