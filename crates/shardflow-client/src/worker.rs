//! Per-shard worker: the fetch → process → checkpoint state machine.
//!
//! One worker owns one shard lease. It claims the lease during
//! initialization, then loops: fetch a batch, hand each record to the
//! processor in sequence order, persist the checkpoint, and only then
//! fetch again, so a shard's checkpoint never lags its processing by
//! more than one batch. A companion task refreshes the lease heartbeat;
//! the moment any conditional write is rejected the worker concedes
//! ownership and stops without touching the state store again.

use crate::config::AppConfig;
use crate::error::Error;
use crate::processor::{ProcessResult, Processor};
use crate::state_store::StateStoreGateway;
use crate::stream::StreamGateway;
use futures::FutureExt;
use parking_lot::RwLock;
use shardflow_core::{
    Batch, ContinuationToken, IteratorPosition, Record, SequenceNumber, ShardId, ShardStatus,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay between initialization attempts after a non-conditional failure.
const INIT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Spacing of checkpoint-persistence retries.
const CHECKPOINT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Delay before retrying a fetch whose internal retry budget ran out.
const FETCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Hot-swappable processor slot shared by all workers of an application.
pub(crate) type SharedProcessor = Arc<RwLock<Arc<dyn Processor>>>;

/// Lifecycle events of a shard worker. Emitted to tracing, and to the
/// event tap when one is installed (tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerEvent {
    Initialized,
    InitFailed(String),
    BatchReceived { count: usize },
    EmptyReceive,
    BatchProcessed { count: usize },
    RecordProcessed(SequenceNumber),
    ProcessErrored(SequenceNumber, String),
    CheckpointUpdated(SequenceNumber),
    Heartbeat,
    OwnershipLost,
    ShardClosed,
}

pub(crate) type EventTap = mpsc::UnboundedSender<WorkerEvent>;

/// Handle to a spawned shard worker, owned by the controller.
pub(crate) struct WorkerHandle {
    shard: ShardId,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn spawn(
        shard: ShardId,
        stream: StreamGateway,
        store: StateStoreGateway,
        processor: SharedProcessor,
        config: AppConfig,
        tap: Option<EventTap>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = ShardWorker {
            shard: shard.clone(),
            stream,
            store,
            processor,
            config,
            tap,
        };
        let join = tokio::spawn(worker.run(stop_rx));
        Self {
            shard,
            stop: stop_tx,
            join,
        }
    }

    /// Whether the worker exited on its own (shard closed, ownership lost).
    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Graceful stop: the in-flight batch finishes and its checkpoint
    /// persists before the worker exits.
    pub(crate) async fn stop(mut self) {
        let _ = self.stop.send(true);
        if let Err(err) = (&mut self.join).await {
            if err.is_panic() {
                warn!(shard = %self.shard, "shard worker panicked during shutdown");
            }
        }
    }
}

struct ShardWorker {
    shard: ShardId,
    stream: StreamGateway,
    store: StateStoreGateway,
    processor: SharedProcessor,
    config: AppConfig,
    tap: Option<EventTap>,
}

/// Fold of one batch through the processor.
struct BatchOutcome {
    /// Records counted towards the checkpoint (successes and skips).
    processed: usize,
    /// Highest sequence number to checkpoint, if any record completed.
    checkpoint: Option<SequenceNumber>,
    /// A `RetryAndStop` policy fired and the rest of the batch was
    /// abandoned.
    stopped: bool,
}

enum CheckpointOutcome {
    Persisted,
    OwnershipLost,
}

impl ShardWorker {
    fn emit(&self, event: WorkerEvent) {
        debug!(shard = %self.shard, event = ?event, "worker event");
        if let Some(tap) = &self.tap {
            let _ = tap.send(event);
        }
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        let Some(start) = self.initialize(&mut stop).await else {
            debug!(shard = %self.shard, "worker stopped before initialization completed");
            return;
        };
        self.emit(WorkerEvent::Initialized);
        info!(shard = %self.shard, position = %start, "shard worker initialized");

        let (ownership_tx, ownership_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.store.clone(),
            self.shard.clone(),
            self.config.heartbeat,
            ownership_tx,
            stop.clone(),
            self.tap.clone(),
        ));

        self.run_fetch_loop(start, &mut stop, ownership_rx).await;

        heartbeat.abort();
        let _ = heartbeat.await;
        info!(shard = %self.shard, "shard worker stopped");
    }

    /// Claim the lease and determine the starting position. Retries until
    /// it succeeds or the worker is stopped (`None`).
    async fn initialize(&self, stop: &mut watch::Receiver<bool>) -> Option<IteratorPosition> {
        loop {
            if *stop.borrow() {
                return None;
            }

            match self.store.claim_shard(&self.shard).await {
                Ok(()) | Err(Error::ConditionalCheckFailed) => {}
                Err(err) => {
                    self.emit(WorkerEvent::InitFailed(err.to_string()));
                    warn!(shard = %self.shard, error = %err, "lease claim failed, retrying");
                    if sleep_unless_flagged(INIT_RETRY_DELAY, stop).await {
                        return None;
                    }
                    continue;
                }
            }

            let status = match self.store.read_shard_status(&self.shard).await {
                Ok(status) => status,
                Err(err) => {
                    self.emit(WorkerEvent::InitFailed(err.to_string()));
                    warn!(shard = %self.shard, error = %err, "lease read failed, retrying");
                    if sleep_unless_flagged(INIT_RETRY_DELAY, stop).await {
                        return None;
                    }
                    continue;
                }
            };

            match status {
                // row disappeared between claim and read; claim again
                None => continue,
                Some(ShardStatus::New { worker, .. }) if worker == *self.store.worker() => {
                    return Some(IteratorPosition::TrimHorizon);
                }
                Some(ShardStatus::Processing { worker, checkpoint })
                    if worker == *self.store.worker() =>
                {
                    return Some(match checkpoint {
                        Some(seq) => IteratorPosition::AfterSequenceNumber(seq),
                        None => IteratorPosition::TrimHorizon,
                    });
                }
                Some(ShardStatus::Processing { worker, .. }) => {
                    // live lease elsewhere: re-check once its heartbeat
                    // could have gone stale
                    debug!(shard = %self.shard, owner = %worker, "lease held elsewhere, waiting");
                    let wait = self
                        .store
                        .heartbeat_timeout()
                        .to_std()
                        .unwrap_or(Duration::from_secs(180));
                    if sleep_unless_flagged(wait, stop).await {
                        return None;
                    }
                }
                Some(ShardStatus::NotProcessing { .. }) | Some(ShardStatus::New { .. }) => {
                    // stale or foreign-new lease: go around and claim it
                    continue;
                }
            }
        }
    }

    async fn run_fetch_loop(
        &self,
        start: IteratorPosition,
        stop: &mut watch::Receiver<bool>,
        mut ownership: watch::Receiver<bool>,
    ) {
        let mut resume = start.clone();
        let mut token = match self.acquire_iterator(&resume, stop, &mut ownership).await {
            Some(token) => token,
            None => return,
        };

        loop {
            if *stop.borrow() || *ownership.borrow() {
                return;
            }

            let batch = tokio::select! {
                _ = flagged(stop) => return,
                _ = flagged(&mut ownership) => return,
                fetched = self.stream.get_records(&token) => match fetched {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!(shard = %self.shard, error = %err, "fetch failed, re-acquiring iterator");
                        if sleep_unless_flagged(FETCH_RETRY_DELAY, stop).await {
                            return;
                        }
                        match self.acquire_iterator(&resume, stop, &mut ownership).await {
                            Some(fresh) => token = fresh,
                            None => return,
                        }
                        continue;
                    }
                },
            };

            if batch.is_empty() {
                self.emit(WorkerEvent::EmptyReceive);
                if sleep_unless_flagged(self.config.empty_receive_delay, stop).await {
                    return;
                }
                self.emit(WorkerEvent::BatchProcessed { count: 0 });
                match batch.next {
                    Some(next) => token = next,
                    None => {
                        self.emit(WorkerEvent::ShardClosed);
                        info!(shard = %self.shard, "shard closed by upstream");
                        return;
                    }
                }
                continue;
            }

            self.emit(WorkerEvent::BatchReceived {
                count: batch.len(),
            });
            let outcome = self.process_batch(&batch, &mut ownership).await;
            if *ownership.borrow() {
                return;
            }

            if let Some(seq) = &outcome.checkpoint {
                match self.persist_checkpoint(seq, &mut ownership).await {
                    CheckpointOutcome::Persisted => {
                        self.emit(WorkerEvent::CheckpointUpdated(seq.clone()));
                    }
                    CheckpointOutcome::OwnershipLost => {
                        self.emit(WorkerEvent::OwnershipLost);
                        return;
                    }
                }
            }
            self.emit(WorkerEvent::BatchProcessed {
                count: outcome.processed,
            });

            if outcome.stopped {
                // the failing record recurs: re-fetch from the last
                // checkpointed record, or the same start when nothing in
                // this batch completed
                if sleep_unless_flagged(FETCH_RETRY_DELAY, stop).await {
                    return;
                }
                if let Some(seq) = &outcome.checkpoint {
                    resume = IteratorPosition::AtSequenceNumber(seq.clone());
                    match self.acquire_iterator(&resume, stop, &mut ownership).await {
                        Some(fresh) => token = fresh,
                        None => return,
                    }
                }
                continue;
            }

            if let Some(seq) = &outcome.checkpoint {
                resume = IteratorPosition::AfterSequenceNumber(seq.clone());
            }
            match batch.next {
                Some(next) => token = next,
                None => {
                    self.emit(WorkerEvent::ShardClosed);
                    info!(shard = %self.shard, "shard closed by upstream, final batch drained");
                    return;
                }
            }
        }
    }

    /// Obtain an iterator for `resume`, retrying until it succeeds or the
    /// worker is stopped.
    async fn acquire_iterator(
        &self,
        resume: &IteratorPosition,
        stop: &mut watch::Receiver<bool>,
        ownership: &mut watch::Receiver<bool>,
    ) -> Option<ContinuationToken> {
        loop {
            if *stop.borrow() || *ownership.borrow() {
                return None;
            }
            match self.stream.get_iterator(&self.shard, resume).await {
                Ok(token) => return Some(token),
                Err(err) => {
                    warn!(shard = %self.shard, error = %err, "iterator acquisition failed, retrying");
                    if sleep_unless_flagged(FETCH_RETRY_DELAY, stop).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Feed the batch to the processor in order, honoring each failing
    /// record's error-handling mode. A stop request arriving mid-batch
    /// does not interrupt it; ownership loss does.
    async fn process_batch(&self, batch: &Batch, ownership: &mut watch::Receiver<bool>) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            processed: 0,
            checkpoint: None,
            stopped: false,
        };
        for record in &batch.records {
            if *ownership.borrow() {
                break;
            }
            match self.process_record(record).await {
                // a skipped record counts as success for checkpoint purposes
                ProcessResult::Success(seq) => {
                    outcome.processed += 1;
                    outcome.checkpoint = Some(seq);
                }
                ProcessResult::Failure(seq, detail) => {
                    debug!(shard = %self.shard, sequence = %seq, detail = %detail, "batch stopped");
                    outcome.stopped = true;
                    break;
                }
            }
        }
        outcome
    }

    /// Run one record through the processor with its retry policy.
    async fn process_record(&self, record: &Record) -> ProcessResult {
        let processor = { self.processor.read().clone() };

        let first_error = match self.invoke(processor.as_ref(), record).await {
            Ok(()) => {
                self.emit(WorkerEvent::RecordProcessed(record.sequence_number.clone()));
                return ProcessResult::Success(record.sequence_number.clone());
            }
            Err(err) => err,
        };
        self.emit(WorkerEvent::ProcessErrored(
            record.sequence_number.clone(),
            first_error.to_string(),
        ));

        let mode = processor.error_handling_mode(record, &first_error);
        let mut last_error = first_error;
        for attempt in 1..=mode.retries() {
            match self.invoke(processor.as_ref(), record).await {
                Ok(()) => {
                    self.emit(WorkerEvent::RecordProcessed(record.sequence_number.clone()));
                    return ProcessResult::Success(record.sequence_number.clone());
                }
                Err(err) => {
                    self.emit(WorkerEvent::ProcessErrored(
                        record.sequence_number.clone(),
                        err.to_string(),
                    ));
                    debug!(
                        shard = %self.shard,
                        sequence = %record.sequence_number,
                        attempt,
                        error = %err,
                        "processor retry failed"
                    );
                    last_error = err;
                }
            }
        }

        warn!(
            shard = %self.shard,
            sequence = %record.sequence_number,
            mode = %mode,
            "record failed after all retries"
        );
        // the callback is user code too: panics are contained and logged
        if std::panic::catch_unwind(AssertUnwindSafe(|| {
            processor.on_max_retry_exceeded(record, mode)
        }))
        .is_err()
        {
            warn!(shard = %self.shard, "on_max_retry_exceeded panicked");
        }

        if mode.skips() {
            ProcessResult::Success(record.sequence_number.clone())
        } else {
            ProcessResult::Failure(record.sequence_number.clone(), last_error.to_string())
        }
    }

    /// Invoke the processor, converting panics into ordinary errors so a
    /// misbehaving processor never takes the worker down.
    async fn invoke(&self, processor: &dyn Processor, record: &Record) -> anyhow::Result<()> {
        match AssertUnwindSafe(processor.process(record)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(
                "processor panicked: {}",
                panic_message(&panic)
            )),
        }
    }

    /// Persist the checkpoint, retrying transient failures with fixed
    /// spacing until it lands or ownership is lost. A graceful stop waits
    /// for this write; the next fetch is never issued before it returns.
    async fn persist_checkpoint(
        &self,
        seq: &SequenceNumber,
        ownership: &mut watch::Receiver<bool>,
    ) -> CheckpointOutcome {
        loop {
            if *ownership.borrow() {
                return CheckpointOutcome::OwnershipLost;
            }
            match self.store.update_checkpoint(&self.shard, seq).await {
                Ok(()) => return CheckpointOutcome::Persisted,
                Err(Error::ConditionalCheckFailed) => return CheckpointOutcome::OwnershipLost,
                Err(err) => {
                    warn!(shard = %self.shard, error = %err, "checkpoint update failed, retrying");
                    tokio::select! {
                        _ = flagged(ownership) => return CheckpointOutcome::OwnershipLost,
                        _ = tokio::time::sleep(CHECKPOINT_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}

/// Periodic lease refresh. Errors other than a rejected condition are
/// logged and dropped; the next tick or checkpoint write refreshes the
/// timestamp. A rejected condition means another worker holds the lease:
/// flag it and exit.
async fn heartbeat_loop(
    store: StateStoreGateway,
    shard: ShardId,
    period: Duration,
    ownership: watch::Sender<bool>,
    mut stop: watch::Receiver<bool>,
    tap: Option<EventTap>,
) {
    let emit = |event: WorkerEvent| {
        if let Some(tap) = &tap {
            let _ = tap.send(event);
        }
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut consecutive_failures: u32 = 0;

    loop {
        tokio::select! {
            _ = flagged(&mut stop) => return,
            _ = ticker.tick() => {
                match store.update_heartbeat(&shard).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        emit(WorkerEvent::Heartbeat);
                        debug!(shard = %shard, "heartbeat refreshed");
                    }
                    Err(Error::ConditionalCheckFailed) => {
                        warn!(shard = %shard, "heartbeat rejected: lease held by another worker");
                        emit(WorkerEvent::OwnershipLost);
                        let _ = ownership.send(true);
                        return;
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        warn!(
                            shard = %shard,
                            error = %err,
                            consecutive_failures,
                            "heartbeat update failed, will retry on next tick"
                        );
                    }
                }
            }
        }
    }
}

/// Completes when the watched flag turns true (or its sender is gone).
async fn flagged(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|flag| *flag).await;
}

/// Sleep for `duration`, returning `true` if the flag fired first.
async fn sleep_unless_flagged(duration: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = flagged(rx) => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ErrorHandlingMode;
    use crate::state_store::StateStore;
    use crate::testing::{numbered_records, MemoryStateStore, MockStreamService, ScriptedProcessor};
    use shardflow_core::{ShardRow, StreamName, TableName, WorkerId};
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    const TABLE: &str = "ordersKinesisState";

    struct Fixture {
        stream: Arc<MockStreamService>,
        store: Arc<MemoryStateStore>,
        config: AppConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let config = AppConfig::builder()
                .heartbeat(Duration::from_millis(20))
                .heartbeat_timeout(Duration::from_millis(500))
                .empty_receive_delay(Duration::from_millis(10))
                .build()
                .unwrap();
            Self {
                stream: Arc::new(MockStreamService::new()),
                store: Arc::new(MemoryStateStore::new()),
                config,
            }
        }

        async fn spawn(
            &self,
            shard: &str,
            processor: Arc<dyn Processor>,
        ) -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerEvent>) {
            self.store
                .ensure_table(&TableName::from(TABLE), 10, 10)
                .await
                .unwrap();
            let (tap_tx, tap_rx) = mpsc::unbounded_channel();
            let stream_gateway = StreamGateway::new(
                self.stream.clone(),
                StreamName::from("events"),
                self.config.max_stream_retries,
            );
            let store_gateway = StateStoreGateway::new(
                self.store.clone(),
                TableName::from(TABLE),
                WorkerId::from("worker-a"),
                self.config.heartbeat_timeout,
                self.config.max_state_store_retries,
            );
            let handle = WorkerHandle::spawn(
                ShardId::from(shard),
                stream_gateway,
                store_gateway,
                Arc::new(RwLock::new(processor)),
                self.config.clone(),
                Some(tap_tx),
            );
            (handle, tap_rx)
        }
    }

    async fn wait_for_event(
        rx: &mut mpsc::UnboundedReceiver<WorkerEvent>,
        mut predicate: impl FnMut(&WorkerEvent) -> bool,
    ) -> WorkerEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for worker event")
    }

    #[tokio::test]
    async fn happy_path_processes_in_order_and_checkpoints_once() {
        let fixture = Fixture::new();
        fixture.stream.add_shard(
            "shard-0",
            vec![
                Record::new("a", "1", "x"),
                Record::new("a", "2", "y"),
            ],
        );
        fixture.stream.close_shard(&ShardId::from("shard-0"));

        let processor = Arc::new(ScriptedProcessor::succeeding());
        let (handle, mut events) = fixture.spawn("shard-0", processor.clone()).await;

        wait_for_event(&mut events, |e| matches!(e, WorkerEvent::ShardClosed)).await;
        handle.stop().await;

        assert_eq!(
            processor.calls(),
            vec![SequenceNumber::from("1"), SequenceNumber::from("2")]
        );
        assert_eq!(
            fixture.store.checkpoint_log(),
            vec![(ShardId::from("shard-0"), SequenceNumber::from("2"))]
        );
    }

    #[tokio::test]
    async fn skip_mode_retries_then_moves_on() {
        let fixture = Fixture::new();
        fixture
            .stream
            .add_shard("shard-0", numbered_records(1, 3));
        fixture.stream.close_shard(&ShardId::from("shard-0"));

        let processor = Arc::new(ScriptedProcessor::succeeding().fail_always(
            "2",
            ErrorHandlingMode::RetryAndSkip { retries: 1 },
        ));
        let (handle, mut events) = fixture.spawn("shard-0", processor.clone()).await;

        wait_for_event(&mut events, |e| matches!(e, WorkerEvent::ShardClosed)).await;
        handle.stop().await;

        // initial attempt + one retry for "2", then "3" proceeds
        let calls = processor.calls();
        assert_eq!(
            calls,
            vec![
                SequenceNumber::from("1"),
                SequenceNumber::from("2"),
                SequenceNumber::from("2"),
                SequenceNumber::from("3"),
            ]
        );
        assert_eq!(
            processor.exceeded(),
            vec![(
                SequenceNumber::from("2"),
                ErrorHandlingMode::RetryAndSkip { retries: 1 }
            )]
        );
        let log = fixture.store.checkpoint_log();
        assert_eq!(log.last().unwrap().1, SequenceNumber::from("3"));
    }

    #[tokio::test]
    async fn stop_mode_holds_checkpoint_and_refetches_failed_record() {
        let fixture = Fixture::new();
        fixture
            .stream
            .add_shard("shard-0", numbered_records(1, 3));

        let processor = Arc::new(ScriptedProcessor::succeeding().fail_always(
            "2",
            ErrorHandlingMode::RetryAndStop { retries: 0 },
        ));
        let (handle, mut events) = fixture.spawn("shard-0", processor.clone()).await;

        // wait for two full stop cycles so the re-fetch behavior is visible
        wait_for_event(&mut events, |e| {
            matches!(e, WorkerEvent::CheckpointUpdated(seq) if seq == &SequenceNumber::from("1"))
        })
        .await;
        wait_for_event(&mut events, |e| {
            matches!(e, WorkerEvent::ProcessErrored(seq, _) if seq == &SequenceNumber::from("2"))
        })
        .await;
        handle.stop().await;

        assert_eq!(
            processor.exceeded().first().unwrap().0,
            SequenceNumber::from("2")
        );
        // never reached "3"
        assert!(!processor.calls().contains(&SequenceNumber::from("3")));
        // every checkpoint stayed at "1"
        for (_, seq) in fixture.store.checkpoint_log() {
            assert_eq!(seq, SequenceNumber::from("1"));
        }
        // the worker re-fetched from the last checkpointed record
        assert!(fixture
            .stream
            .iterator_log()
            .iter()
            .any(|(_, pos)| matches!(
                pos,
                IteratorPosition::AtSequenceNumber(seq) if seq == &SequenceNumber::from("1")
            )));
    }

    #[tokio::test]
    async fn stop_on_first_record_leaves_checkpoint_untouched() {
        let fixture = Fixture::new();
        fixture
            .stream
            .add_shard("shard-0", numbered_records(1, 2));

        let processor = Arc::new(ScriptedProcessor::succeeding().fail_always(
            "1",
            ErrorHandlingMode::RetryAndStop { retries: 0 },
        ));
        let (handle, mut events) = fixture.spawn("shard-0", processor.clone()).await;

        // two failing passes over the same batch start
        wait_for_event(&mut events, |e| {
            matches!(e, WorkerEvent::ProcessErrored(seq, _) if seq == &SequenceNumber::from("1"))
        })
        .await;
        wait_for_event(&mut events, |e| {
            matches!(e, WorkerEvent::ProcessErrored(seq, _) if seq == &SequenceNumber::from("1"))
        })
        .await;
        handle.stop().await;

        assert!(fixture.store.checkpoint_log().is_empty());
        // every fetch re-read the same batch start
        let log = fixture.stream.fetch_log();
        assert!(log.len() >= 2);
        assert!(log.iter().all(|token| token == &log[0]));
    }

    #[tokio::test]
    async fn ownership_loss_stops_all_writes_within_a_tick() {
        let fixture = Fixture::new();
        fixture.stream.add_shard("shard-0", vec![]);

        let processor = Arc::new(ScriptedProcessor::succeeding());
        let (handle, mut events) = fixture.spawn("shard-0", processor).await;
        wait_for_event(&mut events, |e| matches!(e, WorkerEvent::Initialized)).await;

        fixture.store.seize_lease(
            &TableName::from(TABLE),
            &ShardId::from("shard-0"),
            "worker-b",
        );
        wait_for_event(&mut events, |e| matches!(e, WorkerEvent::OwnershipLost)).await;

        // the worker winds down on its own
        timeout(Duration::from_secs(5), async {
            while !handle.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker did not stop after losing ownership");

        // and the seized row was never written again by worker-a
        let row = fixture
            .store
            .row(&TableName::from(TABLE), &ShardId::from("shard-0"))
            .unwrap();
        assert_eq!(row.worker_id, WorkerId::from("worker-b"));
        handle.stop().await;
    }

    #[tokio::test]
    async fn resumes_after_stale_lease_with_checkpoint() {
        let fixture = Fixture::new();
        fixture
            .stream
            .add_shard("shard-0", numbered_records(8, 3)); // 8, 9, 10
        fixture.stream.close_shard(&ShardId::from("shard-0"));

        // stale lease from a dead worker, checkpointed at "7"
        fixture.store.seed_row(
            &TableName::from(TABLE),
            ShardRow {
                shard_id: ShardId::from("shard-0"),
                worker_id: WorkerId::from("worker-dead"),
                last_heartbeat: chrono::Utc::now() - chrono::Duration::hours(1),
                last_checkpoint: Some(SequenceNumber::from("7")),
            },
        );

        let processor = Arc::new(ScriptedProcessor::succeeding());
        let (handle, mut events) = fixture.spawn("shard-0", processor.clone()).await;
        wait_for_event(&mut events, |e| matches!(e, WorkerEvent::ShardClosed)).await;
        handle.stop().await;

        // resumed after the recorded checkpoint
        assert!(fixture
            .stream
            .iterator_log()
            .iter()
            .any(|(_, pos)| matches!(
                pos,
                IteratorPosition::AfterSequenceNumber(seq) if seq == &SequenceNumber::from("7")
            )));
        assert_eq!(
            processor.calls(),
            vec![
                SequenceNumber::from("8"),
                SequenceNumber::from("9"),
                SequenceNumber::from("10"),
            ]
        );
        let row = fixture
            .store
            .row(&TableName::from(TABLE), &ShardId::from("shard-0"))
            .unwrap();
        assert_eq!(row.worker_id, WorkerId::from("worker-a"));
        assert_eq!(row.last_checkpoint, Some(SequenceNumber::from("10")));
    }

    #[tokio::test]
    async fn empty_batch_delays_then_continues() {
        let fixture = Fixture::new();
        fixture.stream.add_shard("shard-0", vec![]);

        let processor = Arc::new(ScriptedProcessor::succeeding());
        let (handle, mut events) = fixture.spawn("shard-0", processor).await;

        wait_for_event(&mut events, |e| matches!(e, WorkerEvent::EmptyReceive)).await;
        wait_for_event(&mut events, |e| {
            matches!(e, WorkerEvent::BatchProcessed { count: 0 })
        })
        .await;
        handle.stop().await;
    }

    #[tokio::test]
    async fn checkpoint_transient_failures_are_retried_until_persisted() {
        let fixture = Fixture::new();
        fixture
            .stream
            .add_shard("shard-0", numbered_records(1, 1));
        fixture.stream.close_shard(&ShardId::from("shard-0"));
        // exhaust the gateway's internal budget once, then recover
        fixture.store.fail_next_checkpoints(
            fixture.config.max_state_store_retries + 1,
        );

        let processor = Arc::new(ScriptedProcessor::succeeding());
        let (handle, mut events) = fixture.spawn("shard-0", processor).await;

        wait_for_event(&mut events, |e| {
            matches!(e, WorkerEvent::CheckpointUpdated(seq) if seq == &SequenceNumber::from("1"))
        })
        .await;
        handle.stop().await;
        assert_eq!(
            fixture.store.checkpoint_log(),
            vec![(ShardId::from("shard-0"), SequenceNumber::from("1"))]
        );
    }

    #[tokio::test]
    async fn fetch_faults_recover_by_reacquiring_an_iterator() {
        let fixture = Fixture::new();
        fixture.stream.add_shard("shard-0", numbered_records(1, 2));
        fixture.stream.close_shard(&ShardId::from("shard-0"));
        // exhaust the gateway's internal budget once, then recover
        fixture
            .stream
            .fail_next_fetches(fixture.config.max_stream_retries + 1);

        let processor = Arc::new(ScriptedProcessor::succeeding());
        let (handle, mut events) = fixture.spawn("shard-0", processor.clone()).await;

        wait_for_event(&mut events, |e| matches!(e, WorkerEvent::ShardClosed)).await;
        handle.stop().await;

        assert_eq!(processor.calls().len(), 2);
        // a fresh iterator was requested after the faults
        assert!(fixture.stream.iterator_log().len() >= 2);
        assert_eq!(
            fixture.store.checkpoint_log(),
            vec![(ShardId::from("shard-0"), SequenceNumber::from("2"))]
        );
    }

    #[tokio::test]
    async fn no_fetch_before_checkpoint_is_acknowledged() {
        let fixture = Fixture::new();
        fixture.stream.add_shard("shard-0", numbered_records(1, 4));
        fixture.stream.set_batch_size(2);
        fixture.stream.close_shard(&ShardId::from("shard-0"));

        let processor = Arc::new(ScriptedProcessor::succeeding());
        let (handle, mut events) = fixture.spawn("shard-0", processor).await;
        wait_for_event(&mut events, |e| matches!(e, WorkerEvent::ShardClosed)).await;
        handle.stop().await;

        // two fetches, and the second checkpoint ("2") was persisted
        // before the second fetch's records ("3","4") were checkpointed
        let checkpoints: Vec<_> = fixture
            .store
            .checkpoint_log()
            .into_iter()
            .map(|(_, seq)| seq)
            .collect();
        assert_eq!(
            checkpoints,
            vec![SequenceNumber::from("2"), SequenceNumber::from("4")]
        );
    }
}
