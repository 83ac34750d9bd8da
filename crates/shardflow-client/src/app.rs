//! The public application object.
//!
//! An [`App`] ties everything together: it registers the application name
//! process-wide, bootstraps the state table, and runs the controller that
//! discovers shards and owns the per-shard workers. Processing begins as
//! soon as [`App::create`] returns.

use crate::config::AppConfig;
use crate::controller::{Controller, WorkerSpawner};
use crate::error::{Error, Result};
use crate::processor::Processor;
use crate::registry;
use crate::state_store::{StateStore, StateStoreGateway};
use crate::stream::{StreamGateway, StreamService};
use crate::worker::SharedProcessor;
use parking_lot::RwLock;
use shardflow_core::{AppName, ShardId, StreamName, WorkerId};
use std::sync::Arc;
use tracing::{info, warn};

/// A running consumer application.
///
/// Call [`App::dispose`] for a clean shutdown: workers finish their
/// in-flight batches, persist their checkpoints, and the application name
/// becomes available again. Dropping an `App` without disposing it logs a
/// warning and tears down on a best-effort basis.
///
/// ```rust,ignore
/// let app = App::create(
///     stream_service,
///     state_store,
///     "orders",
///     "order-events",
///     "worker-1",
///     Arc::new(MyProcessor),
///     AppConfig::default(),
/// )
/// .await?;
///
/// // ... later
/// app.dispose().await;
/// ```
pub struct App {
    app_name: AppName,
    stream_name: StreamName,
    processor: SharedProcessor,
    controller: Option<Controller>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("app_name", &self.app_name)
            .field("stream_name", &self.stream_name)
            .finish()
    }
}

impl App {
    /// Start a consumer application and begin processing immediately.
    ///
    /// Fails with [`Error::AppNameAlreadyRunning`] when another
    /// application with this name runs in the process, or with
    /// [`Error::InitializationFailed`] when the state-table bootstrap
    /// fails terminally. Per-shard lease claims happen asynchronously
    /// after this returns and are retried until they succeed.
    pub async fn create(
        stream_service: Arc<dyn StreamService>,
        state_store: Arc<dyn StateStore>,
        app_name: impl Into<AppName>,
        stream_name: impl Into<StreamName>,
        worker_id: impl Into<WorkerId>,
        processor: Arc<dyn Processor>,
        config: AppConfig,
    ) -> Result<Self> {
        config.validate()?;
        let app_name = app_name.into();
        let stream_name = stream_name.into();
        let worker_id = worker_id.into();

        registry::register(&app_name, &stream_name)?;

        let table = config.table_name(&app_name);
        let store = StateStoreGateway::new(
            state_store,
            table.clone(),
            worker_id.clone(),
            config.heartbeat_timeout,
            config.max_state_store_retries,
        );
        if let Err(err) = store
            .ensure_table(
                config.state_store_read_capacity,
                config.state_store_write_capacity,
            )
            .await
        {
            registry::deregister(&app_name);
            return Err(Error::initialization(err));
        }
        info!(app = %app_name, table = %table, "state table ready");

        let stream = StreamGateway::new(
            stream_service,
            stream_name.clone(),
            config.max_stream_retries,
        );
        let processor: SharedProcessor = Arc::new(RwLock::new(processor));
        let reconcile_every = config.check_stream_changes_frequency;
        let spawner = WorkerSpawner {
            stream,
            store,
            processor: processor.clone(),
            config,
            tap: None,
        };
        let controller = Controller::start(spawner, reconcile_every);
        info!(app = %app_name, stream = %stream_name, worker = %worker_id, "application started");

        Ok(Self {
            app_name,
            stream_name,
            processor,
            controller: Some(controller),
        })
    }

    pub fn app_name(&self) -> &AppName {
        &self.app_name
    }

    pub fn stream_name(&self) -> &StreamName {
        &self.stream_name
    }

    /// Run a worker for `shard`. Resolves once the controller has applied
    /// the request; a shard that is already processing is a no-op success.
    pub async fn start_processing(&self, shard: impl Into<ShardId>) -> Result<()> {
        self.controller()?.start_processing(shard.into()).await
    }

    /// Stop the worker for `shard`. Resolves once applied; an unknown
    /// shard is a no-op success.
    pub async fn stop_processing(&self, shard: impl Into<ShardId>) -> Result<()> {
        self.controller()?.stop_processing(shard.into()).await
    }

    /// Swap the record processor. Takes effect from the next record; each
    /// in-flight record finishes with the processor it started with.
    pub fn change_processor(&self, processor: Arc<dyn Processor>) {
        *self.processor.write() = processor;
    }

    /// Graceful shutdown: stop the topology reconciler, let every worker
    /// finish its in-flight batch and persist its checkpoint, then free
    /// the application name.
    pub async fn dispose(mut self) {
        if let Some(controller) = self.controller.take() {
            controller.dispose().await;
        }
        registry::deregister(&self.app_name);
        info!(app = %self.app_name, "application disposed");
    }

    fn controller(&self) -> Result<&Controller> {
        self.controller.as_ref().ok_or(Error::Shutdown)
    }
}

impl Drop for App {
    fn drop(&mut self) {
        if let Some(controller) = self.controller.take() {
            warn!(
                app = %self.app_name,
                "application dropped without dispose(); tearing down best-effort"
            );
            controller.shutdown_sync();
            registry::deregister(&self.app_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{numbered_records, MemoryStateStore, MockStreamService, ScriptedProcessor};
    use shardflow_core::{SequenceNumber, TableName};
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> AppConfig {
        AppConfig::builder()
            .heartbeat(Duration::from_millis(20))
            .heartbeat_timeout(Duration::from_millis(500))
            .empty_receive_delay(Duration::from_millis(10))
            .check_stream_changes_frequency(Duration::from_millis(25))
            .build()
            .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn duplicate_app_name_is_rejected() {
        let stream = Arc::new(MockStreamService::new());
        let store = Arc::new(MemoryStateStore::new());
        let app = App::create(
            stream.clone(),
            store.clone(),
            "app-dup",
            "events",
            "worker-1",
            Arc::new(ScriptedProcessor::succeeding()),
            test_config(),
        )
        .await
        .unwrap();

        let err = App::create(
            stream.clone(),
            store.clone(),
            "app-dup",
            "events",
            "worker-2",
            Arc::new(ScriptedProcessor::succeeding()),
            test_config(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::AppNameAlreadyRunning(_)));

        app.dispose().await;

        // the name is free again after disposal
        let app = App::create(
            stream,
            store,
            "app-dup",
            "events",
            "worker-3",
            Arc::new(ScriptedProcessor::succeeding()),
            test_config(),
        )
        .await
        .unwrap();
        app.dispose().await;
    }

    #[tokio::test]
    async fn failed_bootstrap_frees_the_name() {
        let stream = Arc::new(MockStreamService::new());
        let store = Arc::new(MemoryStateStore::new());
        let config = test_config();
        store.fail_next_ensure_table(config.max_state_store_retries + 1);

        let err = App::create(
            stream.clone(),
            store.clone(),
            "app-bootstrap",
            "events",
            "worker-1",
            Arc::new(ScriptedProcessor::succeeding()),
            config,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InitializationFailed { .. }));

        // registration rolled back: the same name works once the store
        // recovers
        let app = App::create(
            stream,
            store,
            "app-bootstrap",
            "events",
            "worker-1",
            Arc::new(ScriptedProcessor::succeeding()),
            test_config(),
        )
        .await
        .unwrap();
        app.dispose().await;
    }

    #[tokio::test]
    async fn round_trip_processes_every_record_once() {
        let stream = Arc::new(MockStreamService::new());
        stream.add_shard("shard-0", numbered_records(1, 20));
        stream.set_batch_size(7);
        stream.close_shard(&ShardId::from("shard-0"));
        let store = Arc::new(MemoryStateStore::new());
        let processor = Arc::new(ScriptedProcessor::succeeding());

        let app = App::create(
            stream,
            store.clone(),
            "app-roundtrip",
            "events",
            "worker-1",
            processor.clone(),
            test_config(),
        )
        .await
        .unwrap();

        wait_until(|| {
            store
                .checkpoint_log()
                .last()
                .is_some_and(|(_, seq)| seq == &SequenceNumber::from("20"))
        })
        .await;
        app.dispose().await;

        // exactly N process calls, in ascending order
        let calls = processor.calls();
        assert_eq!(calls.len(), 20);
        let expected: Vec<SequenceNumber> = (1..=20)
            .map(|n| SequenceNumber::from(n.to_string().as_str()))
            .collect();
        assert_eq!(calls, expected);

        // and the final checkpoint is the last record's sequence number
        let row = store
            .row(
                &TableName::from("app-roundtripKinesisState"),
                &ShardId::from("shard-0"),
            )
            .unwrap();
        assert_eq!(row.last_checkpoint, Some(SequenceNumber::from("20")));
    }

    #[tokio::test]
    async fn change_processor_takes_effect_on_later_records() {
        let stream = Arc::new(MockStreamService::new());
        stream.add_shard("shard-0", numbered_records(1, 1));
        let store = Arc::new(MemoryStateStore::new());
        let first = Arc::new(ScriptedProcessor::succeeding());
        let second = Arc::new(ScriptedProcessor::succeeding());

        let app = App::create(
            stream.clone(),
            store.clone(),
            "app-hotswap",
            "events",
            "worker-1",
            first.clone(),
            test_config(),
        )
        .await
        .unwrap();

        wait_until(|| !first.calls().is_empty()).await;
        app.change_processor(second.clone());

        stream.push_records(&ShardId::from("shard-0"), numbered_records(2, 1));
        wait_until(|| !second.calls().is_empty()).await;
        app.dispose().await;

        assert_eq!(first.calls(), vec![SequenceNumber::from("1")]);
        assert_eq!(second.calls(), vec![SequenceNumber::from("2")]);
    }

    #[tokio::test]
    async fn invalid_config_fails_synchronously() {
        let stream = Arc::new(MockStreamService::new());
        let store = Arc::new(MemoryStateStore::new());
        let mut config = AppConfig::default();
        config.heartbeat = config.heartbeat_timeout;

        let err = App::create(
            stream,
            store,
            "app-badconfig",
            "events",
            "worker-1",
            Arc::new(ScriptedProcessor::succeeding()),
            config,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
