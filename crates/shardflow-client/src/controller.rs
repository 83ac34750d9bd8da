//! Application controller: owns the fleet of shard workers.
//!
//! All mutation of the known-shard set and the worker map happens in one
//! serialized consumer task draining a message queue, so the state needs
//! no locks. A reconcile timer lists the stream's shards and feeds the
//! topology difference back through the same queue. The consumer body is
//! panic-contained: a panic restarts the consumer with its state
//! preserved, so one bad message cannot take the application down.

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::state_store::StateStoreGateway;
use crate::stream::StreamGateway;
use crate::worker::{EventTap, SharedProcessor, WorkerHandle};
use futures::FutureExt;
use shardflow_core::ShardId;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything needed to spawn a worker for one shard.
#[derive(Clone)]
pub(crate) struct WorkerSpawner {
    pub stream: StreamGateway,
    pub store: StateStoreGateway,
    pub processor: SharedProcessor,
    pub config: AppConfig,
    pub tap: Option<EventTap>,
}

impl WorkerSpawner {
    fn spawn(&self, shard: ShardId) -> WorkerHandle {
        WorkerHandle::spawn(
            shard,
            self.stream.clone(),
            self.store.clone(),
            self.processor.clone(),
            self.config.clone(),
            self.tap.clone(),
        )
    }
}

type Ack = oneshot::Sender<()>;

enum ControlMessage {
    StartWorker(ShardId, Ack),
    StopWorker(ShardId, Ack),
    /// Shard listing from the reconcile timer; the consumer adds and
    /// removes known shards and starts/stops workers accordingly.
    Reconcile(Vec<ShardId>),
    /// Stop every worker and exit the consumer.
    Shutdown(Ack),
}

#[derive(Default)]
struct ControllerState {
    known_shards: HashSet<ShardId>,
    workers: HashMap<ShardId, WorkerHandle>,
}

/// Handle to the controller's tasks.
pub(crate) struct Controller {
    tx: mpsc::Sender<ControlMessage>,
    consumer: JoinHandle<()>,
    reconciler: JoinHandle<()>,
}

impl Controller {
    pub(crate) fn start(spawner: WorkerSpawner, reconcile_every: Duration) -> Self {
        let (tx, rx) = mpsc::channel(64);

        let reconciler = tokio::spawn(reconcile_loop(
            spawner.stream.clone(),
            tx.clone(),
            reconcile_every,
        ));
        let consumer = tokio::spawn(consume_loop(spawner, rx));

        Self {
            tx,
            consumer,
            reconciler,
        }
    }

    /// Ask the controller to run a worker for `shard`. Resolves once the
    /// request has been applied; requesting a live shard is a no-op
    /// success.
    pub(crate) async fn start_processing(&self, shard: ShardId) -> Result<()> {
        self.apply(|ack| ControlMessage::StartWorker(shard, ack))
            .await
    }

    /// Ask the controller to stop the worker for `shard`. Resolves once
    /// applied; an unknown shard is a no-op success.
    pub(crate) async fn stop_processing(&self, shard: ShardId) -> Result<()> {
        self.apply(|ack| ControlMessage::StopWorker(shard, ack))
            .await
    }

    async fn apply(&self, message: impl FnOnce(Ack) -> ControlMessage) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(message(ack_tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        ack_rx.await.map_err(|_| Error::Shutdown)
    }

    /// Best-effort synchronous shutdown, for the drop safety net: abort
    /// the reconcile timer and ask the consumer to stop its workers
    /// without waiting for it.
    pub(crate) fn shutdown_sync(&self) {
        self.reconciler.abort();
        let (ack_tx, _ack_rx) = oneshot::channel();
        let _ = self.tx.try_send(ControlMessage::Shutdown(ack_tx));
    }

    /// Stop the reconcile timer, gracefully stop every worker, and wait
    /// for the consumer to exit.
    pub(crate) async fn dispose(self) {
        self.reconciler.abort();
        let _ = self.reconciler.await;

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ControlMessage::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(err) = self.consumer.await {
            if err.is_panic() {
                warn!("controller consumer panicked during shutdown");
            }
        }
    }
}

/// Periodically list the stream's shards and hand the listing to the
/// consumer. Fires once immediately so startup discovers the topology
/// without waiting a full period.
async fn reconcile_loop(
    stream: StreamGateway,
    tx: mpsc::Sender<ControlMessage>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match stream.list_shards().await {
            Ok(shards) => {
                if tx.send(ControlMessage::Reconcile(shards)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "shard listing failed, skipping reconcile cycle");
            }
        }
    }
}

/// The serialized consumer. Panics inside one message's handling restart
/// the drain loop with `known_shards`/`workers` intact.
async fn consume_loop(spawner: WorkerSpawner, mut rx: mpsc::Receiver<ControlMessage>) {
    let mut state = ControllerState::default();
    loop {
        match AssertUnwindSafe(drain(&spawner, &mut state, &mut rx))
            .catch_unwind()
            .await
        {
            Ok(()) => return,
            Err(_) => {
                warn!("controller consumer panicked, restarting with preserved state");
            }
        }
    }
}

async fn drain(
    spawner: &WorkerSpawner,
    state: &mut ControllerState,
    rx: &mut mpsc::Receiver<ControlMessage>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            ControlMessage::StartWorker(shard, ack) => {
                start_worker(spawner, state, shard).await;
                let _ = ack.send(());
            }
            ControlMessage::StopWorker(shard, ack) => {
                stop_worker(state, shard).await;
                let _ = ack.send(());
            }
            ControlMessage::Reconcile(current) => {
                reconcile(spawner, state, current).await;
            }
            ControlMessage::Shutdown(ack) => {
                let workers = std::mem::take(&mut state.workers);
                for (shard, handle) in workers {
                    debug!(shard = %shard, "stopping worker for shutdown");
                    handle.stop().await;
                }
                let _ = ack.send(());
                return;
            }
        }
    }
}

/// Apply a topology listing: start workers for newly appeared shards,
/// stop workers for shards that disappeared.
async fn reconcile(spawner: &WorkerSpawner, state: &mut ControllerState, current: Vec<ShardId>) {
    let current: HashSet<ShardId> = current.into_iter().collect();
    let added: Vec<ShardId> = current
        .iter()
        .filter(|shard| !state.known_shards.contains(*shard))
        .cloned()
        .collect();
    let removed: Vec<ShardId> = state
        .known_shards
        .iter()
        .filter(|shard| !current.contains(*shard))
        .cloned()
        .collect();

    if !added.is_empty() || !removed.is_empty() {
        info!(
            added = added.len(),
            removed = removed.len(),
            "shard topology changed"
        );
    }

    for shard in added {
        state.known_shards.insert(shard.clone());
        start_worker(spawner, state, shard).await;
    }
    for shard in removed {
        state.known_shards.remove(&shard);
        stop_worker(state, shard).await;
    }
}

async fn start_worker(spawner: &WorkerSpawner, state: &mut ControllerState, shard: ShardId) {
    if let Some(existing) = state.workers.get(&shard) {
        if !existing.is_finished() {
            debug!(shard = %shard, "worker already running");
            return;
        }
        // the previous worker exited on its own (shard closed, ownership
        // lost); replace it
        if let Some(finished) = state.workers.remove(&shard) {
            finished.stop().await;
        }
    }
    info!(shard = %shard, "starting shard worker");
    state.workers.insert(shard.clone(), spawner.spawn(shard));
}

async fn stop_worker(state: &mut ControllerState, shard: ShardId) {
    match state.workers.remove(&shard) {
        Some(handle) => {
            info!(shard = %shard, "stopping shard worker");
            handle.stop().await;
        }
        None => debug!(shard = %shard, "no worker to stop"),
    }
}
