//! # Trigger Orchestrator
//!
//! The entry point a host drives. It wires the lifecycle manager, the
//! subscription registry and the change bus together and serves the two
//! consumption modes:
//!
//! - **Push**: every change to a configured collection is emitted at once as
//!   one [`Record`], in the order the server sent the mutations.
//! - **Pull**: [`DdpTrigger::fetch`] waits until every declared subscription
//!   is ready, then emits one record per configured collection holding its
//!   snapshot.
//!
//! The host sees records and errors only through its [`Emitter`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::{StartMode, TriggerConfig};
use crate::core::bus::{snapshot_to_json, ChangeEvent, ChangeStream, CollectionBus};
use crate::core::lifecycle::{LifecycleEvent, LifecycleManager};
use crate::core::registry::{SubscriptionHandle, SubscriptionRegistry};
use crate::core::state::ConnectionState;
use crate::error::{ConnectError, DisconnectedError, TriggerError};
use crate::transport::Connector;

/// One emitted item: a collection name and its payload.
///
/// `name` is always the collection name, on the push path (one change
/// event) and on the pull path (one snapshot).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    pub data: Value,
}

impl Record {
    /// Push-path record for one change event.
    pub fn from_event(event: &ChangeEvent) -> Self {
        let data = serde_json::to_value(event).unwrap_or_else(|e| {
            tracing::error!(error = %e, collection = %event.collection, "Failed to serialize change event");
            Value::Null
        });
        Self { name: event.collection.clone(), data }
    }
}

/// The host side of the trigger.
pub trait Emitter: Send + Sync + 'static {
    /// Delivers records. An empty vector is the explicit "nothing to emit"
    /// signal of a pull without collections.
    fn emit(&self, records: Vec<Record>);

    /// Reports a condition the host may treat as fatal.
    fn emit_error(&self, error: TriggerError);
}

impl<E: Emitter + ?Sized> Emitter for Arc<E> {
    fn emit(&self, records: Vec<Record>) {
        (**self).emit(records)
    }

    fn emit_error(&self, error: TriggerError) {
        (**self).emit_error(error)
    }
}

/// A configured DDP client bound to one emitter.
pub struct DdpTrigger<C: Connector, E: Emitter> {
    config: TriggerConfig,
    emitter: Arc<E>,
    lifecycle: LifecycleManager<C>,
    registry: Arc<SubscriptionRegistry>,
    bus: Arc<CollectionBus>,
    handles: Vec<SubscriptionHandle>,
    events: Mutex<Option<mpsc::UnboundedReceiver<LifecycleEvent>>>,
    tasks: Mutex<Tasks>,
    monitor_stop: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
}

#[derive(Default)]
struct Tasks {
    forwarder: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    initial_connect: Option<JoinHandle<()>>,
}

impl<C: Connector, E: Emitter> DdpTrigger<C, E> {
    /// Builds the client and declares every configured subscription. Nothing
    /// touches the network until [`start`](Self::start).
    pub fn new(config: TriggerConfig, connector: C, emitter: E) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let bus = Arc::new(CollectionBus::new());
        let handles = config
            .subscriptions
            .iter()
            .map(|spec| registry.declare_with_params(spec.clone()))
            .collect();
        let (lifecycle, events) =
            LifecycleManager::new(connector, config.connection.clone(), Arc::clone(&registry), Arc::clone(&bus));

        Self {
            config,
            emitter: Arc::new(emitter),
            lifecycle,
            registry,
            bus,
            handles,
            events: Mutex::new(Some(events)),
            tasks: Mutex::new(Tasks::default()),
            monitor_stop: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &LifecycleManager<C> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &CollectionBus {
        &self.bus
    }

    pub fn emitter(&self) -> &E {
        &self.emitter
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// # Start
    ///
    /// Attaches the push path and the lifecycle monitor, then connects.
    ///
    /// In `Background` mode this returns right away and a failed first
    /// connect is reported through `emit_error`. In `WaitConnected` mode it
    /// returns after the first connect, reporting and returning its failure.
    /// Calling `start` more than once is a no-op.
    pub async fn start(&self) -> Result<(), TriggerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ConnectError::Closed.into());
        }
        tracing::info!(
            url = %self.config.connection.endpoint,
            subscriptions = self.handles.len(),
            collections = self.config.collections.len(),
            "Starting DDP trigger"
        );

        {
            let mut tasks = self.tasks();
            if !self.config.collections.is_empty() {
                let stream = self.bus.watch_many(&self.config.collections);
                tasks.forwarder = Some(tokio::spawn(forward_changes(stream, Arc::clone(&self.emitter))));
            }
            let events = self.events.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(events) = events {
                tasks.monitor = Some(tokio::spawn(monitor_lifecycle(
                    events,
                    Arc::clone(&self.emitter),
                    self.monitor_stop.clone(),
                )));
            }
        }

        match self.config.start_mode {
            StartMode::Background => {
                let lifecycle = self.lifecycle.clone();
                let emitter = Arc::clone(&self.emitter);
                let handle = tokio::spawn(async move {
                    if let Err(e) = lifecycle.connect().await {
                        report_connect_failure(emitter.as_ref(), e);
                    }
                });
                self.tasks().initial_connect = Some(handle);
                Ok(())
            }
            StartMode::WaitConnected => match self.lifecycle.connect().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    report_connect_failure(self.emitter.as_ref(), e.clone());
                    Err(e.into())
                }
            },
        }
    }

    /// # Fetch (pull path)
    ///
    /// 1. No configured collections: emit one empty batch, wait for nothing.
    /// 2. Otherwise wait for every declared subscription to be ready in the
    ///    current epoch. This suspends while disconnected and hangs forever
    ///    under the `hang` policy if the connection never returns.
    /// 3. Snapshot every configured collection and emit them in one batch.
    pub async fn fetch(&self) -> Result<(), TriggerError> {
        if self.config.collections.is_empty() {
            self.emitter.emit(Vec::new());
            return Ok(());
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DisconnectedError::Closed.into());
        }

        try_join_all(self.handles.iter().map(|h| self.registry.wait_ready(h))).await?;

        let records = self
            .config
            .collections
            .iter()
            .map(|name| Record { name: name.clone(), data: snapshot_to_json(&self.bus.snapshot(name)) })
            .collect::<Vec<_>>();
        tracing::debug!(records = records.len(), "Emitting collection snapshots");
        self.emitter.emit(records);
        Ok(())
    }

    /// # Stop
    ///
    /// Tear-down in a fixed order so no reconnect can race it:
    /// 1. stop reconnect scheduling and close the transport session,
    /// 2. release every change watcher,
    /// 3. join the push forwarder,
    /// 4. let the lifecycle monitor deliver what is already queued, then join it.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(url = %self.config.connection.endpoint, "Stopping DDP trigger");

        self.lifecycle.disconnect().await;
        self.bus.release_watchers();

        let (forwarder, monitor, initial_connect) = {
            let mut tasks = self.tasks();
            (tasks.forwarder.take(), tasks.monitor.take(), tasks.initial_connect.take())
        };
        if let Some(task) = initial_connect {
            // Resolves with `Closed`, which is not reported.
            let _ = task.await;
        }
        if let Some(task) = forwarder {
            let _ = task.await;
        }
        self.monitor_stop.cancel();
        if let Some(task) = monitor {
            let _ = task.await;
        }
    }
}

/// Reports a failed first connect once. Attempts made while `connect` was
/// waiting are not published as lifecycle errors; `Closed` means a
/// deliberate stop.
fn report_connect_failure<E: Emitter + ?Sized>(emitter: &E, error: ConnectError) {
    match error {
        ConnectError::Timeout(_) | ConnectError::Transport(_) => emitter.emit_error(error.into()),
        ConnectError::Closed => {}
    }
}

/// Push path: one record per change event, in arrival order.
async fn forward_changes<E: Emitter>(mut stream: ChangeStream, emitter: Arc<E>) {
    while let Some(event) = stream.recv().await {
        tracing::trace!(collection = %event.collection, id = %event.id, kind = ?event.kind, "Change");
        emitter.emit(vec![Record::from_event(&event)]);
    }
    tracing::debug!("Change forwarder finished");
}

/// Turns lifecycle signals into log lines and host errors. Once `stop` fires,
/// events already queued are still delivered.
async fn monitor_lifecycle<E: Emitter>(
    mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
    emitter: Arc<E>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            ev = events.recv() => match ev {
                Some(ev) => ev,
                None => return,
            },
            _ = stop.cancelled() => break,
        };
        handle_lifecycle_event(event, emitter.as_ref());
    }
    while let Ok(event) = events.try_recv() {
        handle_lifecycle_event(event, emitter.as_ref());
    }
}

fn handle_lifecycle_event<E: Emitter + ?Sized>(event: LifecycleEvent, emitter: &E) {
    match event {
        LifecycleEvent::Connected { epoch, session } => {
            tracing::info!(epoch, %session, "DDP session established");
        }
        LifecycleEvent::Disconnected { reason, will_reconnect: true } => {
            tracing::warn!(%reason, "DDP session lost, reconnect scheduled");
        }
        LifecycleEvent::Disconnected { reason, will_reconnect: false } => {
            tracing::warn!(%reason, "DDP session lost");
            emitter.emit_error(DisconnectedError::ConnectionLost.into());
        }
        LifecycleEvent::Error(e) => emitter.emit_error(e),
    }
}
