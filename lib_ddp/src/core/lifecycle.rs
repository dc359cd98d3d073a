//! # Connection Lifecycle Manager
//!
//! Owns the transport session and drives the connection state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connecting -> ...
//!       any state -> Closed   (explicit disconnect, terminal)
//! ```
//!
//! A single driver task per connection run performs the attempts, so at most
//! one reconnect is ever in flight. The retry delay is flat. Each driver run
//! carries a generation number and a cancellation token; an abandoned run
//! (timed out `connect`, or `disconnect`) can no longer touch the state.
//!
//! Every transition into `Connected` clears the mirrored collections and
//! re-sends all declared subscriptions for the new epoch.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::{ConnectionConfig, PermanentDisconnectPolicy};
use crate::core::bus::CollectionBus;
use crate::core::registry::SubscriptionRegistry;
use crate::core::state::ConnectionState;
use crate::ddp::ServerMessage;
use crate::error::{ConnectError, DisconnectedError, TransportError, TriggerError};
use crate::transport::{Connector, Session, TransportEvent};

/// Signals published by the lifecycle manager.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Handshake done and subscriptions sent for `epoch`.
    Connected { epoch: u64, session: String },
    /// An established session was lost.
    Disconnected { reason: String, will_reconnect: bool },
    /// Advisory failure (transport error, failed attempt, refused subscription).
    Error(TriggerError),
}

struct DriverHandle {
    generation: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Control {
    driver: Option<DriverHandle>,
    generation: u64,
    last_error: Option<TransportError>,
    /// Run whose failed attempts are reported by the awaiting `connect()`
    /// call instead of as events.
    quiet_generation: Option<u64>,
}

struct Shared<C> {
    connector: C,
    config: ConnectionConfig,
    registry: Arc<SubscriptionRegistry>,
    bus: Arc<CollectionBus>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    control: Mutex<Control>,
    shutdown: CancellationToken,
}

/// How a session run ended.
enum SessionEnd {
    Cancelled,
    Lost { reason: String, was_connected: bool },
}

/// Handle to the connection state machine. Clones share the same client.
pub struct LifecycleManager<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for LifecycleManager<C> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<C: Connector> LifecycleManager<C> {
    /// Creates a manager in `Disconnected` state. The returned receiver
    /// carries every [`LifecycleEvent`].
    pub fn new(
        connector: C,
        config: ConnectionConfig,
        registry: Arc<SubscriptionRegistry>,
        bus: Arc<CollectionBus>,
    ) -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            connector,
            config,
            registry,
            bus,
            state,
            events,
            control: Mutex::new(Control::default()),
            shutdown: CancellationToken::new(),
        });
        (Self { shared }, events_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch channel of state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// The most recent failed attempt's error, if any.
    pub fn last_error(&self) -> Option<TransportError> {
        self.shared.control().last_error.clone()
    }

    /// # Connect
    ///
    /// Starts the driver if it is not running and waits until the client is
    /// `Connected`.
    ///
    /// ## Outcomes:
    /// - `Ok(())` once the handshake completed and subscriptions were sent.
    /// - `ConnectError::Timeout` if `connect_timeout` elapses first. A run
    ///   started by this call is abandoned and the state returns to
    ///   `Disconnected`; no automatic retry follows.
    /// - `ConnectError::Transport` if reconnect is disabled and the single
    ///   attempt failed.
    /// - `ConnectError::Closed` after [`disconnect`](Self::disconnect).
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let mut state_rx = self.shared.state.subscribe();
        let started = {
            let mut control = self.shared.control();
            match *self.shared.state.borrow() {
                ConnectionState::Closed => return Err(ConnectError::Closed),
                ConnectionState::Connected => return Ok(()),
                _ => {}
            }
            if control.driver.is_some() {
                None
            } else {
                self.shared.registry.resume();
                control.last_error = None;
                let generation = Shared::spawn_driver(&self.shared, &mut control);
                control.quiet_generation = Some(generation);
                Some(generation)
            }
        };

        let timeout = self.shared.config.connect_timeout;
        let waited = tokio::time::timeout(timeout, async {
            state_rx
                .wait_for(|s| {
                    matches!(s, ConnectionState::Connected | ConnectionState::Disconnected | ConnectionState::Closed)
                })
                .await
                .map(|s| *s)
        })
        .await;

        if let Some(generation) = started {
            let mut control = self.shared.control();
            if control.quiet_generation == Some(generation) {
                control.quiet_generation = None;
            }
        }

        match waited {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(Ok(ConnectionState::Disconnected)) => {
                Err(self.last_error().map(ConnectError::Transport).unwrap_or(ConnectError::Closed))
            }
            Ok(_) => Err(ConnectError::Closed),
            Err(_) => {
                tracing::error!(url = %self.shared.config.endpoint, ?timeout, "Connection timeout");
                if let Some(generation) = started {
                    self.abandon(generation).await;
                }
                Err(ConnectError::Timeout(timeout))
            }
        }
    }

    /// Cancels the driver run `generation` if it is still the current one
    /// and has not connected in the meantime.
    async fn abandon(&self, generation: u64) {
        let driver = {
            let mut control = self.shared.control();
            let is_current = control.driver.as_ref().is_some_and(|d| d.generation == generation);
            if !is_current || *self.shared.state.borrow() == ConnectionState::Connected {
                return;
            }
            self.shared.state.send_replace(ConnectionState::Disconnected);
            control.driver.take()
        };
        if let Some(driver) = driver {
            driver.token.cancel();
            let _ = driver.task.await;
        }
        self.shared.registry.on_disconnected();
        if self.shared.config.on_permanent_disconnect == PermanentDisconnectPolicy::Fail {
            self.shared.registry.halt(DisconnectedError::ConnectionLost);
        }
    }

    /// # Disconnect
    ///
    /// Moves to the terminal `Closed` state: cancels any scheduled reconnect,
    /// drops the session (closing the socket) and waits for the driver task
    /// to finish. Pending readiness waits fail with `DisconnectedError::Closed`.
    pub async fn disconnect(&self) {
        let driver = {
            let mut control = self.shared.control();
            self.shared.state.send_replace(ConnectionState::Closed);
            control.driver.take()
        };
        self.shared.shutdown.cancel();
        if let Some(driver) = driver {
            driver.token.cancel();
            let _ = driver.task.await;
        }
        self.shared.registry.on_disconnected();
        self.shared.registry.halt(DisconnectedError::Closed);
        tracing::info!(url = %self.shared.config.endpoint, "Disconnected (closed)");
    }
}

impl<C: Connector> Shared<C> {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns a new driver run. Caller holds the control lock.
    fn spawn_driver(shared: &Arc<Self>, control: &mut Control) -> u64 {
        control.generation += 1;
        let generation = control.generation;
        let token = shared.shutdown.child_token();
        shared.state.send_replace(ConnectionState::Connecting);
        let task = tokio::spawn(Self::drive(Arc::clone(shared), token.clone(), generation));
        control.driver = Some(DriverHandle { generation, token, task });
        generation
    }

    /// Publishes `state` only if `generation` is still the live run.
    fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let control = self.control();
        let is_current = control.driver.as_ref().is_some_and(|d| d.generation == generation);
        if !is_current || *self.state.borrow() == ConnectionState::Closed {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    fn publish(&self, event: LifecycleEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// # Driver Loop
    ///
    /// 1. Attempt a connection (cancellable).
    /// 2. On success, run the session until it ends.
    /// 3. If reconnect is enabled, go `Reconnecting`, sleep the flat delay and
    ///    loop; otherwise settle in `Disconnected` and apply the
    ///    permanent-disconnect policy.
    async fn drive(self: Arc<Self>, token: CancellationToken, generation: u64) {
        let endpoint = self.config.endpoint.clone();
        loop {
            if !self.set_state(generation, ConnectionState::Connecting) {
                return;
            }
            tracing::info!(url = %endpoint, "Connecting to DDP server");

            let attempt = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                res = self.connector.connect(&endpoint) => res,
            };

            let (reason, was_connected) = match attempt {
                Ok(session) => match self.run_session(session, &token, generation).await {
                    SessionEnd::Cancelled => return,
                    SessionEnd::Lost { reason, was_connected } => (reason, was_connected),
                },
                Err(e) => {
                    tracing::error!(url = %endpoint, error = %e, "Connection attempt failed");
                    let quiet = {
                        let mut control = self.control();
                        control.last_error = Some(e.clone());
                        control.quiet_generation == Some(generation)
                    };
                    if !quiet {
                        self.publish(LifecycleEvent::Error(e.clone().into()));
                    }
                    (e.to_string(), false)
                }
            };

            if token.is_cancelled() {
                return;
            }

            if !self.config.reconnect_enabled {
                self.settle_disconnected(generation, reason, was_connected);
                return;
            }

            tracing::warn!(
                url = %endpoint,
                %reason,
                delay = ?self.config.reconnect_delay,
                "Connection lost, reconnecting"
            );
            if !self.set_state(generation, ConnectionState::Reconnecting) {
                return;
            }
            if was_connected {
                self.publish(LifecycleEvent::Disconnected { reason, will_reconnect: true });
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }
    }

    /// Reconnect is disabled: stop the run and wait for an explicit connect.
    fn settle_disconnected(&self, generation: u64, reason: String, was_connected: bool) {
        {
            let mut control = self.control();
            let is_current = control.driver.as_ref().is_some_and(|d| d.generation == generation);
            if !is_current || *self.state.borrow() == ConnectionState::Closed {
                return;
            }
            // The task is finishing on its own; dropping the handle detaches it.
            control.driver = None;
            self.state.send_replace(ConnectionState::Disconnected);
        }
        tracing::warn!(url = %self.config.endpoint, %reason, "Connection lost, reconnect disabled");

        if self.config.on_permanent_disconnect == PermanentDisconnectPolicy::Fail {
            self.registry.halt(DisconnectedError::ConnectionLost);
        }
        if was_connected {
            self.publish(LifecycleEvent::Disconnected { reason, will_reconnect: false });
        }
    }

    /// Pumps one session's events until it ends or the run is cancelled.
    async fn run_session(&self, mut session: Session, token: &CancellationToken, generation: u64) -> SessionEnd {
        let mut connected = false;
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => return SessionEnd::Cancelled,
                ev = session.inbound.recv() => ev,
            };

            match event {
                Some(TransportEvent::Connected { session: session_id }) => {
                    if connected {
                        tracing::warn!(session = %session_id, "Duplicate connected signal ignored");
                        continue;
                    }
                    self.bus.clear_all();
                    let (epoch, frames) = self.registry.on_connected_epoch();
                    for frame in frames {
                        if let Err(e) = session.send(frame) {
                            self.registry.on_disconnected();
                            return SessionEnd::Lost { reason: e.to_string(), was_connected: false };
                        }
                    }
                    connected = true;
                    if !self.set_state(generation, ConnectionState::Connected) {
                        return SessionEnd::Cancelled;
                    }
                    {
                        let mut control = self.control();
                        if control.quiet_generation == Some(generation) {
                            control.quiet_generation = None;
                        }
                    }
                    tracing::info!(url = %self.config.endpoint, epoch, session = %session_id, "Connected");
                    self.publish(LifecycleEvent::Connected { epoch, session: session_id });
                }
                Some(TransportEvent::Message(msg)) => self.route(msg),
                Some(TransportEvent::Error(e)) => {
                    tracing::error!(error = %e, "Transport error");
                    self.publish(LifecycleEvent::Error(e.into()));
                }
                Some(TransportEvent::Disconnected(reason)) => {
                    self.registry.on_disconnected();
                    return SessionEnd::Lost { reason, was_connected: connected };
                }
                None => {
                    self.registry.on_disconnected();
                    return SessionEnd::Lost { reason: "transport closed".to_string(), was_connected: connected };
                }
            }
        }
    }

    /// Dispatches one server frame to the registry or the bus.
    fn route(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Ready { subs } => {
                self.registry.mark_ready(&subs);
            }
            ServerMessage::NoSub { id, error } => {
                if let Some(err) = self.registry.mark_nosub(&id, error.as_ref()) {
                    tracing::warn!(sub = %err.name, reason = %err.reason, "Subscription stopped by server");
                    self.publish(LifecycleEvent::Error(err.into()));
                }
            }
            ServerMessage::Error { reason, offending_message } => {
                tracing::error!(%reason, offending = ?offending_message, "Server reported protocol error");
                self.publish(LifecycleEvent::Error(TransportError::Protocol(reason).into()));
            }
            msg if msg.collection().is_some() => {
                self.bus.apply(msg);
            }
            other => {
                tracing::trace!(message = ?other, "Ignoring server message");
            }
        }
    }
}
