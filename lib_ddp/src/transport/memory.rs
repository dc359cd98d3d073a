//! # In-Memory Transport
//!
//! A [`Connector`] whose sessions are plain channels, with the server side
//! handed to a [`MemoryServer`]. Used to embed the client next to an
//! in-process publisher and to drive the client deterministically in tests.
//!
//! Each connection attempt consumes the next scripted [`Attempt`]; when the
//! script is empty the default (`Accept` unless changed) applies.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use super::{Connector, Session, SessionPeer, TransportEvent};
use crate::ddp::{ClientMessage, ServerMessage};
use crate::error::TransportError;

/// Outcome of one connection attempt.
#[derive(Debug, Clone)]
pub enum Attempt {
    /// Open a session and hand its peer to the server.
    Accept,
    /// Fail the attempt immediately.
    Refuse(TransportError),
    /// Never complete (unreachable endpoint).
    Hang,
}

#[derive(Debug)]
struct Script {
    queue: VecDeque<Attempt>,
    default: Attempt,
    attempts: Vec<Instant>,
}

impl Script {
    fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
        script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Client half: plug into the lifecycle manager.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    script: Arc<Mutex<Script>>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

/// Server half: accepts sessions and controls attempt outcomes.
#[derive(Debug)]
pub struct MemoryServer {
    script: Arc<Mutex<Script>>,
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Server end of one accepted session.
#[derive(Debug)]
pub struct MemoryPeer {
    peer: SessionPeer,
    endpoint: Url,
}

impl MemoryConnector {
    pub fn pair() -> (MemoryConnector, MemoryServer) {
        let script = Arc::new(Mutex::new(Script {
            queue: VecDeque::new(),
            default: Attempt::Accept,
            attempts: Vec::new(),
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryConnector { script: Arc::clone(&script), peers: tx },
            MemoryServer { script, peers: rx },
        )
    }
}

impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Session, TransportError> {
        let attempt = {
            let mut script = Script::lock(&self.script);
            script.attempts.push(Instant::now());
            script.queue.pop_front().unwrap_or_else(|| script.default.clone())
        };

        match attempt {
            Attempt::Accept => {
                let (session, peer) = Session::channel();
                self.peers
                    .send(MemoryPeer { peer, endpoint: endpoint.clone() })
                    .map_err(|_| TransportError::Connect {
                        url: endpoint.to_string(),
                        reason: "in-memory server is gone".to_string(),
                    })?;
                Ok(session)
            }
            Attempt::Refuse(err) => Err(err),
            Attempt::Hang => std::future::pending().await,
        }
    }
}

impl MemoryServer {
    /// Queues the outcome of a future attempt (FIFO).
    pub fn push_attempt(&self, attempt: Attempt) {
        Script::lock(&self.script).queue.push_back(attempt);
    }

    /// Outcome used once the queue is empty.
    pub fn set_default(&self, attempt: Attempt) {
        Script::lock(&self.script).default = attempt;
    }

    /// Times at which connection attempts were made.
    pub fn attempts(&self) -> Vec<Instant> {
        Script::lock(&self.script).attempts.clone()
    }

    /// Waits for the next accepted session.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

impl MemoryPeer {
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Completes the DDP handshake.
    pub fn handshake(&self, session: &str) {
        self.event(TransportEvent::Connected { session: session.to_string() });
    }

    pub fn send(&self, msg: ServerMessage) {
        self.event(TransportEvent::Message(msg));
    }

    pub fn error(&self, err: TransportError) {
        self.event(TransportEvent::Error(err));
    }

    /// Raw event injection.
    pub fn event(&self, event: TransportEvent) {
        let _ = self.peer.inbound.send(event);
    }

    /// Next frame written by the client, `None` once the client dropped the
    /// session.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        self.peer.outbound.recv().await
    }

    /// Frame already written by the client, without waiting.
    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        self.peer.outbound.try_recv().ok()
    }

    /// Ends the session from the server side.
    pub fn drop_connection(self, reason: &str) {
        let _ = self.peer.inbound.send(TransportEvent::Disconnected(reason.to_string()));
    }

    /// True once the client released the session.
    pub fn is_closed(&self) -> bool {
        self.peer.inbound.is_closed()
    }
}
