//! # Transport Session
//!
//! The seam between the connection lifecycle and the socket. A [`Connector`]
//! opens one [`Session`] per connection attempt. The session is two channels:
//! client frames go out through `outbound`, and everything the socket reports
//! (handshake completion, decoded server frames, advisory errors, loss of the
//! connection) comes back on `inbound` as [`TransportEvent`]s.
//!
//! Dropping the `Session` closes the socket. A transport must emit exactly one
//! `Disconnected` (or simply close `inbound`) when the connection ends.

use std::future::Future;

use tokio::sync::mpsc;
use url::Url;

use crate::ddp::{ClientMessage, ServerMessage};
use crate::error::TransportError;

/// Channel-backed implementation with a scriptable server side.
pub mod memory;
/// WebSocket implementation backed by `tokio-tungstenite`.
#[cfg(feature = "ws")]
pub mod ws;

pub use memory::{Attempt, MemoryConnector, MemoryPeer, MemoryServer};
#[cfg(feature = "ws")]
pub use ws::WsConnector;

/// Signals raised by a live session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The DDP handshake completed; the session is usable.
    Connected { session: String },
    /// A decoded server frame other than handshake and heartbeat traffic.
    Message(ServerMessage),
    /// Advisory failure; the session stays up.
    Error(TransportError),
    /// The connection is gone. No further events follow.
    Disconnected(String),
}

/// Client side of an open connection.
#[derive(Debug)]
pub struct Session {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Socket side of an open connection, held by the transport task (or by a
/// test playing the server).
#[derive(Debug)]
pub struct SessionPeer {
    pub outbound: mpsc::UnboundedReceiver<ClientMessage>,
    pub inbound: mpsc::UnboundedSender<TransportEvent>,
}

impl Session {
    /// Creates a connected pair of channel ends.
    pub fn channel() -> (Session, SessionPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Session { outbound: out_tx, inbound: in_rx },
            SessionPeer { outbound: out_rx, inbound: in_tx },
        )
    }

    /// Queues a frame for the socket.
    pub fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        self.outbound.send(msg).map_err(|_| TransportError::Closed)
    }
}

/// Opens sessions to a DDP endpoint.
pub trait Connector: Send + Sync + 'static {
    /// Opens the socket and starts the DDP handshake.
    ///
    /// Resolves once the socket is open; handshake completion is reported
    /// later as [`TransportEvent::Connected`] on the returned session.
    fn connect(&self, endpoint: &Url) -> impl Future<Output = Result<Session, TransportError>> + Send;
}
