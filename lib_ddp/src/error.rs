//! # Error Types
//!
//! Every failure the client can surface, grouped by the component that
//! raises it. `TriggerError` is what the host receives through
//! [`crate::core::trigger::Emitter::emit_error`].

use std::time::Duration;
use thiserror::Error;

/// Failures of the transport session. These are advisory: they are reported
/// to the host but never force a disconnect on their own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to open socket to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("socket error: {0}")]
    Socket(String),

    #[error("malformed DDP frame: {0}")]
    Codec(String),

    #[error("DDP handshake failed: {0}")]
    Handshake(String),

    #[error("server reported protocol error: {0}")]
    Protocol(String),

    #[error("session is closed")]
    Closed,
}

/// Failures of [`crate::core::lifecycle::LifecycleManager::connect`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection timeout after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("client is closed")]
    Closed,
}

/// Raised to a pull-path caller whose readiness wait can never be satisfied.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DisconnectedError {
    #[error("connection lost")]
    ConnectionLost,

    #[error("client closed")]
    Closed,
}

/// The server refused or stopped a subscription (`nosub`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("subscription '{name}' stopped by server: {reason}")]
pub struct SubscriptionError {
    pub name: String,
    pub reason: String,
}

/// Invalid client configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported endpoint scheme '{0}' (expected http, https, ws or wss)")]
    UnsupportedScheme(String),

    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Umbrella error delivered to the host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Disconnected(#[from] DisconnectedError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}
