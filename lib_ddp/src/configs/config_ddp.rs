//! # DDP Client Configuration
//!
//! Typed, immutable configuration for one client instance. Parsing from
//! files, environment and command line is the host's business; this module
//! only validates and normalizes what it is given.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::ConfigError;

/// Default flat delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default bound on the initial connect, five minutes.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Path every Meteor server exposes its raw DDP WebSocket on.
pub const DDP_WEBSOCKET_PATH: &str = "/websocket";

/// What a pending pull-path readiness wait does once the connection is lost
/// for good (reconnect disabled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermanentDisconnectPolicy {
    /// Fail the wait with `DisconnectedError::ConnectionLost`.
    #[default]
    Fail,
    /// Keep waiting until an explicit `connect()` brings the client back.
    Hang,
}

impl FromStr for PermanentDisconnectPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "hang" => Ok(Self::Hang),
            other => Err(format!("unknown permanent-disconnect policy '{}' (expected fail or hang)", other)),
        }
    }
}

/// How `start()` treats the initial connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartMode {
    /// Return immediately; a failed first connect is reported via `emit_error`.
    #[default]
    Background,
    /// Return only after the first successful connect (or its failure).
    WaitConnected,
}

impl FromStr for StartMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "background" => Ok(Self::Background),
            "wait_connected" => Ok(Self::WaitConnected),
            other => Err(format!("unknown start mode '{}' (expected background or wait_connected)", other)),
        }
    }
}

/// Connection settings for the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Normalized WebSocket endpoint (`ws`/`wss`, path `/websocket`).
    pub endpoint: Url,
    pub reconnect_enabled: bool,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub on_permanent_disconnect: PermanentDisconnectPolicy,
}

impl ConnectionConfig {
    /// Builds a config with default policies from a user supplied URL.
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: normalize_endpoint(url)?,
            reconnect_enabled: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            on_permanent_disconnect: PermanentDisconnectPolicy::default(),
        })
    }

    pub fn with_reconnect(mut self, enabled: bool, delay: Duration) -> Self {
        self.reconnect_enabled = enabled;
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_permanent_disconnect(mut self, policy: PermanentDisconnectPolicy) -> Self {
        self.on_permanent_disconnect = policy;
        self
    }
}

/// A publication the client should keep subscribed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub name: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl SubscriptionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), params: Vec::new() }
    }
}

/// Everything the trigger orchestrator needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    pub connection: ConnectionConfig,
    pub subscriptions: Vec<SubscriptionSpec>,
    pub collections: Vec<String>,
    pub start_mode: StartMode,
}

impl TriggerConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            subscriptions: Vec::new(),
            collections: Vec::new(),
            start_mode: StartMode::default(),
        }
    }

    pub fn subscribe(mut self, spec: SubscriptionSpec) -> Self {
        self.subscriptions.push(spec);
        self
    }

    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collections.push(name.into());
        self
    }

    pub fn with_start_mode(mut self, mode: StartMode) -> Self {
        self.start_mode = mode;
        self
    }
}

impl fmt::Display for TriggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let subs: Vec<&str> = self.subscriptions.iter().map(|s| s.name.as_str()).collect();
        write!(
            f,
            "TriggerConfig
    Endpoint: {},
    Reconnect: {} ({:?}),
    Connect timeout: {:?},
    On permanent disconnect: {:?},
    Start mode: {:?},
    Subscriptions: {:?},
    Collections: {:?}
",
            self.connection.endpoint,
            self.connection.reconnect_enabled,
            self.connection.reconnect_delay,
            self.connection.connect_timeout,
            self.connection.on_permanent_disconnect,
            self.start_mode,
            subs,
            self.collections
        )
    }
}

/// Rewrites a server URL into its DDP WebSocket endpoint.
///
/// `http` becomes `ws`, `https` becomes `wss`, `ws`/`wss` are kept, and the
/// path is forced to `/websocket`. Query and fragment are dropped.
pub fn normalize_endpoint(raw: &str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    // Special-to-special scheme changes always succeed.
    if url.set_scheme(scheme).is_err() {
        return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
    }
    url.set_path(DDP_WEBSOCKET_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_becomes_wss_websocket() {
        let url = normalize_endpoint("https://chat.example.com/some/page?x=1").unwrap();
        assert_eq!(url.as_str(), "wss://chat.example.com/websocket");
    }

    #[test]
    fn http_with_port_becomes_ws() {
        let url = normalize_endpoint("http://localhost:3000").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:3000/websocket");
    }

    #[test]
    fn ws_schemes_are_kept() {
        assert_eq!(normalize_endpoint("wss://a.io/").unwrap().as_str(), "wss://a.io/websocket");
        assert_eq!(normalize_endpoint("ws://a.io").unwrap().as_str(), "ws://a.io/websocket");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(matches!(normalize_endpoint("ftp://a.io"), Err(ConfigError::UnsupportedScheme(s)) if s == "ftp"));
        assert!(matches!(normalize_endpoint("not a url"), Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn defaults() {
        let cfg = ConnectionConfig::new("https://a.io").unwrap();
        assert!(cfg.reconnect_enabled);
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(5));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(300));
        assert_eq!(cfg.on_permanent_disconnect, PermanentDisconnectPolicy::Fail);
    }

    #[test]
    fn policy_and_mode_parse() {
        assert_eq!("HANG".parse::<PermanentDisconnectPolicy>().unwrap(), PermanentDisconnectPolicy::Hang);
        assert_eq!("wait-connected".parse::<StartMode>().unwrap(), StartMode::WaitConnected);
        assert!("later".parse::<StartMode>().is_err());
    }

    #[test]
    fn subscription_spec_params_default_empty() {
        let spec: SubscriptionSpec = serde_json::from_str(r#"{"name":"users"}"#).unwrap();
        assert_eq!(spec, SubscriptionSpec::new("users"));
    }
}
