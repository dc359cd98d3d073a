//! # Configuration Modules
//!
//! Typed client configuration and endpoint normalization.

/// Connection, subscription and start-up settings for one client.
pub mod config_ddp;

pub use config_ddp::{
    normalize_endpoint, ConnectionConfig, PermanentDisconnectPolicy, StartMode, SubscriptionSpec,
    TriggerConfig,
};
