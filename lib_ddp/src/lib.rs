//! # lib_ddp
//!
//! A DDP (Meteor Distributed Data Protocol) client packaged as a trigger:
//! it keeps a session open, maintains the declared subscriptions across
//! reconnects, mirrors the published collections and hands changes to a host
//! either as they happen (push) or as snapshots on demand (pull).
#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod core;
pub mod ddp;
pub mod error;
pub mod transport;

pub use crate::configs::{ConnectionConfig, PermanentDisconnectPolicy, StartMode, SubscriptionSpec, TriggerConfig};
pub use crate::core::{ConnectionState, DdpTrigger, Emitter, Record};
pub use crate::error::{ConfigError, ConnectError, DisconnectedError, SubscriptionError, TransportError, TriggerError};
