//! # Core Modules
//!
//! The client's moving parts, from the bottom up.
//!
//! ## Core Design Principles:
//! 1. **Single owner per concern**: the lifecycle manager owns the session,
//!    the registry owns readiness, the bus owns mirrored documents.
//! 2. **Epochs over flags**: every reconnect starts a new subscription epoch
//!    so stale `ready` frames and stale waits cannot leak across sessions.
//! 3. **Ordered fan-out**: mutations reach watchers in server order.

/// Mirrored collections and change fan-out.
pub mod bus;
/// Connection state machine and reconnect driver.
pub mod lifecycle;
/// Declared subscriptions and per-epoch readiness.
pub mod registry;
/// Connection state enum.
pub mod state;
/// Host-facing orchestrator (push and pull paths).
pub mod trigger;

pub use bus::{snapshot_to_json, ChangeEvent, ChangeKind, ChangeStream, CollectionBus, Snapshot};
pub use lifecycle::{LifecycleEvent, LifecycleManager};
pub use registry::{SubscriptionHandle, SubscriptionRegistry};
pub use state::ConnectionState;
pub use trigger::{DdpTrigger, Emitter, Record};
