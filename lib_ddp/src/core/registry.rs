//! # Subscription Registry
//!
//! Tracks the publications the client wants and whether each one is ready in
//! the current connection epoch.
//!
//! DDP subscriptions do not survive a socket drop, so every new connection
//! starts a new *epoch*: the registry hands out fresh `sub` frames with
//! epoch-scoped ids (`"<epoch>-<index>"`) and re-arms readiness. A `ready`
//! carrying an id from an older epoch is ignored.
//!
//! Readiness is a `tokio::sync::watch` channel per subscription holding the
//! `(epoch, ready, halted)` triple. Two ways to wait on it:
//! - [`SubscriptionRegistry::readiness`]: the future of the epoch current at
//!   call time. It resolves at most once and never resolves if that epoch ends
//!   before the server confirms.
//! - [`SubscriptionRegistry::wait_ready`]: follows whatever epoch is current,
//!   suspends while disconnected, and fails once the registry is halted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;

use crate::configs::SubscriptionSpec;
use crate::ddp::ClientMessage;
use crate::error::{DisconnectedError, SubscriptionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyState {
    epoch: u64,
    ready: bool,
    halted: Option<DisconnectedError>,
}

struct SubEntry {
    spec: SubscriptionSpec,
    /// Id used on the wire for the current epoch.
    sub_id: Option<String>,
    active: bool,
    state: watch::Sender<ReadyState>,
}

#[derive(Default)]
struct RegistryInner {
    epoch: u64,
    subs: Vec<SubEntry>,
    by_name: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
    halted: Option<DisconnectedError>,
}

/// Stable reference to a declared subscription. Cloning is cheap; the
/// handle stays valid across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    index: usize,
    name: Arc<str>,
}

impl SubscriptionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Desired subscriptions and their per-epoch readiness.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares a parameterless subscription. Declaring the same name twice
    /// returns the same handle.
    pub fn declare(&self, name: &str) -> SubscriptionHandle {
        self.declare_with_params(SubscriptionSpec::new(name))
    }

    /// Declares a subscription with publication arguments.
    ///
    /// Names are the identity: a second declaration of a known name keeps the
    /// first declaration's params. Subscriptions declared while connected are
    /// sent at the start of the next epoch.
    pub fn declare_with_params(&self, spec: SubscriptionSpec) -> SubscriptionHandle {
        let mut inner = self.lock();
        if let Some(&index) = inner.by_name.get(&spec.name) {
            return SubscriptionHandle { index, name: Arc::from(spec.name.as_str()) };
        }

        let index = inner.subs.len();
        let name: Arc<str> = Arc::from(spec.name.as_str());
        let (state, _) = watch::channel(ReadyState { epoch: inner.epoch, ready: false, halted: inner.halted });
        inner.by_name.insert(spec.name.clone(), index);
        inner.subs.push(SubEntry { spec, sub_id: None, active: false, state });
        tracing::debug!(sub = %name, "Subscription declared");
        SubscriptionHandle { index, name }
    }

    /// All declared subscriptions in declaration order.
    pub fn handles(&self) -> Vec<SubscriptionHandle> {
        self.lock()
            .subs
            .iter()
            .enumerate()
            .map(|(index, e)| SubscriptionHandle { index, name: Arc::from(e.spec.name.as_str()) })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current connection epoch; `0` until the first connection.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Starts a new epoch and returns the `sub` frames to send for it.
    ///
    /// Every subscription gets a fresh id and an unresolved readiness state.
    /// A halt caused by a lost connection is lifted; a halt caused by closing
    /// the client is not.
    pub fn on_connected_epoch(&self) -> (u64, Vec<ClientMessage>) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.epoch += 1;
        inner.by_id.clear();
        if inner.halted == Some(DisconnectedError::ConnectionLost) {
            inner.halted = None;
        }

        let epoch = inner.epoch;
        let halted = inner.halted;
        let mut frames = Vec::with_capacity(inner.subs.len());
        for (index, entry) in inner.subs.iter_mut().enumerate() {
            let id = format!("{}-{}", epoch, index);
            entry.sub_id = Some(id.clone());
            entry.active = true;
            entry.state.send_replace(ReadyState { epoch, ready: false, halted });
            inner.by_id.insert(id.clone(), index);
            frames.push(ClientMessage::Sub { id, name: entry.spec.name.clone(), params: entry.spec.params.clone() });
        }
        tracing::debug!(epoch, subs = frames.len(), "Connection epoch started");
        (epoch, frames)
    }

    /// Marks the current-epoch subscriptions named by `ids` as ready.
    ///
    /// Returns the handles that became ready with this call. Unknown and
    /// stale ids are ignored, as are repeated confirmations.
    pub fn mark_ready(&self, ids: &[String]) -> Vec<SubscriptionHandle> {
        let inner = self.lock();
        let mut newly_ready = Vec::new();
        for id in ids {
            let Some(&index) = inner.by_id.get(id) else {
                tracing::trace!(sub_id = %id, "Ignoring ready for unknown or stale subscription");
                continue;
            };
            let entry = &inner.subs[index];
            let changed = entry.state.send_if_modified(|s| {
                if s.ready {
                    false
                } else {
                    s.ready = true;
                    true
                }
            });
            if changed {
                tracing::debug!(sub = %entry.spec.name, epoch = inner.epoch, "Subscription ready");
                newly_ready.push(SubscriptionHandle { index, name: Arc::from(entry.spec.name.as_str()) });
            }
        }
        newly_ready
    }

    /// Records a `nosub` from the server.
    ///
    /// The subscription becomes inactive for the rest of the epoch. Returns
    /// the error to surface, or `None` if the id is not from this epoch.
    pub fn mark_nosub(&self, id: &str, error: Option<&Value>) -> Option<SubscriptionError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let index = inner.by_id.remove(id)?;
        let entry = &mut inner.subs[index];
        entry.active = false;
        entry.sub_id = None;
        let reason = error
            .map(|e| {
                e.get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string())
            })
            .unwrap_or_else(|| "subscription stopped".to_string());
        Some(SubscriptionError { name: entry.spec.name.clone(), reason })
    }

    /// The connection dropped: nothing is ready or active until the next epoch.
    pub fn on_disconnected(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.by_id.clear();
        for entry in inner.subs.iter_mut() {
            entry.active = false;
            entry.sub_id = None;
            entry.state.send_if_modified(|s| std::mem::replace(&mut s.ready, false));
        }
    }

    /// Makes every pending and future [`wait_ready`](Self::wait_ready) fail
    /// with `reason` until [`resume`](Self::resume) (or, for a lost
    /// connection, the next epoch).
    pub fn halt(&self, reason: DisconnectedError) {
        let mut inner = self.lock();
        if inner.halted == Some(DisconnectedError::Closed) {
            return;
        }
        inner.halted = Some(reason);
        for entry in &inner.subs {
            entry.state.send_modify(|s| s.halted = Some(reason));
        }
        tracing::debug!(%reason, "Subscription registry halted");
    }

    /// Lifts a `ConnectionLost` halt. A `Closed` halt is permanent.
    pub fn resume(&self) {
        let mut inner = self.lock();
        if inner.halted != Some(DisconnectedError::ConnectionLost) {
            return;
        }
        inner.halted = None;
        for entry in &inner.subs {
            entry.state.send_modify(|s| s.halted = None);
        }
    }

    pub fn is_ready(&self, handle: &SubscriptionHandle) -> bool {
        let inner = self.lock();
        inner.subs.get(handle.index).is_some_and(|e| e.state.borrow().ready)
    }

    pub fn is_active(&self, handle: &SubscriptionHandle) -> bool {
        let inner = self.lock();
        inner.subs.get(handle.index).is_some_and(|e| e.active)
    }

    /// The readiness future of the epoch current at call time.
    ///
    /// Resolves once the server confirms the subscription in that epoch. If
    /// the epoch ends first, the future stays pending forever; callers that
    /// need to follow reconnects use [`wait_ready`](Self::wait_ready) or ask
    /// again after the reconnect.
    pub fn readiness(&self, handle: &SubscriptionHandle) -> impl Future<Output = ()> + Send + 'static {
        let armed = {
            let inner = self.lock();
            inner.subs.get(handle.index).map(|e| (e.state.subscribe(), inner.epoch))
        };

        async move {
            let Some((mut rx, epoch)) = armed else {
                return std::future::pending().await;
            };
            let outcome = rx.wait_for(|s| s.epoch != epoch || s.ready).await.map(|s| *s);
            match outcome {
                Ok(s) if s.epoch == epoch => {}
                _ => std::future::pending().await,
            }
        }
    }

    /// Waits until the subscription is ready in the current epoch, following
    /// reconnects.
    pub async fn wait_ready(&self, handle: &SubscriptionHandle) -> Result<(), DisconnectedError> {
        let rx = {
            let inner = self.lock();
            inner.subs.get(handle.index).map(|e| e.state.subscribe())
        };
        let Some(mut rx) = rx else {
            return Err(DisconnectedError::Closed);
        };

        let outcome = rx.wait_for(|s| s.ready || s.halted.is_some()).await.map(|s| *s);
        match outcome {
            Ok(s) if s.ready => Ok(()),
            Ok(s) => Err(s.halted.unwrap_or(DisconnectedError::Closed)),
            Err(_) => Err(DisconnectedError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sub_ids(frames: &[ClientMessage]) -> Vec<String> {
        frames
            .iter()
            .map(|f| match f {
                ClientMessage::Sub { id, .. } => id.clone(),
                other => panic!("unexpected frame {:?}", other),
            })
            .collect()
    }

    #[test]
    fn declare_is_idempotent() {
        let reg = SubscriptionRegistry::new();
        let a = reg.declare("users");
        let b = reg.declare("users");
        let c = reg.declare("rooms");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn every_epoch_issues_all_subscriptions_with_fresh_ids() {
        let reg = SubscriptionRegistry::new();
        reg.declare_with_params(SubscriptionSpec { name: "users".into(), params: vec![json!({"limit": 10})] });
        reg.declare("rooms");

        let (epoch, frames) = reg.on_connected_epoch();
        assert_eq!(epoch, 1);
        assert_eq!(
            frames[0],
            ClientMessage::Sub { id: "1-0".into(), name: "users".into(), params: vec![json!({"limit": 10})] }
        );
        assert_eq!(sub_ids(&frames), vec!["1-0", "1-1"]);

        reg.on_disconnected();
        let (epoch, frames) = reg.on_connected_epoch();
        assert_eq!(epoch, 2);
        assert_eq!(sub_ids(&frames), vec!["2-0", "2-1"]);
    }

    #[tokio::test]
    async fn readiness_resolves_once_for_current_epoch() {
        let reg = SubscriptionRegistry::new();
        let users = reg.declare("users");
        reg.on_connected_epoch();

        let fut = reg.readiness(&users);
        assert_eq!(reg.mark_ready(&["1-0".to_string()]), vec![users.clone()]);
        // A second confirmation is not a second resolution.
        assert!(reg.mark_ready(&["1-0".to_string()]).is_empty());
        timeout(Duration::from_millis(100), fut).await.expect("readiness should resolve");
        assert!(reg.is_ready(&users));
    }

    #[tokio::test]
    async fn disconnect_before_ready_strands_the_old_future() {
        let reg = SubscriptionRegistry::new();
        let users = reg.declare("users");
        reg.on_connected_epoch();
        let stale = reg.readiness(&users);

        reg.on_disconnected();
        reg.on_connected_epoch();
        let fresh = reg.readiness(&users);

        // A late ready for the old epoch id is ignored.
        assert!(reg.mark_ready(&["1-0".to_string()]).is_empty());
        assert!(reg.mark_ready(&["2-0".to_string()]).len() == 1);

        timeout(Duration::from_millis(100), fresh).await.expect("new epoch future resolves");
        assert!(timeout(Duration::from_millis(100), stale).await.is_err(), "old epoch future never resolves");
    }

    #[tokio::test]
    async fn wait_ready_follows_reconnects() {
        let reg = Arc::new(SubscriptionRegistry::new());
        let users = reg.declare("users");
        reg.on_connected_epoch();

        let waiter = {
            let reg = reg.clone();
            let users = users.clone();
            tokio::spawn(async move { reg.wait_ready(&users).await })
        };
        tokio::task::yield_now().await;
        reg.on_disconnected();
        reg.on_connected_epoch();
        reg.mark_ready(&["2-0".to_string()]);

        let res = timeout(Duration::from_millis(100), waiter).await.unwrap().unwrap();
        assert_eq!(res, Ok(()));
    }

    #[tokio::test]
    async fn wait_ready_blocks_while_disconnected() {
        let reg = SubscriptionRegistry::new();
        let users = reg.declare("users");
        reg.on_connected_epoch();
        reg.mark_ready(&["1-0".to_string()]);
        assert_eq!(reg.wait_ready(&users).await, Ok(()));

        reg.on_disconnected();
        assert!(timeout(Duration::from_millis(50), reg.wait_ready(&users)).await.is_err());
    }

    #[tokio::test]
    async fn halt_fails_waiters_and_next_epoch_lifts_it() {
        let reg = SubscriptionRegistry::new();
        let users = reg.declare("users");
        reg.halt(DisconnectedError::ConnectionLost);
        assert_eq!(reg.wait_ready(&users).await, Err(DisconnectedError::ConnectionLost));

        reg.on_connected_epoch();
        reg.mark_ready(&["1-0".to_string()]);
        assert_eq!(reg.wait_ready(&users).await, Ok(()));
    }

    #[tokio::test]
    async fn closed_halt_is_permanent() {
        let reg = SubscriptionRegistry::new();
        let users = reg.declare("users");
        reg.halt(DisconnectedError::Closed);
        reg.resume();
        reg.halt(DisconnectedError::ConnectionLost);
        reg.on_connected_epoch();
        assert_eq!(reg.wait_ready(&users).await, Err(DisconnectedError::Closed));
    }

    #[test]
    fn nosub_deactivates_and_reports() {
        let reg = SubscriptionRegistry::new();
        let users = reg.declare("users");
        reg.on_connected_epoch();
        assert!(reg.is_active(&users));

        let err = reg.mark_nosub("1-0", Some(&json!({"error": 404, "reason": "Subscription 'users' not found"})));
        assert_eq!(
            err,
            Some(SubscriptionError { name: "users".into(), reason: "Subscription 'users' not found".into() })
        );
        assert!(!reg.is_active(&users));
        assert_eq!(reg.mark_nosub("1-0", None), None);
    }
}
