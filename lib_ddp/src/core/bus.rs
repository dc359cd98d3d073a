//! # Collection Change Bus
//!
//! Mirrors every collection the server publishes into an in-memory table and
//! fans each applied mutation out to the watchers of that collection.
//!
//! ## Core Design Principles:
//!
//! 1.  **Atomic apply**: one server frame is applied under the table lock and
//!     its `ChangeEvent` is handed to the watchers before the lock is
//!     released, so no reader ever sees half a frame and per-collection event
//!     order equals apply order.
//!
//! 2.  **DDP merge semantics**: `added` inserts, `changed` replaces only the
//!     named fields and drops the `cleared` ones, `removed` deletes.
//!
//! 3.  **Copy-out reads**: snapshots are owned copies. Nothing outside the bus
//!     ever holds a reference into a mirrored table.
//!
//! 4.  **Silent resync**: on reconnect the tables are cleared without telling
//!     watchers; the server's resend shows up as ordinary `Added` events.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::ddp::{Document, ServerMessage};

/// The contents of one mirrored collection, keyed by document id.
pub type Snapshot = BTreeMap<String, Document>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Changed,
    Removed,
}

/// One applied mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: String,
    pub id: String,
    pub kind: ChangeKind,
    /// Fields carried by the frame (empty for removals).
    pub fields: Document,
    /// Fields a `changed` frame removed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleared: Vec<String>,
    /// The document before the apply, if it existed.
    pub previous: Option<Document>,
    /// The document after the apply, unless it was removed.
    pub current: Option<Document>,
}

/// A registered listener. Several slots may share one sender when a stream
/// watches more than one collection.
struct Watcher {
    id: u64,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct CollectionSlot {
    documents: Snapshot,
    watchers: Vec<Watcher>,
}

#[derive(Default)]
struct BusInner {
    collections: HashMap<String, CollectionSlot>,
    released: bool,
}

/// Owner of all mirrored collections.
#[derive(Default)]
pub struct CollectionBus {
    inner: Mutex<BusInner>,
    next_watcher: AtomicU64,
}

/// Live feed of change events for one or more collections, in apply order.
///
/// Ends (`None`) once the bus releases its watchers.
#[derive(Debug)]
pub struct ChangeStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Returns a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl CollectionBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a watcher for one collection.
    pub fn watch(&self, name: &str) -> ChangeStream {
        self.watch_many(&[name])
    }

    /// Registers a single watcher for several collections. Events of all of
    /// them arrive on one channel in the order they were applied.
    pub fn watch_many<S: AsRef<str>>(&self, names: &[S]) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        if inner.released {
            // Dropping `tx` here hands back an already finished stream.
            return ChangeStream { id, rx };
        }
        for name in names {
            let slot = inner.collections.entry(name.as_ref().to_string()).or_default();
            slot.watchers.push(Watcher { id, sender: tx.clone() });
        }
        tracing::debug!(watcher = id, collections = names.len(), "Watcher registered");
        ChangeStream { id, rx }
    }

    /// Removes a watcher from every collection it was registered on.
    pub fn unwatch(&self, stream_id: u64) {
        let mut inner = self.lock();
        for slot in inner.collections.values_mut() {
            slot.watchers.retain(|w| w.id != stream_id);
        }
    }

    /// Applies one server frame. Returns `true` if it was a document
    /// mutation (and therefore produced exactly one event).
    pub fn apply(&self, msg: ServerMessage) -> bool {
        let mut inner = self.lock();
        let (collection, event) = match msg {
            ServerMessage::Added { collection, id, fields }
            | ServerMessage::AddedBefore { collection, id, fields, .. } => {
                let slot = inner.collections.entry(collection.clone()).or_default();
                let previous = slot.documents.insert(id.clone(), fields.clone());
                let event = ChangeEvent {
                    collection: collection.clone(),
                    id,
                    kind: ChangeKind::Added,
                    current: Some(fields.clone()),
                    fields,
                    cleared: Vec::new(),
                    previous,
                };
                (collection, event)
            }
            ServerMessage::Changed { collection, id, fields, cleared } => {
                let slot = inner.collections.entry(collection.clone()).or_default();
                let previous = slot.documents.get(&id).cloned();
                if previous.is_none() {
                    tracing::warn!(%collection, %id, "changed for unknown document, inserting");
                }
                let doc = slot.documents.entry(id.clone()).or_default();
                for (key, value) in &fields {
                    doc.insert(key.clone(), value.clone());
                }
                for key in &cleared {
                    doc.remove(key);
                }
                let event = ChangeEvent {
                    collection: collection.clone(),
                    id,
                    kind: ChangeKind::Changed,
                    current: Some(doc.clone()),
                    fields,
                    cleared,
                    previous,
                };
                (collection, event)
            }
            ServerMessage::Removed { collection, id } => {
                let slot = inner.collections.entry(collection.clone()).or_default();
                let previous = slot.documents.remove(&id);
                let event = ChangeEvent {
                    collection: collection.clone(),
                    id,
                    kind: ChangeKind::Removed,
                    fields: Document::new(),
                    cleared: Vec::new(),
                    previous,
                    current: None,
                };
                (collection, event)
            }
            ServerMessage::MovedBefore { collection, id, .. } => {
                tracing::trace!(%collection, %id, "Ignoring movedBefore");
                return false;
            }
            _ => return false,
        };

        if let Some(slot) = inner.collections.get_mut(&collection) {
            slot.watchers.retain(|w| match w.sender.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!(watcher = w.id, %collection, "Watcher dropped, removing");
                    false
                }
            });
        }
        true
    }

    /// Empties every mirrored table. Watchers stay registered.
    pub fn clear_all(&self) {
        let mut inner = self.lock();
        let mut dropped = 0usize;
        for slot in inner.collections.values_mut() {
            dropped += slot.documents.len();
            slot.documents.clear();
        }
        tracing::debug!(documents = dropped, "Mirrored collections cleared");
    }

    /// Detaches every watcher; their streams end. Later `watch` calls return
    /// finished streams.
    pub fn release_watchers(&self) {
        let mut inner = self.lock();
        inner.released = true;
        for slot in inner.collections.values_mut() {
            slot.watchers.clear();
        }
    }

    /// Copy of a collection's current contents. Unknown collections are empty.
    pub fn snapshot(&self, name: &str) -> Snapshot {
        self.lock()
            .collections
            .get(name)
            .map(|slot| slot.documents.clone())
            .unwrap_or_default()
    }

    /// Number of documents currently mirrored for `name`.
    pub fn document_count(&self, name: &str) -> usize {
        self.lock().collections.get(name).map_or(0, |slot| slot.documents.len())
    }

    /// Number of live watcher registrations for `name`.
    pub fn watcher_count(&self, name: &str) -> usize {
        self.lock().collections.get(name).map_or(0, |slot| slot.watchers.len())
    }
}

/// Renders a snapshot as the JSON array hosts receive: one object per
/// document, `_id` plus its fields, ordered by id.
pub fn snapshot_to_json(snapshot: &Snapshot) -> Value {
    Value::Array(
        snapshot
            .iter()
            .map(|(id, fields)| {
                let mut doc = Document::new();
                doc.insert("_id".to_string(), Value::String(id.clone()));
                for (key, value) in fields {
                    doc.insert(key.clone(), value.clone());
                }
                Value::Object(doc)
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {}", other),
        }
    }

    fn added(collection: &str, id: &str, fields: Value) -> ServerMessage {
        ServerMessage::Added { collection: collection.into(), id: id.into(), fields: doc(fields) }
    }

    fn changed(collection: &str, id: &str, fields: Value, cleared: &[&str]) -> ServerMessage {
        ServerMessage::Changed {
            collection: collection.into(),
            id: id.into(),
            fields: doc(fields),
            cleared: cleared.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn removed(collection: &str, id: &str) -> ServerMessage {
        ServerMessage::Removed { collection: collection.into(), id: id.into() }
    }

    #[test]
    fn added_then_changed_merges() {
        let bus = CollectionBus::new();
        bus.apply(added("users", "u1", json!({"name": "a"})));
        bus.apply(changed("users", "u1", json!({"name": "b"}), &[]));

        let mut expected = Snapshot::new();
        expected.insert("u1".into(), doc(json!({"name": "b"})));
        assert_eq!(bus.snapshot("users"), expected);
        assert!(bus.snapshot("rooms").is_empty());
    }

    #[test]
    fn changed_keeps_unnamed_fields_and_drops_cleared() {
        let bus = CollectionBus::new();
        bus.apply(added("users", "u1", json!({"name": "a", "age": 3, "city": "x"})));
        bus.apply(changed("users", "u1", json!({"age": 4}), &["city"]));
        assert_eq!(bus.snapshot("users")["u1"], doc(json!({"name": "a", "age": 4})));
    }

    #[test]
    fn fold_over_mixed_sequence() {
        let bus = CollectionBus::new();
        let frames = vec![
            added("c", "1", json!({"a": 1})),
            added("c", "2", json!({"b": 2})),
            changed("c", "1", json!({"a": 10, "z": true}), &[]),
            removed("c", "2"),
            changed("c", "3", json!({"n": 1}), &[]),
            added("c", "2", json!({"b": 3})),
            removed("c", "missing"),
        ];

        let mut model = Snapshot::new();
        for frame in frames {
            match &frame {
                ServerMessage::Added { id, fields, .. } => {
                    model.insert(id.clone(), fields.clone());
                }
                ServerMessage::Changed { id, fields, cleared, .. } => {
                    let entry = model.entry(id.clone()).or_default();
                    for (k, v) in fields {
                        entry.insert(k.clone(), v.clone());
                    }
                    for k in cleared {
                        entry.remove(k);
                    }
                }
                ServerMessage::Removed { id, .. } => {
                    model.remove(id);
                }
                _ => unreachable!(),
            }
            assert!(bus.apply(frame));
        }
        assert_eq!(bus.snapshot("c"), model);
    }

    #[tokio::test]
    async fn each_apply_yields_one_event_in_order() {
        let bus = CollectionBus::new();
        let mut users = bus.watch("users");
        let mut other = bus.watch("rooms");

        bus.apply(added("users", "u1", json!({"name": "a"})));
        bus.apply(changed("users", "u1", json!({"name": "b"}), &[]));
        bus.apply(removed("users", "u1"));

        let first = users.recv().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Added);
        assert_eq!(first.previous, None);

        let second = users.recv().await.unwrap();
        assert_eq!(second.kind, ChangeKind::Changed);
        assert_eq!(second.previous, Some(doc(json!({"name": "a"}))));
        assert_eq!(second.current, Some(doc(json!({"name": "b"}))));

        let third = users.recv().await.unwrap();
        assert_eq!(third.kind, ChangeKind::Removed);
        assert_eq!(third.current, None);

        assert!(users.try_recv().is_none());
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn watch_many_preserves_cross_collection_order() {
        let bus = CollectionBus::new();
        let mut stream = bus.watch_many(&["users", "rooms"]);
        bus.apply(added("rooms", "r1", json!({})));
        bus.apply(added("users", "u1", json!({})));
        bus.apply(added("other", "o1", json!({})));
        bus.apply(removed("rooms", "r1"));

        let seen: Vec<(String, ChangeKind)> = (0..3)
            .map(|_| stream.try_recv().unwrap())
            .map(|e| (e.collection, e.kind))
            .collect();
        assert_eq!(
            seen,
            vec![
                ("rooms".to_string(), ChangeKind::Added),
                ("users".to_string(), ChangeKind::Added),
                ("rooms".to_string(), ChangeKind::Removed),
            ]
        );
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn clear_is_silent_and_keeps_watchers() {
        let bus = CollectionBus::new();
        let mut stream = bus.watch("users");
        bus.apply(added("users", "u1", json!({"name": "a"})));
        assert!(stream.try_recv().is_some());

        bus.clear_all();
        assert_eq!(bus.document_count("users"), 0);
        assert!(stream.try_recv().is_none());
        assert_eq!(bus.watcher_count("users"), 1);

        bus.apply(added("users", "u1", json!({"name": "a"})));
        assert_eq!(stream.try_recv().unwrap().previous, None);
    }

    #[test]
    fn dropped_watchers_are_pruned() {
        let bus = CollectionBus::new();
        let stream = bus.watch("users");
        drop(stream);
        bus.apply(added("users", "u1", json!({})));
        assert_eq!(bus.watcher_count("users"), 0);
    }

    #[tokio::test]
    async fn release_ends_streams() {
        let bus = CollectionBus::new();
        let mut stream = bus.watch("users");
        bus.release_watchers();
        assert_eq!(stream.recv().await, None);
        let mut late = bus.watch("users");
        assert_eq!(late.recv().await, None);
    }

    #[test]
    fn moved_before_is_not_a_mutation() {
        let bus = CollectionBus::new();
        let mut stream = bus.watch("c");
        let moved = ServerMessage::MovedBefore { collection: "c".into(), id: "1".into(), before: None };
        assert!(!bus.apply(moved));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn snapshot_json_shape() {
        let bus = CollectionBus::new();
        bus.apply(added("users", "u2", json!({"name": "b"})));
        bus.apply(added("users", "u1", json!({"name": "a"})));
        assert_eq!(
            snapshot_to_json(&bus.snapshot("users")),
            json!([{"_id": "u1", "name": "a"}, {"_id": "u2", "name": "b"}])
        );
    }
}
