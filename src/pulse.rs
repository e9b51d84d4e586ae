//! `Pulse` — coalesces a `Set`'s raw `added`/`removed`/`changed` events
//! into bounded bundles, collapsing redundant entries, and flushes them
//! on a timer or on demand.
//!
//! The repeating timer lives on `PulseHandle` (the `Arc`-shared owner)
//! rather than on `Pulse` directly, because `Pulse::queue` must stay
//! synchronous to be called from `Set`'s non-async mutators.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::item::{Item, ItemId, ItemSnapshot, ObservedClass};
use crate::named_value::NamedValueChange;
use crate::payload::{self, WireEvent};
use crate::scalar::Scalar;
use crate::set::{EventChange, SetEventKind, StructuredSink};

#[derive(Debug, Clone)]
enum QueueEntry {
    Added { snapshot: ItemSnapshot },
    Removed { id: ItemId },
    ChangedProperty { id: ItemId, property: String, old_value: Option<Scalar>, new_value: Option<Scalar> },
    ChangedNamed { id: ItemId, property: String, old_value: Option<Scalar>, new_value: Scalar, new_timestamp: DateTime<Utc> },
}

impl QueueEntry {
    fn item_id(&self) -> &ItemId {
        match self {
            QueueEntry::Added { snapshot } => &snapshot.id,
            QueueEntry::Removed { id } => id,
            QueueEntry::ChangedProperty { id, .. } => id,
            QueueEntry::ChangedNamed { id, .. } => id,
        }
    }

    fn to_wire_event(&self) -> WireEvent {
        match self.clone() {
            QueueEntry::Added { snapshot } => payload::added(snapshot),
            QueueEntry::Removed { id } => payload::removed(id),
            QueueEntry::ChangedProperty { id, property, old_value, new_value } => {
                payload::changed_property(id, property, old_value, new_value)
            }
            QueueEntry::ChangedNamed { id, property, old_value, new_value, new_timestamp } => {
                payload::changed_named(id, property, old_value, new_value, new_timestamp)
            }
        }
    }
}

/// Coalescing settings and state for one cadence.
pub struct Pulse {
    collapse: bool,
    allow_empty: bool,
    include_checksums: bool,
    checksum_fn: Option<Arc<dyn Fn() -> String + Send + Sync>>,
    transmit: Vec<Box<dyn FnMut(Vec<String>) + Send>>,

    queue: Vec<Option<QueueEntry>>,
    added_index: HashMap<ItemId, usize>,
    changes_by_item: HashMap<ItemId, Vec<usize>>,
    last_change_index: HashMap<(ItemId, String), usize>,
    start_checksum: Option<String>,
    pending: bool,
}

impl Pulse {
    pub fn new(collapse: bool, allow_empty: bool, include_checksums: bool) -> Self {
        Self {
            collapse,
            allow_empty,
            include_checksums,
            checksum_fn: None,
            transmit: Vec::new(),
            queue: Vec::new(),
            added_index: HashMap::new(),
            changes_by_item: HashMap::new(),
            last_change_index: HashMap::new(),
            start_checksum: None,
            pending: false,
        }
    }

    /// Wire this pulse to the `Set` it bundles for (needed only when
    /// `include_checksums` is set). Producer endpoints call this once,
    /// at construction.
    pub fn set_checksum_source(&mut self, checksum_fn: Arc<dyn Fn() -> String + Send + Sync>) {
        self.checksum_fn = Some(checksum_fn);
    }

    pub fn set_transmit(&mut self, sinks: Vec<Box<dyn FnMut(Vec<String>) + Send>>) {
        self.transmit = sinks;
    }

    fn checksum(&self) -> String {
        self.checksum_fn.as_ref().map(|f| f()).unwrap_or_default()
    }

    fn note_pending(&mut self) {
        if !self.pending {
            self.pending = true;
            if self.include_checksums {
                self.start_checksum = Some(self.checksum());
            }
        }
    }

    fn queue_entry(&mut self, entry: QueueEntry) {
        self.note_pending();
        self.queue.push(Some(entry));
    }

    /// Accept one raw event. Collapsing rules: an `added` immediately
    /// followed by a `removed` for the same id cancels both;
    /// a `removed` nulls every still-queued `changed` for that id; a
    /// `changed` for the same `(id, property)` as an already-queued,
    /// still-live `changed` replaces it, keeping the earliest `old_value`.
    fn push(&mut self, kind: RawEvent) {
        if !self.collapse {
            self.queue_entry(kind.into_entry());
            return;
        }
        self.note_pending();
        match kind {
            RawEvent::Added { id, snapshot } => {
                self.queue.push(Some(QueueEntry::Added { snapshot }));
                self.added_index.insert(id, self.queue.len() - 1);
            }
            RawEvent::Removed { id } => {
                if let Some(add_idx) = self.added_index.remove(&id) {
                    self.queue[add_idx] = None;
                } else {
                    self.queue.push(Some(QueueEntry::Removed { id: id.clone() }));
                }
                if let Some(indices) = self.changes_by_item.remove(&id) {
                    for idx in indices {
                        self.queue[idx] = None;
                    }
                }
                self.last_change_index.retain(|(item_id, _), _| item_id != &id);
            }
            RawEvent::ChangedProperty { id, property, old_value, new_value } => {
                let key = (id.clone(), property.clone());
                let mut effective_old = old_value;
                if let Some(prev_idx) = self.last_change_index.get(&key).copied() {
                    if let Some(QueueEntry::ChangedProperty { old_value: prev_old, .. }) = &self.queue[prev_idx] {
                        effective_old = prev_old.clone();
                    }
                    self.queue[prev_idx] = None;
                    if let Some(list) = self.changes_by_item.get_mut(&id) {
                        list.retain(|&idx| idx != prev_idx);
                    }
                }
                self.queue.push(Some(QueueEntry::ChangedProperty {
                    id: id.clone(),
                    property,
                    old_value: effective_old,
                    new_value,
                }));
                let idx = self.queue.len() - 1;
                self.last_change_index.insert(key, idx);
                self.changes_by_item.entry(id).or_default().push(idx);
            }
            RawEvent::ChangedNamed { id, property, old_value, new_value, new_timestamp } => {
                let key = (id.clone(), property.clone());
                let mut effective_old = old_value;
                if let Some(prev_idx) = self.last_change_index.get(&key).copied() {
                    if let Some(QueueEntry::ChangedNamed { old_value: prev_old, .. }) = &self.queue[prev_idx] {
                        effective_old = prev_old.clone();
                    }
                    self.queue[prev_idx] = None;
                    if let Some(list) = self.changes_by_item.get_mut(&id) {
                        list.retain(|&idx| idx != prev_idx);
                    }
                }
                self.queue.push(Some(QueueEntry::ChangedNamed {
                    id: id.clone(),
                    property,
                    old_value: effective_old,
                    new_value,
                    new_timestamp,
                }));
                let idx = self.queue.len() - 1;
                self.last_change_index.insert(key, idx);
                self.changes_by_item.entry(id).or_default().push(idx);
            }
        }
    }

    /// Flush the current queue to every configured transmit sink and
    /// reset all bookkeeping.
    pub fn trigger(&mut self) {
        if self.transmit.is_empty() {
            self.clear();
            return;
        }
        let mut bundle: Vec<String> = self
            .queue
            .iter()
            .flatten()
            .filter_map(|entry| entry.to_wire_event().to_json().ok())
            .collect();

        if bundle.is_empty() && !self.allow_empty {
            self.clear();
            return;
        }

        if self.include_checksums {
            let start = self.start_checksum.clone().unwrap_or_else(|| self.checksum());
            let end = self.checksum();
            if let Ok(framing) = WireEvent::framing(Some(start), end).to_json() {
                bundle.insert(0, framing);
            }
        }

        for sink in self.transmit.iter_mut() {
            let outcome = catch_unwind(AssertUnwindSafe(|| sink(bundle.clone())));
            if outcome.is_err() {
                log::warn!("pulse transmit sink panicked while delivering a bundle");
            }
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.added_index.clear();
        self.changes_by_item.clear();
        self.last_change_index.clear();
        self.start_checksum = None;
        self.pending = false;
    }
}

enum RawEvent {
    Added { id: ItemId, snapshot: ItemSnapshot },
    Removed { id: ItemId },
    ChangedProperty { id: ItemId, property: String, old_value: Option<Scalar>, new_value: Option<Scalar> },
    ChangedNamed { id: ItemId, property: String, old_value: Option<Scalar>, new_value: Scalar, new_timestamp: DateTime<Utc> },
}

impl RawEvent {
    fn into_entry(self) -> QueueEntry {
        match self {
            RawEvent::Added { snapshot, .. } => QueueEntry::Added { snapshot },
            RawEvent::Removed { id } => QueueEntry::Removed { id },
            RawEvent::ChangedProperty { id, property, old_value, new_value } => {
                QueueEntry::ChangedProperty { id, property, old_value, new_value }
            }
            RawEvent::ChangedNamed { id, property, old_value, new_value, new_timestamp } => {
                QueueEntry::ChangedNamed { id, property, old_value, new_value, new_timestamp }
            }
        }
    }
}

fn to_raw_event<C: ObservedClass>(item: &Item<C>, kind: &SetEventKind) -> RawEvent {
    match kind {
        SetEventKind::Added => RawEvent::Added { id: item.id().clone(), snapshot: item.snapshot() },
        SetEventKind::Removed => RawEvent::Removed { id: item.id().clone() },
        SetEventKind::Changed(EventChange::Property(change)) => RawEvent::ChangedProperty {
            id: item.id().clone(),
            property: change.property.clone(),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
        },
        SetEventKind::Changed(EventChange::Named(name, change)) => RawEvent::ChangedNamed {
            id: item.id().clone(),
            property: name.clone(),
            old_value: change.old_value.clone(),
            new_value: change.new_value.clone(),
            new_timestamp: change.new_timestamp,
        },
    }
}

/// Shared handle to a `Pulse`, installable as a `Set`'s structured
/// transmit sink and independently start/stop-able on a repeating
/// timer.
#[derive(Clone)]
pub struct PulseHandle(Arc<Mutex<Pulse>>);

impl PulseHandle {
    pub fn new(pulse: Pulse) -> Self {
        Self(Arc::new(Mutex::new(pulse)))
    }

    pub fn trigger(&self) {
        self.0.lock().expect("pulse lock poisoned").trigger();
    }

    /// Start a repeating timer that calls `trigger` every `interval`,
    /// or skip installing one when `interval` is zero. Returns the
    /// spawned task so the caller (a `ProducerEndpoint`) can `abort()`
    /// it in `stop()`.
    pub fn start(&self, interval: Duration) -> Option<tokio::task::JoinHandle<()>> {
        if interval.is_zero() {
            return None;
        }
        let handle = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                handle.trigger();
            }
        }))
    }
}

impl<C: ObservedClass> StructuredSink<C> for PulseHandle {
    fn queue(&mut self, item: &Item<C>, kind: &SetEventKind) {
        let raw = to_raw_event(item, kind);
        self.0.lock().expect("pulse lock poisoned").push(raw);
    }
}
