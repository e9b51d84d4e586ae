//! `Set<C>` — an insertion-ordered collection of one declared class of
//! `Item`, with pluggable transmit sinks and a set-wide checksum
//! (concatenate each member's own checksum, sorted, then re-hash).
//! `Set<C>` itself holds no internal lock — callers pick their own
//! shared wrapper (a `Mutex<Set<C>>`, typically).

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::item::{Item, ItemId, ObservedClass, PropertyChange};
use crate::named_value::NamedValueChange;
use crate::payload;
use crate::scalar::Scalar;
use crate::payload::WireEvent;

/// What happened, for listener and sink dispatch: one of the internal
/// `added`/`removed`/`changed` events a `Set` produces.
#[derive(Debug, Clone)]
pub enum SetEventKind {
    Added,
    Removed,
    Changed(EventChange),
}

#[derive(Debug, Clone)]
pub enum EventChange {
    Property(PropertyChange),
    Named(String, NamedValueChange),
}

type Listener<C> = Box<dyn Fn(&Item<C>, &SetEventKind) + Send>;

/// A destination for a `Set`'s events. `Payload` sinks see one
/// already-encoded wire event per call; `Structured` sinks (a `Pulse`,
/// typically) see the raw item and change and decide for themselves
/// whether/when to flush.
pub enum TransmitSink<C: ObservedClass> {
    Payload(Box<dyn FnMut(String) + Send>),
    Structured(Box<dyn StructuredSink<C> + Send>),
}

pub trait StructuredSink<C: ObservedClass> {
    fn queue(&mut self, item: &Item<C>, kind: &SetEventKind);
}

/// Render one `Set` event as its wire JSON shape.
fn encode_event<C: ObservedClass>(item: &Item<C>, kind: &SetEventKind) -> Result<String> {
    let event = match kind {
        SetEventKind::Added => payload::added(item.snapshot()),
        SetEventKind::Removed => payload::removed(item.id().clone()),
        SetEventKind::Changed(EventChange::Property(change)) => payload::changed_property(
            item.id().clone(),
            change.property.clone(),
            change.old_value.clone(),
            change.new_value.clone(),
        ),
        SetEventKind::Changed(EventChange::Named(name, change)) => payload::changed_named(
            item.id().clone(),
            name.clone(),
            change.old_value.clone(),
            change.new_value.clone(),
            change.new_timestamp,
        ),
    };
    event.to_json()
}

/// An insertion-ordered collection of `Item<C>`, keyed by `ItemId`.
pub struct Set<C: ObservedClass> {
    items: HashMap<ItemId, Item<C>>,
    order: Vec<ItemId>,
    sinks: Vec<TransmitSink<C>>,
    listeners: Vec<Listener<C>>,
    checksum_cache: RefCell<Option<String>>,
}

impl<C: ObservedClass> Default for Set<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ObservedClass> Set<C> {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            order: Vec::new(),
            sinks: Vec::new(),
            listeners: Vec::new(),
            checksum_cache: RefCell::new(None),
        }
    }

    pub fn class_name(&self) -> &'static str {
        C::class_name()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn find(&self, id: &ItemId) -> Option<&Item<C>> {
        self.items.get(id)
    }

    /// All items in insertion order.
    pub fn all(&self) -> Vec<&Item<C>> {
        self.order.iter().filter_map(|id| self.items.get(id)).collect()
    }

    /// Register a local observer. Called synchronously, in registration
    /// order, for every `added`/`removed`/`changed` event this `Set`
    /// produces — including ones produced by `receive`/`update_set_to`,
    /// so consumer-side code sees the same local change events it would
    /// if the mutations had happened directly.
    pub fn on_event(&mut self, listener: Listener<C>) {
        self.listeners.push(listener);
    }

    /// Replace this `Set`'s transmit sinks. An empty vector disables
    /// transmission.
    pub fn set_transmit(&mut self, sinks: Vec<TransmitSink<C>>) {
        self.sinks = sinks;
    }

    pub fn add(&mut self, item: Item<C>) -> Result<()> {
        let id = item.id().clone();
        if self.items.contains_key(&id) {
            return Err(Error::DuplicateId(id));
        }
        self.order.push(id.clone());
        self.items.insert(id.clone(), item);
        let item_ref = self.items.get(&id).expect("just inserted");
        Self::emit(&self.listeners, &mut self.sinks, item_ref, &SetEventKind::Added);
        self.checksum_cache.replace(None);
        Ok(())
    }

    pub fn remove(&mut self, id: &ItemId) -> Result<()> {
        let item = self.items.remove(id).ok_or_else(|| Error::NotFound(id.clone()))?;
        self.order.retain(|existing| existing != id);
        Self::emit(&self.listeners, &mut self.sinks, &item, &SetEventKind::Removed);
        self.checksum_cache.replace(None);
        Ok(())
    }

    /// Assign an observed property on an existing item and emit the
    /// resulting `changed` event(s).
    pub fn set_property(&mut self, id: &ItemId, name: &str, value: Option<Scalar>) -> Result<()> {
        let changes = {
            let item = self.items.get_mut(id).ok_or_else(|| Error::UnknownItem(id.clone()))?;
            item.set_property(name, value)?
        };
        self.emit_property_changes(id, changes);
        Ok(())
    }

    /// Re-sweep an item's observed properties after an out-of-band
    /// mutation via `find_mut`/`inner_mut`, emitting any differences
    /// found.
    pub fn mark_dirty(&mut self, id: &ItemId) -> Result<()> {
        let changes = {
            let item = self.items.get_mut(id).ok_or_else(|| Error::UnknownItem(id.clone()))?;
            item.mark_dirty()
        };
        self.emit_property_changes(id, changes);
        Ok(())
    }

    pub fn find_mut(&mut self, id: &ItemId) -> Option<&mut Item<C>> {
        self.items.get_mut(id)
    }

    pub fn set_named(
        &mut self,
        id: &ItemId,
        name: &str,
        value: Scalar,
        timestamp: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()> {
        let change = {
            let item = self.items.get_mut(id).ok_or_else(|| Error::UnknownItem(id.clone()))?;
            item.set_named(name, value, timestamp)
        };
        if let Some(change) = change {
            let item_ref = self.items.get(id).expect("present");
            Self::emit(
                &self.listeners,
                &mut self.sinks,
                item_ref,
                &SetEventKind::Changed(EventChange::Named(name.to_string(), change)),
            );
            self.checksum_cache.replace(None);
        }
        Ok(())
    }

    pub fn unset_named(&mut self, id: &ItemId, name: &str) -> Result<()> {
        let item = self.items.get_mut(id).ok_or_else(|| Error::UnknownItem(id.clone()))?;
        if item.unset_named(name) {
            self.checksum_cache.replace(None);
        }
        Ok(())
    }

    fn emit_property_changes(&mut self, id: &ItemId, changes: Vec<PropertyChange>) {
        if changes.is_empty() {
            return;
        }
        let item_ref = self.items.get(id).expect("present");
        for change in changes {
            Self::emit(
                &self.listeners,
                &mut self.sinks,
                item_ref,
                &SetEventKind::Changed(EventChange::Property(change)),
            );
        }
        self.checksum_cache.replace(None);
    }

    fn emit(listeners: &[Listener<C>], sinks: &mut [TransmitSink<C>], item: &Item<C>, kind: &SetEventKind) {
        for listener in listeners {
            listener(item, kind);
        }
        for sink in sinks.iter_mut() {
            // A sink that panics does not stop delivery to the rest.
            let outcome = catch_unwind(AssertUnwindSafe(|| match sink {
                TransmitSink::Payload(f) => {
                    if let Ok(payload) = encode_event(item, kind) {
                        f(payload);
                    }
                }
                TransmitSink::Structured(s) => s.queue(item, kind),
            }));
            if outcome.is_err() {
                log::warn!("transmit sink panicked while delivering a '{}' event", item.id());
            }
        }
    }

    /// Parse and apply a single wire event. Each entry of a `Pulse`
    /// bundle is submitted here independently by the consumer engine.
    pub fn receive(&mut self, payload: &str) -> Result<()> {
        match WireEvent::from_json(payload)? {
            WireEvent::Added { item } => {
                let mut inner = C::construct();
                for (name, value) in &item.properties {
                    inner.set_property(name, Some(value.clone()))?;
                }
                let mut built = Item::new(item.id.clone(), inner);
                for (name, nv) in item.notions {
                    built.set_named(&nv.name, nv.value, Some(nv.timestamp));
                }
                self.add(built)
            }
            WireEvent::Removed { item } => self.remove(&item.id),
            WireEvent::Changed { item, change } => match change.new_timestamp {
                Some(ts) => {
                    let value = change
                        .new_value
                        .ok_or_else(|| Error::Malformed("named value change missing new_value".into()))?;
                    self.set_named(&item.id, &change.property, value, Some(ts))
                }
                None => self.set_property(&item.id, &change.property, change.new_value),
            },
            WireEvent::Comment { .. } => Ok(()),
        }
    }

    /// Force this set to match `items` exactly: add what's missing,
    /// remove what's no longer present, then reconcile the rest in
    /// place, in that order.
    pub fn update_set_to(&mut self, items: Vec<Item<C>>) -> Result<()> {
        let incoming: HashMap<ItemId, Item<C>> = items.into_iter().map(|item| (item.id().clone(), item)).collect();

        let to_add: Vec<ItemId> =
            incoming.keys().filter(|id| !self.items.contains_key(*id)).cloned().collect();
        let to_remove: Vec<ItemId> =
            self.order.iter().filter(|id| !incoming.contains_key(*id)).cloned().collect();

        let mut incoming = incoming;
        for id in to_add {
            let item = incoming.remove(&id).expect("present");
            self.add(item)?;
        }
        for id in &to_remove {
            self.remove(id)?;
        }
        for (id, target) in incoming {
            let outcome = {
                let item = self.items.get_mut(&id).ok_or_else(|| Error::UnknownItem(id.clone()))?;
                item.update_to(&target)
            };
            for change in outcome.property_changes {
                let item_ref = self.items.get(&id).expect("present");
                Self::emit(
                    &self.listeners,
                    &mut self.sinks,
                    item_ref,
                    &SetEventKind::Changed(EventChange::Property(change)),
                );
            }
            for (name, change) in outcome.named_changes {
                let item_ref = self.items.get(&id).expect("present");
                Self::emit(
                    &self.listeners,
                    &mut self.sinks,
                    item_ref,
                    &SetEventKind::Changed(EventChange::Named(name, change)),
                );
            }
            self.checksum_cache.replace(None);
        }
        Ok(())
    }

    /// SHA-256 hex digest over the sorted concatenation of every
    /// member's own checksum. Lazily cached; invalidated by any mutator
    /// above.
    pub fn checksum(&self) -> String {
        if let Some(cached) = self.checksum_cache.borrow().as_ref() {
            return cached.clone();
        }
        let mut digests: Vec<String> = self.items.values().map(|item| item.checksum()).collect();
        digests.sort();
        let mut hasher = Sha256::new();
        hasher.update(digests.join("").as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.checksum_cache.replace(Some(digest.clone()));
        digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::Scalar;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default, Clone)]
    struct Widget {
        label: Option<Scalar>,
    }

    impl ObservedClass for Widget {
        fn class_name() -> &'static str {
            "Widget"
        }
        fn observed_property_names() -> &'static [&'static str] {
            &["label"]
        }
        fn construct() -> Self {
            Self::default()
        }
        fn get_property(&self, name: &str) -> Option<Scalar> {
            match name {
                "label" => self.label.clone(),
                _ => None,
            }
        }
        fn set_property(&mut self, name: &str, value: Option<Scalar>) -> Result<()> {
            match name {
                "label" => self.label = value,
                other => return Err(Error::InvalidArgument(format!("unknown property '{other}'"))),
            }
            Ok(())
        }
    }

    fn widget(id: &str) -> Item<Widget> {
        Item::new(ItemId::new(id).unwrap(), Widget::default())
    }

    #[test]
    fn add_rejects_duplicate_id() {
        let mut set = Set::new();
        set.add(widget("w1")).unwrap();
        let err = set.add(widget("w1")).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
    }

    #[test]
    fn remove_missing_is_not_found() {
        let mut set: Set<Widget> = Set::new();
        let err = set.remove(&ItemId::new("missing").unwrap()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn checksum_changes_on_mutation() {
        let mut set = Set::new();
        set.add(widget("w1")).unwrap();
        let before = set.checksum();
        set.set_property(&ItemId::new("w1").unwrap(), "label", Some(Scalar::Str("x".into()))).unwrap();
        assert_ne!(before, set.checksum());
    }

    #[test]
    fn checksum_independent_of_insertion_order() {
        let mut a: Set<Widget> = Set::new();
        a.add(widget("w1")).unwrap();
        a.add(widget("w2")).unwrap();

        let mut b: Set<Widget> = Set::new();
        b.add(widget("w2")).unwrap();
        b.add(widget("w1")).unwrap();

        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn all_preserves_insertion_order() {
        let mut set: Set<Widget> = Set::new();
        set.add(widget("w2")).unwrap();
        set.add(widget("w1")).unwrap();
        let ids: Vec<&str> = set.all().iter().map(|i| i.id().as_str()).collect();
        assert_eq!(ids, vec!["w2", "w1"]);
    }

    #[test]
    fn receive_added_then_removed() {
        let mut set: Set<Widget> = Set::new();
        let added = payload::added(widget("w1").snapshot()).to_json().unwrap();
        set.receive(&added).unwrap();
        assert!(set.find(&ItemId::new("w1").unwrap()).is_some());

        let removed = payload::removed(ItemId::new("w1").unwrap()).to_json().unwrap();
        set.receive(&removed).unwrap();
        assert!(set.find(&ItemId::new("w1").unwrap()).is_none());
    }

    #[test]
    fn receive_property_change_without_timestamp_assigns_property() {
        let mut set: Set<Widget> = Set::new();
        set.add(widget("w1")).unwrap();
        let event = payload::changed_property(
            ItemId::new("w1").unwrap(),
            "label".into(),
            None,
            Some(Scalar::Str("hi".into())),
        )
        .to_json()
        .unwrap();
        set.receive(&event).unwrap();
        assert_eq!(
            set.find(&ItemId::new("w1").unwrap()).unwrap().inner().label,
            Some(Scalar::Str("hi".into()))
        );
    }

    #[test]
    fn receive_named_change_with_timestamp_sets_named_value() {
        let mut set: Set<Widget> = Set::new();
        set.add(widget("w1")).unwrap();
        let event = payload::changed_named(
            ItemId::new("w1").unwrap(),
            "tag".into(),
            None,
            Scalar::Bool(true),
            chrono::Utc::now(),
        )
        .to_json()
        .unwrap();
        set.receive(&event).unwrap();
        assert_eq!(set.find(&ItemId::new("w1").unwrap()).unwrap().get_named("tag"), Some(&Scalar::Bool(true)));
    }

    #[test]
    fn receive_rejects_malformed_payload() {
        let mut set: Set<Widget> = Set::new();
        let err = set.receive("not json").unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn update_set_to_adds_removes_and_reconciles() {
        let mut set: Set<Widget> = Set::new();
        set.add(widget("keep")).unwrap();
        set.add(widget("drop")).unwrap();

        let mut target_keep = widget("keep");
        target_keep.inner_mut().label = Some(Scalar::Str("new".into()));
        target_keep.mark_dirty();
        let target_add = widget("add");

        set.update_set_to(vec![target_keep, target_add]).unwrap();

        assert!(set.find(&ItemId::new("drop").unwrap()).is_none());
        assert!(set.find(&ItemId::new("add").unwrap()).is_some());
        assert_eq!(
            set.find(&ItemId::new("keep").unwrap()).unwrap().inner().label,
            Some(Scalar::Str("new".into()))
        );
    }

    #[test]
    fn on_event_listener_observes_additions() {
        let mut set: Set<Widget> = Set::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        set.on_event(Box::new(move |item, kind| {
            if matches!(kind, SetEventKind::Added) {
                seen2.lock().unwrap().push(item.id().to_string());
            }
        }));
        set.add(widget("w1")).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["w1".to_string()]);
    }

    #[test]
    fn set_transmit_empty_disables_delivery() {
        let mut set: Set<Widget> = Set::new();
        set.set_transmit(Vec::new());
        set.add(widget("w1")).unwrap();
    }
}
