//! `Item` — an identified object holding observed scalar properties and
//! named values.
//!
//! Property mutation is tracked via a static accessor table rather
//! than by trapping arbitrary setters: `ObservedClass` names the
//! properties a type exposes and how to read/write them by name, and
//! `Item<C>` drives the dirty sweep against that table.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::named_value::{NamedValue, NamedValueChange, NamedValueSnapshot};
use crate::scalar::Scalar;

/// Opaque, non-empty, globally unique identifier for an `Item`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Validate and wrap an externally supplied id.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidArgument("item id must not be empty".into()));
        }
        Ok(Self(id))
    }

    /// Generate a fresh, process-unique id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> String {
        id.0
    }
}

/// The static property table a managed type exposes to its owning
/// `Item`: a mapping from property name to an accessor, known entirely
/// at compile time rather than discovered by runtime reflection.
pub trait ObservedClass: Sized {
    /// The class name used in wire payloads and checksum input.
    fn class_name() -> &'static str;

    /// All property names this type can expose as observed scalars,
    /// in declaration order.
    fn observed_property_names() -> &'static [&'static str];

    /// Build a blank instance, used when materializing an `Item` from a
    /// wire snapshot.
    fn construct() -> Self;

    /// Read the current value of an observed property. Returning
    /// `None` means "absent".
    fn get_property(&self, name: &str) -> Option<Scalar>;

    /// Assign a property by name. Implementations should reject names
    /// not in `observed_property_names()`.
    fn set_property(&mut self, name: &str, value: Option<Scalar>) -> Result<()>;
}

/// A diff produced by `Item::mark_dirty` or `Item::update_to` for a
/// single observed property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub property: String,
    pub old_value: Option<Scalar>,
    pub new_value: Option<Scalar>,
}

/// Everything `Item::update_to` produced, handed back to the caller
/// (`Set`) so it can replay the same events a live mutation would have
/// produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub property_changes: Vec<PropertyChange>,
    pub named_changes: Vec<(String, NamedValueChange)>,
    pub named_removed: Vec<String>,
}

/// Wire/debug snapshot of an `Item`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub id: ItemId,
    #[serde(rename = "type")]
    pub class_name: String,
    #[serde(default)]
    pub notions: HashMap<String, NamedValueSnapshot>,
    #[serde(default)]
    pub properties: HashMap<String, Scalar>,
}

/// An identified object of managed class `C`: owns observed scalar
/// properties (backed by `C`'s accessor table) and timestamped named
/// values, and exposes a deterministic checksum.
pub struct Item<C: ObservedClass> {
    id: ItemId,
    inner: C,
    observed: Vec<String>,
    last_observed: HashMap<String, Option<Scalar>>,
    named_values: HashMap<String, NamedValue>,
    checksum_cache: RefCell<Option<String>>,
}

impl<C: ObservedClass> Item<C> {
    /// Wrap `inner` as a new `Item`, declaring all of `C`'s observed
    /// properties.
    pub fn new(id: ItemId, inner: C) -> Self {
        let observed: Vec<String> =
            C::observed_property_names().iter().map(|s| s.to_string()).collect();
        let mut item = Self {
            id,
            inner,
            observed,
            last_observed: HashMap::new(),
            named_values: HashMap::new(),
            checksum_cache: RefCell::new(None),
        };
        item.mark_dirty();
        item
    }

    /// Narrow the observed set to a subset of `C`'s declared
    /// properties. Resets "last observed" to absent for the new set
    /// and runs a dirty sweep.
    pub fn declare_observed(&mut self, names: Vec<String>) -> Result<()> {
        let known = C::observed_property_names();
        for name in &names {
            if !known.contains(&name.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "'{}' is not an observed property of {}",
                    name,
                    C::class_name()
                )));
            }
        }
        self.observed = names;
        self.last_observed.clear();
        self.checksum_cache.replace(None);
        self.mark_dirty();
        Ok(())
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    /// Re-read every observed property from `C` and report any that
    /// changed since the last sweep. The checksum cache is invalidated
    /// before this returns so a handler reading `checksum()` after the
    /// fact sees the new value.
    pub fn mark_dirty(&mut self) -> Vec<PropertyChange> {
        self.checksum_cache.replace(None);
        let mut changes = Vec::new();
        for name in self.observed.clone() {
            let current = self.inner.get_property(&name);
            let previous = self.last_observed.get(&name).cloned().unwrap_or(None);
            if current != previous {
                self.last_observed.insert(name.clone(), current.clone());
                changes.push(PropertyChange {
                    property: name,
                    old_value: previous,
                    new_value: current,
                });
            }
        }
        changes
    }

    /// Assign an observed property directly (used by `Set::receive`
    /// for `changed` events without a `new_timestamp`). Delegates to
    /// `C::set_property` then runs a dirty sweep so the change is
    /// picked up uniformly.
    pub fn set_property(&mut self, name: &str, value: Option<Scalar>) -> Result<Vec<PropertyChange>> {
        self.inner.set_property(name, value)?;
        Ok(self.mark_dirty())
    }

    /// Create or update a named value. `timestamp` defaults to
    /// `Utc::now()` when `None`.
    pub fn set_named(
        &mut self,
        name: &str,
        value: Scalar,
        timestamp: Option<DateTime<Utc>>,
    ) -> Option<NamedValueChange> {
        self.checksum_cache.replace(None);
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        if let Some(existing) = self.named_values.get_mut(name) {
            existing.set(value, timestamp)
        } else {
            self.named_values.insert(name.to_string(), NamedValue::new(name, value.clone(), timestamp));
            Some(NamedValueChange { old_value: None, new_value: value, new_timestamp: timestamp })
        }
    }

    /// Remove a named value silently — no change event.
    pub fn unset_named(&mut self, name: &str) -> bool {
        self.checksum_cache.replace(None);
        self.named_values.remove(name).is_some()
    }

    pub fn get_named(&self, name: &str) -> Option<&Scalar> {
        self.named_values.get(name).map(|nv| nv.value())
    }

    pub fn named_values(&self) -> &HashMap<String, NamedValue> {
        &self.named_values
    }

    /// Copy observed properties from `target` (only where unequal) and
    /// reconcile named values, exactly as a remote `changed` bundle
    /// would. Because `Item<C>` is monomorphized over one `C`, a
    /// class mismatch between `self` and `target` is impossible to
    /// express and so is rejected by the compiler rather than checked
    /// here at runtime.
    pub fn update_to(&mut self, target: &Item<C>) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();
        for name in &self.observed.clone() {
            let mine = self.inner.get_property(name);
            let theirs = target.inner.get_property(name);
            if mine != theirs {
                let _ = self.inner.set_property(name, theirs.clone());
                outcome.property_changes.push(PropertyChange {
                    property: name.clone(),
                    old_value: mine,
                    new_value: theirs,
                });
            }
        }
        self.last_observed = self.observed.iter().cloned()
            .map(|name| {
                let v = self.inner.get_property(&name);
                (name, v)
            })
            .collect();

        for (name, target_nv) in &target.named_values {
            let changed = match self.named_values.get_mut(name) {
                Some(existing) => existing.set(target_nv.value().clone(), target_nv.timestamp()),
                None => {
                    self.named_values.insert(name.clone(), target_nv.clone());
                    Some(NamedValueChange {
                        old_value: None,
                        new_value: target_nv.value().clone(),
                        new_timestamp: target_nv.timestamp(),
                    })
                }
            };
            if let Some(change) = changed {
                outcome.named_changes.push((name.clone(), change));
            }
        }
        let to_remove: Vec<String> = self
            .named_values
            .keys()
            .filter(|name| !target.named_values.contains_key(*name))
            .cloned()
            .collect();
        for name in to_remove {
            self.named_values.remove(&name);
            outcome.named_removed.push(name);
        }
        self.checksum_cache.replace(None);
        outcome
    }

    pub fn snapshot(&self) -> ItemSnapshot {
        let properties = self
            .observed
            .iter()
            .filter_map(|name| self.inner.get_property(name).map(|v| (name.clone(), v)))
            .collect();
        let notions = self
            .named_values
            .iter()
            .map(|(k, v)| (k.clone(), v.snapshot()))
            .collect();
        ItemSnapshot { id: self.id.clone(), class_name: C::class_name().to_string(), notions, properties }
    }

    /// Materialize an `Item` from a wire snapshot. Validates
    /// `className`, restores named values and properties; does not
    /// re-declare the observed set (`C` fixes it statically — see
    /// module docs).
    pub fn from_snapshot(snapshot: ItemSnapshot, mut inner: C) -> Result<Self> {
        if snapshot.class_name != C::class_name() {
            return Err(Error::WrongType {
                expected: C::class_name().to_string(),
                found: snapshot.class_name,
            });
        }
        for (name, value) in &snapshot.properties {
            inner.set_property(name, Some(value.clone()))?;
        }
        let mut item = Self::new(snapshot.id, inner);
        for (name, nv) in snapshot.notions {
            item.named_values.insert(name, NamedValue::from_snapshot(nv));
        }
        Ok(item)
    }

    /// SHA-256 hex digest of a deterministic serialization of `(id,
    /// class name, sorted properties, sorted named values including
    /// timestamps)`. Lazily cached; invalidated by any mutator above.
    pub fn checksum(&self) -> String {
        if let Some(cached) = self.checksum_cache.borrow().as_ref() {
            return cached.clone();
        }
        let mut parts = vec![format!("id:{}", self.id), format!("type:{}", C::class_name())];

        let mut prop_names: Vec<&String> = self.observed.iter().collect();
        prop_names.sort();
        for name in prop_names {
            let value = self.inner.get_property(name);
            parts.push(format!("prop:{}:{}", name, Scalar::encode(value.as_ref())));
        }

        let mut notion_names: Vec<&String> = self.named_values.keys().collect();
        notion_names.sort();
        for name in notion_names {
            let nv = &self.named_values[name];
            parts.push(format!(
                "notion:{}:{}:{}",
                name,
                Scalar::encode(Some(nv.value())),
                nv.timestamp().to_rfc3339()
            ));
        }

        let joined = parts.join("|");
        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.checksum_cache.replace(Some(digest.clone()));
        digest
    }
}
