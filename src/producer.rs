//! Producer endpoint — binds a `Set` and a list of pulse cadences to a
//! datastore keyspace, publishing bundles and full snapshots on a
//! per-cadence schedule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cadence;
use crate::datastore::{Datastore, DatastoreValue};
use crate::error::Result;
use crate::item::{Item, ItemSnapshot, ObservedClass};
use crate::pulse::{Pulse, PulseHandle};
use crate::set::{Set, SetEventKind, StructuredSink};

/// Derive `{prefix}` from a configured base path and node name:
/// `base_path + "." + node_name` when `base_path` is non-empty,
/// otherwise bare `node_name`. `node_name` defaults to the lowercased,
/// simply pluralized class name.
pub fn derive_prefix(base_path: &str, node_name: Option<&str>, class_name: &str) -> String {
    let node_name = node_name
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}s", class_name.to_lowercase()));
    if base_path.is_empty() {
        node_name
    } else {
        format!("{base_path}.{node_name}")
    }
}

/// A structured sink that republishes the producer's full `.all`
/// snapshot to the datastore after every event. `StructuredSink::queue`
/// must stay synchronous, so each call hands its snapshot to a single
/// background task over a channel rather than awaiting the write or
/// spawning one task per event — a dedicated consumer processes
/// snapshots strictly in the order they were queued, so a later event's
/// write can never complete before an earlier one's and leave `.all`
/// showing stale state.
struct AllSink<C: ObservedClass> {
    set: Arc<Mutex<Set<C>>>,
    sender: mpsc::UnboundedSender<Vec<ItemSnapshot>>,
}

impl<C: ObservedClass + Send + Sync + 'static> AllSink<C> {
    fn new(datastore: Arc<dyn Datastore>, key: String, set: Arc<Mutex<Set<C>>>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Vec<ItemSnapshot>>();
        tokio::spawn(async move {
            while let Some(snapshot) = receiver.recv().await {
                if let Err(e) = datastore.set(&key, DatastoreValue::Snapshot(snapshot)).await {
                    log::warn!("failed to publish '{key}': {e}");
                }
            }
        });
        Self { set, sender }
    }
}

impl<C: ObservedClass + Send + Sync + 'static> StructuredSink<C> for AllSink<C> {
    fn queue(&mut self, _item: &Item<C>, _kind: &SetEventKind) {
        let snapshot: Vec<_> = {
            let set = self.set.lock().expect("set lock poisoned");
            set.all().iter().map(|item| item.snapshot()).collect()
        };
        let _ = self.sender.send(snapshot);
    }
}

/// Binds one `Set<C>` to a keyspace, running a `Pulse` per configured
/// cadence.
pub struct ProducerEndpoint<C: ObservedClass + Send + Sync + 'static> {
    prefix: String,
    datastore: Arc<dyn Datastore>,
    set: Arc<Mutex<Set<C>>>,
    pulses: Vec<(Duration, PulseHandle)>,
    timers: Vec<tokio::task::JoinHandle<()>>,
}

impl<C: ObservedClass + Send + Sync + 'static> ProducerEndpoint<C> {
    /// Register the endpoint: writes the class name and initial
    /// `.pulsars` mapping, wires one `Pulse` per cadence plus the `.all`
    /// republisher as the `Set`'s transmit sinks. Call `start` to begin
    /// the repeating timers.
    ///
    /// The `.all` key isn't held open by a producer-side callback — the
    /// datastore interface is just `get`/`set` — so this republishes
    /// the full snapshot eagerly after every event instead.
    pub async fn register(
        prefix: String,
        datastore: Arc<dyn Datastore>,
        set: Arc<Mutex<Set<C>>>,
        cadences: Vec<Duration>,
        allow_empty: bool,
        include_checksums: bool,
    ) -> Result<Self> {
        datastore
            .set(&format!("{prefix}.classname"), DatastoreValue::ClassName(C::class_name().to_string()))
            .await?;

        let mut pulsars = HashMap::new();
        for interval in &cadences {
            pulsars.insert(cadence::format(*interval), Vec::new());
        }
        datastore.set(&format!("{prefix}.pulsars"), DatastoreValue::Pulsars(pulsars)).await?;

        let checksum_fn: Arc<dyn Fn() -> String + Send + Sync> = {
            let set = set.clone();
            Arc::new(move || set.lock().expect("set lock poisoned").checksum())
        };

        let mut pulses = Vec::new();
        let mut sinks: Vec<Box<dyn StructuredSink<C> + Send>> =
            vec![Box::new(AllSink::new(datastore.clone(), format!("{prefix}.all"), set.clone()))];

        for interval in &cadences {
            let mut pulse = Pulse::new(true, allow_empty, include_checksums);
            pulse.set_checksum_source(checksum_fn.clone());
            let tag = cadence::format(*interval);
            let bundle_key = format!("{prefix}.pulsars.{tag}");
            let ds = datastore.clone();
            pulse.set_transmit(vec![Box::new(move |bundle: Vec<String>| {
                let ds = ds.clone();
                let key = bundle_key.clone();
                tokio::spawn(async move {
                    if let Err(e) = ds.set(&key, DatastoreValue::Bundle(bundle)).await {
                        log::warn!("failed to publish '{key}': {e}");
                    }
                });
            })]);
            let handle = PulseHandle::new(pulse);
            sinks.push(Box::new(handle.clone()));
            pulses.push((*interval, handle));
        }

        set.lock().expect("set lock poisoned").set_transmit(
            sinks.into_iter().map(crate::set::TransmitSink::Structured).collect(),
        );

        Ok(Self { prefix, datastore, set, pulses, timers: Vec::new() })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn set(&self) -> &Arc<Mutex<Set<C>>> {
        &self.set
    }

    /// Start the repeating per-cadence timers.
    pub fn start(&mut self) {
        for (interval, handle) in &self.pulses {
            if let Some(task) = handle.start(*interval) {
                self.timers.push(task);
            }
        }
    }

    /// Abort all timers and flush every pulse's remaining queue one
    /// last time.
    pub fn stop(&mut self) {
        for task in self.timers.drain(..) {
            task.abort();
        }
        for (_, handle) in &self.pulses {
            handle.trigger();
        }
    }
}
