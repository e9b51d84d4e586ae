//! Consumer engine — polls a producer's keyspace and keeps a mirror
//! `Set` in sync, stepping through an INITIAL/POLLING state machine on
//! a `tokio::time::interval`-driven runloop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backoff::Backoff;
use crate::datastore::{Datastore, DatastoreValue};
use crate::error::{Error, Result};
use crate::item::{Item, ObservedClass};
use crate::payload::WireEvent;
use crate::set::Set;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Haven't yet validated the producer's class/cadence and pulled a
    /// full snapshot.
    Initial,
    /// Steady-state: polling the bundle for our cadence tag.
    Polling,
}

/// Polls one producer's keyspace for one `Set<C>`.
pub struct ConsumerEngine<C: ObservedClass + Send + Sync + 'static> {
    prefix: String,
    cadence_tag: String,
    datastore: Arc<dyn Datastore>,
    set: Arc<Mutex<Set<C>>>,
    state: Mutex<ConsumerState>,
    backoff: Mutex<Backoff>,
    last_checksum: Mutex<Option<String>>,
    running: Mutex<bool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<C: ObservedClass + Send + Sync + 'static> ConsumerEngine<C> {
    pub fn new(
        prefix: String,
        cadence_tag: String,
        datastore: Arc<dyn Datastore>,
        set: Arc<Mutex<Set<C>>>,
        backoff: Backoff,
    ) -> Self {
        Self {
            prefix,
            cadence_tag,
            datastore,
            set,
            state: Mutex::new(ConsumerState::Initial),
            backoff: Mutex::new(backoff),
            last_checksum: Mutex::new(None),
            running: Mutex::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        *self.running.lock().expect("running lock poisoned")
    }

    /// Force the engine back to `Initial` on its next tick, discarding
    /// any assumption about the producer's current checksum. Fails if
    /// the engine isn't running.
    pub fn resync(&self) -> Result<()> {
        if !*self.running.lock().expect("running lock poisoned") {
            return Err(Error::NotRunning);
        }
        *self.state.lock().expect("state lock poisoned") = ConsumerState::Initial;
        Ok(())
    }

    /// Spawn the runloop, ticking every `runloop_interval` and backing
    /// off on faults per the configured `Backoff` schedule. Fails if
    /// already running.
    pub fn start(self: &Arc<Self>, runloop_interval: Duration) -> Result<()> {
        let mut running = self.running.lock().expect("running lock poisoned");
        if *running {
            return Err(Error::AlreadyRunning);
        }
        *running = true;
        drop(running);

        let engine = self.clone();
        let task = tokio::spawn(async move { engine.run(runloop_interval).await });
        *self.handle.lock().expect("handle lock poisoned") = Some(task);
        Ok(())
    }

    /// Abort the runloop, reset to `Initial`, and reset the backoff
    /// schedule. Fails if not running.
    pub fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().expect("running lock poisoned");
        if !*running {
            return Err(Error::NotRunning);
        }
        *running = false;
        drop(running);

        if let Some(task) = self.handle.lock().expect("handle lock poisoned").take() {
            task.abort();
        }
        *self.state.lock().expect("state lock poisoned") = ConsumerState::Initial;
        self.backoff.lock().expect("backoff lock poisoned").reset();
        Ok(())
    }

    /// Drive the runloop forever, ticking every `runloop_interval` and
    /// backing off on faults per the configured `Backoff` schedule.
    /// Normally driven via `start`; exposed so tests (and callers that
    /// want to manage their own task) can run it directly.
    pub async fn run(&self, runloop_interval: Duration) {
        let mut ticker = tokio::time::interval(runloop_interval);
        loop {
            ticker.tick().await;
            self.step().await;
        }
    }

    /// Run exactly one state transition. Exposed separately from `run`
    /// so tests can drive the engine deterministically.
    pub async fn step(&self) {
        let state = self.state();
        let result = match state {
            ConsumerState::Initial => self.do_initial().await,
            ConsumerState::Polling => self.do_poll().await,
        };
        match result {
            Ok(()) => self.backoff.lock().expect("backoff lock poisoned").reset(),
            Err(e) => {
                log::warn!("consumer engine fault in {state:?} state for '{}': {e}", self.prefix);
                let delay = self.backoff.lock().expect("backoff lock poisoned").advance();
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn do_initial(&self) -> Result<()> {
        let classname_key = format!("{}.classname", self.prefix);
        match self.datastore.get(&classname_key).await? {
            Some(DatastoreValue::ClassName(name)) if name == C::class_name() => {}
            Some(_) => {
                return Err(Error::ConfigurationError(format!("unexpected value at '{classname_key}'")))
            }
            None => return Err(Error::ConfigurationError(format!("'{classname_key}' not found"))),
        }

        let pulsars_key = format!("{}.pulsars", self.prefix);
        match self.datastore.get(&pulsars_key).await? {
            Some(DatastoreValue::Pulsars(tags)) if tags.contains_key(&self.cadence_tag) => {}
            Some(_) => {
                return Err(Error::ConfigurationError(format!(
                    "cadence '{}' not registered at '{pulsars_key}'",
                    self.cadence_tag
                )))
            }
            None => return Err(Error::ConfigurationError(format!("'{pulsars_key}' not found"))),
        }

        let all_key = format!("{}.all", self.prefix);
        let snapshot = match self.datastore.get(&all_key).await? {
            Some(DatastoreValue::Snapshot(items)) => items,
            Some(_) => return Err(Error::ConfigurationError(format!("unexpected value at '{all_key}'"))),
            None => Vec::new(),
        };
        let items = snapshot
            .into_iter()
            .map(|s| Item::from_snapshot(s, C::construct()))
            .collect::<Result<Vec<_>>>()?;

        {
            let mut set = self.set.lock().expect("set lock poisoned");
            set.update_set_to(items)?;
            *self.last_checksum.lock().expect("checksum lock poisoned") = Some(set.checksum());
        }
        *self.state.lock().expect("state lock poisoned") = ConsumerState::Polling;
        Ok(())
    }

    async fn do_poll(&self) -> Result<()> {
        let key = format!("{}.pulsars.{}", self.prefix, self.cadence_tag);
        let bundle = match self.datastore.get(&key).await? {
            Some(DatastoreValue::Bundle(bundle)) => bundle,
            Some(_) => return Err(Error::ConfigurationError(format!("'{key}' is not a bundle"))),
            None => Vec::new(),
        };
        if bundle.is_empty() {
            return Ok(());
        }

        let mut entries = bundle.into_iter();
        let first = entries.next().expect("checked non-empty");
        if let Ok(WireEvent::Comment { start_checksum, end_checksum, .. }) = WireEvent::from_json(&first) {
            let current = self.set.lock().expect("set lock poisoned").checksum();
            if end_checksum == current {
                return Ok(());
            }
            let expected = self.last_checksum.lock().expect("checksum lock poisoned").clone();
            if start_checksum != expected {
                log::warn!(
                    "checksum mismatch at '{}': expected {:?}, bundle starts from {:?}; applying anyway",
                    self.prefix,
                    expected,
                    start_checksum
                );
            }
            let mut set = self.set.lock().expect("set lock poisoned");
            for entry in entries {
                set.receive(&entry)?;
            }
            drop(set);
            *self.last_checksum.lock().expect("checksum lock poisoned") = Some(end_checksum);
        } else {
            let mut set = self.set.lock().expect("set lock poisoned");
            set.receive(&first)?;
            for entry in entries {
                set.receive(&entry)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::InMemoryDatastore;
    use crate::item::ItemId;
    use crate::payload;
    use crate::scalar::Scalar;
    use std::collections::HashMap;

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

    fn engine(datastore: Arc<dyn Datastore>) -> ConsumerEngine<Widget> {
        ConsumerEngine::new(
            "app.widgets".into(),
            "1s".into(),
            datastore,
            Arc::new(Mutex::new(Set::new())),
            Backoff::new(vec![Duration::from_millis(1)]),
        )
    }

    #[tokio::test]
    async fn initial_step_fails_without_registered_class() {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        let engine = engine(datastore);
        engine.step().await;
        assert_eq!(engine.state(), ConsumerState::Initial);
    }

    #[tokio::test]
    async fn initial_step_applies_snapshot_and_advances_to_polling() {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        datastore
            .set("app.widgets.classname", DatastoreValue::ClassName("Widget".into()))
            .await
            .unwrap();
        let mut tags = HashMap::new();
        tags.insert("1s".to_string(), Vec::new());
        datastore.set("app.widgets.pulsars", DatastoreValue::Pulsars(tags)).await.unwrap();
        datastore
            .set(
                "app.widgets.all",
                DatastoreValue::Snapshot(vec![Item::<Widget>::new(ItemId::new("w1").unwrap(), Widget::default())
                    .snapshot()]),
            )
            .await
            .unwrap();

        let engine = engine(datastore);
        engine.step().await;

        assert_eq!(engine.state(), ConsumerState::Polling);
        assert!(engine.set.lock().unwrap().find(&ItemId::new("w1").unwrap()).is_some());
    }

    #[tokio::test]
    async fn configuration_error_is_not_fatal_retries_on_next_step() {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        datastore
            .set("app.widgets.classname", DatastoreValue::ClassName("WrongClass".into()))
            .await
            .unwrap();
        let engine = engine(datastore.clone());
        engine.step().await;
        assert_eq!(engine.state(), ConsumerState::Initial);

        datastore
            .set("app.widgets.classname", DatastoreValue::ClassName("Widget".into()))
            .await
            .unwrap();
        let mut tags = HashMap::new();
        tags.insert("1s".to_string(), Vec::new());
        datastore.set("app.widgets.pulsars", DatastoreValue::Pulsars(tags)).await.unwrap();
        engine.step().await;
        assert_eq!(engine.state(), ConsumerState::Polling);
    }

    #[tokio::test]
    async fn poll_applies_bundle_entries() {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        datastore
            .set("app.widgets.classname", DatastoreValue::ClassName("Widget".into()))
            .await
            .unwrap();
        let mut tags = HashMap::new();
        tags.insert("1s".to_string(), Vec::new());
        datastore.set("app.widgets.pulsars", DatastoreValue::Pulsars(tags)).await.unwrap();

        let engine = engine(datastore.clone());
        engine.step().await;
        assert_eq!(engine.state(), ConsumerState::Polling);

        let added_event = payload::added(Item::<Widget>::new(ItemId::new("w1").unwrap(), Widget::default()).snapshot())
            .to_json()
            .unwrap();
        datastore.set("app.widgets.pulsars.1s", DatastoreValue::Bundle(vec![added_event])).await.unwrap();

        engine.step().await;
        assert!(engine.set.lock().unwrap().find(&ItemId::new("w1").unwrap()).is_some());
    }

    #[tokio::test]
    async fn checksum_mismatch_still_applies_bundle() {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        datastore
            .set("app.widgets.classname", DatastoreValue::ClassName("Widget".into()))
            .await
            .unwrap();
        let mut tags = HashMap::new();
        tags.insert("1s".to_string(), Vec::new());
        datastore.set("app.widgets.pulsars", DatastoreValue::Pulsars(tags)).await.unwrap();

        let engine = engine(datastore.clone());
        engine.step().await;
        assert_eq!(engine.state(), ConsumerState::Polling);

        let added_event = payload::added(Item::<Widget>::new(ItemId::new("w1").unwrap(), Widget::default()).snapshot())
            .to_json()
            .unwrap();
        // "stale" won't match the engine's recorded last checksum, but the
        // bundle is applied anyway rather than discarded or resynced.
        let framing = WireEvent::framing(Some("stale".into()), "fresh".into()).to_json().unwrap();
        datastore
            .set("app.widgets.pulsars.1s", DatastoreValue::Bundle(vec![framing, added_event]))
            .await
            .unwrap();

        engine.step().await;
        assert_eq!(engine.state(), ConsumerState::Polling);
        assert!(engine.set.lock().unwrap().find(&ItemId::new("w1").unwrap()).is_some());
    }

    #[tokio::test]
    async fn poll_discards_bundle_when_end_checksum_matches_current() {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        datastore
            .set("app.widgets.classname", DatastoreValue::ClassName("Widget".into()))
            .await
            .unwrap();
        let mut tags = HashMap::new();
        tags.insert("1s".to_string(), Vec::new());
        datastore.set("app.widgets.pulsars", DatastoreValue::Pulsars(tags)).await.unwrap();

        let engine = engine(datastore.clone());
        engine.step().await;
        let current = engine.set.lock().unwrap().checksum();

        let added_event = payload::added(Item::<Widget>::new(ItemId::new("w1").unwrap(), Widget::default()).snapshot())
            .to_json()
            .unwrap();
        let framing = WireEvent::framing(Some(current.clone()), current).to_json().unwrap();
        datastore
            .set("app.widgets.pulsars.1s", DatastoreValue::Bundle(vec![framing, added_event]))
            .await
            .unwrap();

        engine.step().await;
        assert!(engine.set.lock().unwrap().find(&ItemId::new("w1").unwrap()).is_none());
    }

    #[test]
    fn resync_requires_running_engine() {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        let engine = engine(datastore);
        assert!(matches!(engine.resync().unwrap_err(), Error::NotRunning));

        *engine.running.lock().unwrap() = true;
        *engine.state.lock().unwrap() = ConsumerState::Polling;
        engine.resync().unwrap();
        assert_eq!(engine.state(), ConsumerState::Initial);
    }

    #[tokio::test]
    async fn start_then_start_again_fails_already_running() {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        let engine = Arc::new(engine(datastore));
        engine.start(Duration::from_millis(10)).unwrap();
        assert!(matches!(engine.start(Duration::from_millis(10)).unwrap_err(), Error::AlreadyRunning));
        engine.stop().unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_fails_not_running() {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        let engine = engine(datastore);
        assert!(matches!(engine.stop().unwrap_err(), Error::NotRunning));
    }

    #[tokio::test]
    async fn stop_resets_state_and_backoff() {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        let engine = Arc::new(engine(datastore));
        engine.start(Duration::from_millis(10)).unwrap();
        *engine.state.lock().unwrap() = ConsumerState::Polling;
        engine.backoff.lock().unwrap().advance();

        engine.stop().unwrap();
        assert_eq!(engine.state(), ConsumerState::Initial);
        assert!(!engine.is_running());
        assert_eq!(engine.backoff.lock().unwrap().step(), 0);
    }
}
