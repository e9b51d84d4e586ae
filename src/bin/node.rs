//! Demo binary: wires one producer endpoint and one consumer engine
//! against an in-memory datastore, using a small sample class, to
//! exercise the crate end-to-end. Not a simulation of any domain —
//! just enough state to watch a pulse round-trip.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use repliset::{
    config::EngineConfig,
    consumer::ConsumerEngine,
    datastore::{Datastore, InMemoryDatastore},
    item::{Item, ItemId, ObservedClass},
    producer::{derive_prefix, ProducerEndpoint},
    scalar::Scalar,
    set::Set,
    Result,
};

/// A minimal observed class: just a single `label` property. Stands in
/// for whatever real typed record an application would replicate.
#[derive(Debug, Default, Clone)]
struct SampleRecord {
    label: Option<Scalar>,
}

impl ObservedClass for SampleRecord {
    fn class_name() -> &'static str {
        "SampleRecord"
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
            other => {
                return Err(repliset::Error::InvalidArgument(format!("unknown property '{other}'")))
            }
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("config.toml");
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 2;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            _ => i += 1,
        }
    }

    let config = if config_path.exists() {
        EngineConfig::load(&config_path)?
    } else {
        EngineConfig::default()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(async {
        let datastore: Arc<dyn Datastore> = Arc::new(InMemoryDatastore::new());
        let prefix = derive_prefix(&config.base_path, config.node_name.as_deref(), SampleRecord::class_name());
        let cadences = config.cadence_intervals()?;

        let producer_set = Arc::new(Mutex::new(Set::<SampleRecord>::new()));
        let mut producer = ProducerEndpoint::register(
            prefix.clone(),
            datastore.clone(),
            producer_set.clone(),
            cadences.clone(),
            config.allow_empty_transmissions,
            true,
        )
        .await?;
        producer.start();

        let consumer_set = Arc::new(Mutex::new(Set::<SampleRecord>::new()));
        let cadence_tag = cadences
            .first()
            .map(|interval| repliset::cadence::format(*interval))
            .unwrap_or_else(|| "1s".to_string());
        let consumer = Arc::new(ConsumerEngine::new(
            prefix.clone(),
            cadence_tag,
            datastore.clone(),
            consumer_set.clone(),
            config.backoff(),
        ));

        consumer.start(config.runloop_interval())?;

        log::info!("producer endpoint bound at '{prefix}'");
        producer_set
            .lock()
            .expect("set lock poisoned")
            .add(Item::new(ItemId::generate(), SampleRecord { label: Some(Scalar::Str("hello".into())) }))?;

        tokio::time::sleep(Duration::from_secs(2)).await;
        log::info!("consumer mirror now holds {} item(s)", consumer_set.lock().expect("set lock poisoned").len());

        producer.stop();
        consumer.stop()?;
        Ok(())
    })
}
