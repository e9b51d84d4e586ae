//! # Engine configuration
//!
//! Loads and defaults the settings a node needs to stand up producer
//! and/or consumer endpoints: the datastore namespace, which cadences
//! to run, and the consumer runloop/backoff timing.
//!
//! ## Example configuration file (config.toml)
//! ```toml
//! base_path = "app"
//! node_name = "widgets"
//! cadences = ["1s", "250ms"]
//! allow_empty_transmissions = true
//! runloop_interval_ms = 1000
//! backoff_schedule_secs = [1, 2, 4, 8, 16, 32, 60]
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, File};
use serde::{Deserialize, Serialize};

use crate::backoff::{Backoff, DEFAULT_SCHEDULE_SECS};
use crate::cadence;
use crate::error::Result;

/// Settings shared by a node's producer and consumer endpoints; not
/// itself part of the replication protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Prefix shared by every datastore key this node writes or reads
    /// under. Combined with `node_name` to form the keyspace prefix:
    /// `base_path + "." + node_name`, or bare `node_name` when
    /// `base_path` is empty.
    #[serde(default)]
    pub base_path: String,

    /// Overrides the default (pluralized, lowercased class name) node
    /// name used in the keyspace prefix.
    #[serde(default)]
    pub node_name: Option<String>,

    /// Cadence tags this node's producer endpoint runs a `Pulse` for:
    /// `"{n}ms"` in `100..=999`, or `"{n}s"`.
    #[serde(default = "default_cadences")]
    pub cadences: Vec<String>,

    /// Whether a `Pulse` still flushes an empty bundle on its timer
    /// tick.
    #[serde(default = "default_allow_empty_transmissions")]
    pub allow_empty_transmissions: bool,

    /// How often the consumer engine's runloop ticks, in milliseconds.
    /// Defaults to 1000ms.
    #[serde(default = "default_runloop_interval_ms")]
    pub runloop_interval_ms: u64,

    /// The reconnect backoff schedule, in seconds. Defaults to
    /// `{1,2,4,8,16,32,60}`.
    #[serde(default = "default_backoff_schedule_secs")]
    pub backoff_schedule_secs: Vec<u64>,
    // A `max_configuration_faults` knob (escalate a `ConfigurationError`
    // to fatal after N consecutive faults) was considered and
    // deliberately left unimplemented — the decided behavior is to
    // retry indefinitely.
}

fn default_cadences() -> Vec<String> {
    vec!["1s".to_string()]
}

fn default_allow_empty_transmissions() -> bool {
    true
}

fn default_runloop_interval_ms() -> u64 {
    1000
}

fn default_backoff_schedule_secs() -> Vec<u64> {
    DEFAULT_SCHEDULE_SECS.to_vec()
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to
    /// `EngineConfig::default()` for any field left unset.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder().add_source(File::from(path)).build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn runloop_interval(&self) -> Duration {
        Duration::from_millis(self.runloop_interval_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_schedule_secs.iter().map(|s| Duration::from_secs(*s)).collect())
    }

    /// Parsed, validated cadence intervals.
    pub fn cadence_intervals(&self) -> Result<Vec<Duration>> {
        self.cadences.iter().map(|tag| cadence::parse(tag)).collect()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_path: String::new(),
            node_name: None,
            cadences: default_cadences(),
            allow_empty_transmissions: default_allow_empty_transmissions(),
            runloop_interval_ms: default_runloop_interval_ms(),
            backoff_schedule_secs: default_backoff_schedule_secs(),
        }
    }
}
