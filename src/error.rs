//! Error types shared across the replication engine.
//!
//! Every fallible operation in this crate returns [`Result<T>`], a thin
//! alias over [`std::result::Result`] with [`Error`] as the failure type.
//! There is no separate machine-readable error surface beyond this enum;
//! operators are expected to read log output for anything not captured
//! by a variant.

use thiserror::Error;

use crate::item::ItemId;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of ways a replication operation can fail.
#[derive(Error, Debug)]
pub enum Error {
    /// A constructor or setter rejected its input (bad cadence tag, an
    /// interval in `(0, 100ms)`, a non-sink transmit target, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A `Set` operation saw an item whose declared class did not
    /// match the `Set`'s own class.
    #[error("wrong type: expected items of class '{expected}', got '{found}'")]
    WrongType { expected: String, found: String },

    /// `Item::update_to` was given a target of a different class.
    #[error("type mismatch: expected '{expected}', got '{found}'")]
    TypeMismatch { expected: String, found: String },

    /// `Set::add` was called with an id already present in the set.
    #[error("duplicate id: '{0}'")]
    DuplicateId(ItemId),

    /// `Set::remove` was called with an id not present in the set.
    #[error("not found: '{0}'")]
    NotFound(ItemId),

    /// A `changed` event referenced an id the receiving `Set` does not
    /// hold.
    #[error("unknown item: '{0}'")]
    UnknownItem(ItemId),

    /// `Set::remove` was given a reference with no `id` field.
    #[error("missing id field")]
    MissingIdField,

    /// A `receive` payload failed structural validation.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A `receive` payload's JSON parsed but named an event not in
    /// `{added, removed, changed, comment}`.
    #[error("unknown event: '{0}'")]
    UnknownEvent(String),

    /// The consumer observed a producer class name or cadence tag that
    /// does not match its own configuration. Treated as a recoverable
    /// transport fault rather than a fatal error.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// `ConsumerEngine::start` was called while already running.
    #[error("consumer engine is already running")]
    AlreadyRunning,

    /// `ConsumerEngine::stop`/`resync` was called while not running.
    #[error("consumer engine is not running")]
    NotRunning,

    /// `Datastore::get`/`set` failed, or a fetched snapshot could not
    /// be materialized into items.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Propagated from `config::Config` while loading an `EngineConfig`.
    #[error("configuration load error: {0}")]
    Config(#[from] config::ConfigError),

    /// Propagated from `serde_json` while encoding/decoding a payload.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
