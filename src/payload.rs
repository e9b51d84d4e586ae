//! The wire grammar: four JSON event shapes, tagged by `event_name`,
//! plus the checksum-framing "comment" record a `Pulse` prepends to a
//! bundle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::item::{ItemId, ItemSnapshot};
use crate::scalar::Scalar;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdRef {
    pub id: ItemId,
}

/// A `changed` event's payload. Unified across the property and
/// named-value shapes: `new_timestamp` is present iff this is a
/// named-value change, which is exactly how `Set::receive`
/// distinguishes the two on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireChange {
    pub property: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_name")]
pub enum WireEvent {
    #[serde(rename = "added")]
    Added { item: ItemSnapshot },
    #[serde(rename = "removed")]
    Removed { item: IdRef },
    #[serde(rename = "changed")]
    Changed { item: IdRef, change: WireChange },
    #[serde(rename = "comment")]
    Comment {
        #[serde(rename = "_metadata")]
        metadata: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_checksum: Option<String>,
        end_checksum: String,
    },
}

impl WireEvent {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(payload).map_err(|e| Error::Malformed(e.to_string()))?;
        match value.get("event_name").and_then(|v| v.as_str()) {
            Some("added") | Some("removed") | Some("changed") | Some("comment") => {}
            Some(other) => return Err(Error::UnknownEvent(other.to_string())),
            None => return Err(Error::Malformed("missing 'event_name' field".into())),
        }
        serde_json::from_value(value).map_err(|e| Error::Malformed(e.to_string()))
    }

    pub fn framing(start_checksum: Option<String>, end_checksum: String) -> Self {
        WireEvent::Comment { metadata: true, start_checksum, end_checksum }
    }
}

pub fn added(snapshot: ItemSnapshot) -> WireEvent {
    WireEvent::Added { item: snapshot }
}

pub fn removed(id: ItemId) -> WireEvent {
    WireEvent::Removed { item: IdRef { id } }
}

pub fn changed_property(
    id: ItemId,
    property: String,
    old_value: Option<Scalar>,
    new_value: Option<Scalar>,
) -> WireEvent {
    WireEvent::Changed {
        item: IdRef { id },
        change: WireChange { property, old_value, new_value, new_timestamp: None },
    }
}

pub fn changed_named(
    id: ItemId,
    name: String,
    old_value: Option<Scalar>,
    new_value: Scalar,
    new_timestamp: DateTime<Utc>,
) -> WireEvent {
    WireEvent::Changed {
        item: IdRef { id },
        change: WireChange {
            property: name,
            old_value,
            new_value: Some(new_value),
            new_timestamp: Some(new_timestamp),
        },
    }
}
