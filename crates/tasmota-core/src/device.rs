//! Tasmota device representation

use chrono::{DateTime, Utc};
use mqtt_protocol::payload;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Instant;

/// Stable device identifier assigned by the store
pub type DeviceId = u64;

/// A device known from the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Stable integer id
    pub id: DeviceId,
    /// Tasmota topic (the `%topic%` part of `tele/%topic%/STATE`)
    pub mqtt_topic: String,
    /// Friendly name reported in STATUS0
    #[serde(default)]
    pub name: Option<String>,
    /// IP address reported in STATUS0
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Last LWT / telemetry derived reachability
    #[serde(default)]
    pub online: bool,
    /// Last-known attributes, merged from telemetry payloads
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Armed auto-off timers keyed by switch name
    #[serde(default)]
    pub timers: BTreeMap<String, ArmedTimer>,
    /// Last time anything was heard from the device
    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// An armed auto-off deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmedTimer {
    /// Absolute deadline
    pub deadline: DateTime<Utc>,
    /// Identity of this arming; a newer arm always gets a new token
    #[serde(skip)]
    pub token: u64,
}

impl Device {
    /// Create a device for a topic
    #[must_use]
    pub fn new(id: DeviceId, mqtt_topic: impl Into<String>) -> Self {
        Self {
            id,
            mqtt_topic: mqtt_topic.into(),
            name: None,
            ip_address: None,
            online: false,
            attributes: Map::new(),
            timers: BTreeMap::new(),
            last_seen: None,
        }
    }

    /// Friendly name, falling back to the topic
    #[must_use]
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.mqtt_topic.clone())
    }

    /// Attribute at a dotted path
    #[must_use]
    pub fn attribute(&self, path: &str) -> Option<&Value> {
        let mut keys = path.splitn(2, '.');
        let first = self.attributes.get(keys.next()?)?;
        match keys.next() {
            Some(rest) => payload::extract(first, rest),
            None => Some(first),
        }
    }

    /// Reported on/off state of a switch (`POWER`, `POWER1`, ...)
    #[must_use]
    pub fn switch_state(&self, switch_name: &str) -> Option<bool> {
        self.attributes.get(switch_name).and_then(switch_value)
    }
}

/// Interpret a reported switch value as on/off
#[must_use]
pub fn switch_value(value: &Value) -> Option<bool> {
    match payload::coerce_to_string(value).to_ascii_uppercase().as_str() {
        "ON" | "1" | "TRUE" => Some(true),
        "OFF" | "0" | "FALSE" => Some(false),
        _ => None,
    }
}

/// Merge `partial` into `target`.
///
/// New keys are added and existing keys overwritten, except that two
/// objects under the same key are merged recursively so untouched nested
/// keys survive.
pub fn merge_attributes(target: &mut Map<String, Value>, partial: Map<String, Value>) {
    for (key, value) in partial {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_attributes(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}
