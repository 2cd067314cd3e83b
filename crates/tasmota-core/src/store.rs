//! Process-wide device state store
//!
//! Every read and write takes the single store lock for the duration of
//! the call and never across an `.await`. Callers get owned snapshots.
//! Change notifications are broadcast after the lock is released.

use crate::device::{merge_attributes, switch_value, ArmedTimer, Device, DeviceId};
use crate::persistence;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;

/// Device store events
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A device topic was seen for the first time
    Discovered(Device),
    /// Attributes were merged; carries the full post-merge snapshot
    AttributesChanged {
        device_id: DeviceId,
        attributes: Map<String, Value>,
    },
    /// Online flag flipped
    OnlineChanged { device_id: DeviceId, online: bool },
    /// A timer was armed, cancelled, expired or dropped
    TimersChanged { device_id: DeviceId },
}

#[derive(Default)]
struct StoreInner {
    devices: HashMap<DeviceId, Device>,
    by_topic: HashMap<String, DeviceId>,
    next_id: DeviceId,
    next_timer_token: u64,
}

impl StoreInner {
    fn insert(&mut self, device: Device) {
        self.next_id = self.next_id.max(device.id + 1);
        self.by_topic.insert(device.mqtt_topic.clone(), device.id);
        self.devices.insert(device.id, device);
    }
}

/// Mutex-guarded map of every known device
pub struct DeviceStore {
    inner: Mutex<StoreInner>,
    event_tx: broadcast::Sender<DeviceEvent>,
    data_path: Option<PathBuf>,
}

impl DeviceStore {
    /// Create an empty store. With a path, registry changes are persisted.
    #[must_use]
    pub fn new(data_path: Option<PathBuf>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(StoreInner {
                next_id: 1,
                next_timer_token: 1,
                ..StoreInner::default()
            }),
            event_tx,
            data_path,
        }
    }

    /// Create a store and load previously seen devices from disk
    pub async fn load(data_path: PathBuf) -> Self {
        let devices = persistence::load_devices(&data_path).await;
        let store = Self::new(Some(data_path));
        {
            let mut inner = store.lock();
            for device in devices {
                inner.insert(device);
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, events: Vec<DeviceEvent>) {
        for event in events {
            let _ = self.event_tx.send(event);
        }
    }

    /// Subscribe to device events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_tx.subscribe()
    }

    /// Resolve the device for a Tasmota topic, creating it when unseen.
    ///
    /// Returns the id and whether the device was just created.
    pub fn upsert_by_topic(&self, mqtt_topic: &str) -> (DeviceId, bool) {
        let mut inner = self.lock();
        if let Some(id) = inner.by_topic.get(mqtt_topic).copied() {
            if let Some(device) = inner.devices.get_mut(&id) {
                device.last_seen = Some(Instant::now());
            }
            return (id, false);
        }

        let id = inner.next_id;
        let mut device = Device::new(id, mqtt_topic);
        device.last_seen = Some(Instant::now());
        inner.insert(device.clone());
        drop(inner);

        tracing::info!("Discovered device {} (id {})", mqtt_topic, id);
        self.emit(vec![DeviceEvent::Discovered(device)]);
        self.save();
        (id, true)
    }

    /// Merge a partial attribute map and mark the device online.
    ///
    /// A partial that sets a `POWER*` key to `OFF` drops any armed timer
    /// for that switch. Returns
    /// the post-merge snapshot, or `None` for an unknown device.
    pub fn merge_attributes(
        &self,
        device_id: DeviceId,
        partial: Map<String, Value>,
    ) -> Option<Device> {
        // Only switches this report sets to OFF count as a manual OFF
        let reported_off: Vec<String> = partial
            .iter()
            .filter(|(key, value)| key.starts_with("POWER") && switch_value(value) == Some(false))
            .map(|(key, _)| key.clone())
            .collect();

        let mut events = Vec::new();
        let mut inner = self.lock();
        let device = inner.devices.get_mut(&device_id)?;

        merge_attributes(&mut device.attributes, partial);
        device.last_seen = Some(Instant::now());
        if !device.online {
            device.online = true;
            events.push(DeviceEvent::OnlineChanged {
                device_id,
                online: true,
            });
        }

        let switched_off: Vec<String> = reported_off
            .into_iter()
            .filter(|switch| device.timers.contains_key(switch))
            .collect();
        for switch in &switched_off {
            tracing::info!(
                "Manual OFF detected for {}/{}, cancelling timer",
                device.mqtt_topic,
                switch
            );
            device.timers.remove(switch);
        }
        if !switched_off.is_empty() {
            events.push(DeviceEvent::TimersChanged { device_id });
        }

        let snapshot = device.clone();
        drop(inner);

        events.push(DeviceEvent::AttributesChanged {
            device_id,
            attributes: snapshot.attributes.clone(),
        });
        self.emit(events);
        Some(snapshot)
    }

    /// Update STATUS0 metadata
    pub fn update_metadata(
        &self,
        device_id: DeviceId,
        name: Option<String>,
        ip_address: Option<String>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(device) = inner.devices.get_mut(&device_id) else {
            return false;
        };
        let changed = (name.is_some() && device.name != name)
            || (ip_address.is_some() && device.ip_address != ip_address);
        if name.is_some() {
            device.name = name;
        }
        if ip_address.is_some() {
            device.ip_address = ip_address;
        }
        drop(inner);

        if changed {
            self.save();
        }
        true
    }

    /// Set the online flag
    pub fn set_online(&self, device_id: DeviceId, online: bool) -> bool {
        let mut inner = self.lock();
        let Some(device) = inner.devices.get_mut(&device_id) else {
            return false;
        };
        let changed = device.online != online;
        device.online = online;
        device.last_seen = Some(Instant::now());
        drop(inner);

        if changed {
            self.emit(vec![DeviceEvent::OnlineChanged { device_id, online }]);
        }
        true
    }

    /// Snapshot of a device
    pub fn get(&self, device_id: DeviceId) -> Option<Device> {
        self.lock().devices.get(&device_id).cloned()
    }

    /// Snapshot of all devices, ordered by id
    pub fn list(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.lock().devices.values().cloned().collect();
        devices.sort_by_key(|d| d.id);
        devices
    }

    /// Look up a device id by topic
    pub fn find_by_topic(&self, mqtt_topic: &str) -> Option<DeviceId> {
        self.lock().by_topic.get(mqtt_topic).copied()
    }

    /// Whether the device is currently online (unknown devices are not)
    pub fn is_online(&self, device_id: DeviceId) -> bool {
        self.lock()
            .devices
            .get(&device_id)
            .is_some_and(|d| d.online)
    }

    /// Command topic for a device: `cmnd/<topic>/<command>`
    pub fn command_topic(&self, device_id: DeviceId, command: &str) -> Option<String> {
        self.lock()
            .devices
            .get(&device_id)
            .map(|d| format!("cmnd/{}/{}", d.mqtt_topic, command))
    }

    /// Arm (or re-arm) the timer for a switch, replacing any previous one
    pub fn arm_timer(
        &self,
        device_id: DeviceId,
        switch_name: &str,
        deadline: DateTime<Utc>,
    ) -> Option<ArmedTimer> {
        let mut inner = self.lock();
        let token = inner.next_timer_token;
        let device = inner.devices.get_mut(&device_id)?;
        let timer = ArmedTimer { deadline, token };
        device.timers.insert(switch_name.to_string(), timer);
        inner.next_timer_token += 1;
        drop(inner);

        self.emit(vec![DeviceEvent::TimersChanged { device_id }]);
        Some(timer)
    }

    /// Remove a timer without firing it. Returns whether one was armed.
    pub fn cancel_timer(&self, device_id: DeviceId, switch_name: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner
            .devices
            .get_mut(&device_id)
            .and_then(|d| d.timers.remove(switch_name))
            .is_some();
        drop(inner);

        if removed {
            self.emit(vec![DeviceEvent::TimersChanged { device_id }]);
        }
        removed
    }

    /// Remove the timer only if it is still the arming identified by
    /// `token`. Returns `true` when the caller now owns the expiry.
    pub fn claim_expired_timer(&self, device_id: DeviceId, switch_name: &str, token: u64) -> bool {
        let mut inner = self.lock();
        let Some(device) = inner.devices.get_mut(&device_id) else {
            return false;
        };
        let claimed = match device.timers.get(switch_name) {
            Some(timer) if timer.token == token => {
                device.timers.remove(switch_name);
                true
            }
            _ => false,
        };
        drop(inner);

        if claimed {
            self.emit(vec![DeviceEvent::TimersChanged { device_id }]);
        }
        claimed
    }

    /// Currently armed timer for a switch
    pub fn timer(&self, device_id: DeviceId, switch_name: &str) -> Option<ArmedTimer> {
        self.lock()
            .devices
            .get(&device_id)
            .and_then(|d| d.timers.get(switch_name).copied())
    }

    /// Persist the registry (spawns a background task)
    fn save(&self) {
        if let Some(path) = &self.data_path {
            let devices = self.list();
            let path = path.clone();
            tokio::spawn(async move {
                if let Err(e) = persistence::save_devices(&path, &devices).await {
                    tracing::warn!("Failed to save devices: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_upsert_assigns_stable_ids() {
        let store = DeviceStore::new(None);
        let (pump, created) = store.upsert_by_topic("pump");
        assert!(created);
        let (lamp, _) = store.upsert_by_topic("lamp");
        assert_ne!(pump, lamp);
        assert_eq!(store.upsert_by_topic("pump"), (pump, false));
        assert_eq!(store.find_by_topic("lamp"), Some(lamp));
    }

    #[test]
    fn test_merge_marks_online_and_emits_snapshot() {
        let store = DeviceStore::new(None);
        let (id, _) = store.upsert_by_topic("pump");
        let mut rx = store.subscribe();

        store.merge_attributes(id, object(json!({"ENERGY": {"Power": 5}})));
        let snapshot = store
            .merge_attributes(id, object(json!({"ENERGY": {"Voltage": 230}})))
            .unwrap();

        assert!(snapshot.online);
        assert_eq!(
            snapshot.attributes.get("ENERGY"),
            Some(&json!({"Power": 5, "Voltage": 230}))
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            DeviceEvent::OnlineChanged { online: true, .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            DeviceEvent::AttributesChanged { .. }
        ));
    }

    #[test]
    fn test_unknown_device() {
        let store = DeviceStore::new(None);
        assert!(store.merge_attributes(42, Map::new()).is_none());
        assert!(!store.set_online(42, true));
        assert!(!store.is_online(42));
        assert!(store.command_topic(42, "POWER").is_none());
        assert!(store.arm_timer(42, "POWER", Utc::now()).is_none());
    }

    #[test]
    fn test_command_topic() {
        let store = DeviceStore::new(None);
        let (id, _) = store.upsert_by_topic("pump");
        assert_eq!(
            store.command_topic(id, "POWER1").as_deref(),
            Some("cmnd/pump/POWER1")
        );
    }

    #[test]
    fn test_rearm_invalidates_old_token() {
        let store = DeviceStore::new(None);
        let (id, _) = store.upsert_by_topic("pump");

        let first = store.arm_timer(id, "POWER1", Utc::now()).unwrap();
        let second = store.arm_timer(id, "POWER1", Utc::now()).unwrap();
        assert_ne!(first.token, second.token);

        assert!(!store.claim_expired_timer(id, "POWER1", first.token));
        assert_eq!(store.timer(id, "POWER1"), Some(second));
        assert!(store.claim_expired_timer(id, "POWER1", second.token));
        assert!(store.timer(id, "POWER1").is_none());
        assert!(!store.claim_expired_timer(id, "POWER1", second.token));
    }

    #[test]
    fn test_cancel_timer() {
        let store = DeviceStore::new(None);
        let (id, _) = store.upsert_by_topic("pump");
        let timer = store.arm_timer(id, "POWER", Utc::now()).unwrap();

        assert!(store.cancel_timer(id, "POWER"));
        assert!(!store.cancel_timer(id, "POWER"));
        assert!(!store.claim_expired_timer(id, "POWER", timer.token));
    }

    #[test]
    fn test_manual_off_drops_timer() {
        let store = DeviceStore::new(None);
        let (id, _) = store.upsert_by_topic("pump");
        store.arm_timer(id, "POWER1", Utc::now()).unwrap();
        store.arm_timer(id, "POWER2", Utc::now()).unwrap();

        let snapshot = store
            .merge_attributes(id, object(json!({"POWER1": "OFF", "POWER2": "ON"})))
            .unwrap();

        assert!(!snapshot.timers.contains_key("POWER1"));
        assert!(snapshot.timers.contains_key("POWER2"));
    }

    #[test]
    fn test_stale_off_does_not_drop_timer() {
        let store = DeviceStore::new(None);
        let (id, _) = store.upsert_by_topic("pump");
        store.merge_attributes(id, object(json!({"POWER": "OFF"})));
        let timer = store.arm_timer(id, "POWER", Utc::now()).unwrap();

        // Energy report while the stored POWER is still the old OFF
        let snapshot = store
            .merge_attributes(id, object(json!({"ENERGY": {"Power": 40}})))
            .unwrap();
        assert_eq!(snapshot.timers.get("POWER"), Some(&timer));

        store.merge_attributes(id, object(json!({"POWER": "ON"})));
        assert_eq!(store.timer(id, "POWER"), Some(timer));

        store.merge_attributes(id, object(json!({"POWER": "OFF"})));
        assert!(store.timer(id, "POWER").is_none());
    }

    #[test]
    fn test_set_online_only_emits_on_change() {
        let store = DeviceStore::new(None);
        let (id, _) = store.upsert_by_topic("pump");
        let mut rx = store.subscribe();

        assert!(store.set_online(id, true));
        assert!(store.set_online(id, true));
        assert!(store.is_online(id));
        assert!(matches!(
            rx.try_recv().unwrap(),
            DeviceEvent::OnlineChanged { online: true, .. }
        ));
        assert!(rx.try_recv().is_err());
    }
}
