//! Shared test fixtures

use crate::executor::ActionExecutor;
use async_trait::async_trait;
use mqtt_protocol::{MessageBus, ProtocolError};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tasmota_core::{DeviceId, DeviceStore, TasmotaNetwork};

/// In-memory bus that records publishes and can fail chosen topics
#[derive(Default)]
pub struct RecordingBus {
    published: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingBus {
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().unwrap().clone()
    }

    pub fn fail_on(&self, topic: &str) {
        self.failing.lock().unwrap().insert(topic.to_string());
    }

    pub fn count(&self, topic: &str, payload: &str) -> usize {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, p)| t == topic && p == payload)
            .count()
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), ProtocolError> {
        if self.failing.lock().unwrap().contains(topic) {
            return Err(ProtocolError::NotConnected);
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub bus: Arc<RecordingBus>,
    pub store: Arc<DeviceStore>,
    pub network: Arc<TasmotaNetwork>,
    pub executor: Arc<ActionExecutor>,
}

impl Harness {
    /// Register a device by topic
    pub fn device(&self, topic: &str) -> DeviceId {
        self.store.upsert_by_topic(topic).0
    }
}

pub fn harness() -> Harness {
    let bus = Arc::new(RecordingBus::default());
    let store = Arc::new(DeviceStore::new(None));
    let network = Arc::new(TasmotaNetwork::new(bus.clone(), store.clone()));
    let executor = Arc::new(ActionExecutor::new(network.clone()));
    Harness {
        bus,
        store,
        network,
        executor,
    }
}

pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}
