//! Tasmota device network
//!
//! Turns bus traffic into device store updates and exposes the command
//! surface used by automations, schedules and the HTTP API.

use crate::device::DeviceId;
use crate::ingest::{self, Route};
use crate::store::DeviceStore;
use mqtt_protocol::{payload, BusMessage, MessageBus, ProtocolError};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Topic that every Tasmota device listens on
pub const GROUP_TOPIC: &str = "tasmotas";

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),
}

/// Tasmota network manager
pub struct TasmotaNetwork {
    /// Outgoing bus
    bus: Arc<dyn MessageBus>,
    /// Device state
    devices: Arc<DeviceStore>,
}

impl TasmotaNetwork {
    /// Create a new network manager over a bus and a device store
    pub fn new(bus: Arc<dyn MessageBus>, devices: Arc<DeviceStore>) -> Self {
        Self { bus, devices }
    }

    /// Get the underlying bus
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    /// Get the device store
    pub fn devices(&self) -> &Arc<DeviceStore> {
        &self.devices
    }

    /// Start background task feeding bus messages into the store
    pub fn start(
        self: &Arc<Self>,
        mut bus_rx: broadcast::Receiver<BusMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let network = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = bus_rx.recv() => match msg {
                        Ok(msg) => network.handle_message(&msg).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Device listener lagged by {} messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("Bus closed, device listener exiting");
                            break;
                        }
                    },
                    _ = shutdown.changed() => {
                        tracing::debug!("Device listener shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Apply one bus message to the device store
    pub async fn handle_message(&self, msg: &BusMessage) {
        match ingest::route(&msg.topic) {
            Route::Lwt { device } => {
                let online = msg.payload_str().trim() == "Online";
                let (id, _) = self.devices.upsert_by_topic(device);
                self.devices.set_online(id, online);
                tracing::info!("Device {} is {}", device, if online { "online" } else { "offline" });

                if online {
                    // Ask for STATUS0 so name and IP get filled in
                    let topic = format!("cmnd/{device}/STATUS");
                    if let Err(e) = self.bus.publish(&topic, "0").await {
                        tracing::warn!("Failed to request status from {}: {}", device, e);
                    }
                }
            }
            Route::Status0 { device } => {
                let Some(data) = json_object(msg) else {
                    return;
                };
                let (id, _) = self.devices.upsert_by_topic(device);
                let (name, ip_address) = status_metadata(&data);
                self.devices.update_metadata(id, name, ip_address);
                self.devices.merge_attributes(id, data);
            }
            Route::Telemetry { device } => {
                let Some(data) = json_object(msg) else {
                    return;
                };
                let (id, _) = self.devices.upsert_by_topic(device);
                self.devices.merge_attributes(id, data);
            }
            Route::Generic { topic } => {
                let data = match payload::parse_payload(&msg.payload) {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Map::new();
                        map.insert("value".to_string(), other);
                        map
                    }
                };
                let (id, _) = self.devices.upsert_by_topic(topic);
                self.devices.merge_attributes(id, data);
            }
            Route::Ignore => {
                tracing::trace!("Ignoring {}", msg.topic);
            }
        }
    }

    /// Publish `cmnd/<topic>/<command>` for a device.
    ///
    /// Returns the topic that was published to.
    pub async fn send_command(
        &self,
        device_id: DeviceId,
        command: &str,
        payload: &str,
    ) -> Result<String, NetworkError> {
        let topic = self
            .devices
            .command_topic(device_id, command)
            .ok_or(NetworkError::DeviceNotFound(device_id))?;
        self.bus.publish(&topic, payload).await?;
        tracing::debug!("Sent {} = {}", topic, payload);
        Ok(topic)
    }

    /// Publish a raw message
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), NetworkError> {
        self.bus.publish(topic, payload).await?;
        Ok(())
    }

    /// Ask every device on the bus to report its full status
    pub async fn scan(&self) -> Result<(), NetworkError> {
        tracing::info!("Scanning for Tasmota devices");
        self.publish(&format!("cmnd/{GROUP_TOPIC}/STATUS"), "0").await
    }
}

fn json_object(msg: &BusMessage) -> Option<Map<String, Value>> {
    match payload::parse_payload(&msg.payload) {
        Value::Object(map) => Some(map),
        _ => {
            tracing::warn!("Ignoring non-JSON payload on {}", msg.topic);
            None
        }
    }
}

/// Friendly name and IP address from a STATUS0 reply
fn status_metadata(data: &Map<String, Value>) -> (Option<String>, Option<String>) {
    let status = data.get("Status");
    let name = status
        .and_then(|s| s.get("FriendlyName"))
        .and_then(|f| match f {
            Value::Array(names) => names.first().map(payload::coerce_to_string),
            other => Some(payload::coerce_to_string(other)),
        })
        .or_else(|| {
            status
                .and_then(|s| s.get("DeviceName"))
                .map(payload::coerce_to_string)
        });
    let ip_address = data
        .get("StatusNET")
        .and_then(|n| n.get("IPAddress"))
        .and_then(Value::as_str)
        .map(str::to_string);
    (name, ip_address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, String)>>,
        offline: bool,
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn publish(&self, topic: &str, payload: &str) -> Result<(), ProtocolError> {
            if self.offline {
                return Err(ProtocolError::NotConnected);
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_string()));
            Ok(())
        }
    }

    fn network() -> (Arc<RecordingBus>, TasmotaNetwork) {
        let bus = Arc::new(RecordingBus::default());
        let network = TasmotaNetwork::new(bus.clone(), Arc::new(DeviceStore::new(None)));
        (bus, network)
    }

    #[tokio::test]
    async fn test_lwt_online_requests_status() {
        let (bus, network) = network();
        network
            .handle_message(&BusMessage::new("tele/pump/LWT", "Online"))
            .await;

        let id = network.devices().find_by_topic("pump").unwrap();
        assert!(network.devices().is_online(id));
        assert_eq!(
            *bus.published.lock().unwrap(),
            vec![("cmnd/pump/STATUS".to_string(), "0".to_string())]
        );

        network
            .handle_message(&BusMessage::new("tele/pump/LWT", "Offline"))
            .await;
        assert!(!network.devices().is_online(id));
        assert_eq!(bus.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status0_fills_metadata() {
        let (_bus, network) = network();
        let payload = json!({
            "Status": {"DeviceName": "pump-dev", "FriendlyName": ["Garden Pump"]},
            "StatusNET": {"IPAddress": "192.168.1.40"}
        });
        network
            .handle_message(&BusMessage::new("stat/pump/STATUS0", payload.to_string()))
            .await;

        let id = network.devices().find_by_topic("pump").unwrap();
        let device = network.devices().get(id).unwrap();
        assert_eq!(device.name.as_deref(), Some("Garden Pump"));
        assert_eq!(device.ip_address.as_deref(), Some("192.168.1.40"));
        assert!(device.online);
    }

    #[test]
    fn test_status_metadata_falls_back_to_device_name() {
        let data = json!({"Status": {"DeviceName": "pump-dev"}});
        let (name, ip) = status_metadata(data.as_object().unwrap());
        assert_eq!(name.as_deref(), Some("pump-dev"));
        assert_eq!(ip, None);
    }

    #[tokio::test]
    async fn test_telemetry_merges() {
        let (_bus, network) = network();
        network
            .handle_message(&BusMessage::new(
                "tele/pump/SENSOR",
                r#"{"ENERGY":{"Power":12.5,"Voltage":230}}"#,
            ))
            .await;
        network
            .handle_message(&BusMessage::new(
                "tasmota/pump/stat/RESULT",
                r#"{"POWER":"ON"}"#,
            ))
            .await;

        let id = network.devices().find_by_topic("pump").unwrap();
        let device = network.devices().get(id).unwrap();
        assert_eq!(device.attribute("ENERGY.Power"), Some(&json!(12.5)));
        assert_eq!(device.switch_state("POWER"), Some(true));
    }

    #[tokio::test]
    async fn test_non_json_telemetry_is_ignored() {
        let (_bus, network) = network();
        network
            .handle_message(&BusMessage::new("tele/pump/STATE", "garbage"))
            .await;
        assert!(network.devices().find_by_topic("pump").is_none());
    }

    #[tokio::test]
    async fn test_generic_scalar_is_wrapped() {
        let (_bus, network) = network();
        network
            .handle_message(&BusMessage::new("garden/moisture", "41"))
            .await;

        let id = network.devices().find_by_topic("garden/moisture").unwrap();
        let device = network.devices().get(id).unwrap();
        assert_eq!(device.attribute("value"), Some(&json!(41)));
    }

    #[tokio::test]
    async fn test_command_echo_is_ignored() {
        let (_bus, network) = network();
        network
            .handle_message(&BusMessage::new("cmnd/pump/POWER", "ON"))
            .await;
        assert!(network.devices().list().is_empty());
    }

    #[tokio::test]
    async fn test_send_command() {
        let (bus, network) = network();
        let (id, _) = network.devices().upsert_by_topic("pump");

        let topic = network.send_command(id, "POWER1", "ON").await.unwrap();
        assert_eq!(topic, "cmnd/pump/POWER1");
        assert_eq!(
            *bus.published.lock().unwrap(),
            vec![("cmnd/pump/POWER1".to_string(), "ON".to_string())]
        );

        assert!(matches!(
            network.send_command(99, "POWER", "ON").await,
            Err(NetworkError::DeviceNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_send_command_while_offline() {
        let bus = Arc::new(RecordingBus {
            offline: true,
            ..RecordingBus::default()
        });
        let network = TasmotaNetwork::new(bus, Arc::new(DeviceStore::new(None)));
        let (id, _) = network.devices().upsert_by_topic("pump");

        assert!(matches!(
            network.send_command(id, "POWER", "ON").await,
            Err(NetworkError::Protocol(ProtocolError::NotConnected))
        ));
    }

    #[tokio::test]
    async fn test_scan() {
        let (bus, network) = network();
        network.scan().await.unwrap();
        assert_eq!(
            *bus.published.lock().unwrap(),
            vec![("cmnd/tasmotas/STATUS".to_string(), "0".to_string())]
        );
    }
}
