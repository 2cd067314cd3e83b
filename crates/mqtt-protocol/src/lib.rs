//! MQTT plumbing for Lite Assistant
//!
//! Topic pattern matching, payload path extraction and an async
//! transport on top of `rumqttc` used to talk to Tasmota devices.

pub mod bus;
pub mod config;
pub mod error;
pub mod payload;
pub mod topic;
pub mod transport;

pub use bus::{BusMessage, MessageBus};
pub use config::MqttConfig;
pub use error::ProtocolError;
pub use transport::MqttTransport;
