//! Protocol errors

use thiserror::Error;

/// Errors raised by the MQTT layer
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("Invalid topic pattern: {0}")]
    InvalidTopic(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}
