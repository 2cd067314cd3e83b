//! Bus abstraction shared by the device layer and the automation engine

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ProtocolError;

/// A message received from the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload as text (lossy for non-UTF-8 bytes)
    #[must_use]
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Something that can publish to the bus.
///
/// Success means the client accepted the publish request; it says
/// nothing about the device acting on it.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), ProtocolError>;
}
