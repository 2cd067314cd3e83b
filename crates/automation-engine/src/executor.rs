//! Action executor shared by automations, schedules and timers

use crate::error::AutomationError;
use crate::model::{Action, SwitchAction};
use serde_json::{json, Value};
use std::sync::Arc;
use tasmota_core::{DeviceId, TasmotaNetwork};

/// Executor for device and bus actions
pub struct ActionExecutor {
    network: Arc<TasmotaNetwork>,
}

impl ActionExecutor {
    /// Create a new action executor
    pub fn new(network: Arc<TasmotaNetwork>) -> Self {
        Self { network }
    }

    /// Get the device network
    pub fn network(&self) -> &Arc<TasmotaNetwork> {
        &self.network
    }

    /// Execute an automation action.
    ///
    /// Returns a snapshot of what was done, for the execution log.
    pub async fn execute(&self, action: &Action) -> Result<Value, AutomationError> {
        match action {
            Action::DeviceCommand {
                device_id,
                command,
                payload,
            } => {
                let device = self
                    .network
                    .devices()
                    .get(*device_id)
                    .ok_or(AutomationError::DeviceNotFound(*device_id))?;
                let topic = self.network.send_command(*device_id, command, payload).await?;
                tracing::info!(
                    "Sent command to device {}: {} {}",
                    device.display_name(),
                    command,
                    payload
                );
                Ok(json!({
                    "device": device.display_name(),
                    "topic": topic,
                    "command": command,
                    "payload": payload,
                }))
            }
            Action::MqttPublish { topic, payload } => {
                self.network.publish(topic, payload).await?;
                tracing::info!("Published {} -> {}", topic, payload);
                Ok(json!({ "published": topic, "payload": payload }))
            }
        }
    }

    /// Drive a switch, resolving `TOGGLE` from the reported state.
    ///
    /// A switch with no reported state toggles to `ON`. Returns the
    /// command actually sent.
    pub async fn switch(
        &self,
        device_id: DeviceId,
        switch_name: &str,
        action: SwitchAction,
    ) -> Result<SwitchAction, AutomationError> {
        let resolved = match action {
            SwitchAction::Toggle => {
                let device = self
                    .network
                    .devices()
                    .get(device_id)
                    .ok_or(AutomationError::DeviceNotFound(device_id))?;
                if device.switch_state(switch_name) == Some(true) {
                    SwitchAction::Off
                } else {
                    SwitchAction::On
                }
            }
            other => other,
        };

        self.network
            .send_command(device_id, switch_name, resolved.as_str())
            .await?;
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, object};
    use serde_json::json;

    #[tokio::test]
    async fn test_device_command() {
        let h = harness();
        let pump = h.device("pump");

        let result = h
            .executor
            .execute(&Action::DeviceCommand {
                device_id: pump,
                command: "POWER1".to_string(),
                payload: "ON".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(result["topic"], json!("cmnd/pump/POWER1"));
        assert_eq!(h.bus.published(), vec![("cmnd/pump/POWER1".to_string(), "ON".to_string())]);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let h = harness();
        let result = h
            .executor
            .execute(&Action::DeviceCommand {
                device_id: 77,
                command: "POWER".to_string(),
                payload: "ON".to_string(),
            })
            .await;
        assert!(matches!(result, Err(AutomationError::DeviceNotFound(77))));
        assert!(h.bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_mqtt_publish_failure() {
        let h = harness();
        h.bus.fail_on("alerts/pump");
        let result = h
            .executor
            .execute(&Action::MqttPublish {
                topic: "alerts/pump".to_string(),
                payload: "dry".to_string(),
            })
            .await;
        assert!(matches!(result, Err(AutomationError::Network(_))));
    }

    #[tokio::test]
    async fn test_toggle_resolves_from_state() {
        let h = harness();
        let pump = h.device("pump");

        assert_eq!(
            h.executor.switch(pump, "POWER", SwitchAction::Toggle).await.unwrap(),
            SwitchAction::On
        );

        h.store.merge_attributes(pump, object(json!({"POWER": "ON"})));
        assert_eq!(
            h.executor.switch(pump, "POWER", SwitchAction::Toggle).await.unwrap(),
            SwitchAction::Off
        );
        assert_eq!(
            h.bus.published(),
            vec![
                ("cmnd/pump/POWER".to_string(), "ON".to_string()),
                ("cmnd/pump/POWER".to_string(), "OFF".to_string()),
            ]
        );
    }
}
