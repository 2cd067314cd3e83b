//! WebSocket handler for real-time updates

use automation_engine::{AutomationEvent, AutomationId, ScheduleId, SchedulerEvent, SwitchAction};
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tasmota_core::{DeviceEvent, DeviceId};
use tokio::sync::broadcast::error::RecvError;

use crate::AppState;

/// WebSocket events sent to clients
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsEvent {
    Connected,
    DeviceDiscovered {
        device_id: DeviceId,
        mqtt_topic: String,
    },
    DeviceUpdated {
        device_id: DeviceId,
        attributes: Map<String, Value>,
    },
    DeviceOnline {
        device_id: DeviceId,
        online: bool,
    },
    TimersChanged {
        device_id: DeviceId,
        /// Switch name to absolute UTC deadline
        timers: BTreeMap<String, DateTime<Utc>>,
    },
    AutomationExecuted {
        automation_id: AutomationId,
        automation_name: String,
        success: bool,
        error: Option<String>,
    },
    AutomationChanged {
        automation_id: AutomationId,
        change: &'static str,
    },
    ScheduleFired {
        schedule_id: ScheduleId,
        command: SwitchAction,
    },
    ScheduleFailed {
        schedule_id: ScheduleId,
        error: String,
    },
    ScheduleCompleted {
        schedule_id: ScheduleId,
    },
    ScheduleChanged {
        schedule_id: ScheduleId,
        change: &'static str,
    },
}

impl WsEvent {
    fn from_device(event: DeviceEvent, state: &AppState) -> Self {
        match event {
            DeviceEvent::Discovered(device) => Self::DeviceDiscovered {
                device_id: device.id,
                mqtt_topic: device.mqtt_topic,
            },
            DeviceEvent::AttributesChanged {
                device_id,
                attributes,
            } => Self::DeviceUpdated {
                device_id,
                attributes,
            },
            DeviceEvent::OnlineChanged { device_id, online } => {
                Self::DeviceOnline { device_id, online }
            }
            DeviceEvent::TimersChanged { device_id } => Self::TimersChanged {
                device_id,
                timers: state
                    .network
                    .devices()
                    .get(device_id)
                    .map(|d| d.timers.into_iter().map(|(k, t)| (k, t.deadline)).collect())
                    .unwrap_or_default(),
            },
        }
    }
}

impl From<AutomationEvent> for WsEvent {
    fn from(event: AutomationEvent) -> Self {
        match event {
            AutomationEvent::Executed {
                automation_id,
                automation_name,
                success,
                error,
            } => Self::AutomationExecuted {
                automation_id,
                automation_name,
                success,
                error,
            },
            AutomationEvent::Created { automation_id } => Self::AutomationChanged {
                automation_id,
                change: "created",
            },
            AutomationEvent::Updated { automation_id } => Self::AutomationChanged {
                automation_id,
                change: "updated",
            },
            AutomationEvent::Deleted { automation_id } => Self::AutomationChanged {
                automation_id,
                change: "deleted",
            },
        }
    }
}

impl From<SchedulerEvent> for WsEvent {
    fn from(event: SchedulerEvent) -> Self {
        match event {
            SchedulerEvent::Fired {
                schedule_id,
                command,
            } => Self::ScheduleFired {
                schedule_id,
                command,
            },
            SchedulerEvent::Failed { schedule_id, error } => {
                Self::ScheduleFailed { schedule_id, error }
            }
            SchedulerEvent::Completed { schedule_id } => Self::ScheduleCompleted { schedule_id },
            SchedulerEvent::Created { schedule_id } => Self::ScheduleChanged {
                schedule_id,
                change: "created",
            },
            SchedulerEvent::Updated { schedule_id } => Self::ScheduleChanged {
                schedule_id,
                change: "updated",
            },
            SchedulerEvent::Deleted { schedule_id } => Self::ScheduleChanged {
                schedule_id,
                change: "deleted",
            },
        }
    }
}

/// Flatten a broadcast result; `None` means keep waiting, `Some(None)` closed
fn received<T>(result: Result<T, RecvError>, source: &str) -> Option<Option<T>> {
    match result {
        Ok(event) => Some(Some(event)),
        Err(RecvError::Lagged(n)) => {
            tracing::debug!("WebSocket client lagged by {} {} events", n, source);
            None
        }
        Err(RecvError::Closed) => Some(None),
    }
}

/// Handle a WebSocket connection
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let Ok(connected_msg) = serde_json::to_string(&WsEvent::Connected) else {
        return;
    };
    if sender.send(Message::Text(connected_msg)).await.is_err() {
        return;
    }

    let mut device_rx = state.network.devices().subscribe();
    let mut automation_rx = state.automations.subscribe();
    let mut scheduler_rx = state.scheduler.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                r = device_rx.recv() => received(r, "device")
                    .map(|e| e.map(|e| WsEvent::from_device(e, &state))),
                r = automation_rx.recv() => received(r, "automation")
                    .map(|e| e.map(WsEvent::from)),
                r = scheduler_rx.recv() => received(r, "schedule")
                    .map(|e| e.map(WsEvent::from)),
            };
            let ws_event = match next {
                None => continue,
                Some(None) => break,
                Some(Some(event)) => event,
            };

            let json = match serde_json::to_string(&ws_event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("Failed to encode WebSocket event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_encoding() {
        let event = WsEvent::from(SchedulerEvent::Fired {
            schedule_id: 3,
            command: SwitchAction::Off,
        });
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({"type": "schedule_fired", "schedule_id": 3, "command": "OFF"})
        );

        let event = WsEvent::from(AutomationEvent::Deleted { automation_id: 9 });
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({"type": "automation_changed", "automation_id": 9, "change": "deleted"})
        );
    }

    #[test]
    fn test_lagged_is_skipped() {
        assert_eq!(received::<u8>(Err(RecvError::Lagged(3)), "device"), None);
        assert_eq!(received::<u8>(Err(RecvError::Closed), "device"), Some(None));
        assert_eq!(received(Ok(1u8), "device"), Some(Some(1)));
    }
}
