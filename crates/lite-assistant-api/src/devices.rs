//! Device, command and timer handlers

use crate::response::{not_found, ok, respond, Reply};
use crate::AppState;
use automation_engine::{Action, AutomationError, SwitchAction, TimeUnit};
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tasmota_core::DeviceId;

/// Raw command request
#[derive(Deserialize)]
pub struct CommandRequest {
    command: String,
    #[serde(default)]
    payload: String,
}

/// Switch request
#[derive(Deserialize)]
pub struct SwitchRequest {
    #[serde(default = "default_switch")]
    switch_name: String,
    #[serde(default)]
    action: SwitchAction,
}

/// Auto-off timer request
#[derive(Deserialize)]
pub struct TimerRequest {
    #[serde(default = "default_switch")]
    switch_name: String,
    duration: u64,
    #[serde(default)]
    unit: TimeUnit,
}

fn default_switch() -> String {
    "POWER".to_string()
}

/// List all devices
pub async fn list_devices(State(state): State<AppState>) -> Reply {
    ok(state.network.devices().list())
}

/// Get a specific device
pub async fn get_device(State(state): State<AppState>, Path(id): Path<DeviceId>) -> Reply {
    match state.network.devices().get(id) {
        Some(device) => ok(device),
        None => not_found("Device not found"),
    }
}

/// Send a raw Tasmota command to a device
pub async fn send_command(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    Json(req): Json<CommandRequest>,
) -> Reply {
    let action = Action::DeviceCommand {
        device_id: id,
        command: req.command,
        payload: req.payload,
    };
    if let Err(e) = action.validate() {
        return respond::<()>(Err(e));
    }
    respond(state.executor.execute(&action).await)
}

/// Drive a switch ON, OFF or TOGGLE
pub async fn switch_device(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    Json(req): Json<SwitchRequest>,
) -> Reply {
    let result = state
        .executor
        .switch(id, &req.switch_name, req.action)
        .await
        .map(|sent| json!({ "switch_name": req.switch_name, "command": sent }));
    respond(result)
}

/// Ask every device to report its status
pub async fn scan_devices(State(state): State<AppState>) -> Reply {
    let result = state
        .network
        .scan()
        .await
        .map(|()| json!({ "status": "scan_started" }))
        .map_err(AutomationError::from);
    respond(result)
}

/// Switch ON and arm an auto-off timer
pub async fn start_timer(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    Json(req): Json<TimerRequest>,
) -> Reply {
    let duration = Duration::from_secs(req.unit.to_seconds(req.duration));
    let result = state
        .timers
        .start_timer(id, &req.switch_name, duration)
        .await
        .map(|timer| {
            json!({
                "device_id": id,
                "switch_name": req.switch_name,
                "deadline": timer.deadline,
            })
        });
    respond(result)
}

/// Cancel an auto-off timer without switching
pub async fn cancel_timer(
    State(state): State<AppState>,
    Path((id, switch_name)): Path<(DeviceId, String)>,
) -> Reply {
    if state.network.devices().get(id).is_none() {
        return not_found("Device not found");
    }
    let cancelled = state.timers.cancel(id, &switch_name);
    ok(json!({ "switch_name": switch_name, "cancelled": cancelled }))
}
