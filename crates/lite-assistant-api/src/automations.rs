//! Automation, execution log and schedule handlers

use crate::response::{created, failure, not_found, ok, respond, Reply};
use crate::AppState;
use automation_engine::{
    AutomationId, CreateAutomationRequest, CreateScheduleRequest, ScheduleId,
    UpdateAutomationRequest, UpdateScheduleRequest,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

const DEFAULT_LOG_LIMIT: usize = 50;

/// `?limit=` for log queries
#[derive(Deserialize)]
pub struct LogQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_LOG_LIMIT
}

/// List all automations
pub async fn list_automations(State(state): State<AppState>) -> Reply {
    ok(state.automations.list())
}

/// Get a specific automation
pub async fn get_automation(State(state): State<AppState>, Path(id): Path<AutomationId>) -> Reply {
    match state.automations.get(id) {
        Some(automation) => ok(automation),
        None => not_found("Automation not found"),
    }
}

/// Create an automation
pub async fn create_automation(
    State(state): State<AppState>,
    Json(req): Json<CreateAutomationRequest>,
) -> Reply {
    match state.automations.create(req).await {
        Ok(automation) => created(automation),
        Err(e) => respond::<()>(Err(e)),
    }
}

/// Update an automation
pub async fn update_automation(
    State(state): State<AppState>,
    Path(id): Path<AutomationId>,
    Json(req): Json<UpdateAutomationRequest>,
) -> Reply {
    respond(state.automations.update(id, req).await)
}

/// Delete an automation
pub async fn delete_automation(
    State(state): State<AppState>,
    Path(id): Path<AutomationId>,
) -> Reply {
    respond(state.automations.delete(id).await)
}

pub async fn enable_automation(
    State(state): State<AppState>,
    Path(id): Path<AutomationId>,
) -> Reply {
    respond(state.automations.enable(id).await)
}

pub async fn disable_automation(
    State(state): State<AppState>,
    Path(id): Path<AutomationId>,
) -> Reply {
    respond(state.automations.disable(id).await)
}

/// Run an automation's action now
pub async fn trigger_automation(
    State(state): State<AppState>,
    Path(id): Path<AutomationId>,
) -> Reply {
    respond(state.automations.trigger(id).await)
}

/// Execution history of one automation
pub async fn automation_logs(
    State(state): State<AppState>,
    Path(id): Path<AutomationId>,
    Query(query): Query<LogQuery>,
) -> Reply {
    if state.automations.get(id).is_none() {
        return not_found("Automation not found");
    }
    ok(state.automations.logs(id, query.limit))
}

/// Execution history across all automations
pub async fn all_logs(State(state): State<AppState>, Query(query): Query<LogQuery>) -> Reply {
    ok(state.log.list(None, query.limit))
}

/// List all schedules
pub async fn list_schedules(State(state): State<AppState>) -> Reply {
    ok(state.scheduler.list())
}

/// Get a specific schedule
pub async fn get_schedule(State(state): State<AppState>, Path(id): Path<ScheduleId>) -> Reply {
    match state.scheduler.get(id) {
        Some(schedule) => ok(schedule),
        None => not_found("Schedule not found"),
    }
}

/// Create a schedule
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<CreateScheduleRequest>,
) -> Reply {
    if state.network.devices().get(req.device_id).is_none() {
        return failure(StatusCode::BAD_REQUEST, "Unknown device");
    }
    match state.scheduler.create(req).await {
        Ok(schedule) => created(schedule),
        Err(e) => respond::<()>(Err(e)),
    }
}

/// Update a schedule
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<ScheduleId>,
    Json(req): Json<UpdateScheduleRequest>,
) -> Reply {
    respond(state.scheduler.update(id, req).await)
}

/// Delete a schedule
pub async fn delete_schedule(State(state): State<AppState>, Path(id): Path<ScheduleId>) -> Reply {
    respond(state.scheduler.delete(id).await)
}

pub async fn enable_schedule(State(state): State<AppState>, Path(id): Path<ScheduleId>) -> Reply {
    respond(state.scheduler.set_enabled(id, true).await)
}

pub async fn disable_schedule(State(state): State<AppState>, Path(id): Path<ScheduleId>) -> Reply {
    respond(state.scheduler.set_enabled(id, false).await)
}
