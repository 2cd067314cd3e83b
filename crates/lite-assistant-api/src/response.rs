//! JSON response envelope and error mapping

use automation_engine::AutomationError;
use axum::{http::StatusCode, Json};
use serde::Serialize;
use tasmota_core::NetworkError;

/// API response wrapper using serde_json::Value for flexibility
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or(serde_json::Value::Null)),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

pub type Reply = (StatusCode, Json<ApiResponse>);

pub fn ok<T: Serialize>(data: T) -> Reply {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

pub fn created<T: Serialize>(data: T) -> Reply {
    (StatusCode::CREATED, Json(ApiResponse::success(data)))
}

pub fn failure(status: StatusCode, msg: impl Into<String>) -> Reply {
    (status, Json(ApiResponse::error(msg)))
}

pub fn not_found(msg: impl Into<String>) -> Reply {
    failure(StatusCode::NOT_FOUND, msg)
}

/// Status code for an engine error
pub fn error_status(error: &AutomationError) -> StatusCode {
    match error {
        AutomationError::NotFound(_)
        | AutomationError::ScheduleNotFound(_)
        | AutomationError::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        AutomationError::Disabled(_) => StatusCode::CONFLICT,
        AutomationError::InvalidTrigger(_)
        | AutomationError::InvalidAction(_)
        | AutomationError::InvalidSchedule(_)
        | AutomationError::InvalidTimeFormat(_)
        | AutomationError::InvalidComparison(_) => StatusCode::BAD_REQUEST,
        AutomationError::Network(NetworkError::DeviceNotFound(_)) => StatusCode::NOT_FOUND,
        AutomationError::Network(NetworkError::Protocol(_)) => StatusCode::BAD_GATEWAY,
        AutomationError::Io(_) | AutomationError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Turn an engine result into a reply
pub fn respond<T: Serialize>(result: Result<T, AutomationError>) -> Reply {
    match result {
        Ok(data) => ok(data),
        Err(e) => {
            let status = error_status(&e);
            if status.is_server_error() {
                tracing::error!("Request failed: {}", e);
            }
            failure(status, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt_protocol::ProtocolError;

    #[test]
    fn test_envelope_shape() {
        let value = serde_json::to_value(ApiResponse::success(vec![1, 2])).unwrap();
        assert_eq!(value, serde_json::json!({"success": true, "data": [1, 2]}));

        let value = serde_json::to_value(ApiResponse::error("nope")).unwrap();
        assert_eq!(value, serde_json::json!({"success": false, "error": "nope"}));
    }

    #[test]
    fn test_error_status() {
        assert_eq!(error_status(&AutomationError::NotFound(1)), StatusCode::NOT_FOUND);
        assert_eq!(error_status(&AutomationError::Disabled(1)), StatusCode::CONFLICT);
        assert_eq!(
            error_status(&AutomationError::InvalidSchedule("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&AutomationError::Network(NetworkError::Protocol(
                ProtocolError::NotConnected
            ))),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_respond() {
        let (status, Json(body)) = respond::<()>(Err(AutomationError::ScheduleNotFound(4)));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!body.success);
        assert_eq!(body.error.as_deref(), Some("Schedule not found: 4"));
    }
}
