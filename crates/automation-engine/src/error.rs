//! Error types for the automation engine

use tasmota_core::{DeviceId, NetworkError};
use thiserror::Error;

/// Errors that can occur in the automation engine
#[derive(Error, Debug)]
pub enum AutomationError {
    /// Automation not found
    #[error("Automation not found: {0}")]
    NotFound(u64),

    /// Schedule not found
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(u64),

    /// Automation is disabled
    #[error("Automation is disabled: {0}")]
    Disabled(u64),

    /// Invalid trigger configuration
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Invalid action configuration
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// Invalid schedule configuration
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Invalid time or date format
    #[error("Invalid time format: {0}")]
    InvalidTimeFormat(String),

    /// Ordering comparison against a non-numeric operand
    #[error("Invalid comparison: {0}")]
    InvalidComparison(String),

    /// Device not found for action
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceId),

    /// Publish failed
    #[error("Network error: {0}")]
    Network(NetworkError),

    /// IO error (persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<NetworkError> for AutomationError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::DeviceNotFound(id) => Self::DeviceNotFound(id),
            other => Self::Network(other),
        }
    }
}
