//! Data models for the automation engine

use crate::error::AutomationError;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use mqtt_protocol::topic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tasmota_core::DeviceId;

/// Longest auto-off delay a schedule or timer may request (30 days)
pub const MAX_RUN_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Automation rule identifier
pub type AutomationId = u64;

/// Schedule identifier
pub type ScheduleId = u64;

/// A complete automation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    /// Unique identifier
    pub id: AutomationId,
    /// Human-readable name
    pub name: String,
    /// Whether the automation is active
    pub enabled: bool,
    /// What initiates the automation
    pub trigger: Trigger,
    /// What happens when it fires
    pub action: Action,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

/// Trigger types that can initiate an automation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// A bus message on a topic matching `topic` (`+` / `#` wildcards)
    Mqtt {
        topic: String,
        /// Dotted path into a JSON payload
        #[serde(default)]
        json_path: Option<String>,
        /// Value the extracted field must equal (string comparison)
        #[serde(default)]
        expected_value: Option<Value>,
        /// Substring the raw payload must contain
        #[serde(default)]
        payload_contains: Option<String>,
    },
    /// Local wall-clock time, once per day
    Time { hour: u32, minute: u32 },
    /// A device attribute comparison, optionally sustained
    DeviceState {
        device_id: DeviceId,
        /// Dotted path into the device attributes (e.g. `ENERGY.Power`)
        attribute: String,
        #[serde(default)]
        operator: Operator,
        value: Value,
        /// How long the condition must hold before firing (0 = immediately)
        #[serde(default)]
        sustain_minutes: u32,
    },
}

/// Comparison operators for device state triggers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[default]
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl Operator {
    /// Whether the operator only makes sense for numbers
    #[must_use]
    pub fn is_ordering(self) -> bool {
        !matches!(self, Self::Eq | Self::Ne)
    }

    /// Operator symbol
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actions to perform when an automation fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Publish `payload` to `cmnd/<device topic>/<command>`
    DeviceCommand {
        device_id: DeviceId,
        command: String,
        payload: String,
    },
    /// Publish a raw message
    MqttPublish { topic: String, payload: String },
}

impl Trigger {
    /// Check the trigger configuration
    pub fn validate(&self) -> Result<(), AutomationError> {
        match self {
            Trigger::Mqtt {
                topic,
                json_path,
                expected_value,
                ..
            } => {
                topic::validate_pattern(topic)
                    .map_err(|e| AutomationError::InvalidTrigger(e.to_string()))?;
                match (json_path, expected_value) {
                    (Some(path), _) if path.is_empty() => Err(AutomationError::InvalidTrigger(
                        "json_path must not be empty".to_string(),
                    )),
                    (Some(_), None) => Err(AutomationError::InvalidTrigger(
                        "json_path requires expected_value".to_string(),
                    )),
                    _ => Ok(()),
                }
            }
            Trigger::Time { hour, minute } => {
                if *hour > 23 || *minute > 59 {
                    return Err(AutomationError::InvalidTimeFormat(format!(
                        "{hour:02}:{minute:02}"
                    )));
                }
                Ok(())
            }
            Trigger::DeviceState {
                attribute,
                operator,
                value,
                ..
            } => {
                if attribute.is_empty() {
                    return Err(AutomationError::InvalidTrigger(
                        "attribute must not be empty".to_string(),
                    ));
                }
                if operator.is_ordering() && crate::evaluator::as_number(value).is_none() {
                    return Err(AutomationError::InvalidComparison(format!(
                        "{operator} needs a numeric value, got {value}"
                    )));
                }
                Ok(())
            }
        }
    }
}

impl Action {
    /// Check the action configuration
    pub fn validate(&self) -> Result<(), AutomationError> {
        match self {
            Action::DeviceCommand { command, .. } => {
                if command.is_empty() || command.contains(&['/', '+', '#'][..]) {
                    return Err(AutomationError::InvalidAction(format!(
                        "invalid command '{command}'"
                    )));
                }
                Ok(())
            }
            Action::MqttPublish { topic, .. } => topic::validate_publish_topic(topic)
                .map_err(|e| AutomationError::InvalidAction(e.to_string())),
        }
    }
}

/// Request to create a new automation
#[derive(Debug, Clone, Deserialize)]
pub struct CreateAutomationRequest {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: Trigger,
    pub action: Action,
}

fn default_enabled() -> bool {
    true
}

impl CreateAutomationRequest {
    pub fn validate(&self) -> Result<(), AutomationError> {
        self.trigger.validate()?;
        self.action.validate()
    }
}

/// Request to update an automation
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAutomationRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub action: Option<Action>,
}

impl Automation {
    /// Create a new automation from a create request
    #[must_use]
    pub fn from_request(id: AutomationId, request: CreateAutomationRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: request.name,
            enabled: request.enabled,
            trigger: request.trigger,
            action: request.action,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an update request to this automation
    pub fn apply_update(&mut self, update: UpdateAutomationRequest) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(trigger) = update.trigger {
            self.trigger = trigger;
        }
        if let Some(action) = update.action {
            self.action = action;
        }
        self.updated_at = Utc::now();
    }

    pub fn validate(&self) -> Result<(), AutomationError> {
        self.trigger.validate()?;
        self.action.validate()
    }
}

/// One row per execution attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: u64,
    pub automation_id: AutomationId,
    pub timestamp: DateTime<Utc>,
    /// What caused the execution
    pub trigger_data: Value,
    /// What the action did (empty object on failure)
    pub action_result: Value,
    pub success: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Schedule recurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Once,
    Daily,
    Weekly,
    Interval,
}

/// Unit for schedule durations and intervals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    #[default]
    Minutes,
    Hours,
}

impl TimeUnit {
    /// Convert `value` of this unit to seconds
    #[must_use]
    pub fn to_seconds(self, value: u64) -> u64 {
        match self {
            Self::Seconds => value,
            Self::Minutes => value.saturating_mul(60),
            Self::Hours => value.saturating_mul(3600),
        }
    }
}

/// Switch command issued by a schedule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwitchAction {
    #[default]
    On,
    Off,
    Toggle,
}

impl SwitchAction {
    /// Tasmota command payload
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Toggle => "TOGGLE",
        }
    }
}

impl fmt::Display for SwitchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-driven switch job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub name: String,
    pub enabled: bool,
    pub device_id: DeviceId,
    /// Switch to drive (`POWER`, `POWER1`, ...)
    #[serde(default = "default_switch_name")]
    pub switch_name: String,
    pub schedule_type: ScheduleType,
    /// `HH:MM`, local time (once/daily/weekly)
    #[serde(default)]
    pub time: Option<String>,
    /// `YYYY-MM-DD` (once)
    #[serde(default)]
    pub date: Option<String>,
    /// 0 = Monday ... 6 = Sunday (weekly)
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    #[serde(default)]
    pub interval_value: u64,
    #[serde(default)]
    pub interval_unit: TimeUnit,
    /// Window since local midnight during which an interval schedule runs (0 = all day)
    #[serde(default)]
    pub total_duration_value: u64,
    #[serde(default = "default_total_duration_unit")]
    pub total_duration_unit: TimeUnit,
    #[serde(default)]
    pub action: SwitchAction,
    /// Auto-off after each run (0 = leave on)
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub duration_unit: TimeUnit,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_switch_name() -> String {
    "POWER".to_string()
}

fn default_total_duration_unit() -> TimeUnit {
    TimeUnit::Hours
}

impl Schedule {
    /// Create a new schedule from a create request
    #[must_use]
    pub fn from_request(id: ScheduleId, request: CreateScheduleRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: request.name,
            enabled: request.enabled,
            device_id: request.device_id,
            switch_name: request.switch_name,
            schedule_type: request.schedule_type,
            time: request.time,
            date: request.date,
            days_of_week: request.days_of_week,
            interval_value: request.interval_value,
            interval_unit: request.interval_unit,
            total_duration_value: request.total_duration_value,
            total_duration_unit: request.total_duration_unit,
            action: request.action,
            duration: request.duration,
            duration_unit: request.duration_unit,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an update request to this schedule
    pub fn apply_update(&mut self, update: UpdateScheduleRequest) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        if let Some(device_id) = update.device_id {
            self.device_id = device_id;
        }
        if let Some(switch_name) = update.switch_name {
            self.switch_name = switch_name;
        }
        if let Some(schedule_type) = update.schedule_type {
            self.schedule_type = schedule_type;
        }
        if let Some(time) = update.time {
            self.time = Some(time);
        }
        if let Some(date) = update.date {
            self.date = Some(date);
        }
        if let Some(days) = update.days_of_week {
            self.days_of_week = days;
        }
        if let Some(value) = update.interval_value {
            self.interval_value = value;
        }
        if let Some(unit) = update.interval_unit {
            self.interval_unit = unit;
        }
        if let Some(value) = update.total_duration_value {
            self.total_duration_value = value;
        }
        if let Some(unit) = update.total_duration_unit {
            self.total_duration_unit = unit;
        }
        if let Some(action) = update.action {
            self.action = action;
        }
        if let Some(duration) = update.duration {
            self.duration = duration;
        }
        if let Some(unit) = update.duration_unit {
            self.duration_unit = unit;
        }
        self.updated_at = Utc::now();
    }

    /// Interval length in seconds
    #[must_use]
    pub fn interval_secs(&self) -> u64 {
        self.interval_unit.to_seconds(self.interval_value)
    }

    /// Interval window length in seconds (0 = unbounded)
    #[must_use]
    pub fn total_duration_secs(&self) -> u64 {
        self.total_duration_unit.to_seconds(self.total_duration_value)
    }

    /// Auto-off delay after each run
    #[must_use]
    pub fn run_duration(&self) -> Option<Duration> {
        match self.duration_unit.to_seconds(self.duration) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Parsed `time`
    pub fn time_of_day(&self) -> Result<NaiveTime, AutomationError> {
        let time = self.time.as_deref().ok_or_else(|| {
            AutomationError::InvalidSchedule(format!(
                "{:?} schedules need a time",
                self.schedule_type
            ))
        })?;
        parse_time(time)
    }

    /// Parsed `date`
    pub fn run_date(&self) -> Result<NaiveDate, AutomationError> {
        let date = self.date.as_deref().ok_or_else(|| {
            AutomationError::InvalidSchedule("once schedules need a date".to_string())
        })?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|_| AutomationError::InvalidTimeFormat(date.to_string()))
    }

    /// Check the schedule configuration
    pub fn validate(&self) -> Result<(), AutomationError> {
        if self.switch_name.is_empty() || self.switch_name.contains(&['/', '+', '#'][..]) {
            return Err(AutomationError::InvalidSchedule(format!(
                "invalid switch name '{}'",
                self.switch_name
            )));
        }

        if let Some(run) = self.run_duration() {
            if run > MAX_RUN_DURATION {
                return Err(AutomationError::InvalidSchedule(format!(
                    "run duration {}s exceeds the {}s limit",
                    run.as_secs(),
                    MAX_RUN_DURATION.as_secs()
                )));
            }
        }

        match self.schedule_type {
            ScheduleType::Once => {
                self.time_of_day()?;
                self.run_date()?;
            }
            ScheduleType::Daily => {
                self.time_of_day()?;
            }
            ScheduleType::Weekly => {
                self.time_of_day()?;
                if self.days_of_week.is_empty() {
                    return Err(AutomationError::InvalidSchedule(
                        "weekly schedules need at least one day".to_string(),
                    ));
                }
                if let Some(day) = self.days_of_week.iter().find(|d| **d > 6) {
                    return Err(AutomationError::InvalidSchedule(format!(
                        "day of week out of range: {day}"
                    )));
                }
            }
            ScheduleType::Interval => {
                let interval = self.interval_secs();
                if interval == 0 {
                    return Err(AutomationError::InvalidSchedule(
                        "interval must be positive".to_string(),
                    ));
                }
                if let Some(run) = self.run_duration() {
                    if run.as_secs() >= interval {
                        return Err(AutomationError::InvalidSchedule(format!(
                            "run duration {}s must be shorter than the {}s interval",
                            run.as_secs(),
                            interval
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parse a time string in HH:MM format
pub fn parse_time(s: &str) -> Result<NaiveTime, AutomationError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|_| AutomationError::InvalidTimeFormat(s.to_string()))
}

/// Request to create a new schedule
#[derive(Debug, Clone, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub device_id: DeviceId,
    #[serde(default = "default_switch_name")]
    pub switch_name: String,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub days_of_week: Vec<u8>,
    #[serde(default)]
    pub interval_value: u64,
    #[serde(default)]
    pub interval_unit: TimeUnit,
    #[serde(default)]
    pub total_duration_value: u64,
    #[serde(default = "default_total_duration_unit")]
    pub total_duration_unit: TimeUnit,
    #[serde(default)]
    pub action: SwitchAction,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub duration_unit: TimeUnit,
}

/// Request to update a schedule
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateScheduleRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    #[serde(default)]
    pub switch_name: Option<String>,
    #[serde(default)]
    pub schedule_type: Option<ScheduleType>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub days_of_week: Option<Vec<u8>>,
    #[serde(default)]
    pub interval_value: Option<u64>,
    #[serde(default)]
    pub interval_unit: Option<TimeUnit>,
    #[serde(default)]
    pub total_duration_value: Option<u64>,
    #[serde(default)]
    pub total_duration_unit: Option<TimeUnit>,
    #[serde(default)]
    pub action: Option<SwitchAction>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub duration_unit: Option<TimeUnit>,
}
