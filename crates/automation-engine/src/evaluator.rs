//! Trigger evaluation
//!
//! Pure matching for bus-message triggers, attribute comparison and the
//! per-rule sustain state machine used by device state triggers.

use crate::error::AutomationError;
use crate::model::{AutomationId, Operator, Trigger};
use dashmap::DashMap;
use mqtt_protocol::{payload, topic};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// Numeric view of a value (numbers, and strings that parse as numbers)
#[must_use]
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Compare an attribute value against the configured operand.
///
/// Both sides numeric: numeric comparison. Otherwise `==` / `!=` compare
/// the string forms and ordering operators are an error.
pub fn compare(actual: &Value, operator: Operator, expected: &Value) -> Result<bool, AutomationError> {
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        return Ok(match operator {
            Operator::Eq => a == e,
            Operator::Ne => a != e,
            Operator::Lt => a < e,
            Operator::Le => a <= e,
            Operator::Gt => a > e,
            Operator::Ge => a >= e,
        });
    }

    let a = payload::coerce_to_string(actual);
    let e = payload::coerce_to_string(expected);
    match operator {
        Operator::Eq => Ok(a == e),
        Operator::Ne => Ok(a != e),
        _ => Err(AutomationError::InvalidComparison(format!(
            "{a} {operator} {e}"
        ))),
    }
}

/// Whether an `Mqtt` trigger matches a message.
///
/// The topic must match the pattern. Then any configured payload check
/// passing is enough; with no payload checks the topic match suffices.
#[must_use]
pub fn mqtt_trigger_matches(trigger: &Trigger, msg_topic: &str, raw_payload: &str) -> bool {
    let Trigger::Mqtt {
        topic: pattern,
        json_path,
        expected_value,
        payload_contains,
    } = trigger
    else {
        return false;
    };

    if !topic::matches(pattern, msg_topic) {
        return false;
    }

    if json_path.is_none() && payload_contains.is_none() {
        return true;
    }

    if let Some(needle) = payload_contains {
        if raw_payload.contains(needle.as_str()) {
            return true;
        }
    }

    if let (Some(path), Some(expected)) = (json_path, expected_value) {
        let parsed = payload::parse_payload(raw_payload.as_bytes());
        if let Some(actual) = payload::extract(&parsed, path) {
            return payload::coerce_to_string(actual) == payload::coerce_to_string(expected);
        }
    }

    false
}

/// Sustain state of one device state rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SustainState {
    /// Condition false
    Unmet,
    /// Condition true since `since`, window not yet elapsed
    Pending { since: Instant },
    /// Already fired for the current true period
    Fired,
}

/// What the caller has to do after an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changed
    None,
    /// A window started; confirm at `due` with the same `since`
    Armed { since: Instant, due: Instant },
    /// Execute the action now
    Fire,
    /// A pending window was abandoned
    Reset,
}

/// Per-rule sustain state machine.
///
/// `Unmet -> Pending -> Fired`, back to `Unmet` whenever the condition
/// goes false. A rule fires at most once per true period.
#[derive(Debug, Default)]
pub struct SustainTracker {
    states: DashMap<AutomationId, SustainState>,
}

impl SustainTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the current condition value for a rule
    pub fn observe(
        &self,
        id: AutomationId,
        condition: bool,
        window: Duration,
        now: Instant,
    ) -> Transition {
        let mut state = self.states.entry(id).or_insert(SustainState::Unmet);
        match (*state, condition) {
            (SustainState::Unmet, true) if window.is_zero() => {
                *state = SustainState::Fired;
                Transition::Fire
            }
            (SustainState::Unmet, true) => {
                *state = SustainState::Pending { since: now };
                Transition::Armed {
                    since: now,
                    due: now + window,
                }
            }
            (SustainState::Pending { since }, true) if now >= since + window => {
                *state = SustainState::Fired;
                Transition::Fire
            }
            (SustainState::Pending { .. }, false) => {
                *state = SustainState::Unmet;
                Transition::Reset
            }
            (SustainState::Fired, false) => {
                *state = SustainState::Unmet;
                Transition::None
            }
            _ => Transition::None,
        }
    }

    /// Deadline check for a pending window.
    ///
    /// Fires only if the rule is still pending with the same start instant
    /// and the window has elapsed.
    pub fn confirm(&self, id: AutomationId, since: Instant, window: Duration, now: Instant) -> bool {
        let Some(mut state) = self.states.get_mut(&id) else {
            return false;
        };
        match *state {
            SustainState::Pending { since: started } if started == since && now >= since + window => {
                *state = SustainState::Fired;
                true
            }
            _ => false,
        }
    }

    /// Current state of a rule
    #[must_use]
    pub fn state(&self, id: AutomationId) -> SustainState {
        self.states
            .get(&id)
            .map_or(SustainState::Unmet, |s| *s)
    }

    /// Forget a rule (after update or delete)
    pub fn clear(&self, id: AutomationId) {
        self.states.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FIVE_MINUTES: Duration = Duration::from_secs(300);

    fn minutes(n: u64) -> Duration {
        Duration::from_secs(n * 60)
    }

    #[test]
    fn test_compare_numeric() {
        assert!(compare(&json!(12.5), Operator::Gt, &json!(10)).unwrap());
        assert!(compare(&json!("12.5"), Operator::Le, &json!(12.5)).unwrap());
        assert!(compare(&json!(5), Operator::Eq, &json!("5.0")).unwrap());
        assert!(!compare(&json!(5), Operator::Ne, &json!(5)).unwrap());
    }

    #[test]
    fn test_compare_strings() {
        assert!(compare(&json!("ON"), Operator::Eq, &json!("ON")).unwrap());
        assert!(compare(&json!("OFF"), Operator::Ne, &json!("ON")).unwrap());
        assert!(compare(&json!(true), Operator::Eq, &json!("true")).unwrap());
    }

    #[test]
    fn test_ordering_on_text_is_error() {
        assert!(matches!(
            compare(&json!("ON"), Operator::Gt, &json!(3)),
            Err(AutomationError::InvalidComparison(_))
        ));
    }

    fn mqtt(topic: &str) -> Trigger {
        Trigger::Mqtt {
            topic: topic.to_string(),
            json_path: None,
            expected_value: None,
            payload_contains: None,
        }
    }

    #[test]
    fn test_mqtt_topic_only() {
        let trigger = mqtt("tele/+/STATE");
        assert!(mqtt_trigger_matches(&trigger, "tele/pump/STATE", "{}"));
        assert!(!mqtt_trigger_matches(&trigger, "tele/pump/SENSOR", "{}"));
    }

    #[test]
    fn test_mqtt_json_path() {
        let trigger = Trigger::Mqtt {
            topic: "tele/pump/SENSOR".to_string(),
            json_path: Some("ENERGY.Power".to_string()),
            expected_value: Some(json!(0)),
            payload_contains: None,
        };
        assert!(mqtt_trigger_matches(
            &trigger,
            "tele/pump/SENSOR",
            r#"{"ENERGY":{"Power":0}}"#
        ));
        assert!(!mqtt_trigger_matches(
            &trigger,
            "tele/pump/SENSOR",
            r#"{"ENERGY":{"Power":3}}"#
        ));
        assert!(!mqtt_trigger_matches(&trigger, "tele/pump/SENSOR", "not json"));
    }

    #[test]
    fn test_mqtt_payload_contains() {
        let trigger = Trigger::Mqtt {
            topic: "stat/#".to_string(),
            json_path: None,
            expected_value: None,
            payload_contains: Some("\"ON\"".to_string()),
        };
        assert!(mqtt_trigger_matches(&trigger, "stat/pump/RESULT", r#"{"POWER":"ON"}"#));
        assert!(!mqtt_trigger_matches(&trigger, "stat/pump/RESULT", r#"{"POWER":"OFF"}"#));
    }

    #[test]
    fn test_zero_window_fires_on_transition() {
        let tracker = SustainTracker::new();
        let t0 = Instant::now();
        assert_eq!(tracker.observe(1, true, Duration::ZERO, t0), Transition::Fire);
        assert_eq!(tracker.observe(1, true, Duration::ZERO, t0), Transition::None);
        assert_eq!(tracker.observe(1, false, Duration::ZERO, t0), Transition::None);
        assert_eq!(tracker.observe(1, true, Duration::ZERO, t0), Transition::Fire);
    }

    #[test]
    fn test_sustain_interrupted_does_not_fire() {
        let tracker = SustainTracker::new();
        let t0 = Instant::now();

        let first = tracker.observe(1, true, FIVE_MINUTES, t0);
        let Transition::Armed { since, due } = first else {
            panic!("expected armed, got {first:?}");
        };
        assert_eq!(due, t0 + FIVE_MINUTES);

        assert_eq!(
            tracker.observe(1, false, FIVE_MINUTES, t0 + minutes(3)),
            Transition::Reset
        );
        assert!(matches!(
            tracker.observe(1, true, FIVE_MINUTES, t0 + minutes(4)),
            Transition::Armed { .. }
        ));

        // The first window's deadline no longer counts
        assert!(!tracker.confirm(1, since, FIVE_MINUTES, t0 + minutes(5)));
        assert!(matches!(tracker.state(1), SustainState::Pending { .. }));
    }

    #[test]
    fn test_sustain_continuous_fires_once() {
        let tracker = SustainTracker::new();
        let t0 = Instant::now();

        let Transition::Armed { since, .. } = tracker.observe(1, true, FIVE_MINUTES, t0) else {
            panic!("expected armed");
        };
        assert_eq!(
            tracker.observe(1, true, FIVE_MINUTES, t0 + minutes(2)),
            Transition::None
        );
        assert!(!tracker.confirm(1, since, FIVE_MINUTES, t0 + minutes(4)));
        assert!(tracker.confirm(1, since, FIVE_MINUTES, t0 + minutes(5)));
        assert!(!tracker.confirm(1, since, FIVE_MINUTES, t0 + minutes(5)));
        assert_eq!(
            tracker.observe(1, true, FIVE_MINUTES, t0 + minutes(6)),
            Transition::None
        );
        assert_eq!(tracker.state(1), SustainState::Fired);
    }

    #[test]
    fn test_late_observation_fires_pending_window() {
        let tracker = SustainTracker::new();
        let t0 = Instant::now();
        let Transition::Armed { since, .. } = tracker.observe(1, true, FIVE_MINUTES, t0) else {
            panic!("expected armed");
        };
        assert_eq!(
            tracker.observe(1, true, FIVE_MINUTES, t0 + minutes(7)),
            Transition::Fire
        );
        assert!(!tracker.confirm(1, since, FIVE_MINUTES, t0 + minutes(7)));
    }

    #[test]
    fn test_clear() {
        let tracker = SustainTracker::new();
        let t0 = Instant::now();
        tracker.observe(1, true, FIVE_MINUTES, t0);
        tracker.clear(1);
        assert_eq!(tracker.state(1), SustainState::Unmet);
    }
}
