//! Payload decoding and dotted-path extraction

use serde_json::Value;

/// Decode a raw bus payload.
///
/// JSON payloads are parsed as-is; anything else (e.g. Tasmota's bare
/// `Online` / `ON`) is kept as a JSON string of the raw text.
#[must_use]
pub fn parse_payload(raw: &[u8]) -> Value {
    let text = String::from_utf8_lossy(raw);
    serde_json::from_str(text.trim()).unwrap_or_else(|_| Value::String(text.into_owned()))
}

/// Extract the value at a dotted path (e.g. `ENERGY.Power`).
///
/// Returns `None` when a key is missing or an intermediate value is not
/// an object. Keys containing a literal `.` cannot be addressed.
#[must_use]
pub fn extract<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(payload, |current, key| current.as_object()?.get(key))
}

/// String form used for equality comparisons.
///
/// Strings compare without their quotes; other values use their JSON form.
#[must_use]
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
