//! Topic pattern matching
//!
//! Patterns are `/`-delimited levels. `+` matches exactly one level and
//! `#` (only valid as the last level) matches the remaining levels,
//! including none at all.

use crate::error::ProtocolError;

/// Single-level wildcard
pub const SINGLE_LEVEL: &str = "+";

/// Multi-level wildcard
pub const MULTI_LEVEL: &str = "#";

/// Check whether a concrete topic matches a subscription pattern.
///
/// A pattern with `#` anywhere but the last level never matches.
#[must_use]
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return pattern_levels.next().is_none(),
            (Some(SINGLE_LEVEL), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a subscription pattern.
///
/// Wildcards must occupy a whole level and `#` must be the last level.
pub fn validate_pattern(pattern: &str) -> Result<(), ProtocolError> {
    if pattern.is_empty() {
        return Err(ProtocolError::InvalidTopic("empty pattern".to_string()));
    }

    let levels: Vec<&str> = pattern.split('/').collect();
    let last = levels.len() - 1;

    for (index, level) in levels.iter().enumerate() {
        if *level == MULTI_LEVEL && index != last {
            return Err(ProtocolError::InvalidTopic(format!(
                "'#' must be the last level in {pattern}"
            )));
        }
        if level.len() > 1 && (level.contains('#') || level.contains('+')) {
            return Err(ProtocolError::InvalidTopic(format!(
                "wildcard must occupy a whole level in {pattern}"
            )));
        }
    }

    Ok(())
}

/// Validate a topic used for publishing (no wildcards allowed)
pub fn validate_publish_topic(topic: &str) -> Result<(), ProtocolError> {
    if topic.is_empty() {
        return Err(ProtocolError::InvalidTopic("empty topic".to_string()));
    }
    if topic.contains('#') || topic.contains('+') {
        return Err(ProtocolError::InvalidTopic(format!(
            "wildcards are not allowed when publishing: {topic}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(!matches("a/+/c", "a/b/x/c"));
        assert!(!matches("a/+/c", "a/c"));
        assert!(matches("tele/+/SENSOR", "tele/pump/SENSOR"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("a/#", "a/b/c/d"));
        assert!(matches("a/#", "a/b"));
        assert!(matches("a/#", "a"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("a/#", "b/c"));
    }

    #[test]
    fn test_hash_not_last_never_matches() {
        assert!(!matches("a/#/c", "a/b/c"));
        assert!(!matches("a/#/c", "a/c"));
        assert!(validate_pattern("a/#/c").is_err());
    }

    #[test]
    fn test_exact_and_length_mismatch() {
        assert!(matches("stat/pump/RESULT", "stat/pump/RESULT"));
        assert!(!matches("stat/pump", "stat/pump/RESULT"));
        assert!(!matches("stat/pump/RESULT/x", "stat/pump/RESULT"));
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("tele/+/STATE").is_ok());
        assert!(validate_pattern("tasmota/discovery/#").is_ok());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("tele/dev+/STATE").is_err());
        assert!(validate_pattern("tele/#x").is_err());
    }

    #[test]
    fn test_validate_publish_topic() {
        assert!(validate_publish_topic("cmnd/pump/POWER").is_ok());
        assert!(validate_publish_topic("cmnd/+/POWER").is_err());
        assert!(validate_publish_topic("").is_err());
    }
}
