use super::{Message, MessageKind};
use std::fmt;

/// Validation errors for Message envelopes
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    MissingTopic,
    MissingSender,
    InvalidTopicFormat(String),
    PayloadNotObject,
    MissingCorrelation,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingTopic => write!(f, "topic is required"),
            ValidationError::MissingSender => write!(f, "sender is required"),
            ValidationError::InvalidTopicFormat(t) => {
                write!(
                    f,
                    "invalid topic format '{}': must be dot-separated segments of [a-z0-9_-]",
                    t
                )
            }
            ValidationError::PayloadNotObject => {
                write!(f, "payload must be a JSON object")
            }
            ValidationError::MissingCorrelation => {
                write!(f, "response messages must carry a correlation id")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validates a Message envelope before it is enqueued.
///
/// Validation rules:
/// - Required fields: topic, sender
/// - Topic format: dot-separated segments of lowercase letters, digits,
///   `_` and `-` (e.g., "hardware.detected"), no wildcards
/// - Payload: must be a JSON object (not array, string, etc.)
/// - Responses must carry a correlation id
pub fn validate(message: &Message) -> Result<(), ValidationError> {
    if message.topic.is_empty() {
        return Err(ValidationError::MissingTopic);
    }
    if message.sender.is_empty() {
        return Err(ValidationError::MissingSender);
    }

    if !is_valid_topic(&message.topic) {
        return Err(ValidationError::InvalidTopicFormat(message.topic.clone()));
    }

    if !message.payload.is_object() {
        return Err(ValidationError::PayloadNotObject);
    }

    if message.kind == MessageKind::Response && message.correlation_id.is_none() {
        return Err(ValidationError::MissingCorrelation);
    }

    Ok(())
}

/// Validates a concrete topic name.
///
/// Valid topics:
/// - Lowercase letters (a-z), digits (0-9), `_` and `-`
/// - Dots (.) for hierarchy
/// - No leading/trailing dots
/// - No consecutive dots
pub fn is_valid_topic(topic: &str) -> bool {
    if topic.is_empty() {
        return false;
    }

    topic.split('.').all(is_valid_segment)
}

pub(crate) fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    #[test]
    fn test_valid_topics() {
        assert!(is_valid_topic("hardware"));
        assert!(is_valid_topic("hardware.detected"));
        assert!(is_valid_topic("agent.state_changed"));
        assert!(is_valid_topic("schedule.update-check"));
        assert!(is_valid_topic("a.b.c.d"));
        assert!(is_valid_topic("zone1.sensor2"));
    }

    #[test]
    fn test_invalid_topics() {
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic(".hardware"));
        assert!(!is_valid_topic("hardware."));
        assert!(!is_valid_topic("hardware..detected"));
        assert!(!is_valid_topic("Hardware"));
        assert!(!is_valid_topic("hardware.*"));
        assert!(!is_valid_topic("hardware.**"));
        assert!(!is_valid_topic("hardware/detected"));
        assert!(!is_valid_topic("hardware detected"));
    }
}
