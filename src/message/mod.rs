use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

mod validation;

pub use validation::{is_valid_topic, validate, ValidationError};
pub(crate) use validation::is_valid_segment;

/// Delivery priority. Declaration order defines `Ord`, so `Critical` is the
/// greatest value and is delivered first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Role of a message in a conversation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Event,
    Request,
    Response,
}

/// Message is the immutable unit of communication on the bus.
///
/// The envelope is fixed and the payload is opaque to the bus: each topic
/// documents its own payload shape and receivers decode it with
/// [`Message::decode_payload`]. Once published a message is shared as
/// `Arc<Message>` and never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// UUIDv7 identifier (time-ordered, globally unique)
    #[serde(rename = "messageId")]
    pub id: Uuid,

    /// Hierarchical, dot-separated routing key (e.g., "hardware.detected")
    pub topic: String,

    /// Identity of the publishing agent
    pub sender: String,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub kind: MessageKind,

    /// Links a request to its response
    #[serde(rename = "correlationId")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    /// On responses, the id of the request being answered
    #[serde(rename = "causationId")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,

    /// Optional schema/version tag (not validated by the bus)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    /// Topic-specific data, must be a JSON object
    pub payload: Value,
}

impl Message {
    /// Creates a normal-priority event.
    pub fn new(topic: impl Into<String>, sender: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic: topic.into(),
            sender: sender.into(),
            priority: Priority::Normal,
            kind: MessageKind::Event,
            correlation_id: None,
            causation_id: None,
            schema: None,
            created_at: Utc::now(),
            payload,
        }
    }

    /// Creates a request message. The bus assigns the correlation id when
    /// it is sent through [`crate::MessageBus::request`].
    pub fn request(topic: impl Into<String>, sender: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MessageKind::Request,
            ..Self::new(topic, sender, payload)
        }
    }

    /// Builds the response to `request`, carrying its correlation id and
    /// pointing back at it through `causation_id`.
    pub fn response_to(request: &Message, sender: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MessageKind::Response,
            priority: request.priority,
            correlation_id: request.correlation_id,
            causation_id: Some(request.id),
            ..Self::new(request.topic.clone(), sender, payload)
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Decodes the payload into the receiver's type for this topic.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Convenience accessor for string payload fields.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }

    /// Validates the envelope fields. Payload contents are not inspected.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate(self)
    }
}
