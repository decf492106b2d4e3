use serde::{Deserialize, Serialize};

/// Whether a message asks for something to happen or reports that it did.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Event,
}

/// CloudEvents attributes identifying a message kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudEventAttributes {
    /// Stable type identifier (e.g. "billing.invoice.issued").
    #[serde(rename = "type")]
    pub event_type: String,
    pub data_content_type: String,
    pub spec_version: String,
}

/// Identifies a kind of message.
///
/// Definitions are plain values: two definitions describe the same message
/// kind when they are equal, regardless of where they were constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDefinition {
    pub message_type: MessageType,
    pub cloud_event: CloudEventAttributes,
}

pub const DEFAULT_DATA_CONTENT_TYPE: &str = "application/json";
pub const DEFAULT_SPEC_VERSION: &str = "1.0";

impl MessageDefinition {
    pub fn new(message_type: MessageType, event_type: impl Into<String>) -> Self {
        Self {
            message_type,
            cloud_event: CloudEventAttributes {
                event_type: event_type.into(),
                data_content_type: DEFAULT_DATA_CONTENT_TYPE.to_string(),
                spec_version: DEFAULT_SPEC_VERSION.to_string(),
            },
        }
    }

    pub fn command(event_type: impl Into<String>) -> Self {
        Self::new(MessageType::Command, event_type)
    }

    pub fn event(event_type: impl Into<String>) -> Self {
        Self::new(MessageType::Event, event_type)
    }

    pub fn with_data_content_type(mut self, data_content_type: impl Into<String>) -> Self {
        self.cloud_event.data_content_type = data_content_type.into();
        self
    }

    pub fn with_spec_version(mut self, spec_version: impl Into<String>) -> Self {
        self.cloud_event.spec_version = spec_version.into();
        self
    }

    pub fn event_type(&self) -> &str {
        &self.cloud_event.event_type
    }
}
