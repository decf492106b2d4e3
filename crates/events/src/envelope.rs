use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use dmq_core::{MessageId, TenantId, ValidationError};

use crate::definition::{CloudEventAttributes, MessageDefinition, MessageType};
use crate::schema::MessageSchema;

/// Envelope metadata that is not part of the message identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    /// Correlates messages belonging to the same conversation.
    #[serde(rename = "correlationid", default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,

    /// When the envelope was built.
    time: DateTime<Utc>,
}

impl EnvelopeMetadata {
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }
}

/// A validated, immutable message instance.
///
/// This is the unit handed to a queue. The serialized form follows
/// CloudEvents attribute naming (`id`, `type`, `specversion`,
/// `datacontenttype`) with the tenant carried as `tenantid`.
///
/// Notes:
/// - **Multi-tenancy** is enforced here via `tenant_id`.
/// - Envelopes are only produced by [`build`], which validates them against a
///   schema; there are no mutators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    id: MessageId,

    #[serde(rename = "type")]
    event_type: String,
    #[serde(rename = "specversion")]
    spec_version: String,
    #[serde(rename = "datacontenttype")]
    data_content_type: String,
    #[serde(rename = "messagetype")]
    message_type: MessageType,

    #[serde(rename = "tenantid")]
    tenant_id: TenantId,

    #[serde(flatten)]
    metadata: EnvelopeMetadata,

    data: T,
}

impl<T> Envelope<T> {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The definition this envelope was built from.
    pub fn definition(&self) -> MessageDefinition {
        MessageDefinition {
            message_type: self.message_type,
            cloud_event: CloudEventAttributes {
                event_type: self.event_type.clone(),
                data_content_type: self.data_content_type.clone(),
                spec_version: self.spec_version.clone(),
            },
        }
    }

    pub fn metadata(&self) -> &EnvelopeMetadata {
        &self.metadata
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.correlation_id()
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

impl<T: Serialize> Envelope<T> {
    /// Erase the payload type, keeping every attribute.
    pub fn into_json(self) -> Result<Envelope<JsonValue>, serde_json::Error> {
        let data = serde_json::to_value(&self.data)?;
        Ok(Envelope {
            id: self.id,
            event_type: self.event_type,
            spec_version: self.spec_version,
            data_content_type: self.data_content_type,
            message_type: self.message_type,
            tenant_id: self.tenant_id,
            metadata: self.metadata,
            data,
        })
    }
}

/// Build and validate an envelope.
///
/// The candidate envelope is serialized and checked against `schema`; any
/// missing field or violated bound fails with a [`ValidationError`] naming
/// the field. An empty `correlation_id` is treated as absent.
///
/// `build` keeps no state between calls: every call produces an independent
/// envelope with a fresh id.
pub fn build<T: Serialize>(
    definition: &MessageDefinition,
    schema: &MessageSchema,
    tenant_id: impl Into<String>,
    correlation_id: impl Into<String>,
    data: T,
) -> Result<Envelope<T>, ValidationError> {
    let tenant_id = TenantId::new(tenant_id)
        .map_err(|_| ValidationError::new("tenantid", "is required"))?;

    let correlation_id = correlation_id.into();
    let correlation_id = if correlation_id.is_empty() {
        None
    } else {
        Some(correlation_id)
    };

    let envelope = Envelope {
        id: MessageId::new(),
        event_type: definition.cloud_event.event_type.clone(),
        spec_version: definition.cloud_event.spec_version.clone(),
        data_content_type: definition.cloud_event.data_content_type.clone(),
        message_type: definition.message_type,
        tenant_id,
        metadata: EnvelopeMetadata {
            correlation_id,
            time: Utc::now(),
        },
        data,
    };

    let document = serde_json::to_value(&envelope)
        .map_err(|e| ValidationError::new("data", format!("not serializable: {e}")))?;
    schema.validate(&document)?;

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::schema::FieldRule;

    fn definition() -> MessageDefinition {
        MessageDefinition::command("test.message.a")
    }

    #[test]
    fn builds_a_valid_envelope() {
        let schema = MessageSchema::envelope_default();
        let envelope = build(&definition(), &schema, "tenantId", "", json!({})).unwrap();

        assert_eq!(envelope.tenant_id().as_str(), "tenantId");
        assert_eq!(envelope.event_type(), "test.message.a");
        assert_eq!(envelope.definition(), definition());
        assert_eq!(envelope.correlation_id(), None);
    }

    #[test]
    fn serialized_form_uses_wire_names() {
        let schema = MessageSchema::envelope_default();
        let envelope = build(&definition(), &schema, "tenantId", "corr-1", json!({ "n": 1 })).unwrap();
        let doc = serde_json::to_value(&envelope).unwrap();

        assert_eq!(doc["type"], "test.message.a");
        assert_eq!(doc["tenantid"], "tenantId");
        assert_eq!(doc["correlationid"], "corr-1");
        assert_eq!(doc["specversion"], "1.0");
        assert_eq!(doc["datacontenttype"], "application/json");
        assert_eq!(doc["data"]["n"], 1);
    }

    #[test]
    fn round_trips_through_json() {
        let schema = MessageSchema::envelope_default();
        let envelope = build(&definition(), &schema, "tenantId", "corr-1", json!({ "n": 1 })).unwrap();
        let text = serde_json::to_string(&envelope).unwrap();
        let back: Envelope<JsonValue> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn rejects_tenant_outside_bounds() {
        let schema = MessageSchema::envelope_default();

        let err = build(&definition(), &schema, "abc", "", json!({})).unwrap_err();
        assert_eq!(err.field(), "tenantid");

        let err = build(&definition(), &schema, "", "", json!({})).unwrap_err();
        assert_eq!(err.field(), "tenantid");
    }

    #[test]
    fn rejects_data_of_wrong_shape() {
        let schema = MessageSchema::envelope_default();
        let err = build(&definition(), &schema, "tenantId", "", json!([1, 2])).unwrap_err();
        assert_eq!(err.field(), "data");
    }

    #[test]
    fn repeated_builds_are_independent() {
        let data_schema = MessageSchema::new()
            .property("name", FieldRule::string().length(1, 5))
            .require("name");
        let schema = MessageSchema::envelope_default()
            .property("data", FieldRule::object().with_schema(data_schema));

        let first = build(&definition(), &schema, "tenant-1", "a", json!({ "name": "ok" })).unwrap();
        let failed = build(&definition(), &schema, "tenant-2", "b", json!({ "name": "too long" }));
        let second = build(&definition(), &schema, "tenant-3", "c", json!({ "name": "fine" })).unwrap();

        assert_eq!(failed.unwrap_err().field(), "data.name");
        assert_ne!(first.id(), second.id());
        assert_eq!(first.tenant_id().as_str(), "tenant-1");
        assert_eq!(second.tenant_id().as_str(), "tenant-3");
        assert_eq!(second.correlation_id(), Some("c"));
    }

    #[test]
    fn into_json_keeps_attributes() {
        #[derive(Serialize)]
        struct Payload {
            amount: u32,
        }

        let schema = MessageSchema::envelope_default();
        let envelope = build(&definition(), &schema, "tenantId", "", Payload { amount: 3 }).unwrap();
        let id = envelope.id();
        let erased = envelope.into_json().unwrap();

        assert_eq!(erased.id(), id);
        assert_eq!(erased.data()["amount"], 3);
    }
}
