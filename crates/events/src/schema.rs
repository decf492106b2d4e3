//! Structural message schemas.
//!
//! A schema describes the JSON shape an envelope must have once serialized:
//! which fields are required, what kind of value each field holds, and
//! length bounds for strings. Nested objects (typically `data`) carry their
//! own sub-schema.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use dmq_core::ValidationError;

/// JSON value kind a field must hold.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Object,
    Array,
    Number,
    Boolean,
    /// Any non-null value.
    Any,
}

impl FieldKind {
    fn matches(self, value: &JsonValue) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Any => !value.is_null(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Any => "value",
        }
    }
}

/// Constraints on a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub kind: FieldKind,
    /// Minimum length in characters (strings only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    /// Maximum length in characters (strings only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Sub-schema applied when the field holds an object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Box<MessageSchema>>,
}

impl FieldRule {
    pub fn of(kind: FieldKind) -> Self {
        Self {
            kind,
            min_length: None,
            max_length: None,
            schema: None,
        }
    }

    pub fn string() -> Self {
        Self::of(FieldKind::String)
    }

    pub fn object() -> Self {
        Self::of(FieldKind::Object)
    }

    pub fn length(mut self, min: usize, max: usize) -> Self {
        self.min_length = Some(min);
        self.max_length = Some(max);
        self
    }

    pub fn min_length(mut self, min: usize) -> Self {
        self.min_length = Some(min);
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn with_schema(mut self, schema: MessageSchema) -> Self {
        self.schema = Some(Box::new(schema));
        self
    }
}

/// Schema for a serialized envelope (or a nested object inside it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSchema {
    #[serde(default)]
    properties: BTreeMap<String, FieldRule>,
    #[serde(default)]
    required: BTreeSet<String>,
}

impl MessageSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// The envelope schema used by services that do not declare their own:
    /// `type`, `tenantid` (5 to 10 characters) and an object `data` are required.
    pub fn envelope_default() -> Self {
        Self::new()
            .property("type", FieldRule::string())
            .property("data", FieldRule::object())
            .property("tenantid", FieldRule::string().length(5, 10))
            .require("data")
            .require("type")
            .require("tenantid")
    }

    pub fn property(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.properties.insert(name.into(), rule);
        self
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.insert(name.into());
        self
    }

    pub fn rule(&self, name: &str) -> Option<&FieldRule> {
        self.properties.get(name)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.contains(name)
    }

    /// Validate a JSON document, reporting the first violation.
    ///
    /// Required fields are checked first, then declared properties, both in
    /// field-name order.
    pub fn validate(&self, document: &JsonValue) -> Result<(), ValidationError> {
        self.validate_at(document, None)
    }

    fn validate_at(&self, document: &JsonValue, prefix: Option<&str>) -> Result<(), ValidationError> {
        let path = |name: &str| match prefix {
            Some(p) => format!("{p}.{name}"),
            None => name.to_string(),
        };

        let Some(object) = document.as_object() else {
            return Err(ValidationError::new(
                prefix.unwrap_or("$"),
                "expected an object",
            ));
        };

        for name in &self.required {
            match object.get(name) {
                None | Some(JsonValue::Null) => {
                    return Err(ValidationError::new(path(name.as_str()), "is required"));
                }
                Some(_) => {}
            }
        }

        for (name, rule) in &self.properties {
            let Some(value) = object.get(name) else {
                continue;
            };
            if value.is_null() && !self.is_required(name) {
                continue;
            }
            let field = path(name.as_str());

            if !rule.kind.matches(value) {
                return Err(ValidationError::new(
                    field,
                    format!("expected {}", rule.kind.name()),
                ));
            }

            if let Some(text) = value.as_str() {
                let len = text.chars().count();
                if let Some(min) = rule.min_length {
                    if len < min {
                        return Err(ValidationError::new(
                            field,
                            format!("must be at least {min} characters (got {len})"),
                        ));
                    }
                }
                if let Some(max) = rule.max_length {
                    if len > max {
                        return Err(ValidationError::new(
                            field,
                            format!("must be at most {max} characters (got {len})"),
                        ));
                    }
                }
            }

            if let Some(nested) = &rule.schema {
                nested.validate_at(value, Some(&field))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_schema_requires_tenant() {
        let schema = MessageSchema::envelope_default();
        let err = schema
            .validate(&json!({ "type": "a", "data": {} }))
            .unwrap_err();
        assert_eq!(err.field(), "tenantid");
    }

    #[test]
    fn null_counts_as_missing() {
        let schema = MessageSchema::envelope_default();
        let err = schema
            .validate(&json!({ "type": "a", "data": null, "tenantid": "tenant" }))
            .unwrap_err();
        assert_eq!(err.field(), "data");
    }

    #[test]
    fn tenant_length_bounds() {
        let schema = MessageSchema::envelope_default();

        let short = schema.validate(&json!({ "type": "a", "data": {}, "tenantid": "abcd" }));
        assert_eq!(short.unwrap_err().field(), "tenantid");

        let long = schema.validate(&json!({ "type": "a", "data": {}, "tenantid": "abcdefghijk" }));
        assert_eq!(long.unwrap_err().field(), "tenantid");

        assert!(schema.validate(&json!({ "type": "a", "data": {}, "tenantid": "abcde" })).is_ok());
        assert!(schema.validate(&json!({ "type": "a", "data": {}, "tenantid": "abcdefghij" })).is_ok());
    }

    #[test]
    fn lengths_count_characters_not_bytes() {
        let schema = MessageSchema::new().property("name", FieldRule::string().max_length(3));
        assert!(schema.validate(&json!({ "name": "äöü" })).is_ok());
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let schema = MessageSchema::envelope_default();
        let err = schema
            .validate(&json!({ "type": "a", "data": "not-an-object", "tenantid": "tenant" }))
            .unwrap_err();
        assert_eq!(err.field(), "data");
        assert_eq!(err.reason(), "expected object");
    }

    #[test]
    fn nested_schema_uses_dotted_paths() {
        let data = MessageSchema::new()
            .property("name", FieldRule::string().min_length(1))
            .require("name");
        let schema = MessageSchema::envelope_default()
            .property("data", FieldRule::object().with_schema(data));

        let err = schema
            .validate(&json!({ "type": "a", "data": {}, "tenantid": "tenant" }))
            .unwrap_err();
        assert_eq!(err.field(), "data.name");

        let err = schema
            .validate(&json!({ "type": "a", "data": { "name": "" }, "tenantid": "tenant" }))
            .unwrap_err();
        assert_eq!(err.field(), "data.name");
    }

    #[test]
    fn optional_fields_may_be_absent_or_null() {
        let schema = MessageSchema::new().property("note", FieldRule::string().min_length(2));
        assert!(schema.validate(&json!({})).is_ok());
        assert!(schema.validate(&json!({ "note": null })).is_ok());
    }
}
