//! Compiled schema documents and compatibility checking
//!
//! VARMA validates JSON payloads against a small structural schema
//! dialect: `type`, `properties`, `required`, `enum` and `items`. That
//! covers the pre-publish gate without pulling a full JSON-Schema engine
//! into the hot path; binary formats (Avro, Protobuf) are validated by
//! their codecs at the adapter edge.

use crate::error::{DeliveryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Schema serialization format - an open set
///
/// Unknown type strings fail with `UnsupportedSchemaType` so new formats
/// can appear registry-side before this build learns about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaType {
    /// JSON documents, structurally validated in-process
    Json,
    /// Avro binary, validated by the codec at the adapter edge
    Avro,
    /// Protobuf binary, validated by the codec at the adapter edge
    Protobuf,
}

impl SchemaType {
    /// Canonical registry label
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::Json => "JSON",
            SchemaType::Avro => "AVRO",
            SchemaType::Protobuf => "PROTOBUF",
        }
    }
}

impl FromStr for SchemaType {
    type Err = DeliveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "JSON" => Ok(SchemaType::Json),
            "AVRO" => Ok(SchemaType::Avro),
            "PROTOBUF" => Ok(SchemaType::Protobuf),
            other => Err(DeliveryError::UnsupportedSchemaType(other.to_string())),
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compatibility rule applied when a new schema version is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompatibilityMode {
    /// No checking - every registration is accepted
    None,
    /// Data written under the previous version must validate under the
    /// new one (new version may not add required fields)
    #[default]
    Backward,
    /// Data written under the new version must validate under the
    /// previous one (new version may not drop required fields)
    Forward,
    /// Both directions
    Full,
}

/// A compiled structural schema
///
/// Deserialized once at registration/fetch time and reused for every
/// validation - immutable after compile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    /// Expected JSON type: object, array, string, number, integer,
    /// boolean, null
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Nested property schemas (object types)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, SchemaDocument>,

    /// Property names that must be present (object types)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    /// Closed value set
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<serde_json::Value>>,

    /// Element schema (array types)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<SchemaDocument>>,
}

impl SchemaDocument {
    /// Compile a schema from its JSON source
    pub fn compile(source: &str) -> Result<Self> {
        serde_json::from_str(source)
            .map_err(|e| DeliveryError::Validation(format!("malformed schema document: {e}")))
    }

    /// Validate a JSON value, returning the first violation found
    pub fn check(&self, value: &serde_json::Value) -> std::result::Result<(), String> {
        self.check_at(value, "$")
    }

    fn check_at(
        &self,
        value: &serde_json::Value,
        path: &str,
    ) -> std::result::Result<(), String> {
        if let Some(kind) = &self.kind {
            if !type_matches(kind, value) {
                return Err(format!(
                    "{path}: expected {kind}, got {}",
                    type_name(value)
                ));
            }
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(format!("{path}: value not in enum"));
            }
        }

        if let serde_json::Value::Object(map) = value {
            for name in &self.required {
                if !map.contains_key(name) {
                    return Err(format!("{path}: missing required field '{name}'"));
                }
            }
            for (name, sub) in &self.properties {
                if let Some(field) = map.get(name) {
                    sub.check_at(field, &format!("{path}.{name}"))?;
                }
            }
        }

        if let (Some(items), serde_json::Value::Array(elements)) = (&self.items, value) {
            for (i, element) in elements.iter().enumerate() {
                items.check_at(element, &format!("{path}[{i}]"))?;
            }
        }

        Ok(())
    }

    /// Check whether this schema may replace `previous` under `mode`
    pub fn compatible_with(
        &self,
        previous: &SchemaDocument,
        mode: CompatibilityMode,
    ) -> std::result::Result<(), String> {
        match mode {
            CompatibilityMode::None => Ok(()),
            CompatibilityMode::Backward => backward_compatible(self, previous),
            CompatibilityMode::Forward => forward_compatible(self, previous),
            CompatibilityMode::Full => {
                backward_compatible(self, previous)?;
                forward_compatible(self, previous)
            }
        }
    }
}

/// Data written under `old` must validate under `new`: the new version
/// may not require fields the old version did not, and shared property
/// types must agree.
fn backward_compatible(
    new: &SchemaDocument,
    old: &SchemaDocument,
) -> std::result::Result<(), String> {
    for name in &new.required {
        if !old.required.contains(name) {
            return Err(format!(
                "backward incompatible: adds required field '{name}'"
            ));
        }
    }
    shared_types_agree(new, old)
}

/// Data written under `new` must validate under `old`: the new version
/// may not drop fields the old version required.
fn forward_compatible(
    new: &SchemaDocument,
    old: &SchemaDocument,
) -> std::result::Result<(), String> {
    for name in &old.required {
        if !new.required.contains(name) {
            return Err(format!(
                "forward incompatible: drops required field '{name}'"
            ));
        }
    }
    shared_types_agree(new, old)
}

fn shared_types_agree(
    a: &SchemaDocument,
    b: &SchemaDocument,
) -> std::result::Result<(), String> {
    for (name, sub_a) in &a.properties {
        if let Some(sub_b) = b.properties.get(name) {
            if let (Some(ka), Some(kb)) = (&sub_a.kind, &sub_b.kind) {
                if ka != kb {
                    return Err(format!(
                        "incompatible: field '{name}' changed type from {kb} to {ka}"
                    ));
                }
            }
        }
    }
    Ok(())
}

fn type_matches(kind: &str, value: &serde_json::Value) -> bool {
    match kind {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        // Unknown type keyword: permissive, mirroring the open schema set
        _ => true,
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
