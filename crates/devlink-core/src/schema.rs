//! Command payload schemas.
//!
//! Every command topic a plugin may publish is described by a
//! [`CommandSchema`]. Payloads are validated on the host before anything is
//! handed to the transport, so a malformed command from one plugin never
//! reaches the device.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Expected JSON kind of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Bool,
    Integer,
    Number,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

/// A single payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    /// Inclusive byte-length bounds for strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len: Option<(usize, usize)>,
    /// Inclusive bounds for integers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(i64, i64)>,
}

/// Schema for the payload of one command topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSchema {
    pub fields: Vec<FieldSpec>,
    /// Accept fields not listed in `fields`.
    #[serde(default)]
    pub allow_unknown: bool,
}

impl CommandSchema {
    /// Schema for a command that takes no arguments.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn required(self, name: &str, kind: FieldKind) -> Self {
        self.field(name, kind, true)
    }

    pub fn optional(self, name: &str, kind: FieldKind) -> Self {
        self.field(name, kind, false)
    }

    /// Constrain the byte length of the most recently added string field.
    pub fn length(mut self, min: usize, max: usize) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.len = Some((min, max));
        }
        self
    }

    /// Constrain the range of the most recently added integer field.
    pub fn range(mut self, min: i64, max: i64) -> Self {
        if let Some(field) = self.fields.last_mut() {
            field.range = Some((min, max));
        }
        self
    }

    pub fn allow_unknown(mut self) -> Self {
        self.allow_unknown = true;
        self
    }

    fn field(mut self, name: &str, kind: FieldKind, required: bool) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required,
            len: None,
            range: None,
        });
        self
    }

    /// Validate a payload, returning the first violation found.
    ///
    /// A `null` payload is treated as an empty object.
    pub fn validate(&self, payload: &Value) -> Result<(), String> {
        let empty = serde_json::Map::new();
        let map = match payload {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(format!("payload must be an object, got {}", kind_name(other))),
        };

        for spec in &self.fields {
            match map.get(&spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required field '{}'", spec.name));
                }
                None | Some(Value::Null) => {}
                Some(value) => check_field(spec, value)?,
            }
        }

        if !self.allow_unknown {
            if let Some(unknown) = map
                .keys()
                .find(|k| !self.fields.iter().any(|f| &f.name == *k))
            {
                return Err(format!("unknown field '{}'", unknown));
            }
        }

        Ok(())
    }
}

fn check_field(spec: &FieldSpec, value: &Value) -> Result<(), String> {
    if !spec.kind.accepts(value) {
        return Err(format!(
            "field '{}' must be {:?}, got {}",
            spec.name,
            spec.kind,
            kind_name(value)
        ));
    }

    if let (Some((min, max)), Some(s)) = (spec.len, value.as_str()) {
        if s.len() < min || s.len() > max {
            return Err(format!(
                "field '{}' length {} outside {}..={}",
                spec.name,
                s.len(),
                min,
                max
            ));
        }
    }

    if let Some((min, max)) = spec.range {
        // u64 values above i64::MAX only fit in the wider type
        let n = value
            .as_i64()
            .map(i128::from)
            .or_else(|| value.as_u64().map(i128::from));
        if let Some(n) = n {
            if n < i128::from(min) || n > i128::from(max) {
                return Err(format!("field '{}' value {} outside {}..={}", spec.name, n, min, max));
            }
        }
    }

    Ok(())
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A payload failed validation for its command topic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("schema violation on '{topic}': {reason}")]
pub struct SchemaViolation {
    pub topic: String,
    pub reason: String,
}

/// Schemas keyed by exact command topic.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, CommandSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the schema for a command topic.
    pub fn insert(&mut self, topic: impl Into<String>, schema: CommandSchema) {
        self.schemas.insert(topic.into(), schema);
    }

    pub fn remove(&mut self, topic: &str) -> Option<CommandSchema> {
        self.schemas.remove(topic)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.schemas.contains_key(topic)
    }

    /// Validate a payload for `topic`. Unknown topics are violations.
    pub fn validate(&self, topic: &str, payload: &Value) -> Result<(), SchemaViolation> {
        let schema = self.schemas.get(topic).ok_or_else(|| SchemaViolation {
            topic: topic.to_string(),
            reason: "no schema registered for command topic".to_string(),
        })?;

        schema.validate(payload).map_err(|reason| SchemaViolation {
            topic: topic.to_string(),
            reason,
        })
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}
