//! Declarative output validation.
//!
//! A deliberately small schema language: a root type, required property
//! names, and per-property type/enum rules. Tools and steps use it both for
//! input checking and strict-retry output validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON value categories a schema can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    /// A JSON object.
    Object,
    /// A JSON array.
    Array,
    /// A string.
    String,
    /// Any number.
    Number,
    /// An integer-valued number.
    Integer,
    /// A boolean.
    Boolean,
    /// JSON null.
    Null,
}

impl SchemaType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Null => value.is_null(),
        }
    }
}

impl std::fmt::Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Object => "object",
            Self::Array => "array",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Null => "null",
        };
        f.write_str(s)
    }
}

/// Constraint on a single object property.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyRule {
    /// Required value type, when constrained.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub expected: Option<SchemaType>,
    /// Allowed values, when constrained.
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<Value>>,
    /// Human-readable description (surfaced through MCP tool schemas).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Declarative schema over a JSON value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSchema {
    /// Required type of the root value.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub root: Option<SchemaType>,
    /// Property names that must be present (root must be an object).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    /// Per-property rules.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropertyRule>,
}

impl OutputSchema {
    /// A schema requiring an object with the given required keys.
    #[must_use]
    pub fn object_with(required: &[&str]) -> Self {
        Self {
            root: Some(SchemaType::Object),
            required: required.iter().map(|s| (*s).to_owned()).collect(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a typed property rule.
    #[must_use]
    pub fn property(mut self, name: &str, expected: SchemaType) -> Self {
        self.properties.insert(
            name.to_owned(),
            PropertyRule {
                expected: Some(expected),
                ..PropertyRule::default()
            },
        );
        self
    }

    /// Validate a value, returning every violation found.
    ///
    /// # Errors
    ///
    /// A non-empty list of human-readable violations.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();

        if let Some(root) = self.root {
            if !root.matches(value) {
                violations.push(format!("expected root type {root}, got {}", kind_of(value)));
            }
        }

        let object = value.as_object();
        for name in &self.required {
            if object.is_none_or(|map| !map.contains_key(name)) {
                violations.push(format!("missing required property {name:?}"));
            }
        }

        if let Some(map) = object {
            for (name, rule) in &self.properties {
                let Some(actual) = map.get(name) else {
                    continue;
                };
                if let Some(expected) = rule.expected {
                    if !expected.matches(actual) {
                        violations.push(format!(
                            "property {name:?}: expected {expected}, got {}",
                            kind_of(actual)
                        ));
                    }
                }
                if let Some(allowed) = &rule.one_of {
                    if !allowed.contains(actual) {
                        violations.push(format!("property {name:?}: value not in allowed set"));
                    }
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_object_passes() {
        let schema = OutputSchema::object_with(&["summary"]).property("summary", SchemaType::String);
        assert!(schema.validate(&json!({"summary": "ok"})).is_ok());
    }

    #[test]
    fn missing_required_property_is_reported() {
        let schema = OutputSchema::object_with(&["summary", "score"]);
        let violations = schema.validate(&json!({"summary": "ok"})).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("score"));
    }

    #[test]
    fn wrong_root_type_is_reported() {
        let schema = OutputSchema::object_with(&[]);
        let violations = schema.validate(&json!([1, 2])).unwrap_err();
        assert!(violations[0].contains("expected root type object"));
    }

    #[test]
    fn property_type_mismatch_is_reported() {
        let schema = OutputSchema::object_with(&["n"]).property("n", SchemaType::Integer);
        let violations = schema.validate(&json!({"n": "five"})).unwrap_err();
        assert!(violations[0].contains("expected integer"));
    }

    #[test]
    fn enum_constraint() {
        let mut schema = OutputSchema::object_with(&["mode"]);
        schema.properties.insert(
            "mode".into(),
            PropertyRule {
                one_of: Some(vec![json!("fast"), json!("slow")]),
                ..PropertyRule::default()
            },
        );
        assert!(schema.validate(&json!({"mode": "fast"})).is_ok());
        assert!(schema.validate(&json!({"mode": "medium"})).is_err());
    }

    #[test]
    fn multiple_violations_accumulate() {
        let schema = OutputSchema::object_with(&["a", "b"]).property("c", SchemaType::Boolean);
        let violations = schema.validate(&json!({"c": 3})).unwrap_err();
        assert_eq!(violations.len(), 3);
    }

    #[test]
    fn schema_serde_roundtrip() {
        let schema = OutputSchema::object_with(&["x"]).property("x", SchemaType::Number);
        let json = serde_json::to_string(&schema).unwrap();
        let back: OutputSchema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schema);
    }
}
