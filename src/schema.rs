//! Compiled schema validation
//!
//! Tool inputs, prompt arguments, and resource URIs are validated against a
//! JSON Schema subset. Each registration carries a [`SchemaKind`]: a tagged
//! variant over the concrete schema shapes, so downstream validation
//! dispatches on the variant instead of probing structure at call time.
//! Compiled validators are cached keyed by a structural hash of the schema,
//! making repeated validations O(size of value).

use dashmap::DashMap;
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

static COMPILED_CACHE: Lazy<DashMap<String, Arc<JSONSchema>>> = Lazy::new(DashMap::new);

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema root must be an object schema")]
    NotObjectRoot,
    #[error("schema root must be a string schema")]
    NotStringRoot,
    #[error("schema failed to compile: {0}")]
    Compile(String),
}

/// Validation schema attached to a registration.
#[derive(Clone, Debug)]
pub enum SchemaKind {
    /// Object-root schema (tool inputs, prompt arguments).
    Object(CompiledSchema),
    /// String-root schema (resource URIs).
    Uri(CompiledSchema),
    /// No internal schema declared; values pass through sanitization only.
    None,
}

impl SchemaKind {
    /// Compile an object-root schema, or `None` when absent.
    pub fn object(schema: Option<&Value>) -> Result<Self, SchemaError> {
        match schema {
            None => Ok(SchemaKind::None),
            Some(schema) => {
                if schema.get("type").and_then(Value::as_str) != Some("object") {
                    return Err(SchemaError::NotObjectRoot);
                }
                Ok(SchemaKind::Object(CompiledSchema::compile(schema)?))
            }
        }
    }

    /// Compile a string-root schema, or `None` when absent.
    pub fn uri(schema: Option<&Value>) -> Result<Self, SchemaError> {
        match schema {
            None => Ok(SchemaKind::None),
            Some(schema) => {
                if schema.get("type").and_then(Value::as_str) != Some("string") {
                    return Err(SchemaError::NotStringRoot);
                }
                Ok(SchemaKind::Uri(CompiledSchema::compile(schema)?))
            }
        }
    }

    /// Validate a value against this schema kind. `None` always passes.
    pub fn validate(&self, value: &Value) -> Result<(), ValidationFailure> {
        match self {
            SchemaKind::Object(compiled) | SchemaKind::Uri(compiled) => compiled.validate(value),
            SchemaKind::None => Ok(()),
        }
    }

    pub fn is_declared(&self) -> bool {
        !matches!(self, SchemaKind::None)
    }
}

/// A schema compiled once and shared through the process-wide cache.
#[derive(Clone, Debug)]
pub struct CompiledSchema {
    hash: String,
    validator: Arc<JSONSchema>,
}

impl CompiledSchema {
    pub fn compile(schema: &Value) -> Result<Self, SchemaError> {
        let hash = structural_hash(schema);
        if let Some(cached) = COMPILED_CACHE.get(&hash) {
            return Ok(Self {
                hash,
                validator: Arc::clone(cached.value()),
            });
        }
        let compiled = JSONSchema::compile(schema).map_err(|e| SchemaError::Compile(e.to_string()))?;
        let validator = Arc::new(compiled);
        COMPILED_CACHE.insert(hash.clone(), Arc::clone(&validator));
        Ok(Self { hash, validator })
    }

    pub fn validate(&self, value: &Value) -> Result<(), ValidationFailure> {
        let result = self.validator.validate(value);
        match result {
            Ok(()) => Ok(()),
            Err(mut errors) => {
                let failure = errors
                    .next()
                    .map(|err| ValidationFailure {
                        path: if err.instance_path.to_string().is_empty() {
                            "$".to_string()
                        } else {
                            err.instance_path.to_string()
                        },
                        expected: err.to_string(),
                        received: json_type_name(&err.instance).to_string(),
                    })
                    .unwrap_or_else(ValidationFailure::unknown);
                Err(failure)
            }
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// A structured validation failure: where it happened, what the schema
/// expected, and what JSON type arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub path: String,
    pub expected: String,
    pub received: String,
}

impl ValidationFailure {
    fn unknown() -> Self {
        Self {
            path: "$".to_string(),
            expected: "value matching schema".to_string(),
            received: "non-conforming value".to_string(),
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {} (got {})", self.expected, self.path, self.received)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Stable structural hash: SHA-256 over a canonical (sorted-key) rendering,
/// so formatting and key order do not defeat the cache.
pub fn structural_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    write_canonical(value, &mut hasher);
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, hasher: &mut Sha256) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update(b"\"");
            hasher.update(s.as_bytes());
            hasher.update(b"\"");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical(item, hasher);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update(key.as_bytes());
                hasher.update(b":");
                write_canonical(&map[key], hasher);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structural_hash_ignores_key_order() {
        let a = json!({"type": "object", "properties": {"a": {"type": "string"}, "b": {"type": "number"}}});
        let b = json!({"properties": {"b": {"type": "number"}, "a": {"type": "string"}}, "type": "object"});
        assert_eq!(structural_hash(&a), structural_hash(&b));
        assert_ne!(structural_hash(&a), structural_hash(&json!({"type": "object"})));
    }

    #[test]
    fn compiled_schemas_are_cached_by_hash() {
        let schema = json!({"type": "object", "properties": {"msg": {"type": "string"}}});
        let first = CompiledSchema::compile(&schema).unwrap();
        let second = CompiledSchema::compile(&schema).unwrap();
        assert_eq!(first.hash(), second.hash());
    }

    #[test]
    fn object_kind_rejects_non_object_root() {
        let err = SchemaKind::object(Some(&json!({"type": "string"}))).unwrap_err();
        assert!(matches!(err, SchemaError::NotObjectRoot));
    }

    #[test]
    fn validates_required_properties() {
        let kind = SchemaKind::object(Some(&json!({
            "type": "object",
            "properties": {"msg": {"type": "string"}},
            "required": ["msg"]
        })))
        .unwrap();

        assert!(kind.validate(&json!({"msg": "hi"})).is_ok());

        let failure = kind.validate(&json!({"msg": 42})).unwrap_err();
        assert_eq!(failure.received, "number");

        let failure = kind.validate(&json!({})).unwrap_err();
        assert_eq!(failure.path, "$");
    }

    #[test]
    fn uri_kind_validates_string_patterns() {
        let kind = SchemaKind::uri(Some(&json!({
            "type": "string",
            "pattern": "^file://"
        })))
        .unwrap();

        assert!(kind.validate(&json!("file:///etc/hosts")).is_ok());
        assert!(kind.validate(&json!("https://example.com")).is_err());
    }

    #[test]
    fn absent_schema_passes_everything() {
        let kind = SchemaKind::object(None).unwrap();
        assert!(!kind.is_declared());
        assert!(kind.validate(&json!({"anything": [1, 2, 3]})).is_ok());
    }
}
