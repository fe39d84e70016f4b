// Wire-input sanitization
// Applied to every value received over the wire before schema validation.
// The sanitizer rejects; it never silently rewrites payloads.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Maximum length in bytes for any string received over the wire.
const MAX_STRING_BYTES: usize = 10_000;

/// Maximum nesting depth for objects and arrays. `serde_json` trees are
/// acyclic by construction, so this bound also caps traversal.
const MAX_DEPTH: usize = 10;

/// Maximum number of properties per object level.
const MAX_PROPERTIES: usize = 100;

/// C0 control characters (minus TAB/LF/CR) plus DEL.
static CONTROL_CHARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new("[\\x00-\\x08\\x0B\\x0C\\x0E-\\x1F\\x7F]")
        .expect("Failed to compile control character regex")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("string value exceeds {MAX_STRING_BYTES} bytes at {path}")]
    StringTooLong { path: String },
    #[error("string value contains control characters at {path}")]
    ControlCharacters { path: String },
    #[error("value nesting exceeds depth {MAX_DEPTH} at {path}")]
    TooDeep { path: String },
    #[error("object exceeds {MAX_PROPERTIES} properties at {path}")]
    TooManyProperties { path: String },
}

/// Validate a wire value against the input limits. Error messages describe
/// the violation and its path without echoing payload bytes.
pub fn sanitize_value(value: &serde_json::Value) -> Result<(), SanitizeError> {
    check(value, 0, "$")
}

fn check(value: &serde_json::Value, depth: usize, path: &str) -> Result<(), SanitizeError> {
    match value {
        serde_json::Value::String(s) => check_string(s, path),
        serde_json::Value::Array(items) => {
            if depth + 1 > MAX_DEPTH {
                return Err(SanitizeError::TooDeep {
                    path: path.to_string(),
                });
            }
            for (i, item) in items.iter().enumerate() {
                check(item, depth + 1, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        serde_json::Value::Object(map) => {
            if depth + 1 > MAX_DEPTH {
                return Err(SanitizeError::TooDeep {
                    path: path.to_string(),
                });
            }
            if map.len() > MAX_PROPERTIES {
                return Err(SanitizeError::TooManyProperties {
                    path: path.to_string(),
                });
            }
            for (key, item) in map {
                check_string(key, path)?;
                check(item, depth + 1, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_string(s: &str, path: &str) -> Result<(), SanitizeError> {
    if s.len() > MAX_STRING_BYTES {
        return Err(SanitizeError::StringTooLong {
            path: path.to_string(),
        });
    }
    if CONTROL_CHARS.is_match(s) {
        return Err(SanitizeError::ControlCharacters {
            path: path.to_string(),
        });
    }
    Ok(())
}
