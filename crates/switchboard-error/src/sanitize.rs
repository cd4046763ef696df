//! Scrubbing of error details before they reach the wire.
//!
//! Error details are written by application code, which means they sometimes
//! contain things that must not be echoed back to a client: credentials
//! captured in a request snapshot, or multi-kilobyte context objects.  Every
//! payload runs through [`sanitize_details`] at construction time.

use serde_json::{Map, Value};
use tracing::debug;

/// Keys (compared case-insensitively) that are stripped from details at any
/// nesting depth.
const FORBIDDEN_KEYS: [&str; 12] = [
    "password",
    "token",
    "authorization",
    "cookie",
    "secret",
    "apikey",
    "accesstoken",
    "refreshtoken",
    "credentials",
    "auth",
    "bearer",
    "jwt",
];

/// Maximum JSON serialization length, in bytes, for an object nested inside
/// the details.  The top-level details object is exempt.
const MAX_NESTED_OBJECT_LEN: usize = 500;

/// Return true if `key` must never appear in outbound details.
fn is_forbidden_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    FORBIDDEN_KEYS.contains(&lowered.as_str())
}

/// Sanitize a details value for transmission.
///
/// Keys matching the forbidden set are removed at every depth.  Objects
/// nested below the top level whose JSON form exceeds 500 bytes (after their
/// own sanitization) are dropped entirely.  Primitive values, including
/// arbitrarily long strings and date-like strings, pass through unchanged.
pub fn sanitize_details(details: &Value) -> Value {
    match details {
        Value::Object(map) => Value::Object(sanitize_map(map)),
        Value::Array(items) => Value::Array(sanitize_array(items)),
        primitive => primitive.clone(),
    }
}

/// Sanitize the fields of an object, dropping forbidden keys and oversized
/// nested objects.
fn sanitize_map(map: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(map.len());
    for (key, value) in map {
        if is_forbidden_key(key) {
            debug!("Stripping forbidden key {key:?} from error details");
            continue;
        }
        match sanitize_nested(value) {
            Some(clean) => {
                out.insert(key.clone(), clean);
            }
            None => {
                debug!("Dropping oversized nested object at key {key:?} in error details");
            }
        }
    }
    out
}

/// Sanitize the elements of an array, dropping oversized nested objects.
fn sanitize_array(items: &[Value]) -> Vec<Value> {
    items.iter().filter_map(sanitize_nested).collect()
}

/// Sanitize a value nested below the top level.
///
/// Returns `None` when the value is an object whose sanitized JSON form is
/// still over the size cap.
fn sanitize_nested(value: &Value) -> Option<Value> {
    match value {
        Value::Object(map) => {
            let clean = Value::Object(sanitize_map(map));
            let len = serde_json::to_string(&clean).map(|s| s.len()).unwrap_or(usize::MAX);
            (len <= MAX_NESTED_OBJECT_LEN).then_some(clean)
        }
        Value::Array(items) => Some(Value::Array(sanitize_array(items))),
        primitive => Some(primitive.clone()),
    }
}
