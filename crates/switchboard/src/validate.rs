//! The validator port: the three operations the router needs from a schema
//! library.
//!
//! The router never introspects schema structure.  It asks an adapter for a
//! schema's message type, for its declared RPC response schema, and for a
//! safe parse of a frame; everything else about validation is the adapter's
//! business.  A router instance is bound to exactly one adapter for its
//! lifetime, and all schemas it is given come from that adapter.  In Rust
//! this "same family" rule costs nothing at runtime: the router is generic
//! over its [`Validator`] and schemas are the adapter's associated type.

pub mod native;

use serde_json::Value;

/// Adapter between the router and one schema library.
pub trait Validator: Send + Sync + 'static {
    /// The adapter's schema type.
    type Schema: Send + Sync + 'static;

    /// Return the message-type discriminator this schema describes.
    fn type_of<'a>(&self, schema: &'a Self::Schema) -> &'a str;

    /// Return the declared RPC response schema, if there is one.
    fn response_of<'a>(&self, schema: &'a Self::Schema) -> Option<&'a Self::Schema>;

    /// Check `frame` (a whole envelope) against `schema`.
    ///
    /// On success, returns the validated value.  Adapters may coerce or
    /// fill defaults, so the returned value is what handlers observe.
    fn safe_parse(&self, schema: &Self::Schema, frame: &Value) -> Result<Value, ValidationIssues>;
}

/// One problem found during validation.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
#[non_exhaustive]
pub struct ValidationIssue {
    /// Dotted path to the offending location (`"payload.id"`, `"type"`, …).
    pub path: String,
    /// Human-readable description.
    pub message: String,
}

impl ValidationIssue {
    /// Construct an issue at `path`.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// The set of problems that made a frame fail validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[non_exhaustive]
pub struct ValidationIssues {
    /// The individual issues, in discovery order.
    pub issues: Vec<ValidationIssue>,
}

impl ValidationIssues {
    /// A single-issue failure.
    pub fn single(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssues {
            issues: vec![ValidationIssue::new(path, message)],
        }
    }

    /// Render the issues as a JSON details value for an error payload.
    pub fn to_details(&self) -> Value {
        serde_json::json!({ "issues": self.issues })
    }
}

impl std::fmt::Display for ValidationIssues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.issues.is_empty() {
            return write!(f, "validation failed");
        }
        for (n, issue) in self.issues.iter().enumerate() {
            if n > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", issue.path, issue.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationIssues {}
