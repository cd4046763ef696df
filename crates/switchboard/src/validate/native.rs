//! The built-in validator adapter.
//!
//! Schemas here are plain descriptor values: a message type, an optional
//! payload shape, and (for RPC request schemas) a response schema.  Payload
//! shapes are ordinary serde deserializations (a payload is valid iff it
//! deserializes as the declared Rust type) or custom check functions.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{ValidationIssues, Validator};

/// A payload check: either a typed deserialization or a custom function.
type PayloadCheck = Arc<dyn Fn(&Value) -> Result<(), ValidationIssues> + Send + Sync>;

/// A schema descriptor for the [`NativeValidator`].
#[derive(Clone)]
pub struct MessageSchema {
    /// The message type this schema describes.
    msg_type: String,
    /// Payload shape, if the message declares one.  A schema without a
    /// shape accepts any payload, including none.
    payload: Option<PayloadCheck>,
    /// Whether a declared payload is required to be present.
    payload_required: bool,
    /// For RPC request schemas, the response schema.
    response: Option<Box<MessageSchema>>,
}

impl MessageSchema {
    /// Describe an event (or response) message with type `msg_type`.
    pub fn event(msg_type: impl Into<String>) -> Self {
        MessageSchema {
            msg_type: msg_type.into(),
            payload: None,
            payload_required: false,
            response: None,
        }
    }

    /// Describe an RPC request message with type `msg_type` whose replies
    /// use `response`.
    pub fn rpc(msg_type: impl Into<String>, response: MessageSchema) -> Self {
        MessageSchema {
            response: Some(Box::new(response)),
            ..MessageSchema::event(msg_type)
        }
    }

    /// Require a payload that deserializes as `T`.
    pub fn with_payload<T: DeserializeOwned + 'static>(mut self) -> Self {
        self.payload = Some(Arc::new(|value: &Value| {
            serde_json::from_value::<T>(value.clone())
                .map(|_| ())
                .map_err(|e| ValidationIssues::single("payload", e.to_string()))
        }));
        self.payload_required = true;
        self
    }

    /// Require a payload accepted by `check`.
    pub fn with_payload_check(
        mut self,
        check: impl Fn(&Value) -> Result<(), ValidationIssues> + Send + Sync + 'static,
    ) -> Self {
        self.payload = Some(Arc::new(check));
        self.payload_required = true;
        self
    }

    /// The message type this schema describes.
    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    /// The response schema, if this is an RPC request schema.
    pub fn response(&self) -> Option<&MessageSchema> {
        self.response.as_deref()
    }
}

impl fmt::Debug for MessageSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSchema")
            .field("msg_type", &self.msg_type)
            .field("has_payload", &self.payload.is_some())
            .field("response", &self.response)
            .finish()
    }
}

/// The built-in [`Validator`] over [`MessageSchema`] descriptors.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct NativeValidator;

impl Validator for NativeValidator {
    type Schema = MessageSchema;

    fn type_of<'a>(&self, schema: &'a MessageSchema) -> &'a str {
        &schema.msg_type
    }

    fn response_of<'a>(&self, schema: &'a MessageSchema) -> Option<&'a MessageSchema> {
        schema.response.as_deref()
    }

    fn safe_parse(&self, schema: &MessageSchema, frame: &Value) -> Result<Value, ValidationIssues> {
        let mut issues = ValidationIssues::default();

        let Some(obj) = frame.as_object() else {
            return Err(ValidationIssues::single("$", "frame is not an object"));
        };
        match obj.get("type").and_then(Value::as_str) {
            Some(t) if t == schema.msg_type => {}
            Some(t) => issues.issues.push(super::ValidationIssue::new(
                "type",
                format!("expected {:?}, got {:?}", schema.msg_type, t),
            )),
            None => issues
                .issues
                .push(super::ValidationIssue::new("type", "missing or not a string")),
        }
        if let Some(meta) = obj.get("meta") {
            if !meta.is_object() {
                issues
                    .issues
                    .push(super::ValidationIssue::new("meta", "not an object"));
            }
        }

        match (obj.get("payload"), &schema.payload) {
            (Some(payload), Some(check)) => {
                if let Err(e) = check(payload) {
                    issues.issues.extend(e.issues);
                }
            }
            (None, Some(_)) if schema.payload_required => {
                issues
                    .issues
                    .push(super::ValidationIssue::new("payload", "required"));
            }
            _ => {}
        }

        if issues.issues.is_empty() {
            Ok(frame.clone())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list @@ -->
    use super::*;
    use serde_json::json;

    #[derive(serde::Deserialize)]
    struct Question {
        #[allow(dead_code)]
        id: u64,
    }

    #[test]
    fn accepts_matching_frames() {
        let schema = MessageSchema::event("Q").with_payload::<Question>();
        let frame = json!({"type": "Q", "meta": {}, "payload": {"id": 3}});
        let validated = NativeValidator.safe_parse(&schema, &frame).unwrap();
        assert_eq!(validated, frame);
    }

    #[test]
    fn rejects_type_mismatch() {
        let schema = MessageSchema::event("Q");
        let err = NativeValidator
            .safe_parse(&schema, &json!({"type": "R", "meta": {}}))
            .unwrap_err();
        assert_eq!(err.issues[0].path, "type");
    }

    #[test]
    fn rejects_bad_payload() {
        let schema = MessageSchema::event("Q").with_payload::<Question>();
        let err = NativeValidator
            .safe_parse(&schema, &json!({"type": "Q", "meta": {}, "payload": {"id": "x"}}))
            .unwrap_err();
        assert_eq!(err.issues[0].path, "payload");

        let err = NativeValidator
            .safe_parse(&schema, &json!({"type": "Q", "meta": {}}))
            .unwrap_err();
        assert_eq!(err.issues[0].message, "required");
    }

    #[test]
    fn schema_without_shape_accepts_anything() {
        let schema = MessageSchema::event("Free");
        for payload in [json!(null), json!(42), json!({"a": [1, 2]})] {
            let frame = json!({"type": "Free", "meta": {}, "payload": payload});
            assert!(NativeValidator.safe_parse(&schema, &frame).is_ok());
        }
    }

    #[test]
    fn custom_checks_run() {
        let schema = MessageSchema::event("N").with_payload_check(|v| {
            if v.as_i64().is_some_and(|n| n > 0) {
                Ok(())
            } else {
                Err(ValidationIssues::single("payload", "must be a positive integer"))
            }
        });
        assert!(NativeValidator
            .safe_parse(&schema, &json!({"type": "N", "meta": {}, "payload": 3}))
            .is_ok());
        assert!(NativeValidator
            .safe_parse(&schema, &json!({"type": "N", "meta": {}, "payload": -1}))
            .is_err());
    }

    #[test]
    fn response_descriptor_round_trip() {
        let schema = MessageSchema::rpc("Q", MessageSchema::event("R"));
        assert_eq!(NativeValidator.type_of(&schema), "Q");
        assert_eq!(
            NativeValidator.response_of(&schema).map(|s| s.msg_type()),
            Some("R")
        );
        assert!(NativeValidator
            .response_of(&MessageSchema::event("E"))
            .is_none());
    }
}
