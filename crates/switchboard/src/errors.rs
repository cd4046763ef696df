//! Error types used by the router, and canonical error envelope
//! construction.

use serde_json::Value;

use switchboard_error::ErrorPayload;

use crate::msgs::{CorrelationId, Meta, ERROR_MSG_TYPE, RPC_ERROR_MSG_TYPE};
use crate::transport::TransportError;
use crate::validate::ValidationIssues;

/// A type-erased error from application code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why an inbound frame was rejected before dispatch.
///
/// All of these are silent-drop conditions: the frame is discarded and the
/// rejection logged, but nothing is reported to the client.  (Size-gate
/// failures are reported, and are handled before parsing ever starts.)
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub(crate) enum FrameRejected {
    /// The frame was not well-formed JSON.
    #[error("Frame was not well-formed json")]
    InvalidJson,

    /// The frame was JSON, but not a JSON object.
    #[error("Frame was not a json object")]
    NotAnObject,

    /// The `type` field was missing or not a string.
    #[error("Frame had no string `type` field")]
    TypeMissing,

    /// The `meta` field was present but not a JSON object.
    #[error("Frame `meta` field was not a json object")]
    MetaType,

    /// A known `meta` field had the wrong type.
    #[error("Frame `meta` fields had unexpected types")]
    MetaFieldType,
}

/// Whether an error envelope belongs to an RPC exchange.
///
/// The [`Rpc`](ErrorScope::Rpc) variant carries the correlation id, so an
/// `RPC_ERROR` without a correlation is unrepresentable.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorScope {
    /// The error is not tied to a request; sent as `ERROR`.
    Oneway,
    /// The error terminates the RPC with this correlation id; sent as
    /// `RPC_ERROR`.
    Rpc(CorrelationId),
}

impl ErrorScope {
    /// The envelope type this scope produces.
    pub fn envelope_type(&self) -> &'static str {
        match self {
            ErrorScope::Oneway => ERROR_MSG_TYPE,
            ErrorScope::Rpc(_) => RPC_ERROR_MSG_TYPE,
        }
    }

    /// The correlation id, for RPC-scoped errors.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            ErrorScope::Oneway => None,
            ErrorScope::Rpc(c) => Some(c),
        }
    }
}

/// Build the wire form of an error envelope.
///
/// The meta timestamp is always server-generated; the correlation id is
/// present iff the scope is RPC.
pub(crate) fn error_frame(scope: &ErrorScope, payload: &ErrorPayload) -> Value {
    let meta = match scope {
        ErrorScope::Oneway => Meta::stamped(),
        ErrorScope::Rpc(correlation_id) => Meta::stamped_with_correlation(correlation_id),
    };
    serde_json::json!({
        "type": scope.envelope_type(),
        "meta": meta,
        "payload": payload,
    })
}

/// A handler registration was rejected.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegisterError {
    /// The message type begins with the reserved `$ws:` prefix.
    #[error("Message type {0:?} uses the reserved \"$ws:\" prefix")]
    ReservedPrefix(String),

    /// An event registration was attempted with an RPC request schema.
    #[error("Schema for {0:?} declares a response; register it with rpc()")]
    HasResponse(String),

    /// An RPC registration was attempted with a schema that has no response.
    #[error("RPC schema for {0:?} does not declare a response")]
    MissingResponse(String),
}

/// An outbound send failed.
///
/// Note that one-shot suppression and configured progress drops are *not*
/// errors: those sends report success and do nothing.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SendError {
    /// The outbound envelope failed validation against its schema.
    #[error("Outbound message failed validation")]
    Validation(#[from] ValidationIssues),

    /// The transport could not accept the frame.
    #[error("Could not write to the connection")]
    Transport(#[from] TransportError),

    /// The router that owned this context has shut down.
    #[error("Router has shut down")]
    RouterShutdown,
}

/// A failure reported by an authentication handler.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The connection has not presented acceptable credentials.
    #[error("Connection is not authenticated: {0}")]
    Unauthenticated(String),

    /// The connection is authenticated but not allowed to do this.
    #[error("Operation not permitted: {0}")]
    PermissionDenied(String),
}

impl AuthError {
    /// The wire code this failure maps to.
    pub fn code(&self) -> switchboard_error::ErrorCode {
        match self {
            AuthError::Unauthenticated(_) => switchboard_error::ErrorCode::Unauthenticated,
            AuthError::PermissionDenied(_) => switchboard_error::ErrorCode::PermissionDenied,
        }
    }
}

/// What an error hook wants done with a handler failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum ErrorVerdict {
    /// Let the router emit its automatic `INTERNAL` envelope (the default).
    #[default]
    Emit,
    /// The hook handled the failure; suppress the automatic envelope.
    Suppress,
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
    use switchboard_error::ErrorCode;

    #[test]
    fn oneway_scope_builds_error() {
        let payload = ErrorPayload::new(ErrorCode::NotFound);
        let frame = error_frame(&ErrorScope::Oneway, &payload);
        assert_eq!(frame["type"], json!("ERROR"));
        assert!(frame["meta"]["timestamp"].is_i64());
        assert_eq!(frame["meta"].get("correlationId"), None);
        assert_eq!(frame["payload"]["code"], json!("NOT_FOUND"));
    }

    #[test]
    fn rpc_scope_always_carries_correlation() {
        let payload = ErrorPayload::builder(ErrorCode::ResourceExhausted)
            .retry_after_ms(100)
            .build();
        let scope = ErrorScope::Rpc(CorrelationId::from("c1"));
        let frame = error_frame(&scope, &payload);
        assert_eq!(frame["type"], json!("RPC_ERROR"));
        assert_eq!(frame["meta"]["correlationId"], json!("c1"));
        assert_eq!(frame["payload"]["retryable"], json!(true));
        assert_eq!(frame["payload"]["retryAfterMs"], json!(100));
    }
}
