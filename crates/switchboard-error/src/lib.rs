#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list @@
#![allow(renamed_and_removed_lints)]
#![allow(unknown_lints)]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
//! <!-- @@ end lint list @@ -->

use std::fmt::{self, Display};
use std::str::FromStr;

mod payload;
pub use payload::*;

mod sanitize;
pub use sanitize::*;

/// Classification of an error reported to a client of a Switchboard router.
///
/// Every error payload that leaves a router carries exactly one of these
/// codes.  The set of canonical codes is closed; applications may extend it
/// only through the `APP_*` namespace (see [`ErrorCode::app`]).
///
/// Clients are expected to drive retry behavior from the code together with
/// the `retryable`/`retryAfterMs` fields of the payload, not from the
/// human-readable message.
//
// Splitting vs lumping guidelines:
//
// Codes identify what the *caller* can do about a failure, not where in the
// router it was detected.  Two failure sites that call for the same caller
// response share a code; a new code is only warranted when a client could
// reasonably react differently to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    /// The connection has not authenticated, and the operation requires it.
    Unauthenticated,

    /// The connection is authenticated but not allowed to do this.
    PermissionDenied,

    /// The request payload failed validation, or a field had the wrong shape.
    InvalidArgument,

    /// The operation cannot run in the current system state.
    FailedPrecondition,

    /// The named entity does not exist.
    NotFound,

    /// The entity the request tried to create already exists.
    AlreadyExists,

    /// The operation was aborted, typically due to a concurrency conflict.
    ///
    /// Retrying after a short delay usually helps.
    Aborted,

    /// The operation's deadline expired before it completed.
    DeadlineExceeded,

    /// Some resource is exhausted: a rate limit, an inflight cap, a payload
    /// size limit, or outbound socket buffer space.
    ResourceExhausted,

    /// The service is currently unavailable; this is most likely transient.
    Unavailable,

    /// The operation is not implemented or not supported.
    Unimplemented,

    /// An internal invariant was broken: this is a bug in the server.
    ///
    /// Payload construction requires an explicit retryability decision for
    /// this code; when none is supplied it fails safe to non-retryable.
    Internal,

    /// The request was cancelled by the caller (or on its behalf).
    Cancelled,

    /// An application-defined code in the `APP_*` namespace.
    ///
    /// The stored string is the full wire form, including the `APP_` prefix.
    /// Construct these with [`ErrorCode::app`], which enforces the prefix.
    App(String),
}

/// The canonical codes, in wire order.
///
/// `APP_*` codes are open-ended and therefore not listed.
pub const CANONICAL_CODES: [ErrorCode; 13] = [
    ErrorCode::Unauthenticated,
    ErrorCode::PermissionDenied,
    ErrorCode::InvalidArgument,
    ErrorCode::FailedPrecondition,
    ErrorCode::NotFound,
    ErrorCode::AlreadyExists,
    ErrorCode::Aborted,
    ErrorCode::DeadlineExceeded,
    ErrorCode::ResourceExhausted,
    ErrorCode::Unavailable,
    ErrorCode::Unimplemented,
    ErrorCode::Internal,
    ErrorCode::Cancelled,
];

/// Whether a code permits the `retryAfterMs` hint on its payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum RetryAfterRule {
    /// `retryAfterMs` may appear on payloads with this code.
    Allowed,
    /// `retryAfterMs` is meaningless for this code and is dropped with a
    /// warning if supplied.
    Forbidden,
}

impl ErrorCode {
    /// Construct an application-defined code.
    ///
    /// `code` must be the full wire form: the `APP_` prefix followed by at
    /// least one character drawn from `[A-Z0-9_]`.
    pub fn app(code: impl Into<String>) -> Result<Self, BadAppCode> {
        let code = code.into();
        let Some(suffix) = code.strip_prefix("APP_") else {
            return Err(BadAppCode::MissingPrefix(code));
        };
        if suffix.is_empty()
            || !suffix
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(BadAppCode::BadSuffix(code));
        }
        Ok(ErrorCode::App(code))
    }

    /// Return the wire form of this code.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::App(code) => code.as_str(),
        }
    }

    /// Return the default value of the `retryable` field for this code, if
    /// the code implies one.
    ///
    /// Transient codes default to `Some(true)`.  `None` means the field is
    /// omitted unless the caller sets it explicitly.  [`ErrorCode::Internal`]
    /// returns `None` here but additionally *requires* an explicit decision;
    /// see [`ErrorPayloadBuilder::build`](crate::ErrorPayloadBuilder::build).
    pub fn retryable_default(&self) -> Option<bool> {
        match self {
            ErrorCode::Aborted
            | ErrorCode::DeadlineExceeded
            | ErrorCode::ResourceExhausted
            | ErrorCode::Unavailable => Some(true),
            _ => None,
        }
    }

    /// Return whether payloads with this code may carry `retryAfterMs`.
    pub fn retry_after_rule(&self) -> RetryAfterRule {
        match self {
            ErrorCode::Aborted
            | ErrorCode::DeadlineExceeded
            | ErrorCode::ResourceExhausted
            | ErrorCode::Unavailable
            | ErrorCode::Internal
            | ErrorCode::App(_) => RetryAfterRule::Allowed,
            _ => RetryAfterRule::Forbidden,
        }
    }

    /// Return true if this code is one of the transient codes that clients
    /// should expect to succeed on retry.
    pub fn is_transient(&self) -> bool {
        self.retryable_default() == Some(true)
    }

    /// Return true if this is an application-defined (`APP_*`) code.
    pub fn is_app(&self) -> bool {
        matches!(self, ErrorCode::App(_))
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = match s {
            "UNAUTHENTICATED" => ErrorCode::Unauthenticated,
            "PERMISSION_DENIED" => ErrorCode::PermissionDenied,
            "INVALID_ARGUMENT" => ErrorCode::InvalidArgument,
            "FAILED_PRECONDITION" => ErrorCode::FailedPrecondition,
            "NOT_FOUND" => ErrorCode::NotFound,
            "ALREADY_EXISTS" => ErrorCode::AlreadyExists,
            "ABORTED" => ErrorCode::Aborted,
            "DEADLINE_EXCEEDED" => ErrorCode::DeadlineExceeded,
            "RESOURCE_EXHAUSTED" => ErrorCode::ResourceExhausted,
            "UNAVAILABLE" => ErrorCode::Unavailable,
            "UNIMPLEMENTED" => ErrorCode::Unimplemented,
            "INTERNAL" => ErrorCode::Internal,
            "CANCELLED" => ErrorCode::Cancelled,
            other => {
                return ErrorCode::app(other).map_err(|_| UnknownCode(other.to_owned()));
            }
        };
        Ok(code)
    }
}

impl serde::Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A string did not name a canonical code or a well-formed `APP_*` code.
#[derive(Clone, Debug, thiserror::Error)]
#[error("Unrecognized error code: {0:?}")]
#[non_exhaustive]
pub struct UnknownCode(pub String);

/// An application code was rejected by [`ErrorCode::app`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BadAppCode {
    /// The code did not begin with `APP_`.
    #[error("Application code {0:?} does not begin with APP_")]
    MissingPrefix(String),

    /// The part after `APP_` was empty or contained a character outside
    /// `[A-Z0-9_]`.
    #[error("Application code {0:?} has a malformed suffix")]
    BadSuffix(String),
}
