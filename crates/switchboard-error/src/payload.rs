//! The outbound error payload and its construction rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{sanitize_details, ErrorCode, RetryAfterRule};

/// The `retryAfterMs` hint on an error payload.
///
/// On the wire this is either a number of milliseconds or a literal `null`;
/// `null` means "retrying is impossible under current policy" and forces
/// `retryable` to `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum RetryAfterMs {
    /// Retrying will not help; serialized as `null`.
    Never,
    /// Retry after roughly this many milliseconds.
    After(u64),
}

impl Serialize for RetryAfterMs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RetryAfterMs::Never => serializer.serialize_none(),
            RetryAfterMs::After(ms) => serializer.serialize_u64(*ms),
        }
    }
}

/// Deserialize an *present* `retryAfterMs` field: `null` means [`RetryAfterMs::Never`].
fn deserialize_retry_after<'de, D>(deserializer: D) -> Result<Option<RetryAfterMs>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<u64>::deserialize(deserializer)?;
    Ok(Some(match raw {
        None => RetryAfterMs::Never,
        Some(ms) => RetryAfterMs::After(ms),
    }))
}

/// The body of an `ERROR` or `RPC_ERROR` envelope.
///
/// Construct these through [`ErrorPayload::builder`]; the builder applies the
/// retryability reconciliation rules and sanitizes `details`, so a payload
/// that exists is a payload that is legal to send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ErrorPayload {
    /// The canonical (or `APP_*`) code for this failure.
    pub code: ErrorCode,

    /// Optional human-readable explanation.  Not for programmatic use.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,

    /// Optional structured details, sanitized before transmission.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<Value>,

    /// Whether the caller may expect a retry of the same request to succeed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retryable: Option<bool>,

    /// When to retry, if the code permits the hint.
    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        deserialize_with = "deserialize_retry_after"
    )]
    pub retry_after_ms: Option<RetryAfterMs>,
}

impl ErrorPayload {
    /// Start building a payload for `code`.
    pub fn builder(code: ErrorCode) -> ErrorPayloadBuilder {
        ErrorPayloadBuilder {
            code,
            message: None,
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    /// Build a bare payload for `code` with all optional fields defaulted.
    pub fn new(code: ErrorCode) -> Self {
        Self::builder(code).build()
    }
}

/// Builder for [`ErrorPayload`].
///
/// [`build`](Self::build) cannot fail: inputs that violate per-code policy
/// are corrected (and logged) rather than rejected, since by the time an
/// error payload is being built there is already a failure to report.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ErrorPayloadBuilder {
    /// The code the payload will carry.
    code: ErrorCode,
    /// Optional message.
    message: Option<String>,
    /// Optional unsanitized details.
    details: Option<Value>,
    /// Explicit retryability, if the caller stated one.
    retryable: Option<bool>,
    /// Requested retry hint, if any.
    retry_after_ms: Option<RetryAfterMs>,
}

impl ErrorPayloadBuilder {
    /// Set the human-readable message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach structured details.  They will be sanitized in [`build`](Self::build).
    pub fn details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// State explicitly whether the operation is retryable.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    /// Request a `retryAfterMs` hint of `ms` milliseconds.
    pub fn retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(RetryAfterMs::After(ms));
        self
    }

    /// Mark retry as impossible under policy (`retryAfterMs: null`).
    pub fn retry_never(mut self) -> Self {
        self.retry_after_ms = Some(RetryAfterMs::Never);
        self
    }

    /// Apply the per-code policy and produce the payload.
    ///
    /// Rules, in order:
    /// 1. `retryAfterMs` on a code that forbids it is dropped.
    /// 2. A numeric `retryAfterMs` alongside an explicit `retryable: false`
    ///    is contradictory; the hint is dropped.
    /// 3. `retryAfterMs: null` forces `retryable: false`.
    /// 4. An explicit `retryable` otherwise wins.
    /// 5. A surviving numeric `retryAfterMs` implies `retryable: true`.
    /// 6. `INTERNAL` with no explicit decision fails safe to `false`.
    /// 7. Otherwise the code's default applies (transient codes: `true`;
    ///    all others: field omitted).
    pub fn build(self) -> ErrorPayload {
        let ErrorPayloadBuilder {
            code,
            message,
            details,
            retryable,
            mut retry_after_ms,
        } = self;

        if retry_after_ms.is_some() && code.retry_after_rule() == RetryAfterRule::Forbidden {
            warn!("Dropping retryAfterMs: not meaningful for {code}");
            retry_after_ms = None;
        }
        if matches!(retry_after_ms, Some(RetryAfterMs::After(_))) && retryable == Some(false) {
            warn!("Dropping numeric retryAfterMs on a non-retryable {code} payload");
            retry_after_ms = None;
        }

        let retryable = if matches!(retry_after_ms, Some(RetryAfterMs::Never)) {
            if retryable == Some(true) {
                warn!("retryAfterMs: null overrides explicit retryable=true on {code}");
            }
            Some(false)
        } else if let Some(explicit) = retryable {
            Some(explicit)
        } else if matches!(retry_after_ms, Some(RetryAfterMs::After(_))) {
            Some(true)
        } else if code == ErrorCode::Internal {
            warn!("INTERNAL error payload without an explicit retryable; defaulting to false");
            Some(false)
        } else {
            code.retryable_default()
        };

        let details = details.map(|d| sanitize_details(&d));

        ErrorPayload {
            code,
            message,
            details,
            retryable,
            retry_after_ms,
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

    #[test]
    fn transient_defaults_to_retryable() {
        let p = ErrorPayload::new(ErrorCode::Unavailable);
        assert_eq!(p.retryable, Some(true));
        assert_eq!(p.retry_after_ms, None);
    }

    #[test]
    fn terminal_codes_omit_retryable() {
        let p = ErrorPayload::new(ErrorCode::NotFound);
        assert_eq!(p.retryable, None);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json, json!({"code": "NOT_FOUND"}));
    }

    #[test]
    fn forbidden_retry_after_is_dropped() {
        let p = ErrorPayload::builder(ErrorCode::InvalidArgument)
            .retry_after_ms(250)
            .build();
        assert_eq!(p.retry_after_ms, None);
        assert_eq!(p.retryable, None);
    }

    #[test]
    fn numeric_retry_after_implies_retryable() {
        let p = ErrorPayload::builder(ErrorCode::ResourceExhausted)
            .retry_after_ms(100)
            .build();
        assert_eq!(p.retry_after_ms, Some(RetryAfterMs::After(100)));
        assert_eq!(p.retryable, Some(true));
    }

    #[test]
    fn null_retry_after_forces_non_retryable() {
        let p = ErrorPayload::builder(ErrorCode::Unavailable)
            .retryable(true)
            .retry_never()
            .build();
        assert_eq!(p.retry_after_ms, Some(RetryAfterMs::Never));
        assert_eq!(p.retryable, Some(false));
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["retryAfterMs"], Value::Null);
        assert_eq!(json["retryable"], json!(false));
    }

    #[test]
    fn contradictory_hint_is_dropped() {
        let p = ErrorPayload::builder(ErrorCode::Aborted)
            .retryable(false)
            .retry_after_ms(50)
            .build();
        assert_eq!(p.retry_after_ms, None);
        assert_eq!(p.retryable, Some(false));
    }

    #[test]
    fn internal_fails_safe() {
        let p = ErrorPayload::new(ErrorCode::Internal);
        assert_eq!(p.retryable, Some(false));

        let p = ErrorPayload::builder(ErrorCode::Internal).retryable(true).build();
        assert_eq!(p.retryable, Some(true));
    }

    #[test]
    fn details_are_sanitized_on_build() {
        let p = ErrorPayload::builder(ErrorCode::InvalidArgument)
            .message("bad")
            .details(json!({"email": "a@b", "password": "hunter2"}))
            .build();
        assert_eq!(p.details, Some(json!({"email": "a@b"})));
    }

    #[test]
    fn null_round_trips_through_the_wire_form() {
        let p = ErrorPayload::builder(ErrorCode::Unavailable).retry_never().build();
        let s = serde_json::to_string(&p).unwrap();
        let back: ErrorPayload = serde_json::from_str(&s).unwrap();
        assert_eq!(back.retry_after_ms, Some(RetryAfterMs::Never));
        assert_eq!(back, p);
    }
}
