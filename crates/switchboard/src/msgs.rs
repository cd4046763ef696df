//! Wire message types and inbound frame normalization.
//!
//! Every frame, inbound or outbound, is a single newline-free JSON object
//! `{"type": ..., "meta": {...}, "payload": ...}`.  Inbound text passes
//! through two stages here: [`RawFrame::parse`] (syntax and shape) and
//! [`RawFrame::normalize`] (meta normalization and the anti-spoofing strip of
//! server-reserved keys).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::FrameRejected;

/// Prefix reserved for control frames; user message types must not use it.
pub const RESERVED_PREFIX: &str = "$ws:";

/// Control frame a client sends to cancel a pending RPC.
pub const ABORT_MSG_TYPE: &str = "$ws:abort";

/// Control frame the server sends to stream RPC progress.
pub const PROGRESS_MSG_TYPE: &str = "$ws:rpc-progress";

/// Envelope type for errors outside an RPC exchange.
pub const ERROR_MSG_TYPE: &str = "ERROR";

/// Envelope type for errors that terminate an RPC exchange.
pub const RPC_ERROR_MSG_TYPE: &str = "RPC_ERROR";

/// Server-controlled meta keys, stripped from inbound frames before
/// validation and re-injected afterwards.
pub(crate) const SERVER_META_KEYS: [&str; 2] = ["clientId", "receivedAt"];

/// A stable identifier for one connection, assigned by the platform at
/// upgrade time.
#[derive(
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    derive_more::AsRef,
)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Construct a client id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A client-supplied string tying an RPC request to its reply, progress, and
/// error frames.
#[derive(
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    derive_more::AsRef,
)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Construct a correlation id from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh correlation id for an RPC request that arrived
    /// without one.
    pub(crate) fn synthesize() -> Self {
        use rand::Rng as _;
        let raw: u128 = rand::rng().random();
        Self(format!("{:032x}", raw))
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Deserialize an optional correlation id, mapping the empty string to
/// "absent" so that downstream code can rely on correlation ids being
/// non-empty.
fn deserialize_correlation<'de, D>(deserializer: D) -> Result<Option<CorrelationId>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(CorrelationId::from))
}

/// The `meta` member of an envelope.
///
/// Known keys are typed; anything else the client sent rides along in
/// `extra` and is preserved verbatim.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Meta {
    /// Correlation id for RPC exchanges.
    #[serde(
        skip_serializing_if = "Option::is_none",
        default,
        deserialize_with = "deserialize_correlation"
    )]
    pub correlation_id: Option<CorrelationId>,

    /// Client-requested RPC timeout, in milliseconds.  The server clamps it.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout_ms: Option<u64>,

    /// Sender-supplied wall-clock timestamp, in unix milliseconds.
    /// Server-generated on every outbound envelope.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<i64>,

    /// Client-supplied idempotency key; opaque to the router.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub idempotency_key: Option<String>,

    /// Server-reserved: the id of the connection a frame arrived on.
    /// Stripped from inbound frames before validation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub client_id: Option<ClientId>,

    /// Server-reserved: when the frame was received, in unix milliseconds.
    /// Stripped from inbound frames before validation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub received_at: Option<i64>,

    /// Any other keys the sender supplied.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Meta {
    /// A meta carrying only a server-generated timestamp.
    pub(crate) fn stamped() -> Self {
        Meta {
            timestamp: Some(now_ms()),
            ..Meta::default()
        }
    }

    /// A meta carrying a server timestamp and a correlation id.
    pub(crate) fn stamped_with_correlation(correlation_id: &CorrelationId) -> Self {
        Meta {
            correlation_id: Some(correlation_id.clone()),
            ..Meta::stamped()
        }
    }
}

/// An outbound envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Envelope {
    /// The routing discriminator.
    #[serde(rename = "type")]
    pub msg_type: String,

    /// Envelope metadata.
    #[serde(default)]
    pub meta: Meta,

    /// Optional payload.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Value>,
}

impl Envelope {
    /// Construct an envelope.
    pub fn new(msg_type: impl Into<String>, meta: Meta, payload: Option<Value>) -> Self {
        Envelope {
            msg_type: msg_type.into(),
            meta,
            payload,
        }
    }
}

/// The `$ws:rpc-progress` control frame.
///
/// Unlike ordinary envelopes, progress carries its value in a top-level
/// `data` member.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ProgressFrame {
    /// Always [`PROGRESS_MSG_TYPE`].
    #[serde(rename = "type")]
    pub msg_type: String,

    /// The progress value, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,

    /// Carries the server timestamp and the RPC's correlation id.
    pub meta: Meta,
}

impl ProgressFrame {
    /// Build a progress frame for the RPC identified by `correlation_id`.
    pub(crate) fn new(correlation_id: &CorrelationId, data: Option<Value>) -> Self {
        ProgressFrame {
            msg_type: PROGRESS_MSG_TYPE.to_owned(),
            data,
            meta: Meta::stamped_with_correlation(correlation_id),
        }
    }
}

/// Current wall-clock time in unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// A frame that parsed as a JSON object with a string `type`, but has not
/// yet been normalized.
///
/// Control-frame handling and first-message authentication observe the frame
/// in this state; everything downstream sees a [`NormalizedFrame`].
#[derive(Clone, Debug)]
pub(crate) struct RawFrame {
    /// The routing discriminator.
    pub(crate) msg_type: String,
    /// The whole frame.
    pub(crate) value: Value,
}

impl RawFrame {
    /// Parse `text` as a frame, enforcing the top-level shape.
    pub(crate) fn parse(text: &str) -> Result<Self, FrameRejected> {
        let value: Value = serde_json::from_str(text).map_err(|_| FrameRejected::InvalidJson)?;
        if !value.is_object() {
            return Err(FrameRejected::NotAnObject);
        }
        let msg_type = match value.get("type") {
            Some(Value::String(t)) => t.clone(),
            _ => return Err(FrameRejected::TypeMissing),
        };
        Ok(RawFrame { msg_type, value })
    }

    /// Return true if this is a reserved control frame.
    pub(crate) fn is_control(&self) -> bool {
        self.msg_type.starts_with(RESERVED_PREFIX)
    }

    /// Read the correlation id out of the raw, un-normalized meta, if there
    /// is a non-empty one.
    pub(crate) fn raw_correlation_id(&self) -> Option<CorrelationId> {
        self.value
            .get("meta")
            .and_then(|m| m.get("correlationId"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(CorrelationId::from)
    }

    /// Normalize the frame: synthesize an empty `meta` when absent, reject a
    /// non-object `meta`, and delete the server-reserved keys.
    ///
    /// Deleting (rather than overwriting) here is the anti-spoofing
    /// boundary: the server values are injected into the *validated* object
    /// later, never into raw input.
    pub(crate) fn normalize(self) -> Result<NormalizedFrame, FrameRejected> {
        let RawFrame { msg_type, mut value } = self;
        let obj = value
            .as_object_mut()
            .ok_or(FrameRejected::NotAnObject)?;

        let meta_value = obj
            .entry("meta".to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        let meta_obj = meta_value
            .as_object_mut()
            .ok_or(FrameRejected::MetaType)?;
        for key in SERVER_META_KEYS {
            meta_obj.remove(key);
        }

        let meta: Meta = serde_json::from_value(meta_value.clone())
            .map_err(|_| FrameRejected::MetaFieldType)?;

        Ok(NormalizedFrame {
            msg_type,
            meta,
            value,
        })
    }
}

/// A normalized inbound frame, ready for validation.
#[derive(Clone, Debug)]
pub(crate) struct NormalizedFrame {
    /// The routing discriminator.
    pub(crate) msg_type: String,
    /// Typed view of the normalized meta.
    pub(crate) meta: Meta,
    /// The whole normalized frame, as handed to the validator.
    pub(crate) value: Value,
}

/// Leniently scan raw frame text for a `"correlationId": "..."` pair.
///
/// Used only for frames that failed the size gate, so that the resulting
/// `RESOURCE_EXHAUSTED` can still be correlated by the caller.  The scan is
/// read-only and single-pass; it never attempts real JSON parsing, and it
/// gives up rather than guess when the text around a candidate key does not
/// look like a string value.
pub(crate) fn scan_correlation_id(text: &str) -> Option<CorrelationId> {
    const NEEDLE: &str = "\"correlationId\"";
    let mut searched = 0;
    while let Some(found) = text[searched..].find(NEEDLE) {
        let after_key = searched + found + NEEDLE.len();
        searched = after_key;
        let rest = text[after_key..].trim_start();
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let rest = rest.trim_start();
        let Some(rest) = rest.strip_prefix('"') else {
            continue;
        };
        let Some(end) = rest.find('"') else {
            continue;
        };
        let id = &rest[..end];
        if !id.is_empty() {
            return Some(CorrelationId::from(id));
        }
    }
    None
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

    /// Assert that parsing `$text` fails with the pattern `$pat`.
    macro_rules! expect_rejected {
        ($pat:pat, $text:expr) => {
            let err = RawFrame::parse($text)
                .and_then(RawFrame::normalize)
                .expect_err("frame unexpectedly accepted");
            assert!(matches!(err, $pat), "unexpected rejection {:?}", err);
        };
    }

    #[test]
    fn shape_violations() {
        expect_rejected!(FrameRejected::InvalidJson, "{nope");
        expect_rejected!(FrameRejected::NotAnObject, "[1,2,3]");
        expect_rejected!(FrameRejected::TypeMissing, r#"{"meta":{}}"#);
        expect_rejected!(FrameRejected::TypeMissing, r#"{"type":17}"#);
        expect_rejected!(FrameRejected::MetaType, r#"{"type":"T","meta":"hi"}"#);
        expect_rejected!(
            FrameRejected::MetaFieldType,
            r#"{"type":"T","meta":{"correlationId":42}}"#
        );
    }

    #[test]
    fn missing_meta_is_synthesized() {
        let frame = RawFrame::parse(r#"{"type":"T","payload":1}"#)
            .unwrap()
            .normalize()
            .unwrap();
        assert_eq!(frame.value["meta"], json!({}));
        assert_eq!(frame.meta, Meta::default());
    }

    #[test]
    fn server_reserved_keys_are_stripped() {
        let text = r#"{"type":"T","meta":{"clientId":"evil","receivedAt":1,"correlationId":"c"}}"#;
        let frame = RawFrame::parse(text).unwrap().normalize().unwrap();
        assert_eq!(frame.value["meta"], json!({"correlationId": "c"}));
        assert_eq!(frame.meta.client_id, None);
        assert_eq!(frame.meta.received_at, None);
        assert_eq!(frame.meta.correlation_id, Some(CorrelationId::from("c")));
    }

    #[test]
    fn empty_correlation_counts_as_absent() {
        let text = r#"{"type":"T","meta":{"correlationId":""}}"#;
        let frame = RawFrame::parse(text).unwrap().normalize().unwrap();
        assert_eq!(frame.meta.correlation_id, None);
    }

    #[test]
    fn extra_meta_keys_ride_along() {
        let text = r#"{"type":"T","meta":{"traceId":"t-1","timeoutMs":250}}"#;
        let frame = RawFrame::parse(text).unwrap().normalize().unwrap();
        assert_eq!(frame.meta.timeout_ms, Some(250));
        assert_eq!(frame.meta.extra["traceId"], json!("t-1"));
    }

    #[test]
    fn control_detection() {
        let frame = RawFrame::parse(r#"{"type":"$ws:abort","meta":{"correlationId":"c9"}}"#).unwrap();
        assert!(frame.is_control());
        assert_eq!(frame.raw_correlation_id(), Some(CorrelationId::from("c9")));
        assert!(!RawFrame::parse(r#"{"type":"Q"}"#).unwrap().is_control());
    }

    #[test]
    fn lenient_scan_finds_correlation() {
        assert_eq!(
            scan_correlation_id(r#"{"type":"Q","meta":{"correlationId": "c3","x":1}"#),
            Some(CorrelationId::from("c3"))
        );
        // Whitespace variations.
        assert_eq!(
            scan_correlation_id(r#""correlationId"  :  "c4""#),
            Some(CorrelationId::from("c4"))
        );
        // A non-string value is skipped, a later candidate can still match.
        assert_eq!(
            scan_correlation_id(r#""correlationId": 7, "correlationId": "c5""#),
            Some(CorrelationId::from("c5"))
        );
        assert_eq!(scan_correlation_id(r#"{"type":"Q"}"#), None);
        assert_eq!(scan_correlation_id(r#""correlationId": """#), None);
    }

    #[test]
    fn synthesized_ids_are_distinct() {
        let a = CorrelationId::synthesize();
        let b = CorrelationId::synthesize();
        assert_ne!(a, b);
        assert_eq!(a.as_ref().len(), 32);
    }

    #[test]
    fn envelope_wire_form() {
        let env = Envelope::new(
            "Answer",
            Meta::stamped_with_correlation(&CorrelationId::from("c1")),
            Some(json!({"ok": true})),
        );
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], json!("Answer"));
        assert_eq!(v["meta"]["correlationId"], json!("c1"));
        assert!(v["meta"]["timestamp"].is_i64());
        assert_eq!(v["payload"], json!({"ok": true}));
    }

    #[test]
    fn progress_wire_form() {
        let frame = ProgressFrame::new(&CorrelationId::from("c2"), Some(json!({"pct": 40})));
        let v = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["type"], json!(PROGRESS_MSG_TYPE));
        // Progress data is a top-level member, not a payload.
        assert_eq!(v["data"], json!({"pct": 40}));
        assert_eq!(v["meta"]["correlationId"], json!("c2"));
        assert_eq!(v.get("payload"), None);
    }
}
