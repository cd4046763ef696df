//! Topic broadcast: the pub/sub seam and the validate-before-publish
//! gateway.
//!
//! All broadcasting funnels through [`publish_with`], which validates the
//! envelope against its schema before anything reaches subscribers.  The
//! backend is pluggable; [`InProcessPubSub`] is a complete single-process
//! implementation with exact subscriber counting, and [`NullPubSub`] is the
//! backend of last resort for routers that never broadcast.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::BoxError;
use crate::msgs::{ClientId, Envelope, Meta};
use crate::transport::RawSocket;
use crate::validate::{ValidationIssues, Validator};

/// How precisely a backend could count the subscribers a publish reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum Delivery {
    /// The backend counted exactly this many subscribers.
    Exact(usize),
    /// The backend can only estimate.
    Estimate(usize),
    /// The backend cannot count subscribers at all.
    Unknown,
}

/// A topic fan-out backend.
pub trait PubSub: Send + Sync + 'static {
    /// Deliver `frame` (a serialized envelope) to every subscriber of
    /// `topic`.
    fn publish(&self, topic: &str, frame: &str) -> Result<Delivery, BoxError>;
}

/// Options for a publish call.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct PublishOptions {
    /// Reserved: skip the publishing connection.  Currently refused from
    /// every call site, so no caller can mistake it for a silent no-op.
    pub exclude_self: bool,
    /// Extra meta keys to carry on the broadcast envelope.
    pub meta: Map<String, Value>,
}

/// A publish was not delivered.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PublishError {
    /// The envelope failed validation; nothing reached subscribers.
    #[error("Broadcast payload failed validation")]
    Validation(#[source] ValidationIssues),

    /// `exclude_self` was requested, and no adapter supports it yet.
    #[error("excludeSelf is not supported by pub/sub adapters")]
    ExcludeSelfUnsupported,

    /// RPC request schemas cannot be broadcast; replies are unicast.
    #[error("RPC request schemas cannot be broadcast")]
    RpcSchema,

    /// The backend failed.
    #[error("Pub/sub backend failure")]
    Backend(#[source] BoxError),

    /// The router that owned this publish path has shut down.
    #[error("Router has shut down")]
    RouterShutdown,
}

/// The canonical publish path: build the envelope, validate it, delegate.
///
/// `clientId` is never injected into broadcast meta; a broadcast does not
/// belong to any one connection.
pub(crate) fn publish_with<V: Validator>(
    validator: &V,
    pubsub: &dyn PubSub,
    topic: &str,
    schema: &V::Schema,
    payload: Option<Value>,
    options: &PublishOptions,
) -> Result<Delivery, PublishError> {
    if options.exclude_self {
        return Err(PublishError::ExcludeSelfUnsupported);
    }
    if validator.response_of(schema).is_some() {
        return Err(PublishError::RpcSchema);
    }

    let mut meta = Meta::stamped();
    meta.extra = options.meta.clone();
    let envelope = Envelope::new(validator.type_of(schema), meta, payload);
    let value =
        serde_json::to_value(&envelope).map_err(|e| PublishError::Backend(Box::new(e)))?;
    let validated = validator
        .safe_parse(schema, &value)
        .map_err(PublishError::Validation)?;
    let frame =
        serde_json::to_string(&validated).map_err(|e| PublishError::Backend(Box::new(e)))?;

    pubsub.publish(topic, &frame).map_err(PublishError::Backend)
}

/// A single-process [`PubSub`] with exact subscriber counting.
///
/// Platforms whose sockets have no native pub/sub can point
/// [`RawSocket::subscribe`] at one of these.  Dead sockets are pruned
/// lazily.
#[derive(Default)]
pub struct InProcessPubSub {
    /// Topic name to subscribed sockets, by client id.
    topics: Mutex<HashMap<String, HashMap<ClientId, Weak<dyn RawSocket>>>>,
}

impl InProcessPubSub {
    /// Create an empty pub/sub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `socket` to `topic`.
    pub fn subscribe(&self, topic: &str, client_id: ClientId, socket: Weak<dyn RawSocket>) {
        let mut topics = self.topics.lock().expect("lock poisoned");
        topics
            .entry(topic.to_owned())
            .or_default()
            .insert(client_id, socket);
    }

    /// Detach `client_id` from `topic`.
    pub fn unsubscribe(&self, topic: &str, client_id: &ClientId) {
        let mut topics = self.topics.lock().expect("lock poisoned");
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(client_id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Detach `client_id` from every topic.
    pub fn drop_client(&self, client_id: &ClientId) {
        let mut topics = self.topics.lock().expect("lock poisoned");
        topics.retain(|_, subscribers| {
            subscribers.remove(client_id);
            !subscribers.is_empty()
        });
    }

    /// Count the live subscribers of `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let mut topics = self.topics.lock().expect("lock poisoned");
        match topics.get_mut(topic) {
            Some(subscribers) => {
                subscribers.retain(|_, socket| socket.strong_count() > 0);
                subscribers.len()
            }
            None => 0,
        }
    }
}

impl PubSub for InProcessPubSub {
    fn publish(&self, topic: &str, frame: &str) -> Result<Delivery, BoxError> {
        // Snapshot the subscriber list so sends happen outside the lock.
        let subscribers: Vec<(ClientId, Weak<dyn RawSocket>)> = {
            let topics = self.topics.lock().expect("lock poisoned");
            match topics.get(topic) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|(id, socket)| (id.clone(), Weak::clone(socket)))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut matched = 0;
        let mut dead = Vec::new();
        for (client_id, socket) in subscribers {
            match socket.upgrade() {
                Some(socket) => {
                    if let Err(e) = socket.send_text(frame) {
                        debug!("Dropping broadcast to {client_id}: {e}");
                    } else {
                        matched += 1;
                    }
                }
                None => dead.push(client_id),
            }
        }
        if !dead.is_empty() {
            let mut topics = self.topics.lock().expect("lock poisoned");
            if let Some(subscribers) = topics.get_mut(topic) {
                for client_id in dead {
                    subscribers.remove(&client_id);
                }
            }
        }
        Ok(Delivery::Exact(matched))
    }
}

/// A [`PubSub`] that delivers to nobody.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct NullPubSub;

impl PubSub for NullPubSub {
    fn publish(&self, _topic: &str, _frame: &str) -> Result<Delivery, BoxError> {
        Ok(Delivery::Unknown)
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
    use crate::testing::MockSocket;
    use crate::validate::native::{MessageSchema, NativeValidator};
    use serde_json::json;
    use std::sync::Arc;

    /// Register `socket` on `topic` directly (tests bypass the transport).
    fn attach(ps: &InProcessPubSub, topic: &str, socket: &Arc<MockSocket>) {
        let weak: Weak<dyn RawSocket> =
            Arc::downgrade(&(Arc::clone(socket) as Arc<dyn RawSocket>));
        ps.subscribe(topic, socket.client_id().clone(), weak);
    }

    #[test]
    fn publish_reaches_only_the_topic() {
        let ps = InProcessPubSub::new();
        let a = MockSocket::open("a");
        let b = MockSocket::open("b");
        attach(&ps, "news", &a);
        attach(&ps, "sports", &b);

        let schema = MessageSchema::event("Headline");
        let delivery = publish_with(
            &NativeValidator,
            &ps,
            "news",
            &schema,
            Some(json!({"text": "hi"})),
            &PublishOptions::default(),
        )
        .unwrap();

        assert_eq!(delivery, Delivery::Exact(1));
        assert_eq!(a.sent_frames().len(), 1);
        assert!(b.sent_frames().is_empty());
        let frame = &a.sent_frames()[0];
        assert_eq!(frame["type"], json!("Headline"));
        assert!(frame["meta"]["timestamp"].is_i64());
        assert_eq!(frame["meta"].get("clientId"), None);
    }

    #[test]
    fn validation_failures_never_reach_subscribers() {
        let ps = InProcessPubSub::new();
        let a = MockSocket::open("a");
        attach(&ps, "news", &a);

        #[derive(serde::Deserialize)]
        struct Headline {
            #[allow(dead_code)]
            text: String,
        }
        let schema = MessageSchema::event("Headline").with_payload::<Headline>();
        let err = publish_with(
            &NativeValidator,
            &ps,
            "news",
            &schema,
            Some(json!({"text": 7})),
            &PublishOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, PublishError::Validation(_)));
        assert!(a.sent_frames().is_empty());
    }

    #[test]
    fn exclude_self_is_refused() {
        let ps = InProcessPubSub::new();
        let schema = MessageSchema::event("Headline");
        let mut options = PublishOptions::default();
        options.exclude_self = true;
        let err = publish_with(&NativeValidator, &ps, "news", &schema, None, &options)
            .unwrap_err();
        assert!(matches!(err, PublishError::ExcludeSelfUnsupported));
    }

    #[test]
    fn rpc_request_schemas_are_refused() {
        let ps = InProcessPubSub::new();
        let schema = MessageSchema::rpc("Q", MessageSchema::event("R"));
        let err = publish_with(
            &NativeValidator,
            &ps,
            "news",
            &schema,
            None,
            &PublishOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PublishError::RpcSchema));
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let ps = InProcessPubSub::new();
        let a = MockSocket::open("a");
        attach(&ps, "news", &a);
        assert_eq!(ps.subscriber_count("news"), 1);
        drop(a);
        assert_eq!(ps.subscriber_count("news"), 0);
    }

    #[test]
    fn unsubscribe_and_drop_client() {
        let ps = InProcessPubSub::new();
        let a = MockSocket::open("a");
        attach(&ps, "news", &a);
        attach(&ps, "sports", &a);
        ps.unsubscribe("news", a.client_id());
        assert_eq!(ps.subscriber_count("news"), 0);
        assert_eq!(ps.subscriber_count("sports"), 1);
        ps.drop_client(a.client_id());
        assert_eq!(ps.subscriber_count("sports"), 0);
    }
}
