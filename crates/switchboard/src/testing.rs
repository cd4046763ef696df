//! Test helpers: an in-memory [`RawSocket`] implementation.
//!
//! Used by this crate's own tests, and exported for embedders who want to
//! exercise their routers without a real WebSocket server.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::msgs::ClientId;
use crate::pubsub::InProcessPubSub;
use crate::transport::{CloseCode, RawSocket, ReadyState, TransportError};

/// An in-memory socket that records everything the router does to it.
///
/// Outbound frames accumulate in a buffer readable through
/// [`sent_frames`](Self::sent_frames); the reported
/// [`buffered_bytes`](RawSocket::buffered_bytes) level is set manually, so
/// tests can stage backpressure at will.  Attach an [`InProcessPubSub`] to
/// make `subscribe`/`unsubscribe` real.
pub struct MockSocket {
    /// Self-reference handed to the pub/sub on subscribe.
    me: Weak<MockSocket>,
    /// This socket's id.
    client_id: ClientId,
    /// Every frame sent, in order.
    sent: Mutex<Vec<String>>,
    /// The simulated outbound buffer level.
    buffered: AtomicUsize,
    /// Current socket state.
    state: Mutex<ReadyState>,
    /// The close call, if one happened.
    closed: Mutex<Option<(CloseCode, String)>>,
    /// Topics this socket is attached to.
    topics: Mutex<BTreeSet<String>>,
    /// Number of pings sent.
    pings: AtomicUsize,
    /// The pub/sub backing `subscribe`, if attached.
    pubsub: Mutex<Option<Arc<InProcessPubSub>>>,
}

impl MockSocket {
    /// Open a socket with the given client id.
    pub fn open(client_id: impl Into<ClientId>) -> Arc<Self> {
        Arc::new_cyclic(|me| MockSocket {
            me: me.clone(),
            client_id: client_id.into(),
            sent: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
            state: Mutex::new(ReadyState::Open),
            closed: Mutex::new(None),
            topics: Mutex::new(BTreeSet::new()),
            pings: AtomicUsize::new(0),
            pubsub: Mutex::new(None),
        })
    }

    /// Route this socket's subscriptions through `pubsub`.
    pub fn attach_pubsub(&self, pubsub: &Arc<InProcessPubSub>) {
        *self.pubsub.lock().expect("lock poisoned") = Some(Arc::clone(pubsub));
    }

    /// This socket's id.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Every sent frame, as raw text.
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().expect("lock poisoned").clone()
    }

    /// Every sent frame, parsed as JSON.
    pub fn sent_frames(&self) -> Vec<Value> {
        self.sent_texts()
            .iter()
            .map(|text| serde_json::from_str(text).expect("socket sent malformed json"))
            .collect()
    }

    /// The most recently sent frame, parsed as JSON.
    pub fn last_frame(&self) -> Option<Value> {
        self.sent_frames().pop()
    }

    /// Stage a simulated outbound buffer level.
    pub fn set_buffered_bytes(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    /// The close call this socket received, if any.
    pub fn closed_with(&self) -> Option<(CloseCode, String)> {
        self.closed.lock().expect("lock poisoned").clone()
    }

    /// How many pings this socket received.
    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// The topics this socket is attached to.
    pub fn topics(&self) -> Vec<String> {
        self.topics
            .lock()
            .expect("lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// This socket as a weak trait object, for pub/sub registration.
    fn weak_dyn(&self) -> Weak<dyn RawSocket> {
        self.me.clone()
    }
}

impl RawSocket for MockSocket {
    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    fn send_text(&self, frame: &str) -> Result<(), TransportError> {
        match self.ready_state() {
            ReadyState::Open => {
                self.sent.lock().expect("lock poisoned").push(frame.to_owned());
                Ok(())
            }
            ReadyState::Closing | ReadyState::Closed => Err(TransportError::Closed),
        }
    }

    fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock().expect("lock poisoned")
    }

    fn close(&self, code: CloseCode, reason: &str) {
        *self.state.lock().expect("lock poisoned") = ReadyState::Closed;
        let mut closed = self.closed.lock().expect("lock poisoned");
        if closed.is_none() {
            *closed = Some((code, reason.to_owned()));
        }
        if let Some(pubsub) = self.pubsub.lock().expect("lock poisoned").as_ref() {
            pubsub.drop_client(&self.client_id);
        }
        self.topics.lock().expect("lock poisoned").clear();
    }

    fn subscribe(&self, topic: &str) {
        self.topics
            .lock()
            .expect("lock poisoned")
            .insert(topic.to_owned());
        if let Some(pubsub) = self.pubsub.lock().expect("lock poisoned").as_ref() {
            pubsub.subscribe(topic, self.client_id.clone(), self.weak_dyn());
        }
    }

    fn unsubscribe(&self, topic: &str) {
        self.topics.lock().expect("lock poisoned").remove(topic);
        if let Some(pubsub) = self.pubsub.lock().expect("lock poisoned").as_ref() {
            pubsub.unsubscribe(topic, &self.client_id);
        }
    }

    fn ping(&self) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }
}
