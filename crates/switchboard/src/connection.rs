//! Per-connection state owned by the router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
// Tokio's `Instant` rather than std's, so heartbeat tests can drive the
// clock with `tokio::time::pause`.
use tokio::time::Instant;

use crate::heartbeat::HeartbeatHandle;
use crate::msgs::ClientId;
use crate::transport::{CloseCode, RawSocket, ReadyState, TransportError};

/// Everything the router tracks about one open connection.
///
/// The socket itself stays behind the [`RawSocket`] trait; topic
/// subscription state lives on the transport side of that trait and is never
/// mirrored here.
pub(crate) struct Connection {
    /// The connection's stable id, copied out of the socket at open.
    client_id: ClientId,
    /// The platform socket.
    socket: Arc<dyn RawSocket>,
    /// The opaque per-connection key/value bag.
    data: Mutex<Map<String, Value>>,
    /// Whether first-message authentication has succeeded.
    ///
    /// Connections on routers with no auth hooks start authenticated.
    authenticated: AtomicBool,
    /// When we last saw any inbound frame (the heartbeat's proof of life).
    last_seen: Mutex<Instant>,
    /// The heartbeat task, when heartbeats are enabled.
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl Connection {
    /// Track a newly-opened socket.
    pub(crate) fn new(socket: Arc<dyn RawSocket>, authenticated: bool) -> Arc<Self> {
        Arc::new(Connection {
            client_id: socket.client_id().clone(),
            socket,
            data: Mutex::new(Map::new()),
            authenticated: AtomicBool::new(authenticated),
            last_seen: Mutex::new(Instant::now()),
            heartbeat: Mutex::new(None),
        })
    }

    /// The connection's id.
    pub(crate) fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The platform socket.
    pub(crate) fn socket(&self) -> &Arc<dyn RawSocket> {
        &self.socket
    }

    /// Note proof of life from an inbound frame.
    pub(crate) fn mark_seen(&self) {
        *self.last_seen.lock().expect("lock poisoned") = Instant::now();
    }

    /// Time since the last inbound frame.
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_seen.lock().expect("lock poisoned").elapsed()
    }

    /// Whether first-message auth has succeeded.
    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// Flip the authenticated flag.
    pub(crate) fn set_authenticated(&self) {
        self.authenticated.store(true, Ordering::Relaxed);
    }

    /// Merge `entries` into the connection's data bag.
    pub(crate) fn assign_data(&self, entries: Map<String, Value>) {
        let mut data = self.data.lock().expect("lock poisoned");
        for (key, value) in entries {
            data.insert(key, value);
        }
    }

    /// Read one key out of the data bag.
    pub(crate) fn get_data(&self, key: &str) -> Option<Value> {
        self.data.lock().expect("lock poisoned").get(key).cloned()
    }

    /// True when the outbound buffer is over `limit`.
    pub(crate) fn should_backpressure(&self, limit: usize) -> bool {
        self.socket.buffered_bytes() > limit
    }

    /// Send a text frame, refusing if the socket is no longer open.
    pub(crate) fn send_text(&self, frame: &str) -> Result<(), TransportError> {
        match self.socket.ready_state() {
            ReadyState::Open => self.socket.send_text(frame),
            ReadyState::Closing | ReadyState::Closed => Err(TransportError::Closed),
        }
    }

    /// Install the heartbeat task for this connection.
    pub(crate) fn set_heartbeat(&self, handle: HeartbeatHandle) {
        *self.heartbeat.lock().expect("lock poisoned") = Some(handle);
    }

    /// Stop the heartbeat task, if one is running.
    pub(crate) fn stop_heartbeat(&self) {
        self.heartbeat.lock().expect("lock poisoned").take();
    }
}

/// A connection as lifecycle hooks see it.
///
/// Cheap to clone; read the id and data bag, drive subscriptions, or close
/// the connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    /// The underlying connection.
    conn: Arc<Connection>,
}

impl ConnectionHandle {
    /// Wrap a connection.
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        ConnectionHandle { conn }
    }

    /// The connection's id.
    pub fn client_id(&self) -> &ClientId {
        self.conn.client_id()
    }

    /// Whether first-message auth has succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.conn.is_authenticated()
    }

    /// Merge `entries` into the connection's data bag.
    pub fn assign_data(&self, entries: Map<String, Value>) {
        self.conn.assign_data(entries);
    }

    /// Read one key out of the data bag.
    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.conn.get_data(key)
    }

    /// Attach the connection to `topic`.
    pub fn subscribe(&self, topic: &str) {
        self.conn.socket().subscribe(topic);
    }

    /// Detach the connection from `topic`.
    pub fn unsubscribe(&self, topic: &str) {
        self.conn.socket().unsubscribe(topic);
    }

    /// Close the connection.
    pub fn close(&self, code: CloseCode, reason: &str) {
        self.conn.socket().close(code, reason);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("client_id", self.conn.client_id())
            .finish()
    }
}
