//! The platform adapter: how the router talks to a real WebSocket.
//!
//! The router never names a concrete socket type.  A platform (or a test)
//! hands it objects implementing [`RawSocket`]; the router drives them and
//! queries their outbound buffer level for backpressure decisions.  Framing,
//! the HTTP upgrade, and TLS all live on the platform's side of this trait.

use std::io::Error as IoError;
use std::sync::Arc;

use caret::caret_int;

use crate::msgs::ClientId;

caret_int! {
    /// A WebSocket close code.
    ///
    /// Any `u16` is representable; these are the values the router itself
    /// uses.
    pub struct CloseCode(u16) {
        /// Normal closure.
        NORMAL = 1000,
        /// Policy violation; used for authentication and authorization
        /// failures.
        POLICY_VIOLATION = 1008,
        /// Frame exceeded the configured size limit.
        MESSAGE_TOO_BIG = 1009,
        /// The connection showed no signs of life within the heartbeat
        /// window.
        HEARTBEAT_TIMEOUT = 4000,
    }
}

/// The state of the underlying socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum ReadyState {
    /// The socket is open and accepting frames.
    Open,
    /// A close has been initiated but not completed.
    Closing,
    /// The socket is closed.
    Closed,
}

/// The transport could not accept an outbound frame.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The socket is closing or closed.
    #[error("Connection is closed")]
    Closed,

    /// The platform reported a write failure.
    #[error("Could not write to connection")]
    WriteFailed(#[source] Arc<IoError>),
}

/// One WebSocket connection, as the platform exposes it to the router.
///
/// `send_text` is expected to enqueue rather than block; the router reads
/// [`buffered_bytes`](Self::buffered_bytes) to notice when a peer is not
/// draining its queue.  Topic subscription state is owned by the platform;
/// the router only ever delegates to it.
pub trait RawSocket: Send + Sync + 'static {
    /// The stable id assigned to this connection at upgrade time.
    fn client_id(&self) -> &ClientId;

    /// Enqueue a single UTF-8 text frame.
    fn send_text(&self, frame: &str) -> Result<(), TransportError>;

    /// Bytes currently queued for this connection but not yet written.
    fn buffered_bytes(&self) -> usize;

    /// Current socket state.
    fn ready_state(&self) -> ReadyState;

    /// Close the connection.
    fn close(&self, code: CloseCode, reason: &str);

    /// Attach this connection to `topic`.
    fn subscribe(&self, topic: &str);

    /// Detach this connection from `topic`.
    fn unsubscribe(&self, topic: &str);

    /// Send a transport-level ping, if the platform supports one.
    ///
    /// The default implementation does nothing; heartbeat staleness is then
    /// driven purely by inbound frames as proof of life.
    fn ping(&self) {}
}
