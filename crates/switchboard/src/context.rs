//! The per-frame context handed to middleware and handlers.
//!
//! A [`Context`] is short-lived: it belongs to exactly one dispatched frame
//! and is dropped when the handler finishes.  It holds a weak reference to
//! the router, so a context that outlives its router degrades into
//! [`SendError::RouterShutdown`] rather than keeping the router alive.
//!
//! RPC frames get an [`RpcContext`], which adds the reply/progress/
//! cancellation surface on top of everything [`Context`] offers.  All
//! outbound paths that could terminate the RPC go through the one-shot
//! guard in the RPC table.

use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use switchboard_error::{ErrorCode, ErrorPayload};

use crate::cancel::AbortSignal;
use crate::connection::Connection;
use crate::errors::{ErrorScope, SendError};
use crate::msgs::{ClientId, CorrelationId, Envelope, Meta, ProgressFrame};
use crate::pubsub::{Delivery, PublishError, PublishOptions};
use crate::router::RouterInner;
use crate::rpc::{CancelRegistration, RpcManager};
use crate::validate::{ValidationIssues, Validator};

/// RPC state shared by a context and its clones.
pub(crate) struct RpcShared {
    /// The request's correlation id (client-supplied or synthesized).
    pub(crate) correlation_id: CorrelationId,
    /// Absolute deadline for the request.
    pub(crate) deadline: Instant,
    /// Observes cancellation of this request.
    pub(crate) signal: AbortSignal,
    /// The RPC table, for one-shot checks and cancel registration.
    pub(crate) mgr: Arc<RpcManager>,
}

/// Interior of a [`Context`].
pub(crate) struct CtxInner<V: Validator> {
    /// The router that dispatched this frame.
    pub(crate) router: Weak<RouterInner<V>>,
    /// The connection the frame arrived on.
    pub(crate) conn: Arc<Connection>,
    /// The frame's message type.
    pub(crate) msg_type: String,
    /// Typed meta, with server keys injected.
    pub(crate) meta: Meta,
    /// The validated envelope, with server meta injected.
    pub(crate) frame: Value,
    /// RPC state, for RPC frames.
    pub(crate) rpc: Option<RpcShared>,
}

/// The context for one dispatched frame.
///
/// Middleware and event handlers receive these; RPC handlers receive an
/// [`RpcContext`] wrapping one.
pub struct Context<V: Validator> {
    /// Shared interior.
    inner: Arc<CtxInner<V>>,
}

impl<V: Validator> Clone for Context<V> {
    fn clone(&self) -> Self {
        Context {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Validator> Context<V> {
    /// Build a context.  (Router internals only.)
    pub(crate) fn new(inner: CtxInner<V>) -> Self {
        Context {
            inner: Arc::new(inner),
        }
    }

    /// Upgrade the router reference, or report shutdown.
    fn router(&self) -> Result<Arc<RouterInner<V>>, SendError> {
        self.inner.router.upgrade().ok_or(SendError::RouterShutdown)
    }

    /// The id of the connection this frame arrived on.
    pub fn client_id(&self) -> &ClientId {
        self.inner.conn.client_id()
    }

    /// The frame's message type.
    pub fn msg_type(&self) -> &str {
        &self.inner.msg_type
    }

    /// The frame's meta, with server keys (`clientId`, `receivedAt`)
    /// injected.
    pub fn meta(&self) -> &Meta {
        &self.inner.meta
    }

    /// The whole validated envelope.
    pub fn frame(&self) -> &Value {
        &self.inner.frame
    }

    /// The frame's payload, if it has one.
    pub fn payload(&self) -> Option<&Value> {
        self.inner.frame.get("payload")
    }

    /// True if this frame is an RPC request.
    pub fn is_rpc(&self) -> bool {
        self.inner.rpc.is_some()
    }

    /// The frame's correlation id, for RPC frames.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.inner.rpc.as_ref().map(|r| &r.correlation_id)
    }

    /// The RPC deadline, for RPC frames.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.rpc.as_ref().map(|r| r.deadline)
    }

    /// Time until the deadline, pinned to zero afterwards.  `None` for
    /// event frames, which have no deadline.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.inner
            .rpc
            .as_ref()
            .map(|r| r.deadline.saturating_duration_since(Instant::now()))
    }

    /// Merge `entries` into the connection's data bag.
    pub fn assign_data(&self, entries: Map<String, Value>) {
        self.inner.conn.assign_data(entries);
    }

    /// Read one key out of the connection's data bag.
    pub fn get_data(&self, key: &str) -> Option<Value> {
        self.inner.conn.get_data(key)
    }

    /// Attach this connection to `topic`.
    pub fn subscribe(&self, topic: &str) {
        self.inner.conn.socket().subscribe(topic);
    }

    /// Detach this connection from `topic`.
    pub fn unsubscribe(&self, topic: &str) {
        self.inner.conn.socket().unsubscribe(topic);
    }

    /// Broadcast through the router's pub/sub gateway.
    pub fn publish(
        &self,
        topic: &str,
        schema: &V::Schema,
        payload: Option<Value>,
        options: &PublishOptions,
    ) -> Result<Delivery, PublishError> {
        let router = self
            .inner
            .router
            .upgrade()
            .ok_or(PublishError::RouterShutdown)?;
        crate::pubsub::publish_with(
            &router.validator,
            router.pubsub.as_ref(),
            topic,
            schema,
            payload,
            options,
        )
    }

    /// Validate `payload` against `schema` and send the resulting envelope
    /// on this connection only.
    ///
    /// In an RPC context the send is one-shot-wrapped: once the RPC is
    /// terminal, further sends are suppressed.
    pub fn send(&self, schema: &V::Schema, payload: Option<Value>) -> Result<(), SendError> {
        let router = self.router()?;
        let envelope = Envelope::new(
            router.validator.type_of(schema),
            Meta::stamped(),
            payload,
        );
        let value = encode_value(&envelope)?;
        let validated = router.validator.safe_parse(schema, &value)?;

        if let Some(rpc) = &self.inner.rpc {
            if rpc.mgr.is_terminal(self.client_id(), &rpc.correlation_id) {
                debug!(
                    "Suppressing send after terminal RPC {}",
                    rpc.correlation_id
                );
                return Ok(());
            }
        }
        if self
            .inner
            .conn
            .should_backpressure(router.config.socket_buffer_limit_bytes)
        {
            warn!(
                "Sending {} to {} under backpressure",
                self.inner.msg_type,
                self.client_id()
            );
        }
        self.transmit(&validated)
    }

    /// Emit an error envelope: `RPC_ERROR` (terminal, one-shot-guarded) in
    /// an RPC context, `ERROR` otherwise.
    pub fn error(
        &self,
        code: ErrorCode,
        message: Option<&str>,
        details: Option<Value>,
    ) -> Result<(), SendError> {
        let mut builder = ErrorPayload::builder(code);
        if let Some(message) = message {
            builder = builder.message(message);
        }
        if let Some(details) = details {
            builder = builder.details(details);
        }
        self.send_error(builder.build())
    }

    /// As [`error`](Self::error), with full control over the payload.
    pub fn send_error(&self, payload: ErrorPayload) -> Result<(), SendError> {
        let router = self.router()?;
        match &self.inner.rpc {
            Some(rpc) => {
                if !rpc.mgr.mark_terminal(self.client_id(), &rpc.correlation_id) {
                    debug!(
                        "Suppressing error after terminal RPC {}",
                        rpc.correlation_id
                    );
                    return Ok(());
                }
                let scope = ErrorScope::Rpc(rpc.correlation_id.clone());
                router.send_error_on(&self.inner.conn, &scope, &payload)
            }
            None => router.send_error_on(&self.inner.conn, &ErrorScope::Oneway, &payload),
        }
    }

    /// Serialize and transmit `value` on this connection.
    pub(crate) fn transmit<T: serde::Serialize>(&self, value: &T) -> Result<(), SendError> {
        let text = serde_json::to_string(value)
            .map_err(|e| ValidationIssues::single("$", format!("could not encode frame: {e}")))?;
        self.inner.conn.send_text(&text).map_err(Into::into)
    }

    /// The RPC state, for router internals.
    pub(crate) fn rpc_shared(&self) -> Option<&RpcShared> {
        self.inner.rpc.as_ref()
    }
}

/// The context for one dispatched RPC request.
///
/// Dereferences to [`Context`], and adds the terminal-reply, progress, and
/// cancellation surface.
pub struct RpcContext<V: Validator> {
    /// The underlying context; its `rpc` state is always present.
    ctx: Context<V>,
}

impl<V: Validator> Clone for RpcContext<V> {
    fn clone(&self) -> Self {
        RpcContext {
            ctx: self.ctx.clone(),
        }
    }
}

impl<V: Validator> Deref for RpcContext<V> {
    type Target = Context<V>;

    fn deref(&self) -> &Context<V> {
        &self.ctx
    }
}

impl<V: Validator> RpcContext<V> {
    /// Wrap a context whose RPC state is present.  (Router internals only.)
    pub(crate) fn new(ctx: Context<V>) -> Self {
        debug_assert!(ctx.inner.rpc.is_some());
        RpcContext { ctx }
    }

    /// The RPC state.  Present by construction.
    fn shared(&self) -> &RpcShared {
        self.ctx
            .inner
            .rpc
            .as_ref()
            .expect("RpcContext without rpc state")
    }

    /// This request's correlation id.
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.shared().correlation_id
    }

    /// This request's absolute deadline.
    pub fn deadline(&self) -> Instant {
        self.shared().deadline
    }

    /// Time until the deadline, pinned to zero afterwards.
    pub fn time_remaining(&self) -> Duration {
        self.shared()
            .deadline
            .saturating_duration_since(Instant::now())
    }

    /// A signal that resolves if this request is cancelled.
    pub fn abort_signal(&self) -> AbortSignal {
        self.shared().signal.clone()
    }

    /// Register a cancel observer.
    ///
    /// Returns the registration for later removal; if the request is
    /// already over, `callback` runs immediately and `None` is returned.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) -> Option<CancelRegistration> {
        let rpc = self.shared();
        rpc.mgr
            .register_cancel(self.client_id(), &rpc.correlation_id, Box::new(callback))
    }

    /// Send the terminal reply for this request.
    ///
    /// Validates `payload` against the response `schema`; marks the RPC
    /// terminal; at most one terminal frame ever leaves.  Under
    /// backpressure the reply is not dropped: it is converted into a
    /// retryable `RESOURCE_EXHAUSTED` error.
    pub fn reply(&self, schema: &V::Schema, payload: Option<Value>) -> Result<(), SendError> {
        let rpc = self.shared();
        let router = self.ctx.router()?;

        let envelope = Envelope::new(
            router.validator.type_of(schema),
            Meta::stamped_with_correlation(&rpc.correlation_id),
            payload,
        );
        let value = encode_value(&envelope)?;
        let validated = router.validator.safe_parse(schema, &value)?;

        if rpc.mgr.is_terminal(self.client_id(), &rpc.correlation_id) {
            debug!("Suppressing reply after terminal RPC {}", rpc.correlation_id);
            return Ok(());
        }
        if self
            .ctx
            .inner
            .conn
            .should_backpressure(router.config.socket_buffer_limit_bytes)
        {
            warn!(
                "Backpressure on {}: converting reply into RESOURCE_EXHAUSTED",
                rpc.correlation_id
            );
            let payload = ErrorPayload::builder(ErrorCode::ResourceExhausted)
                .message("Socket backpressure")
                .retryable(true)
                .retry_after_ms(100)
                .build();
            return self.ctx.send_error(payload);
        }
        if !rpc.mgr.mark_terminal(self.client_id(), &rpc.correlation_id) {
            debug!("Suppressing reply after terminal RPC {}", rpc.correlation_id);
            return Ok(());
        }
        self.ctx.transmit(&validated)
    }

    /// Stream a non-terminal progress frame for this request.
    ///
    /// Progress after the terminal frame is dropped silently; progress
    /// under backpressure is dropped when the router is configured to
    /// do so (the default).
    pub fn progress(&self, data: Option<Value>) -> Result<(), SendError> {
        let rpc = self.shared();
        let router = self.ctx.router()?;

        if rpc.mgr.is_terminal(self.client_id(), &rpc.correlation_id) {
            debug!(
                "Dropping progress after terminal RPC {}",
                rpc.correlation_id
            );
            return Ok(());
        }
        if router.config.drop_progress_on_backpressure
            && self
                .ctx
                .inner
                .conn
                .should_backpressure(router.config.socket_buffer_limit_bytes)
        {
            debug!(
                "Dropping progress for {} under backpressure",
                rpc.correlation_id
            );
            return Ok(());
        }
        rpc.mgr
            .touch_progress(self.client_id(), &rpc.correlation_id);
        let frame = ProgressFrame::new(&rpc.correlation_id, data);
        self.ctx.transmit(&frame)
    }

    /// The underlying [`Context`], by value.
    pub fn into_context(self) -> Context<V> {
        self.ctx
    }
}

/// Serialize a value for validation.
fn encode_value<T: serde::Serialize>(value: &T) -> Result<Value, SendError> {
    serde_json::to_value(value)
        .map_err(|e| ValidationIssues::single("$", format!("could not encode frame: {e}")).into())
}
