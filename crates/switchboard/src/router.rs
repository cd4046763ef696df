//! The router core: handler registry, lifecycle hooks, and the message
//! pipeline.
//!
//! A [`Router`] owns everything scoped to its lifetime: the route table,
//! middleware, lifecycle hooks, the connection set, and the RPC table.  The
//! platform drives it through three callbacks ([`open`](Router::open),
//! [`message`](Router::message), [`close`](Router::close)); everything
//! else happens inside.
//!
//! Inbound processing is strictly ordered per connection up to the moment a
//! handler starts: admission, normalization, validation, and RPC admission
//! all run inside [`message`](Router::message).  The middleware chain and
//! handler then run on a spawned task, so a slow handler never blocks the
//! connection's other frames.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt as _;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use switchboard_error::{ErrorCode, ErrorPayload};

use crate::connection::{Connection, ConnectionHandle};
use crate::context::{Context, CtxInner, RpcShared};
use crate::errors::{
    error_frame, AuthError, BoxError, ErrorScope, ErrorVerdict, RegisterError, SendError,
};
use crate::heartbeat::{self, StaleAction};
use crate::middleware::{
    BoxFut, EventHandlerFn, HandlerResult, MiddlewareFn, Next, RouteHandler, RpcHandlerFn,
};
use crate::msgs::{
    now_ms, scan_correlation_id, ClientId, CorrelationId, RawFrame, ABORT_MSG_TYPE,
    RESERVED_PREFIX,
};
use crate::pubsub::{Delivery, PubSub, PublishError, PublishOptions};
use crate::rpc::{AdmitOutcome, RpcManager, SweepReason};
use crate::transport::{CloseCode, RawSocket};
use crate::validate::{ValidationIssues, Validator};
use crate::RouterConfig;

/// An erased `on_open` hook.
type OpenHookFn = dyn Fn(ConnectionHandle) -> BoxFut<()> + Send + Sync;
/// An erased `on_close` hook.
type CloseHookFn = dyn Fn(CloseEvent) -> BoxFut<()> + Send + Sync;
/// An erased `on_auth` hook.
type AuthHookFn = dyn Fn(AuthRequest) -> BoxFut<Result<(), AuthError>> + Send + Sync;
/// An erased `on_error` hook.
type ErrorHookFn = dyn Fn(HandlerFailure) -> BoxFut<ErrorVerdict> + Send + Sync;
/// An erased `on_limit_exceeded` hook.
type LimitHookFn = dyn Fn(LimitExceeded) -> BoxFut<()> + Send + Sync;
/// An erased `on_stale` hook.
type StaleHookFn = dyn Fn(ConnectionHandle) -> BoxFut<()> + Send + Sync;

/// What `on_close` hooks observe.
#[derive(Clone)]
#[non_exhaustive]
pub struct CloseEvent {
    /// The closed connection.  Its data bag is still readable.
    pub handle: ConnectionHandle,
    /// The close code.
    pub code: CloseCode,
    /// The close reason, if the platform reported one.
    pub reason: Option<String>,
}

/// What `on_auth` hooks observe: the connection and its first message,
/// before normalization.
#[derive(Clone)]
#[non_exhaustive]
pub struct AuthRequest {
    /// The connection being authenticated.
    pub handle: ConnectionHandle,
    /// The first message's type.
    pub msg_type: String,
    /// The first message, exactly as it arrived.
    pub frame: Value,
}

/// What `on_error` hooks observe when a handler fails.
#[derive(Clone)]
#[non_exhaustive]
pub struct HandlerFailure {
    /// Connection the frame arrived on.
    pub client_id: ClientId,
    /// The frame's message type.
    pub msg_type: String,
    /// The RPC correlation id, when the failing handler was an RPC handler.
    pub correlation_id: Option<CorrelationId>,
    /// The error the handler returned (or the panic it unwound with).
    pub error: Arc<BoxError>,
}

/// What `on_limit_exceeded` hooks observe for oversize frames.
#[derive(Clone)]
#[non_exhaustive]
pub struct LimitExceeded {
    /// The connection that sent the frame.
    pub handle: ConnectionHandle,
    /// Size of the rejected frame, in bytes.
    pub frame_bytes: usize,
    /// Correlation id recovered by the lenient scan, if any.
    pub correlation_id: Option<CorrelationId>,
}

/// The kind of a registered handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum HandlerKind {
    /// Registered with [`Router::on`].
    Event,
    /// Registered with [`Router::rpc`].
    Rpc,
}

/// One row of [`Router::routes`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct RouteInfo {
    /// The registered message type.
    pub msg_type: String,
    /// What kind of handler serves it.
    pub kind: HandlerKind,
}

/// One entry in the route table.
struct RouteEntry<V: Validator> {
    /// The schema the entry was registered with.
    schema: Arc<V::Schema>,
    /// The handler.
    handler: RouteHandler<V>,
}

impl<V: Validator> Clone for RouteEntry<V> {
    fn clone(&self) -> Self {
        RouteEntry {
            schema: Arc::clone(&self.schema),
            handler: self.handler.clone(),
        }
    }
}

/// Shared state behind every clone of a [`Router`].
pub(crate) struct RouterInner<V: Validator> {
    /// The validator adapter this router is bound to.
    pub(crate) validator: V,
    /// The router's configuration.
    pub(crate) config: RouterConfig,
    /// The pub/sub backend.
    pub(crate) pubsub: Arc<dyn PubSub>,
    /// The route table.
    routes: RwLock<HashMap<String, RouteEntry<V>>>,
    /// Global middleware, in registration order.
    global_mw: RwLock<Vec<Arc<MiddlewareFn<V>>>>,
    /// Per-type middleware, in registration order.
    typed_mw: RwLock<HashMap<String, Vec<Arc<MiddlewareFn<V>>>>>,
    /// `on_open` hooks.
    on_open: RwLock<Vec<Arc<OpenHookFn>>>,
    /// `on_close` hooks.
    on_close: RwLock<Vec<Arc<CloseHookFn>>>,
    /// `on_auth` hooks.
    on_auth: RwLock<Vec<Arc<AuthHookFn>>>,
    /// `on_error` hooks.
    on_error: RwLock<Vec<Arc<ErrorHookFn>>>,
    /// `on_limit_exceeded` hooks.
    on_limit: RwLock<Vec<Arc<LimitHookFn>>>,
    /// `on_stale` hooks.
    on_stale: RwLock<Vec<Arc<StaleHookFn>>>,
    /// Open connections, by client id.
    connections: Mutex<HashMap<ClientId, Arc<Connection>>>,
    /// The RPC table.
    pub(crate) rpc_mgr: Arc<RpcManager>,
    /// The sweep task, spawned on first open.
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Validator> Drop for RouterInner<V> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.maintenance.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

/// A type-safe, validator-agnostic WebSocket message router.
///
/// Cheap to clone; clones share all state.  Registration (handlers,
/// middleware, hooks) normally happens before the first
/// [`open`](Router::open); afterwards the tables are treated as read-mostly.
pub struct Router<V: Validator = crate::NativeValidator> {
    /// Shared state.
    inner: Arc<RouterInner<V>>,
}

impl<V: Validator> Clone for Router<V> {
    fn clone(&self) -> Self {
        Router {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Validator> Router<V> {
    /// Create a router bound to `validator`, `config`, and `pubsub`.
    pub fn new(validator: V, config: RouterConfig, pubsub: Arc<dyn PubSub>) -> Self {
        let rpc_mgr = Arc::new(RpcManager::new(&config));
        Router {
            inner: Arc::new(RouterInner {
                validator,
                config,
                pubsub,
                routes: RwLock::new(HashMap::new()),
                global_mw: RwLock::new(Vec::new()),
                typed_mw: RwLock::new(HashMap::new()),
                on_open: RwLock::new(Vec::new()),
                on_close: RwLock::new(Vec::new()),
                on_auth: RwLock::new(Vec::new()),
                on_error: RwLock::new(Vec::new()),
                on_limit: RwLock::new(Vec::new()),
                on_stale: RwLock::new(Vec::new()),
                connections: Mutex::new(HashMap::new()),
                rpc_mgr,
                maintenance: Mutex::new(None),
            }),
        }
    }

    //
    // Registration surface.
    //

    /// Register an event handler for `schema`'s message type.
    ///
    /// Rejects reserved-prefix types and RPC request schemas.  Registering
    /// a type twice replaces the old handler, with a warning.
    pub fn on<F, Fut>(&self, schema: V::Schema, handler: F) -> Result<(), RegisterError>
    where
        F: Fn(Context<V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let msg_type = self.inner.validator.type_of(&schema).to_owned();
        if msg_type.starts_with(RESERVED_PREFIX) {
            return Err(RegisterError::ReservedPrefix(msg_type));
        }
        if self.inner.validator.response_of(&schema).is_some() {
            warn!("Schema for {msg_type:?} declares a response; register it with rpc()");
            return Err(RegisterError::HasResponse(msg_type));
        }
        let handler: Arc<EventHandlerFn<V>> = Arc::new(move |ctx| handler(ctx).boxed());
        self.insert_route(msg_type, schema, RouteHandler::Event(handler));
        Ok(())
    }

    /// Register an RPC handler for `schema`'s message type.
    ///
    /// The schema must declare a response descriptor.
    pub fn rpc<F, Fut>(&self, schema: V::Schema, handler: F) -> Result<(), RegisterError>
    where
        F: Fn(crate::RpcContext<V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let msg_type = self.inner.validator.type_of(&schema).to_owned();
        if msg_type.starts_with(RESERVED_PREFIX) {
            return Err(RegisterError::ReservedPrefix(msg_type));
        }
        if self.inner.validator.response_of(&schema).is_none() {
            return Err(RegisterError::MissingResponse(msg_type));
        }
        let handler: Arc<RpcHandlerFn<V>> = Arc::new(move |ctx| handler(ctx).boxed());
        self.insert_route(msg_type, schema, RouteHandler::Rpc(handler));
        Ok(())
    }

    /// Declare a topic message type: sugar over [`on`](Self::on) with a
    /// handler that accepts (and drops) inbound frames of the type.
    pub fn topic(&self, schema: V::Schema) -> Result<(), RegisterError> {
        self.on(schema, |ctx: Context<V>| async move {
            debug!("Dropping inbound topic message {:?}", ctx.msg_type());
            Ok(())
        })
    }

    /// As [`topic`](Self::topic), with a hook that runs for inbound frames
    /// of the topic's type.
    pub fn topic_with<F, Fut>(&self, schema: V::Schema, on_publish: F) -> Result<(), RegisterError>
    where
        F: Fn(Context<V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on(schema, on_publish)
    }

    /// Remove the handler for `schema`'s message type.  Returns whether one
    /// was registered.
    pub fn off(&self, schema: &V::Schema) -> bool {
        let msg_type = self.inner.validator.type_of(schema);
        self.inner
            .routes
            .write()
            .expect("lock poisoned")
            .remove(msg_type)
            .is_some()
    }

    /// Register a global middleware, run for every dispatched frame.
    pub fn middleware<F, Fut>(&self, mw: F)
    where
        F: Fn(Context<V>, Next<V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let mw: Arc<MiddlewareFn<V>> = Arc::new(move |ctx, next| mw(ctx, next).boxed());
        self.inner.global_mw.write().expect("lock poisoned").push(mw);
    }

    /// Register a middleware for `schema`'s message type only.
    pub fn middleware_for<F, Fut>(&self, schema: &V::Schema, mw: F)
    where
        F: Fn(Context<V>, Next<V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let msg_type = self.inner.validator.type_of(schema).to_owned();
        let mw: Arc<MiddlewareFn<V>> = Arc::new(move |ctx, next| mw(ctx, next).boxed());
        self.inner
            .typed_mw
            .write()
            .expect("lock poisoned")
            .entry(msg_type)
            .or_default()
            .push(mw);
    }

    /// Append `other`'s handlers, middleware, and lifecycle hooks to this
    /// router.  Handler collisions resolve last-write-wins, with a warning.
    ///
    /// Both routers must use the same validator type; there is no runtime
    /// marker check to fail.
    pub fn merge(&self, other: &Router<V>) {
        {
            let other_routes = other.inner.routes.read().expect("lock poisoned").clone();
            let mut routes = self.inner.routes.write().expect("lock poisoned");
            for (msg_type, entry) in other_routes {
                if routes.insert(msg_type.clone(), entry).is_some() {
                    warn!("merge: replacing existing handler for message type {msg_type:?}");
                }
            }
        }
        {
            let other_mw = other.inner.global_mw.read().expect("lock poisoned").clone();
            self.inner
                .global_mw
                .write()
                .expect("lock poisoned")
                .extend(other_mw);
        }
        {
            let other_typed = other.inner.typed_mw.read().expect("lock poisoned").clone();
            let mut typed = self.inner.typed_mw.write().expect("lock poisoned");
            for (msg_type, mws) in other_typed {
                typed.entry(msg_type).or_default().extend(mws);
            }
        }
        /// Append one hook list onto another.
        fn extend_hooks<T: ?Sized>(dst: &RwLock<Vec<Arc<T>>>, src: &RwLock<Vec<Arc<T>>>) {
            let src = src.read().expect("lock poisoned").clone();
            dst.write().expect("lock poisoned").extend(src);
        }
        extend_hooks(&self.inner.on_open, &other.inner.on_open);
        extend_hooks(&self.inner.on_close, &other.inner.on_close);
        extend_hooks(&self.inner.on_auth, &other.inner.on_auth);
        extend_hooks(&self.inner.on_error, &other.inner.on_error);
        extend_hooks(&self.inner.on_limit, &other.inner.on_limit);
        extend_hooks(&self.inner.on_stale, &other.inner.on_stale);
    }

    /// Enumerate the registered routes, sorted by message type.
    pub fn routes(&self) -> Vec<RouteInfo> {
        let routes = self.inner.routes.read().expect("lock poisoned");
        let mut infos: Vec<RouteInfo> = routes
            .iter()
            .map(|(msg_type, entry)| RouteInfo {
                msg_type: msg_type.clone(),
                kind: match entry.handler {
                    RouteHandler::Event(_) => HandlerKind::Event,
                    RouteHandler::Rpc(_) => HandlerKind::Rpc,
                },
            })
            .collect();
        infos.sort_by(|a, b| a.msg_type.cmp(&b.msg_type));
        infos
    }

    /// Register an `on_open` hook.
    pub fn on_open<F, Fut>(&self, hook: F)
    where
        F: Fn(ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Arc<OpenHookFn> = Arc::new(move |h| hook(h).boxed());
        self.inner.on_open.write().expect("lock poisoned").push(hook);
    }

    /// Register an `on_close` hook.
    pub fn on_close<F, Fut>(&self, hook: F)
    where
        F: Fn(CloseEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Arc<CloseHookFn> = Arc::new(move |e| hook(e).boxed());
        self.inner.on_close.write().expect("lock poisoned").push(hook);
    }

    /// Register an `on_auth` hook, making authentication mandatory for
    /// connections opened afterwards.
    pub fn on_auth<F, Fut>(&self, hook: F)
    where
        F: Fn(AuthRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AuthError>> + Send + 'static,
    {
        let hook: Arc<AuthHookFn> = Arc::new(move |r| hook(r).boxed());
        self.inner.on_auth.write().expect("lock poisoned").push(hook);
    }

    /// Register an `on_error` hook, observing handler failures.
    pub fn on_error<F, Fut>(&self, hook: F)
    where
        F: Fn(HandlerFailure) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ErrorVerdict> + Send + 'static,
    {
        let hook: Arc<ErrorHookFn> = Arc::new(move |f| hook(f).boxed());
        self.inner.on_error.write().expect("lock poisoned").push(hook);
    }

    /// Register an `on_limit_exceeded` hook, observing oversize frames.
    pub fn on_limit_exceeded<F, Fut>(&self, hook: F)
    where
        F: Fn(LimitExceeded) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Arc<LimitHookFn> = Arc::new(move |e| hook(e).boxed());
        self.inner.on_limit.write().expect("lock poisoned").push(hook);
    }

    /// Register an `on_stale` hook, run before a heartbeat-stale connection
    /// is closed.
    pub fn on_stale<F, Fut>(&self, hook: F)
    where
        F: Fn(ConnectionHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: Arc<StaleHookFn> = Arc::new(move |h| hook(h).boxed());
        self.inner.on_stale.write().expect("lock poisoned").push(hook);
    }

    /// Broadcast `payload` to `topic` through the pub/sub gateway.
    pub fn publish(
        &self,
        topic: &str,
        schema: &V::Schema,
        payload: Option<Value>,
        options: &PublishOptions,
    ) -> Result<Delivery, PublishError> {
        crate::pubsub::publish_with(
            &self.inner.validator,
            self.inner.pubsub.as_ref(),
            topic,
            schema,
            payload,
            options,
        )
    }

    //
    // Transport callbacks.
    //

    /// The platform accepted a connection.
    pub async fn open(&self, socket: Arc<dyn RawSocket>) {
        let authenticated = self.inner.on_auth.read().expect("lock poisoned").is_empty();
        let conn = Connection::new(socket, authenticated);
        let client_id = conn.client_id().clone();
        {
            let mut connections = self.inner.connections.lock().expect("lock poisoned");
            if connections
                .insert(client_id.clone(), Arc::clone(&conn))
                .is_some()
            {
                warn!("Replacing existing connection {client_id}");
            }
        }
        self.inner.ensure_maintenance();

        if let Some(hb) = self.inner.config.heartbeat {
            let weak = Arc::downgrade(&self.inner);
            let action: StaleAction = Box::new(move |conn: Arc<Connection>| {
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let hooks = inner.on_stale.read().expect("lock poisoned").clone();
                    let handle = ConnectionHandle::new(conn);
                    for hook in hooks {
                        run_isolated(hook(handle.clone())).await;
                    }
                }
                .boxed()
            });
            conn.set_heartbeat(heartbeat::start(&conn, hb, action));
        }

        let handle = ConnectionHandle::new(conn);
        let hooks = self.inner.on_open.read().expect("lock poisoned").clone();
        for hook in hooks {
            run_isolated(hook(handle.clone())).await;
        }
    }

    /// The platform received a frame for `client_id`.
    pub async fn message(&self, client_id: &ClientId, data: &[u8]) {
        let conn = {
            let connections = self.inner.connections.lock().expect("lock poisoned");
            connections.get(client_id).cloned()
        };
        let Some(conn) = conn else {
            debug!("Dropping frame for unknown connection {client_id}");
            return;
        };
        // Any frame is proof of life.
        conn.mark_seen();

        if data.len() > self.inner.config.max_payload_bytes {
            self.handle_oversize(&conn, data).await;
            return;
        }
        let Ok(text) = std::str::from_utf8(data) else {
            debug!("Dropping non-UTF-8 frame from {client_id}");
            return;
        };
        let raw = match RawFrame::parse(text) {
            Ok(raw) => raw,
            Err(rejected) => {
                debug!("Dropping frame from {client_id}: {rejected}");
                return;
            }
        };

        if raw.is_control() {
            self.inner.handle_control(&conn, &raw);
            return;
        }

        if !conn.is_authenticated() && !self.run_auth(&conn, &raw).await {
            return;
        }

        let normalized = match raw.normalize() {
            Ok(normalized) => normalized,
            Err(rejected) => {
                debug!("Dropping frame from {client_id}: {rejected}");
                return;
            }
        };

        let entry = {
            let routes = self.inner.routes.read().expect("lock poisoned");
            routes.get(&normalized.msg_type).cloned()
        };
        let Some(entry) = entry else {
            debug!(
                "Dropping {:?} from {client_id}: no handler registered",
                normalized.msg_type
            );
            return;
        };
        let is_rpc_entry = matches!(entry.handler, RouteHandler::Rpc(_));

        let mut validated =
            match self.inner.validator.safe_parse(&entry.schema, &normalized.value) {
                Ok(validated) => validated,
                Err(issues) => {
                    if is_rpc_entry {
                        if let Some(correlation_id) = normalized.meta.correlation_id.clone() {
                            let payload = ErrorPayload::builder(ErrorCode::InvalidArgument)
                                .message("Request failed validation")
                                .details(issues.to_details())
                                .build();
                            let scope = ErrorScope::Rpc(correlation_id);
                            if let Err(e) = self.inner.send_error_on(&conn, &scope, &payload) {
                                debug!("Could not deliver INVALID_ARGUMENT: {e}");
                            }
                            return;
                        }
                    }
                    debug!(
                        "Dropping invalid {:?} from {client_id}: {issues}",
                        normalized.msg_type
                    );
                    return;
                }
            };

        // Server meta dominance: inject our values into the validated frame.
        let received_at = now_ms();
        let mut meta = normalized.meta.clone();
        meta.client_id = Some(client_id.clone());
        meta.received_at = Some(received_at);
        if let Some(meta_obj) = validated.get_mut("meta").and_then(Value::as_object_mut) {
            meta_obj.insert("clientId".to_owned(), json!(client_id));
            meta_obj.insert("receivedAt".to_owned(), json!(received_at));
        }

        let rpc = if is_rpc_entry {
            let correlation_id = match meta.correlation_id.clone() {
                Some(correlation_id) => correlation_id,
                None => {
                    let synthesized = CorrelationId::synthesize();
                    meta.correlation_id = Some(synthesized.clone());
                    if let Some(meta_obj) =
                        validated.get_mut("meta").and_then(Value::as_object_mut)
                    {
                        meta_obj.insert("correlationId".to_owned(), json!(synthesized));
                    }
                    synthesized
                }
            };
            let now = Instant::now();
            let requested = meta
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.inner.config.rpc_timeout);
            // The configured timeout is also the ceiling: clients can only
            // shorten their deadline.
            let deadline = now + requested.min(self.inner.config.rpc_timeout);
            match self
                .inner
                .rpc_mgr
                .admit(client_id, &correlation_id, now, deadline)
            {
                AdmitOutcome::Admitted { signal } => Some(RpcShared {
                    correlation_id,
                    deadline,
                    signal,
                    mgr: Arc::clone(&self.inner.rpc_mgr),
                }),
                AdmitOutcome::LimitExceeded => {
                    warn!("In-flight RPC limit reached for {client_id}");
                    let payload = resource_exhausted("Too many in-flight requests");
                    let scope = ErrorScope::Rpc(correlation_id);
                    if let Err(e) = self.inner.send_error_on(&conn, &scope, &payload) {
                        debug!("Could not deliver RESOURCE_EXHAUSTED: {e}");
                    }
                    return;
                }
                AdmitOutcome::Duplicate => {
                    debug!("Suppressing duplicate RPC {correlation_id} from {client_id}");
                    return;
                }
            }
        } else {
            None
        };

        let ctx = Context::new(CtxInner {
            router: Arc::downgrade(&self.inner),
            conn,
            msg_type: normalized.msg_type.clone(),
            meta,
            frame: validated,
            rpc,
        });
        let chain = self.inner.chain_for(&normalized.msg_type);
        let router = Arc::downgrade(&self.inner);
        tokio::spawn(dispatch(router, ctx, chain, entry.handler.clone()));
    }

    /// The platform closed a connection.
    ///
    /// Pending RPCs are cancelled before any `on_close` hook runs.
    pub async fn close(&self, client_id: &ClientId, code: CloseCode, reason: Option<&str>) {
        let conn = {
            let mut connections = self.inner.connections.lock().expect("lock poisoned");
            connections.remove(client_id)
        };
        let Some(conn) = conn else {
            debug!("Close for unknown connection {client_id}");
            return;
        };
        self.inner.rpc_mgr.on_disconnect(client_id);
        conn.stop_heartbeat();

        let event = CloseEvent {
            handle: ConnectionHandle::new(conn),
            code,
            reason: reason.map(str::to_owned),
        };
        let hooks = self.inner.on_close.read().expect("lock poisoned").clone();
        for hook in hooks {
            run_isolated(hook(event.clone())).await;
        }
    }

    //
    // Pipeline pieces.
    //

    /// Insert (or replace) a route table entry.
    fn insert_route(&self, msg_type: String, schema: V::Schema, handler: RouteHandler<V>) {
        let mut routes = self.inner.routes.write().expect("lock poisoned");
        let entry = RouteEntry {
            schema: Arc::new(schema),
            handler,
        };
        if routes.insert(msg_type.clone(), entry).is_some() {
            warn!("Replacing existing handler for message type {msg_type:?}");
        }
    }

    /// Run the first-message auth chain.  Returns false (after reporting and
    /// closing) when authentication failed.
    async fn run_auth(&self, conn: &Arc<Connection>, raw: &RawFrame) -> bool {
        let hooks = self.inner.on_auth.read().expect("lock poisoned").clone();
        let handle = ConnectionHandle::new(Arc::clone(conn));
        for hook in hooks {
            let request = AuthRequest {
                handle: handle.clone(),
                msg_type: raw.msg_type.clone(),
                frame: raw.value.clone(),
            };
            let failure = match AssertUnwindSafe(hook(request)).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(_) => {
                    warn!("Auth handler panicked; failing closed");
                    Some(AuthError::Unauthenticated("authentication failed".into()))
                }
            };
            if let Some(error) = failure {
                let scope = match raw.raw_correlation_id() {
                    Some(correlation_id) => ErrorScope::Rpc(correlation_id),
                    None => ErrorScope::Oneway,
                };
                let payload = ErrorPayload::builder(error.code())
                    .message(error.to_string())
                    .build();
                // send_error_on closes with 1008 here: an auth failure
                // before the first successful message is handshake scope.
                if let Err(e) = self.inner.send_error_on(conn, &scope, &payload) {
                    debug!("Could not deliver auth error: {e}");
                }
                return false;
            }
        }
        conn.set_authenticated();
        true
    }

    /// Apply the oversize-frame policy.
    async fn handle_oversize(&self, conn: &Arc<Connection>, data: &[u8]) {
        let text = String::from_utf8_lossy(data);
        let correlation_id = scan_correlation_id(&text);
        warn!(
            "Frame from {} exceeds size limit ({} bytes)",
            conn.client_id(),
            data.len()
        );

        let scope = match correlation_id.clone() {
            Some(correlation_id) => ErrorScope::Rpc(correlation_id),
            None => ErrorScope::Oneway,
        };
        match self.inner.config.on_exceeded {
            crate::OversizePolicy::Send => {
                let payload = resource_exhausted("Message exceeds size limit");
                if let Err(e) = self.inner.send_error_on(conn, &scope, &payload) {
                    debug!("Could not deliver RESOURCE_EXHAUSTED: {e}");
                }
            }
            crate::OversizePolicy::Close => {
                let payload = resource_exhausted("Message exceeds size limit");
                if let Err(e) = self.inner.send_error_on(conn, &scope, &payload) {
                    debug!("Could not deliver RESOURCE_EXHAUSTED: {e}");
                }
                conn.socket()
                    .close(self.inner.config.close_code, "MESSAGE_TOO_BIG");
            }
            crate::OversizePolicy::Custom => {}
        }

        let hooks = self.inner.on_limit.read().expect("lock poisoned").clone();
        let event = LimitExceeded {
            handle: ConnectionHandle::new(Arc::clone(conn)),
            frame_bytes: data.len(),
            correlation_id,
        };
        for hook in hooks {
            run_isolated(hook(event.clone())).await;
        }
    }
}

impl<V: Validator> RouterInner<V> {
    /// Handle a reserved control frame.
    fn handle_control(&self, conn: &Arc<Connection>, raw: &RawFrame) {
        match raw.msg_type.as_str() {
            ABORT_MSG_TYPE => match raw.raw_correlation_id() {
                Some(correlation_id) => {
                    self.rpc_mgr.on_client_abort(conn.client_id(), &correlation_id);
                }
                None => {
                    debug!("$ws:abort without correlationId from {}", conn.client_id());
                }
            },
            other => debug!("Ignoring reserved control frame {other:?}"),
        }
    }

    /// Build the middleware chain for one message type.
    fn chain_for(&self, msg_type: &str) -> Arc<[Arc<MiddlewareFn<V>>]> {
        let mut chain = self.global_mw.read().expect("lock poisoned").clone();
        {
            let typed = self.typed_mw.read().expect("lock poisoned");
            if let Some(extra) = typed.get(msg_type) {
                chain.extend(extra.iter().map(Arc::clone));
            }
        }
        chain.into()
    }

    /// Send an error envelope on `conn`, applying the authorization close
    /// policy.  Callers are responsible for any one-shot bookkeeping.
    ///
    /// Error envelopes are never dropped for backpressure; we warn and send
    /// anyway.
    pub(crate) fn send_error_on(
        &self,
        conn: &Arc<Connection>,
        scope: &ErrorScope,
        payload: &ErrorPayload,
    ) -> Result<(), SendError> {
        if conn.should_backpressure(self.config.socket_buffer_limit_bytes) {
            warn!(
                "Sending error envelope to {} under backpressure",
                conn.client_id()
            );
        }
        let frame = error_frame(scope, payload);
        let text = serde_json::to_string(&frame).map_err(|e| {
            SendError::Validation(ValidationIssues::single(
                "$",
                format!("could not encode frame: {e}"),
            ))
        })?;
        let result = conn.send_text(&text).map_err(SendError::from);

        let close = match &payload.code {
            ErrorCode::Unauthenticated => {
                self.config.auth.close_on_unauthenticated || !conn.is_authenticated()
            }
            ErrorCode::PermissionDenied => {
                self.config.auth.close_on_permission_denied || !conn.is_authenticated()
            }
            _ => false,
        };
        if close {
            conn.socket()
                .close(CloseCode::POLICY_VIOLATION, payload.code.as_str());
        }
        result
    }

    /// Spawn the sweep task, once.
    fn ensure_maintenance(self: &Arc<Self>) {
        let mut guard = self.maintenance.lock().expect("lock poisoned");
        if guard.is_some() {
            return;
        }
        let cadence = self.config.rpc_cleanup_cadence;
        let weak = Arc::downgrade(self);
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(cadence).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.run_sweep();
            }
        }));
    }

    /// One sweep pass: retire expired records and report expired deadlines.
    fn run_sweep(&self) {
        let swept = self.rpc_mgr.sweep(Instant::now());
        for swept_rpc in swept {
            if !matches!(swept_rpc.reason, SweepReason::DeadlineExpired) {
                // Idle records are cancelled without a wire report.
                continue;
            }
            let conn = {
                let connections = self.connections.lock().expect("lock poisoned");
                connections.get(&swept_rpc.client_id).cloned()
            };
            if let Some(conn) = conn {
                let payload = ErrorPayload::builder(ErrorCode::DeadlineExceeded)
                    .message("RPC deadline exceeded")
                    .build();
                let scope = ErrorScope::Rpc(swept_rpc.correlation_id);
                if let Err(e) = self.send_error_on(&conn, &scope, &payload) {
                    debug!("Could not deliver DEADLINE_EXCEEDED: {e}");
                }
            }
        }
    }
}

/// Run the middleware chain and handler for one frame, then apply the
/// post-handler policies.
async fn dispatch<V: Validator>(
    router: Weak<RouterInner<V>>,
    ctx: Context<V>,
    chain: Arc<[Arc<MiddlewareFn<V>>]>,
    endpoint: RouteHandler<V>,
) {
    let next = Next::new(chain, endpoint);
    let outcome = AssertUnwindSafe(next.run(ctx.clone())).catch_unwind().await;
    let error: Option<BoxError> = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(error),
        Err(panic) => Some(panic_to_error(panic)),
    };

    let Some(inner) = router.upgrade() else {
        return;
    };
    if let Some(error) = error {
        let failure = HandlerFailure {
            client_id: ctx.client_id().clone(),
            msg_type: ctx.msg_type().to_owned(),
            correlation_id: ctx.correlation_id().cloned(),
            error: Arc::new(error),
        };
        let hooks = inner.on_error.read().expect("lock poisoned").clone();
        if hooks.is_empty() {
            warn!(
                "Handler for {:?} failed: {}",
                failure.msg_type, failure.error
            );
        }
        let mut verdict = ErrorVerdict::Emit;
        for hook in hooks {
            match AssertUnwindSafe(hook(failure.clone())).catch_unwind().await {
                Ok(ErrorVerdict::Suppress) => verdict = ErrorVerdict::Suppress,
                Ok(ErrorVerdict::Emit) => {}
                Err(_) => warn!("Error hook panicked"),
            }
        }
        if verdict == ErrorVerdict::Emit && inner.config.auto_send_error_on_throw {
            let mut builder = ErrorPayload::builder(ErrorCode::Internal).retryable(false);
            if inner.config.expose_error_details {
                builder = builder.message(failure.error.to_string());
            }
            if let Err(e) = ctx.send_error(builder.build()) {
                debug!("Could not deliver INTERNAL error: {e}");
            }
        }
    }

    if inner.config.warn_incomplete_rpc {
        if let Some(rpc) = ctx.rpc_shared() {
            if !rpc.mgr.is_terminal(ctx.client_id(), &rpc.correlation_id) {
                warn!(
                    "RPC handler for {:?} finished without a terminal reply (correlation {})",
                    ctx.msg_type(),
                    rpc.correlation_id
                );
            }
        }
    }
}

/// Run a lifecycle hook, isolating panics from its siblings.
async fn run_isolated<F: Future<Output = ()>>(fut: F) {
    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        warn!("Lifecycle handler panicked");
    }
}

/// Convert an unwind payload into a reportable error.
fn panic_to_error(panic: Box<dyn std::any::Any + Send>) -> BoxError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_owned());
    format!("handler panicked: {message}").into()
}

/// The retryable `RESOURCE_EXHAUSTED` payload used by the size gate, the
/// inflight cap, and backpressure conversion.
fn resource_exhausted(message: &str) -> ErrorPayload {
    ErrorPayload::builder(ErrorCode::ResourceExhausted)
        .message(message)
        .retryable(true)
        .retry_after_ms(100)
        .build()
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
    use crate::pubsub::NullPubSub;
    use crate::validate::native::{MessageSchema, NativeValidator};

    /// A router with default configuration and no pub/sub.
    fn router() -> Router<NativeValidator> {
        Router::new(
            NativeValidator,
            RouterConfig::builder().build().unwrap(),
            Arc::new(NullPubSub),
        )
    }

    #[test]
    fn registration_rules() {
        let router = router();

        // Reserved prefixes are rejected.
        let err = router
            .on(MessageSchema::event("$ws:evil"), |_ctx| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, RegisterError::ReservedPrefix(_)));

        // Event registration refuses RPC request schemas.
        let err = router
            .on(
                MessageSchema::rpc("Q", MessageSchema::event("R")),
                |_ctx| async { Ok(()) },
            )
            .unwrap_err();
        assert!(matches!(err, RegisterError::HasResponse(_)));

        // RPC registration requires a response descriptor.
        let err = router
            .rpc(MessageSchema::event("Q"), |_ctx| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, RegisterError::MissingResponse(_)));

        router
            .rpc(MessageSchema::rpc("Q", MessageSchema::event("R")), |_ctx| async {
                Ok(())
            })
            .unwrap();
        router
            .on(MessageSchema::event("E"), |_ctx| async { Ok(()) })
            .unwrap();
        router.topic(MessageSchema::event("T")).unwrap();

        assert_eq!(
            router.routes(),
            vec![
                RouteInfo {
                    msg_type: "E".into(),
                    kind: HandlerKind::Event
                },
                RouteInfo {
                    msg_type: "Q".into(),
                    kind: HandlerKind::Rpc
                },
                RouteInfo {
                    msg_type: "T".into(),
                    kind: HandlerKind::Event
                },
            ]
        );
    }

    #[test]
    fn duplicate_registration_overwrites() {
        let router = router();
        router
            .on(MessageSchema::event("E"), |_ctx| async { Ok(()) })
            .unwrap();
        // Last registration wins; still exactly one route.
        router
            .on(MessageSchema::event("E"), |_ctx| async { Ok(()) })
            .unwrap();
        assert_eq!(router.routes().len(), 1);
    }

    #[test]
    fn off_removes_routes() {
        let router = router();
        let schema = MessageSchema::event("E");
        router.on(schema.clone(), |_ctx| async { Ok(()) }).unwrap();
        assert!(router.off(&schema));
        assert!(!router.off(&schema));
        assert!(router.routes().is_empty());
    }

    #[test]
    fn merge_appends_routes_and_middleware() {
        let a = router();
        let b = router();
        a.on(MessageSchema::event("A"), |_ctx| async { Ok(()) })
            .unwrap();
        b.on(MessageSchema::event("B"), |_ctx| async { Ok(()) })
            .unwrap();
        b.on(MessageSchema::event("A"), |_ctx| async { Ok(()) })
            .unwrap();
        b.middleware(|ctx, next| next.run(ctx));

        a.merge(&b);
        assert_eq!(a.routes().len(), 2);
        assert_eq!(a.inner.global_mw.read().unwrap().len(), 1);
    }
}
