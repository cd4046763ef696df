//! Middleware: the ordered chain a frame passes through on its way to its
//! handler.
//!
//! A middleware receives the frame's [`Context`] and a [`Next`]; calling
//! [`Next::run`] continues the chain.  The effective chain for a frame is
//! every global middleware (in registration order) followed by every
//! middleware registered for the frame's message type.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::{Context, RpcContext};
use crate::errors::BoxError;
use crate::validate::Validator;

/// What handlers and middleware return.
pub type HandlerResult = Result<(), BoxError>;

/// A boxed future, the erased form all handlers are stored in.
pub(crate) type BoxFut<T> = BoxFuture<'static, T>;

/// An erased event handler.
pub(crate) type EventHandlerFn<V> = dyn Fn(Context<V>) -> BoxFut<HandlerResult> + Send + Sync;

/// An erased RPC handler.
pub(crate) type RpcHandlerFn<V> = dyn Fn(RpcContext<V>) -> BoxFut<HandlerResult> + Send + Sync;

/// An erased middleware.
pub(crate) type MiddlewareFn<V> = dyn Fn(Context<V>, Next<V>) -> BoxFut<HandlerResult> + Send + Sync;

/// The handler at the end of a chain.
pub(crate) enum RouteHandler<V: Validator> {
    /// An event handler.
    Event(Arc<EventHandlerFn<V>>),
    /// An RPC handler; its context is wrapped just before invocation.
    Rpc(Arc<RpcHandlerFn<V>>),
}

impl<V: Validator> Clone for RouteHandler<V> {
    fn clone(&self) -> Self {
        match self {
            RouteHandler::Event(h) => RouteHandler::Event(Arc::clone(h)),
            RouteHandler::Rpc(h) => RouteHandler::Rpc(Arc::clone(h)),
        }
    }
}

/// The rest of a frame's middleware chain.
pub struct Next<V: Validator> {
    /// The full chain for this frame.
    chain: Arc<[Arc<MiddlewareFn<V>>]>,
    /// Position of the next middleware to run.
    pos: usize,
    /// The handler to invoke once the chain is exhausted.
    endpoint: RouteHandler<V>,
}

impl<V: Validator> Next<V> {
    /// Start a chain.  (Router internals only.)
    pub(crate) fn new(chain: Arc<[Arc<MiddlewareFn<V>>]>, endpoint: RouteHandler<V>) -> Self {
        Next {
            chain,
            pos: 0,
            endpoint,
        }
    }

    /// Run the rest of the chain, ending with the handler.
    pub fn run(self, ctx: Context<V>) -> BoxFut<HandlerResult> {
        if let Some(mw) = self.chain.get(self.pos) {
            let mw = Arc::clone(mw);
            let rest = Next {
                chain: self.chain,
                pos: self.pos + 1,
                endpoint: self.endpoint,
            };
            mw(ctx, rest)
        } else {
            match self.endpoint {
                RouteHandler::Event(handler) => handler(ctx),
                // The pipeline only builds RPC endpoints for contexts with
                // RPC state, so the wrap here cannot miss.
                RouteHandler::Rpc(handler) => handler(RpcContext::new(ctx)),
            }
        }
    }
}
