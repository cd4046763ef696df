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

mod cancel;
mod config;
mod connection;
mod context;
mod errors;
mod heartbeat;
mod middleware;
mod msgs;
mod pubsub;
mod router;
mod rpc;
mod transport;
mod validate;

pub mod testing;

pub use cancel::{Aborted, AbortSignal};
pub use config::{
    AuthPolicy, ConfigBuildError, HeartbeatConfig, OversizePolicy, RouterConfig,
    RouterConfigBuilder,
};
pub use connection::ConnectionHandle;
pub use context::{Context, RpcContext};
pub use errors::{AuthError, BoxError, ErrorScope, ErrorVerdict, RegisterError, SendError};
pub use middleware::{HandlerResult, Next};
pub use msgs::{
    ClientId, CorrelationId, Envelope, Meta, ProgressFrame, ABORT_MSG_TYPE, ERROR_MSG_TYPE,
    PROGRESS_MSG_TYPE, RESERVED_PREFIX, RPC_ERROR_MSG_TYPE,
};
pub use pubsub::{Delivery, InProcessPubSub, NullPubSub, PubSub, PublishError, PublishOptions};
pub use router::{
    AuthRequest, CloseEvent, HandlerFailure, HandlerKind, LimitExceeded, RouteInfo, Router,
};
pub use rpc::CancelRegistration;
pub use transport::{CloseCode, RawSocket, ReadyState, TransportError};
pub use validate::native::{MessageSchema, NativeValidator};
pub use validate::{ValidationIssue, ValidationIssues, Validator};

// The error taxonomy is defined in its own crate; re-export the pieces a
// router embedder needs every day.
pub use switchboard_error::{ErrorCode, ErrorPayload, ErrorPayloadBuilder, RetryAfterMs};
