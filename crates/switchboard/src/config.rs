//! Router configuration.

use std::time::Duration;

use crate::transport::CloseCode;

/// How much longer than the RPC timeout an idle record survives by default.
const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(10);

/// What to do with an inbound frame that exceeds `max_payload_bytes`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum OversizePolicy {
    /// Send a `RESOURCE_EXHAUSTED` envelope and keep the connection open.
    #[default]
    Send,
    /// Send the envelope, then close the connection with `close_code`.
    Close,
    /// Do nothing automatic; only the `on_limit_exceeded` hooks run.
    Custom,
}

/// Connection-close policy for authorization failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct AuthPolicy {
    /// Close (1008) whenever an `UNAUTHENTICATED` error is sent.
    pub close_on_unauthenticated: bool,
    /// Close (1008) whenever a `PERMISSION_DENIED` error is sent.
    pub close_on_permission_denied: bool,
}

/// Heartbeat (liveness) settings.
///
/// When set, every connection gets a ping timer; a connection that shows no
/// life for `interval + timeout` is closed with 4000/`HEARTBEAT_TIMEOUT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct HeartbeatConfig {
    /// How often to ping.
    pub interval: Duration,
    /// How long after a ping to wait for proof of life.
    pub timeout: Duration,
}

impl HeartbeatConfig {
    /// Construct a heartbeat configuration.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        HeartbeatConfig { interval, timeout }
    }
}

/// Configuration for a [`Router`](crate::Router).
///
/// Build one with [`RouterConfig::builder`]; every field has a default.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct RouterConfig {
    /// Maximum inbound frame size, in bytes.
    pub max_payload_bytes: usize,
    /// What to do with oversize frames.
    pub on_exceeded: OversizePolicy,
    /// Close code used when `on_exceeded` is [`OversizePolicy::Close`].
    pub close_code: CloseCode,
    /// Outbound buffer level, in bytes, above which the socket counts as
    /// backpressured.  `usize::MAX` disables the check.
    pub socket_buffer_limit_bytes: usize,
    /// Default and maximum RPC deadline.  A client `timeoutMs` can shorten
    /// the effective deadline, never extend it.
    pub rpc_timeout: Duration,
    /// How long a pending RPC may go without activity before the sweeper
    /// cancels it.
    pub rpc_idle_timeout: Duration,
    /// How often the sweeper runs.
    pub rpc_cleanup_cadence: Duration,
    /// How long a terminal record lingers to suppress duplicate requests
    /// reusing its correlation id.
    pub rpc_dedup_window: Duration,
    /// Maximum concurrently-pending RPCs per connection.
    pub rpc_max_inflight_per_socket: usize,
    /// Drop progress frames instead of sending them under backpressure.
    pub drop_progress_on_backpressure: bool,
    /// Emit an automatic `INTERNAL` envelope when a handler fails.
    pub auto_send_error_on_throw: bool,
    /// Include handler error text in automatic `INTERNAL` envelopes.
    pub expose_error_details: bool,
    /// Warn when an RPC handler returns without sending a terminal frame.
    pub warn_incomplete_rpc: bool,
    /// Authorization close policy.
    pub auth: AuthPolicy,
    /// Heartbeat settings; `None` disables the heartbeat entirely.
    pub heartbeat: Option<HeartbeatConfig>,
}

impl RouterConfig {
    /// Start building a [`RouterConfig`].
    ///
    /// Returns a fresh default [`RouterConfigBuilder`].
    pub fn builder() -> RouterConfigBuilder {
        RouterConfigBuilder::default()
    }
}

/// Builder for [`RouterConfig`].
//
// Hand-written rather than derived: several defaults are computed from
// other fields, and `build` enforces cross-field invariants.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct RouterConfigBuilder {
    /// See [`RouterConfig::max_payload_bytes`].
    max_payload_bytes: Option<usize>,
    /// See [`RouterConfig::on_exceeded`].
    on_exceeded: Option<OversizePolicy>,
    /// See [`RouterConfig::close_code`].
    close_code: Option<CloseCode>,
    /// See [`RouterConfig::socket_buffer_limit_bytes`].
    socket_buffer_limit_bytes: Option<usize>,
    /// See [`RouterConfig::rpc_timeout`].
    rpc_timeout: Option<Duration>,
    /// See [`RouterConfig::rpc_idle_timeout`].
    rpc_idle_timeout: Option<Duration>,
    /// See [`RouterConfig::rpc_cleanup_cadence`].
    rpc_cleanup_cadence: Option<Duration>,
    /// See [`RouterConfig::rpc_dedup_window`].
    rpc_dedup_window: Option<Duration>,
    /// See [`RouterConfig::rpc_max_inflight_per_socket`].
    rpc_max_inflight_per_socket: Option<usize>,
    /// See [`RouterConfig::drop_progress_on_backpressure`].
    drop_progress_on_backpressure: Option<bool>,
    /// See [`RouterConfig::auto_send_error_on_throw`].
    auto_send_error_on_throw: Option<bool>,
    /// See [`RouterConfig::expose_error_details`].
    expose_error_details: Option<bool>,
    /// See [`RouterConfig::warn_incomplete_rpc`].
    warn_incomplete_rpc: Option<bool>,
    /// See [`RouterConfig::auth`].
    auth: Option<AuthPolicy>,
    /// See [`RouterConfig::heartbeat`].
    heartbeat: Option<HeartbeatConfig>,
}

/// A problem with a [`RouterConfigBuilder`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigBuildError {
    /// A single field value is out of range.
    #[error("Field {field} is invalid: {problem}")]
    Invalid {
        /// The offending field.
        field: String,
        /// What is wrong with it.
        problem: String,
    },

    /// Two or more fields contradict each other.
    #[error("Fields {fields:?} are inconsistent: {problem}")]
    Inconsistent {
        /// The fields involved.
        fields: Vec<String>,
        /// What is wrong with them.
        problem: String,
    },
}

impl RouterConfigBuilder {
    /// Set the maximum inbound frame size.
    pub fn max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = Some(bytes);
        self
    }

    /// Set the oversize-frame policy.
    pub fn on_exceeded(mut self, policy: OversizePolicy) -> Self {
        self.on_exceeded = Some(policy);
        self
    }

    /// Set the close code for [`OversizePolicy::Close`].
    pub fn close_code(mut self, code: CloseCode) -> Self {
        self.close_code = Some(code);
        self
    }

    /// Set the backpressure threshold.
    pub fn socket_buffer_limit_bytes(mut self, bytes: usize) -> Self {
        self.socket_buffer_limit_bytes = Some(bytes);
        self
    }

    /// Set the default/maximum RPC deadline.
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    /// Set the pending-RPC idle timeout.
    pub fn rpc_idle_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_idle_timeout = Some(timeout);
        self
    }

    /// Set the sweep cadence.
    pub fn rpc_cleanup_cadence(mut self, cadence: Duration) -> Self {
        self.rpc_cleanup_cadence = Some(cadence);
        self
    }

    /// Set the terminal-record dedup window.
    pub fn rpc_dedup_window(mut self, window: Duration) -> Self {
        self.rpc_dedup_window = Some(window);
        self
    }

    /// Set the per-connection inflight cap.
    pub fn rpc_max_inflight_per_socket(mut self, limit: usize) -> Self {
        self.rpc_max_inflight_per_socket = Some(limit);
        self
    }

    /// Set whether progress frames are dropped under backpressure.
    pub fn drop_progress_on_backpressure(mut self, drop: bool) -> Self {
        self.drop_progress_on_backpressure = Some(drop);
        self
    }

    /// Set whether handler failures emit an automatic `INTERNAL`.
    pub fn auto_send_error_on_throw(mut self, send: bool) -> Self {
        self.auto_send_error_on_throw = Some(send);
        self
    }

    /// Set whether handler error text is exposed to clients.
    pub fn expose_error_details(mut self, expose: bool) -> Self {
        self.expose_error_details = Some(expose);
        self
    }

    /// Set whether incomplete RPC handlers are warned about.
    pub fn warn_incomplete_rpc(mut self, warn: bool) -> Self {
        self.warn_incomplete_rpc = Some(warn);
        self
    }

    /// Set the authorization close policy.
    pub fn auth(mut self, auth: AuthPolicy) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Enable the heartbeat.
    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Build a [`RouterConfig`], checking invariants and filling derived
    /// defaults.
    pub fn build(&self) -> Result<RouterConfig, ConfigBuildError> {
        /// Reject a zero duration for `field`.
        fn nonzero(field: &str, d: Duration) -> Result<Duration, ConfigBuildError> {
            if d.is_zero() {
                Err(ConfigBuildError::Invalid {
                    field: field.into(),
                    problem: "must be nonzero".into(),
                })
            } else {
                Ok(d)
            }
        }

        let max_payload_bytes = self.max_payload_bytes.unwrap_or(1_000_000);
        if max_payload_bytes == 0 {
            return Err(ConfigBuildError::Invalid {
                field: "max_payload_bytes".into(),
                problem: "must be nonzero".into(),
            });
        }

        let rpc_timeout = nonzero("rpc_timeout", self.rpc_timeout.unwrap_or(Duration::from_secs(30)))?;
        let rpc_idle_timeout = nonzero(
            "rpc_idle_timeout",
            self.rpc_idle_timeout.unwrap_or(rpc_timeout + DEFAULT_IDLE_GRACE),
        )?;
        if rpc_idle_timeout < rpc_timeout {
            return Err(ConfigBuildError::Inconsistent {
                fields: vec!["rpc_timeout".into(), "rpc_idle_timeout".into()],
                problem: "idle timeout would cancel RPCs before their deadline".into(),
            });
        }
        let rpc_cleanup_cadence = nonzero(
            "rpc_cleanup_cadence",
            self.rpc_cleanup_cadence.unwrap_or(Duration::from_secs(1)),
        )?;
        // An unconfigured dedup window tracks the *effective* idle timeout.
        let rpc_dedup_window = self.rpc_dedup_window.unwrap_or(rpc_idle_timeout);

        let rpc_max_inflight_per_socket = self.rpc_max_inflight_per_socket.unwrap_or(1000);
        if rpc_max_inflight_per_socket == 0 {
            return Err(ConfigBuildError::Invalid {
                field: "rpc_max_inflight_per_socket".into(),
                problem: "must be at least 1".into(),
            });
        }

        if let Some(hb) = &self.heartbeat {
            nonzero("heartbeat.interval", hb.interval)?;
            nonzero("heartbeat.timeout", hb.timeout)?;
        }

        Ok(RouterConfig {
            max_payload_bytes,
            on_exceeded: self.on_exceeded.unwrap_or_default(),
            close_code: self.close_code.unwrap_or(CloseCode::MESSAGE_TOO_BIG),
            socket_buffer_limit_bytes: self.socket_buffer_limit_bytes.unwrap_or(1_000_000),
            rpc_timeout,
            rpc_idle_timeout,
            rpc_cleanup_cadence,
            rpc_dedup_window,
            rpc_max_inflight_per_socket,
            drop_progress_on_backpressure: self.drop_progress_on_backpressure.unwrap_or(true),
            auto_send_error_on_throw: self.auto_send_error_on_throw.unwrap_or(true),
            expose_error_details: self.expose_error_details.unwrap_or(false),
            warn_incomplete_rpc: self.warn_incomplete_rpc.unwrap_or(true),
            auth: self.auth.unwrap_or_default(),
            heartbeat: self.heartbeat,
        })
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

    #[test]
    fn defaults() {
        let cfg = RouterConfig::builder().build().unwrap();
        assert_eq!(cfg.max_payload_bytes, 1_000_000);
        assert_eq!(cfg.on_exceeded, OversizePolicy::Send);
        assert_eq!(cfg.close_code, CloseCode::MESSAGE_TOO_BIG);
        assert_eq!(cfg.rpc_timeout, Duration::from_secs(30));
        assert_eq!(cfg.rpc_idle_timeout, Duration::from_secs(40));
        assert_eq!(cfg.rpc_dedup_window, Duration::from_secs(40));
        assert_eq!(cfg.rpc_max_inflight_per_socket, 1000);
        assert!(cfg.drop_progress_on_backpressure);
        assert!(cfg.auto_send_error_on_throw);
        assert!(!cfg.expose_error_details);
        assert!(cfg.warn_incomplete_rpc);
        assert_eq!(cfg.auth, AuthPolicy::default());
        assert_eq!(cfg.heartbeat, None);
    }

    #[test]
    fn dedup_window_tracks_idle_timeout() {
        let cfg = RouterConfig::builder()
            .rpc_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(cfg.rpc_idle_timeout, Duration::from_secs(15));
        assert_eq!(cfg.rpc_dedup_window, Duration::from_secs(15));
    }

    #[test]
    fn rejects_inverted_timeouts() {
        let err = RouterConfig::builder()
            .rpc_timeout(Duration::from_secs(30))
            .rpc_idle_timeout(Duration::from_secs(5))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigBuildError::Inconsistent { .. }));
    }

    #[test]
    fn rejects_zero_values() {
        assert!(RouterConfig::builder().max_payload_bytes(0).build().is_err());
        assert!(RouterConfig::builder()
            .rpc_cleanup_cadence(Duration::ZERO)
            .build()
            .is_err());
        assert!(RouterConfig::builder()
            .rpc_max_inflight_per_socket(0)
            .build()
            .is_err());
        assert!(RouterConfig::builder()
            .heartbeat(HeartbeatConfig::new(Duration::ZERO, Duration::from_secs(1)))
            .build()
            .is_err());
    }
}
