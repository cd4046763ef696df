//! The in-flight RPC table: admission, one-shot terminal transitions,
//! cancellation, and sweeping.
//!
//! Records are keyed by `(clientId, correlationId)`.  A record is created
//! when a validated RPC request is admitted, transitions to terminal exactly
//! once, and then lingers for the dedup window so that a late duplicate of
//! the same request is suppressed rather than re-dispatched.
//!
//! Lock discipline: the table mutex is only ever held for map bookkeeping.
//! Cancel callbacks and abort signals fire after the lock is released, since
//! observers are allowed to call back into the manager.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cancel::{abort_pair, AbortHandle, AbortSignal};
use crate::config::RouterConfig;
use crate::msgs::{ClientId, CorrelationId};

/// A cancel observer registered by a handler.
pub(crate) type CancelCallback = Box<dyn FnOnce() + Send>;

/// Lifecycle state of one record.
enum RecordState {
    /// The request is in flight; a terminal frame has not been sent.
    Pending,
    /// A terminal frame has been sent (or the request was cancelled).
    Terminal {
        /// When the transition happened; drives the dedup window.
        since: Instant,
    },
}

/// One in-flight (or recently terminal) RPC.
struct RpcRecord {
    /// Current state.
    state: RecordState,
    /// Last activity: creation, progress, or cancellation.
    last_activity: Instant,
    /// Absolute deadline for the request.
    deadline: Instant,
    /// Cancel observers, fired once in registration order.
    callbacks: Vec<(u64, CancelCallback)>,
    /// Id for the next registered callback.
    next_callback_id: u64,
    /// Firing side of the record's abort signal.
    handle: AbortHandle,
    /// Observing side, cloned into handler contexts.
    signal: AbortSignal,
}

impl RpcRecord {
    /// Build a fresh pending record.
    fn new(now: Instant, deadline: Instant) -> Self {
        let (handle, signal) = abort_pair();
        RpcRecord {
            state: RecordState::Pending,
            last_activity: now,
            deadline,
            callbacks: Vec::new(),
            next_callback_id: 0,
            handle,
            signal,
        }
    }

    /// True if the record is still pending.
    fn is_pending(&self) -> bool {
        matches!(self.state, RecordState::Pending)
    }
}

/// Result of [`RpcManager::admit`].
pub(crate) enum AdmitOutcome {
    /// The request was admitted; the signal observes its cancellation.
    Admitted {
        /// Abort signal for the new record.
        signal: AbortSignal,
    },
    /// The per-connection inflight cap is full.
    LimitExceeded,
    /// A record (pending, or terminal within the dedup window) already
    /// holds this correlation id; the request is a duplicate.
    Duplicate,
}

/// Why the sweeper retired a pending record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SweepReason {
    /// The request's deadline passed.
    DeadlineExpired,
    /// The request went idle: no progress within the idle window.
    Idle,
}

/// A pending record the sweeper cancelled this pass.
pub(crate) struct SweptRpc {
    /// Connection the record belonged to.
    pub(crate) client_id: ClientId,
    /// The record's correlation id.
    pub(crate) correlation_id: CorrelationId,
    /// Why it was retired.
    pub(crate) reason: SweepReason,
}

/// Everything fired after the table lock is dropped.
struct DeferredCancel {
    /// Callbacks to invoke, in registration order.
    callbacks: Vec<CancelCallback>,
    /// The abort handle to fire.
    handle: AbortHandle,
}

impl DeferredCancel {
    /// Fire the callbacks and the signal.
    fn fire(self) {
        for callback in self.callbacks {
            callback();
        }
        self.handle.fire();
    }
}

/// The per-router RPC table.
pub(crate) struct RpcManager {
    /// Per-connection inflight cap.
    max_inflight_per_socket: usize,
    /// Idle window for pending records.
    idle_timeout: Duration,
    /// Linger window for terminal records.
    dedup_window: Duration,
    /// The table itself.
    inner: Mutex<HashMap<ClientId, HashMap<CorrelationId, RpcRecord>>>,
}

impl RpcManager {
    /// Create a manager using the limits in `config`.
    pub(crate) fn new(config: &RouterConfig) -> Self {
        RpcManager {
            max_inflight_per_socket: config.rpc_max_inflight_per_socket,
            idle_timeout: config.rpc_idle_timeout,
            dedup_window: config.rpc_dedup_window,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Try to create a pending record for `(client_id, correlation_id)`.
    pub(crate) fn admit(
        &self,
        client_id: &ClientId,
        correlation_id: &CorrelationId,
        now: Instant,
        deadline: Instant,
    ) -> AdmitOutcome {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let records = inner.entry(client_id.clone()).or_default();
        if records.contains_key(correlation_id) {
            return AdmitOutcome::Duplicate;
        }
        let pending = records.values().filter(|r| r.is_pending()).count();
        if pending >= self.max_inflight_per_socket {
            return AdmitOutcome::LimitExceeded;
        }
        let record = RpcRecord::new(now, deadline);
        let signal = record.signal.clone();
        records.insert(correlation_id.clone(), record);
        AdmitOutcome::Admitted { signal }
    }

    /// True iff the record is terminal or absent.
    pub(crate) fn is_terminal(&self, client_id: &ClientId, correlation_id: &CorrelationId) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        match inner.get(client_id).and_then(|r| r.get(correlation_id)) {
            Some(record) => !record.is_pending(),
            None => true,
        }
    }

    /// Transition the record to terminal.
    ///
    /// Returns true if this call performed the transition; false if the
    /// record was already terminal or absent (the send must be suppressed).
    /// Cancel callbacks are *not* fired: completing normally is not a
    /// cancellation.
    pub(crate) fn mark_terminal(
        &self,
        client_id: &ClientId,
        correlation_id: &CorrelationId,
    ) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let Some(record) = inner.get_mut(client_id).and_then(|r| r.get_mut(correlation_id))
        else {
            return false;
        };
        if !record.is_pending() {
            return false;
        }
        record.state = RecordState::Terminal {
            since: Instant::now(),
        };
        record.callbacks.clear();
        true
    }

    /// Record progress activity on a pending record.
    pub(crate) fn touch_progress(
        &self,
        client_id: &ClientId,
        correlation_id: &CorrelationId,
    ) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let Some(record) = inner.get_mut(client_id).and_then(|r| r.get_mut(correlation_id))
        else {
            return false;
        };
        if !record.is_pending() {
            return false;
        }
        record.last_activity = Instant::now();
        true
    }

    /// Register a cancel observer on a pending record.
    ///
    /// If the record is already terminal or absent, `callback` is invoked
    /// immediately and no registration is returned.
    pub(crate) fn register_cancel(
        self: &std::sync::Arc<Self>,
        client_id: &ClientId,
        correlation_id: &CorrelationId,
        callback: CancelCallback,
    ) -> Option<CancelRegistration> {
        let late = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            match inner.get_mut(client_id).and_then(|r| r.get_mut(correlation_id)) {
                Some(record) if record.is_pending() => {
                    let id = record.next_callback_id;
                    record.next_callback_id += 1;
                    record.callbacks.push((id, callback));
                    return Some(CancelRegistration {
                        mgr: std::sync::Arc::downgrade(self),
                        client_id: client_id.clone(),
                        correlation_id: correlation_id.clone(),
                        id,
                    });
                }
                _ => callback,
            }
        };
        // The request is already over; let the observer know right away.
        late();
        None
    }

    /// Handle a client `$ws:abort` for one correlation id.
    pub(crate) fn on_client_abort(&self, client_id: &ClientId, correlation_id: &CorrelationId) {
        let deferred = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some(record) = inner.get_mut(client_id).and_then(|r| r.get_mut(correlation_id))
            else {
                debug!("Ignoring abort for unknown RPC {client_id}/{correlation_id}");
                return;
            };
            if !record.is_pending() {
                debug!("Ignoring abort for terminal RPC {client_id}/{correlation_id}");
                return;
            }
            record.state = RecordState::Terminal {
                since: Instant::now(),
            };
            DeferredCancel {
                callbacks: record.callbacks.drain(..).map(|(_, cb)| cb).collect(),
                handle: record.handle.clone(),
            }
        };
        deferred.fire();
    }

    /// Cancel and destroy every record for a disconnected client.
    pub(crate) fn on_disconnect(&self, client_id: &ClientId) {
        let deferred: Vec<DeferredCancel> = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some(records) = inner.remove(client_id) else {
                return;
            };
            records
                .into_values()
                .filter(|r| r.is_pending())
                .map(|mut record| DeferredCancel {
                    callbacks: record.callbacks.drain(..).map(|(_, cb)| cb).collect(),
                    handle: record.handle.clone(),
                })
                .collect()
        };
        for cancel in deferred {
            cancel.fire();
        }
    }

    /// One maintenance pass.
    ///
    /// Reaps terminal records older than the dedup window, and cancels
    /// pending records whose deadline has passed or that have gone idle.
    /// Cancelled records stay terminal for the dedup window.
    pub(crate) fn sweep(&self, now: Instant) -> Vec<SweptRpc> {
        let mut swept = Vec::new();
        let mut deferred = Vec::new();
        {
            let mut inner = self.inner.lock().expect("lock poisoned");
            for (client_id, records) in inner.iter_mut() {
                records.retain(|correlation_id, record| {
                    match record.state {
                        RecordState::Terminal { since } => {
                            now.duration_since(since) < self.dedup_window
                        }
                        RecordState::Pending => {
                            let reason = if record.deadline <= now {
                                Some(SweepReason::DeadlineExpired)
                            } else if now.duration_since(record.last_activity)
                                >= self.idle_timeout
                            {
                                Some(SweepReason::Idle)
                            } else {
                                None
                            };
                            if let Some(reason) = reason {
                                record.state = RecordState::Terminal { since: now };
                                deferred.push(DeferredCancel {
                                    callbacks: record
                                        .callbacks
                                        .drain(..)
                                        .map(|(_, cb)| cb)
                                        .collect(),
                                    handle: record.handle.clone(),
                                });
                                swept.push(SweptRpc {
                                    client_id: client_id.clone(),
                                    correlation_id: correlation_id.clone(),
                                    reason,
                                });
                            }
                            true
                        }
                    }
                });
            }
            inner.retain(|_, records| !records.is_empty());
        }
        for cancel in deferred {
            cancel.fire();
        }
        swept
    }

    /// Number of pending records for `client_id`.
    #[cfg(test)]
    pub(crate) fn pending_count(&self, client_id: &ClientId) -> usize {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .get(client_id)
            .map(|records| records.values().filter(|r| r.is_pending()).count())
            .unwrap_or(0)
    }
}

/// A registered cancel observer; dropping it keeps the registration,
/// [`unregister`](Self::unregister) removes it.
pub struct CancelRegistration {
    /// The owning manager.
    mgr: Weak<RpcManager>,
    /// Key: connection.
    client_id: ClientId,
    /// Key: correlation.
    correlation_id: CorrelationId,
    /// Which callback to remove.
    id: u64,
}

impl CancelRegistration {
    /// Remove the observer, if its record still exists.
    pub fn unregister(self) {
        let Some(mgr) = self.mgr.upgrade() else {
            return;
        };
        let mut inner = mgr.inner.lock().expect("lock poisoned");
        if let Some(record) = inner
            .get_mut(&self.client_id)
            .and_then(|r| r.get_mut(&self.correlation_id))
        {
            record.callbacks.retain(|(id, _)| *id != self.id);
        }
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
    use crate::config::RouterConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A manager with a small inflight cap and short windows.
    fn mgr() -> Arc<RpcManager> {
        let config = RouterConfig::builder()
            .rpc_timeout(Duration::from_secs(30))
            .rpc_idle_timeout(Duration::from_secs(40))
            .rpc_dedup_window(Duration::from_secs(40))
            .rpc_max_inflight_per_socket(2)
            .build()
            .unwrap();
        Arc::new(RpcManager::new(&config))
    }

    /// Shorthand ids.
    fn ids(n: u32) -> (ClientId, CorrelationId) {
        (ClientId::from("c"), CorrelationId::new(format!("r{n}")))
    }

    /// Admit `(client, corr)` with a 30s deadline, asserting success.
    fn must_admit(mgr: &RpcManager, client: &ClientId, corr: &CorrelationId) -> AbortSignal {
        let now = Instant::now();
        match mgr.admit(client, corr, now, now + Duration::from_secs(30)) {
            AdmitOutcome::Admitted { signal } => signal,
            _ => panic!("admission refused"),
        }
    }

    #[test]
    fn one_shot_transition() {
        let mgr = mgr();
        let (client, corr) = ids(1);
        must_admit(&mgr, &client, &corr);
        assert!(!mgr.is_terminal(&client, &corr));
        assert!(mgr.mark_terminal(&client, &corr));
        assert!(mgr.is_terminal(&client, &corr));
        // Only the first transition wins.
        assert!(!mgr.mark_terminal(&client, &corr));
        // Unknown records count as terminal.
        assert!(mgr.is_terminal(&client, &CorrelationId::from("nope")));
    }

    #[test]
    fn inflight_cap_and_dedup() {
        let mgr = mgr();
        let (client, _) = ids(0);
        let now = Instant::now();
        let deadline = now + Duration::from_secs(30);
        must_admit(&mgr, &client, &CorrelationId::from("r1"));
        must_admit(&mgr, &client, &CorrelationId::from("r2"));
        assert!(matches!(
            mgr.admit(&client, &CorrelationId::from("r3"), now, deadline),
            AdmitOutcome::LimitExceeded
        ));
        // Same correlation is a duplicate, not a limit refusal.
        assert!(matches!(
            mgr.admit(&client, &CorrelationId::from("r1"), now, deadline),
            AdmitOutcome::Duplicate
        ));
        // A terminal record still dedups until the window passes.
        assert!(mgr.mark_terminal(&client, &CorrelationId::from("r1")));
        assert!(matches!(
            mgr.admit(&client, &CorrelationId::from("r1"), now, deadline),
            AdmitOutcome::Duplicate
        ));
        // But it no longer counts against the cap.
        must_admit(&mgr, &client, &CorrelationId::from("r4"));
        assert_eq!(mgr.pending_count(&client), 2);
    }

    #[test]
    fn abort_fires_callbacks_and_signal() {
        let mgr = mgr();
        let (client, corr) = ids(1);
        let signal = must_admit(&mgr, &client, &corr);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        mgr.register_cancel(&client, &corr, Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        mgr.on_client_abort(&client, &corr);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(signal.is_aborted());
        assert!(mgr.is_terminal(&client, &corr));
        // Aborting again is a no-op.
        mgr.on_client_abort(&client, &corr);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn normal_completion_does_not_fire_callbacks() {
        let mgr = mgr();
        let (client, corr) = ids(1);
        let signal = must_admit(&mgr, &client, &corr);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        mgr.register_cancel(&client, &corr, Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(mgr.mark_terminal(&client, &corr));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!signal.is_aborted());
    }

    #[test]
    fn late_registration_fires_immediately() {
        let mgr = mgr();
        let (client, corr) = ids(1);
        must_admit(&mgr, &client, &corr);
        mgr.mark_terminal(&client, &corr);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let registration = mgr.register_cancel(&client, &corr, Box::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(registration.is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_removes_the_observer() {
        let mgr = mgr();
        let (client, corr) = ids(1);
        must_admit(&mgr, &client, &corr);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let registration = mgr
            .register_cancel(&client, &corr, Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        registration.unregister();
        mgr.on_client_abort(&client, &corr);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disconnect_cancels_everything() {
        let mgr = mgr();
        let client = ClientId::from("c");
        let other = ClientId::from("d");
        let s1 = must_admit(&mgr, &client, &CorrelationId::from("r1"));
        let s2 = must_admit(&mgr, &client, &CorrelationId::from("r2"));
        let s3 = must_admit(&mgr, &other, &CorrelationId::from("r1"));
        let fired = Arc::new(AtomicUsize::new(0));
        for corr in ["r1", "r2"] {
            let f = Arc::clone(&fired);
            mgr.register_cancel(&client, &CorrelationId::from(corr), Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }));
        }
        mgr.on_disconnect(&client);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(s1.is_aborted());
        assert!(s2.is_aborted());
        // Other connections are untouched.
        assert!(!s3.is_aborted());
        assert_eq!(mgr.pending_count(&client), 0);
        assert_eq!(mgr.pending_count(&other), 1);
    }

    #[test]
    fn sweep_expires_deadlines() {
        let mgr = mgr();
        let (client, corr) = ids(1);
        let now = Instant::now();
        let AdmitOutcome::Admitted { signal } =
            mgr.admit(&client, &corr, now, now + Duration::from_secs(5))
        else {
            panic!("admission refused");
        };
        let swept = mgr.sweep(now + Duration::from_secs(6));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].reason, SweepReason::DeadlineExpired);
        assert_eq!(swept[0].correlation_id, corr);
        assert!(signal.is_aborted());
        assert!(mgr.is_terminal(&client, &corr));
    }

    #[test]
    fn sweep_cancels_idle_records() {
        let mgr = mgr();
        let (client, corr) = ids(1);
        let now = Instant::now();
        // Far-off deadline; only idleness can retire it.
        let AdmitOutcome::Admitted { .. } =
            mgr.admit(&client, &corr, now, now + Duration::from_secs(600))
        else {
            panic!("admission refused");
        };
        assert!(mgr.sweep(now + Duration::from_secs(39)).is_empty());
        let swept = mgr.sweep(now + Duration::from_secs(41));
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].reason, SweepReason::Idle);
    }

    #[test]
    fn sweep_reaps_terminal_records_after_the_window() {
        let mgr = mgr();
        let (client, corr) = ids(1);
        let now = Instant::now();
        must_admit(&mgr, &client, &corr);
        mgr.mark_terminal(&client, &corr);
        // Within the window the record lingers and dedups.
        assert!(mgr.sweep(now + Duration::from_secs(1)).is_empty());
        assert!(matches!(
            mgr.admit(&client, &corr, now, now + Duration::from_secs(30)),
            AdmitOutcome::Duplicate
        ));
        // After the window it is gone, and the correlation is reusable.
        mgr.sweep(now + Duration::from_secs(90));
        let AdmitOutcome::Admitted { .. } =
            mgr.admit(&client, &corr, now, now + Duration::from_secs(30))
        else {
            panic!("correlation was not reusable after the dedup window");
        };
    }

    #[test]
    fn progress_keeps_a_record_alive() {
        let mgr = mgr();
        let (client, corr) = ids(1);
        must_admit(&mgr, &client, &corr);
        assert!(mgr.touch_progress(&client, &corr));
        mgr.mark_terminal(&client, &corr);
        assert!(!mgr.touch_progress(&client, &corr));
    }
}
