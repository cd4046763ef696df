//! Cancellation signals for in-flight RPCs.
//!
//! An RPC handler is never killed: cancellation is cooperative.  When a
//! request is aborted (client `$ws:abort`, disconnect, idle sweep, deadline),
//! the record's [`AbortHandle`] fires and every [`AbortSignal`] observing it
//! resolves.  The one-shot guard suppresses whatever the handler tries to
//! send afterwards.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures::Future;

/// State shared between a handle and its signals.
struct Inner {
    /// Whether the handle has fired.
    aborted: bool,
    /// Wakers for every [`Aborted`] future currently being polled.
    wakers: Vec<Waker>,
}

/// The firing side of a cancellation signal.
///
/// Owned by the RPC record; fires at most once.
#[derive(Clone)]
pub(crate) struct AbortHandle {
    /// Shared state.
    inner: Arc<Mutex<Inner>>,
}

/// The observing side of a cancellation signal.
///
/// Cheap to clone; handed to handler contexts.  All clones observe the same
/// underlying request.
#[derive(Clone)]
pub struct AbortSignal {
    /// Shared state.
    inner: Arc<Mutex<Inner>>,
}

/// Create a connected handle/signal pair.
pub(crate) fn abort_pair() -> (AbortHandle, AbortSignal) {
    let inner = Arc::new(Mutex::new(Inner {
        aborted: false,
        wakers: Vec::new(),
    }));
    (
        AbortHandle {
            inner: Arc::clone(&inner),
        },
        AbortSignal { inner },
    )
}

impl AbortHandle {
    /// Fire the signal.  Returns true if this call was the one that fired it.
    pub(crate) fn fire(&self) -> bool {
        let wakers = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if inner.aborted {
                return false;
            }
            inner.aborted = true;
            std::mem::take(&mut inner.wakers)
        };
        // Wake outside the lock: a waker may re-enter observer code.
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl AbortSignal {
    /// Return true if the request has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.lock().expect("lock poisoned").aborted
    }

    /// Return a future that resolves when the request is aborted.
    ///
    /// If the request is already aborted, the future is immediately ready.
    pub fn aborted(&self) -> Aborted {
        Aborted {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Future returned by [`AbortSignal::aborted`].
pub struct Aborted {
    /// Shared state.
    inner: Arc<Mutex<Inner>>,
}

impl Future for Aborted {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.aborted {
            return Poll::Ready(());
        }
        if let Some(existing) = inner.wakers.iter_mut().find(|w| w.will_wake(cx.waker())) {
            existing.clone_from(cx.waker());
        } else {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
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
    use futures::FutureExt as _;

    #[test]
    fn starts_unfired() {
        let (_handle, signal) = abort_pair();
        assert!(!signal.is_aborted());
        assert_eq!(signal.aborted().now_or_never(), None);
    }

    #[test]
    fn fire_resolves_pending_observers() {
        let (handle, signal) = abort_pair();
        assert!(handle.fire());
        assert!(signal.is_aborted());
        assert_eq!(signal.aborted().now_or_never(), Some(()));
    }

    #[test]
    fn fires_at_most_once() {
        let (handle, _signal) = abort_pair();
        assert!(handle.fire());
        assert!(!handle.fire());
    }

    #[tokio::test]
    async fn wakes_concurrent_observers() {
        let (handle, signal) = abort_pair();
        let a = signal.aborted();
        let b = signal.clone().aborted();
        let ((), (), ()) = futures::join!(a, b, async move {
            tokio::task::yield_now().await;
            handle.fire();
        });
    }
}
