//! Connection liveness: ping scheduling and stale-connection closes.
//!
//! When heartbeats are enabled, every connection gets a timer task.  Each
//! tick sends a transport-level ping (where the platform supports one) and
//! checks how long the connection has been silent; any inbound frame counts
//! as proof of life.  A connection silent for longer than
//! `interval + timeout` is reported to the stale hooks and closed with
//! 4000/`HEARTBEAT_TIMEOUT`.

use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::HeartbeatConfig;
use crate::connection::Connection;
use crate::transport::CloseCode;

/// Reason string sent with heartbeat closes.
const STALE_REASON: &str = "HEARTBEAT_TIMEOUT";

/// What to run when a connection goes stale, before it is closed.
pub(crate) type StaleAction = Box<dyn FnOnce(Arc<Connection>) -> BoxFuture<'static, ()> + Send>;

/// The heartbeat task for one connection.
///
/// Dropping the handle stops the task; the router drops it on close.
pub(crate) struct HeartbeatHandle {
    /// The timer task.
    task: JoinHandle<()>,
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start the heartbeat for `conn`.
pub(crate) fn start(
    conn: &Arc<Connection>,
    config: HeartbeatConfig,
    on_stale: StaleAction,
) -> HeartbeatHandle {
    let weak: Weak<Connection> = Arc::downgrade(conn);
    let mut on_stale = Some(on_stale);
    let task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(config.interval).await;
            let Some(conn) = weak.upgrade() else {
                break;
            };
            conn.socket().ping();
            if conn.idle_for() > config.interval + config.timeout {
                debug!(
                    "Connection {} is stale; closing ({STALE_REASON})",
                    conn.client_id()
                );
                if let Some(action) = on_stale.take() {
                    action(Arc::clone(&conn)).await;
                }
                conn.socket().close(CloseCode::HEARTBEAT_TIMEOUT, STALE_REASON);
                break;
            }
        }
    });
    HeartbeatHandle { task }
}
