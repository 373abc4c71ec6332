//! Open-connection accounting.
//!
//! The accept loop opens a [`ConnGuard`] per accepted connection; the guard
//! decrements the counter when the connection task finishes, panics
//! included. The connection-cap middleware reads [`ConnectionWatcher::count`]
//! to reject requests early, and the gauge/counters expose the same numbers
//! under the `httpserver_` metric sub-prefix.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use metrics::{Counter, Gauge};
use tracing::debug;

use crate::metrics::MetricsRegistry;

/// Transport-level remote address of the current connection, attached to
/// every request as an extension by the accept loop.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);

pub struct ConnectionWatcher {
    currently_open: AtomicI64,
    open_gauge: Gauge,
    opened_total: Counter,
    closed_total: Counter,
}

impl ConnectionWatcher {
    #[must_use]
    pub fn new(registry: &MetricsRegistry) -> Self {
        Self {
            currently_open: AtomicI64::new(0),
            open_gauge: registry.gauge("httpserver_incoming_connections", &[]),
            opened_total: registry.counter("httpserver_incoming_connections_opened_total", &[]),
            closed_total: registry.counter("httpserver_incoming_connections_closed_total", &[]),
        }
    }

    /// Current number of open connections.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.currently_open.load(Ordering::Relaxed)
    }

    /// Account for a newly accepted connection; the returned guard closes
    /// the books when dropped.
    #[must_use]
    pub fn guard(self: &Arc<Self>, remote: SocketAddr) -> ConnGuard {
        let open = self.currently_open.fetch_add(1, Ordering::Relaxed) + 1;
        self.open_gauge.set(open as f64);
        self.opened_total.increment(1);
        debug!(%remote, open, "incoming connection opened");
        ConnGuard {
            watcher: Arc::clone(self),
            remote,
        }
    }
}

/// RAII handle for one open connection.
pub struct ConnGuard {
    watcher: Arc<ConnectionWatcher>,
    remote: SocketAddr,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let open = self.watcher.currently_open.fetch_sub(1, Ordering::Relaxed) - 1;
        self.watcher.open_gauge.set(open as f64);
        self.watcher.closed_total.increment(1);
        debug!(remote = %self.remote, open, "incoming connection closed");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
