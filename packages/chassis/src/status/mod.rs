//! Per-service readiness accounting.
//!
//! The orchestrator owns one [`StatusRegister`]; every registered service
//! receives a [`ServiceReporter`] handle scoped to its own name. Aggregate
//! readiness is the conjunction over all per-service bits and is what the
//! operations server exposes on `/ready`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Shared mutable state behind every reporter handle.
///
/// Queries take shared access, mutations exclusive. `alive` starts true and
/// is a one-way transition: once `dead()` is called it never reverts.
#[derive(Debug, Default)]
struct StatusInner {
    alive: bool,
    ready: HashMap<String, bool>,
}

/// Error returned when a service name is registered twice.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("service already registered: {0}")]
pub struct AlreadyRegistered(pub String);

/// Concurrent readiness aggregate consumed by orchestrator probes.
#[derive(Debug, Clone)]
pub struct StatusRegister {
    inner: Arc<RwLock<StatusInner>>,
}

impl StatusRegister {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StatusInner {
                alive: true,
                ready: HashMap::new(),
            })),
        }
    }

    /// Allocate a reporter handle for `name`. Each name starts not-ready and
    /// is never removed; registering the same name twice fails.
    pub fn register(&self, name: &str) -> Result<ServiceReporter, AlreadyRegistered> {
        let mut inner = self.inner.write();
        if inner.ready.contains_key(name) {
            return Err(AlreadyRegistered(name.to_string()));
        }
        inner.ready.insert(name.to_string(), false);
        Ok(ServiceReporter {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        })
    }

    /// True iff every registered service most recently reported ready.
    /// An empty register is vacuously ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.read().ready.values().all(|ready| *ready)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.read().alive
    }

    /// Flip every registered service to not-ready. Called by the orchestrator
    /// at the start of the shutdown tail so probes observe the transition
    /// before the process exits.
    pub fn set_all_not_ready(&self) {
        let mut inner = self.inner.write();
        for ready in inner.ready.values_mut() {
            *ready = false;
        }
    }
}

impl Default for StatusRegister {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-service handle for driving the shared readiness aggregate.
#[derive(Debug, Clone)]
pub struct ServiceReporter {
    inner: Arc<RwLock<StatusInner>>,
    name: String,
}

impl ServiceReporter {
    /// Service is up and may receive traffic.
    pub fn ready(&self) {
        self.inner.write().ready.insert(self.name.clone(), true);
    }

    /// Temporary outage; recovery expected.
    pub fn not_ready(&self) {
        self.inner.write().ready.insert(self.name.clone(), false);
    }

    /// Service is down for good. Clears the process-wide alive bit; the bit
    /// never reverts.
    pub fn dead(&self) {
        self.inner.write().alive = false;
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_register_is_ready_and_alive() {
        let status = StatusRegister::new();
        assert!(status.is_ready());
        assert!(status.is_alive());
    }

    #[test]
    fn registered_service_starts_not_ready() {
        let status = StatusRegister::new();
        let _reporter = status.register("ingest").unwrap();
        assert!(!status.is_ready());
    }

    #[test]
    fn duplicate_registration_fails() {
        let status = StatusRegister::new();
        let _first = status.register("ingest").unwrap();
        let err = status.register("ingest").unwrap_err();
        assert_eq!(err, AlreadyRegistered("ingest".to_string()));
    }

    #[test]
    fn ready_is_conjunction_over_all_services() {
        let status = StatusRegister::new();
        let a = status.register("a").unwrap();
        let b = status.register("b").unwrap();

        a.ready();
        assert!(!status.is_ready(), "one of two services still not ready");

        b.ready();
        assert!(status.is_ready());

        a.not_ready();
        assert!(!status.is_ready(), "reporters may toggle back");
    }

    #[test]
    fn dead_clears_alive_permanently() {
        let status = StatusRegister::new();
        let reporter = status.register("worker").unwrap();

        assert!(status.is_alive());
        reporter.dead();
        assert!(!status.is_alive());

        // Readiness is tracked independently of the alive bit.
        reporter.ready();
        assert!(status.is_ready());
        assert!(!status.is_alive());
    }

    #[test]
    fn set_all_not_ready_flips_every_entry() {
        let status = StatusRegister::new();
        let a = status.register("a").unwrap();
        let b = status.register("b").unwrap();
        a.ready();
        b.ready();
        assert!(status.is_ready());

        status.set_all_not_ready();
        assert!(!status.is_ready());
    }

    #[test]
    fn reporter_visible_across_clones() {
        let status = StatusRegister::new();
        let reporter = status.register("svc").unwrap();
        let view = status.clone();

        reporter.ready();
        assert!(view.is_ready());
    }
}
