//! Cooperative shutdown.
//!
//! One [`ShutdownController`] per process run; every long-running worker
//! (servers, service `run` loops, signal watcher) holds a [`Shutdown`]
//! token derived from it. There is no partial cancellation: the first
//! trigger tears everything down together.

use tokio::sync::watch;

/// Owner side of the cancellation scope.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Derive a token observing this scope.
    #[must_use]
    pub fn token(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }

    /// Cancel the scope. Idempotent.
    pub fn trigger(&self) {
        // Ignore send errors -- receivers may have been dropped.
        let _ = self.tx.send(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-side cancellation token.
///
/// Cheap to clone; workers must return from `run` promptly once
/// [`Shutdown::cancelled`] resolves.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Resolves when the scope is cancelled. A dropped controller counts
    /// as cancellation so workers never hang on a dead scope.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
