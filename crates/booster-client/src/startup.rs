//! Startup-end signalling (SPEC_FULL.md §4.8): the embedding runtime tells
//! this crate when the process has finished its startup phase, which gates
//! when CLR/CDS contribution and AOT fetch are allowed to begin.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Reason the embedder gave for firing the startup-end signal. Carried only
/// for logging; this crate does not branch on it.
#[derive(Debug, Clone)]
pub struct StartupSignal(pub String);

/// One-shot latch the embedder fires once at end of startup
/// (`BoosterStartupMaxTime` is the fallback if it never fires).
#[derive(Debug, Default)]
pub struct StartupGate {
    fired: AtomicBool,
    notify: Notify,
}

impl StartupGate {
    /// Creates a gate that has not yet fired.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the gate. Idempotent: firing twice is a no-op past the first
    /// call.
    pub fn fire(&self, signal: &StartupSignal) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            tracing::debug!(reason = %signal.0, "startup end signalled");
            self.notify.notify_waiters();
        }
    }

    /// Whether the gate has fired.
    #[must_use]
    pub fn is_startup_end(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Waits for the gate to fire. Returns immediately if it already has.
    pub async fn wait(&self) {
        if self.is_startup_end() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_startup_end() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_once_fired() {
        let gate = StartupGate::new();
        assert!(!gate.is_startup_end());
        gate.fire(&StartupSignal("main entered".to_string()));
        assert!(gate.is_startup_end());
        gate.wait().await;
    }

    #[test]
    fn fire_is_idempotent() {
        let gate = StartupGate::new();
        gate.fire(&StartupSignal("a".to_string()));
        gate.fire(&StartupSignal("b".to_string()));
        assert!(gate.is_startup_end());
    }
}
