//! Session bookkeeping shared by both relay variants
//!
//! Both the persistent and the push client keep the same small amount of
//! state: how many consecutive relay contacts failed, whether the session
//! has been shut down, and who wants to hear about the session closing.
//! The session moves from `Active` to `Failed` exactly once; there is no
//! way back — callers open a fresh session to retry.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, info};

/// Consecutive contact failures tolerated before a session fails
pub const MAX_RELAY_FAILURES: u32 = 5;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session is usable
    Active,
    /// Session failed or was shut down; terminal
    Failed,
}

/// Callback fired once when a session closes
pub type CloseListener = Box<dyn FnOnce() + Send>;

/// Failure counter, shutdown flag, and close-listener registry.
///
/// Composed into both client variants and into the server's per-peer
/// forwarders rather than inherited, so each side keeps exactly the
/// bookkeeping it needs.
pub struct SessionBookkeeping {
    failure_count: AtomicU32,
    max_failures: u32,
    failed: AtomicBool,
    shutdown: AtomicBool,
    close_listeners: Mutex<Vec<CloseListener>>,
}

impl SessionBookkeeping {
    /// Bookkeeping with the default failure tolerance
    pub fn new() -> Self {
        Self::with_max_failures(MAX_RELAY_FAILURES)
    }

    /// Bookkeeping with a custom failure tolerance
    pub fn with_max_failures(max_failures: u32) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            max_failures,
            failed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            close_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Current consecutive-failure count
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Session state
    pub fn state(&self) -> SessionState {
        if self.failed.load(Ordering::Acquire) {
            SessionState::Failed
        } else {
            SessionState::Active
        }
    }

    /// True once `shutdown()` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Register a listener fired once when the session closes. If the
    /// session already failed the listener fires immediately.
    pub fn add_close_listener(&self, listener: CloseListener) {
        if self.failed.load(Ordering::Acquire) {
            listener();
            return;
        }
        let mut listeners = self.close_listeners.lock();
        // Re-check under the lock: fail() drains exactly once
        if self.failed.load(Ordering::Acquire) {
            drop(listeners);
            listener();
        } else {
            listeners.push(listener);
        }
    }

    /// A relay contact failed. Returns the new count; crossing the
    /// tolerance fails the session and fires close listeners.
    pub fn record_failure(&self) -> u32 {
        let count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(count, "relay contact failed");
        if count > self.max_failures {
            self.fail();
        }
        count
    }

    /// A relay contact (or liveness signal) succeeded; the counter resets.
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
    }

    /// Move to `Failed` and fire close listeners exactly once.
    pub fn fail(&self) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("relay session failed, notifying close listeners");
        let listeners: Vec<CloseListener> = std::mem::take(&mut *self.close_listeners.lock());
        for listener in listeners {
            listener();
        }
    }

    /// Idempotent shutdown: subsequent sends fail fast, close listeners
    /// fire (once) so the owner can pick a replacement relay.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.fail();
    }
}

impl Default for SessionBookkeeping {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_fresh_session_is_active_with_zero_failures() {
        let session = SessionBookkeeping::new();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.failure_count(), 0);
    }

    #[test]
    fn test_failure_below_threshold_stays_active() {
        let session = SessionBookkeeping::new();
        for _ in 0..MAX_RELAY_FAILURES {
            session.record_failure();
        }
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.failure_count(), MAX_RELAY_FAILURES);
    }

    #[test]
    fn test_exceeding_threshold_fails_session() {
        let session = SessionBookkeeping::new();
        for _ in 0..=MAX_RELAY_FAILURES {
            session.record_failure();
        }
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_success_resets_counter() {
        let session = SessionBookkeeping::new();
        session.record_failure();
        session.record_failure();
        assert_eq!(session.failure_count(), 2);

        session.record_success();
        assert_eq!(session.failure_count(), 0);
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn test_close_listeners_fire_once() {
        let session = SessionBookkeeping::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        session.add_close_listener(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        session.fail();
        session.fail();
        session.shutdown();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_added_after_failure_fires_immediately() {
        let session = SessionBookkeeping::new();
        session.fail();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        session.add_close_listener(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_fails_session() {
        let session = SessionBookkeeping::new();
        session.shutdown();
        session.shutdown();

        assert!(session.is_shut_down());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_custom_failure_tolerance() {
        let session = SessionBookkeeping::with_max_failures(1);
        session.record_failure();
        assert_eq!(session.state(), SessionState::Active);
        session.record_failure();
        assert_eq!(session.state(), SessionState::Failed);
    }
}
