//! Server-side liveness tracking for push-relayed peers
//!
//! The unreachable peer promises a map update every `interval`. The relay
//! stretches that promise by a tolerance factor (default 1.5) before
//! declaring the peer offline, absorbing scheduler jitter on mobile
//! devices. Timestamps only ever move forward: a reordered or stale map
//! update cannot make a live peer look older than it is.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Default stretch applied to the promised map-update interval
pub const DEFAULT_LIVENESS_STRETCH: f64 = 1.5;

/// Callback fired once when a tracked peer is declared offline
pub type OfflineListener = Box<dyn FnOnce() + Send>;

/// Tracks whether an unreachable peer is still checking in.
pub struct LivenessTracker {
    /// Millisecond unix timestamp of the latest accepted refresh
    last_alive_ms: AtomicU64,
    /// Promised refresh interval
    interval: Duration,
    /// Tolerance multiplier on the interval
    stretch: f64,
    offline_listeners: Mutex<Vec<OfflineListener>>,
}

impl LivenessTracker {
    /// Tracker with the default 1.5x tolerance, stamped alive now
    pub fn new(interval: Duration) -> Self {
        Self::with_stretch(interval, DEFAULT_LIVENESS_STRETCH)
    }

    /// Tracker with a custom tolerance multiplier, stamped alive now
    pub fn with_stretch(interval: Duration, stretch: f64) -> Self {
        Self {
            last_alive_ms: AtomicU64::new(now_millis()),
            interval,
            stretch,
            offline_listeners: Mutex::new(Vec::new()),
        }
    }

    /// Promised refresh interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record a liveness refresh. Monotonic: the stamp only moves forward,
    /// so a reordered update cannot regress it.
    pub fn mark_alive(&self) {
        self.mark_alive_at(now_millis());
    }

    /// Record a refresh observed at `timestamp_ms`
    pub fn mark_alive_at(&self, timestamp_ms: u64) {
        self.last_alive_ms.fetch_max(timestamp_ms, Ordering::AcqRel);
    }

    /// Millisecond timestamp of the latest accepted refresh
    pub fn last_alive_ms(&self) -> u64 {
        self.last_alive_ms.load(Ordering::Acquire)
    }

    /// True while `now < last_alive + interval * stretch`
    pub fn is_alive(&self) -> bool {
        self.is_alive_at(now_millis())
    }

    /// Liveness judged at `now_ms`
    pub fn is_alive_at(&self, now_ms: u64) -> bool {
        let tolerated = (self.interval.as_millis() as f64 * self.stretch) as u64;
        now_ms < self.last_alive_ms().saturating_add(tolerated)
    }

    /// Register a listener fired once when the peer is declared offline
    pub fn add_offline_listener(&self, listener: OfflineListener) {
        self.offline_listeners.lock().push(listener);
    }

    /// Declare the peer offline and fire listeners. Buffered messages are
    /// not the tracker's concern; they live until their own age limit.
    pub fn declare_offline(&self) {
        debug!("peer declared offline");
        let listeners: Vec<OfflineListener> = std::mem::take(&mut *self.offline_listeners.lock());
        for listener in listeners {
            listener();
        }
    }
}

/// Current unix timestamp in milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// TESTS
// ============================================================================
