//! Message buffer — holds traffic for a peer that cannot be reached live
//!
//! Messages destined for an unreachable peer accumulate here until one of
//! three limits trips (count, cumulative bytes, age of the oldest entry) or
//! a manual flush is requested. A flush snapshots the contents in insertion
//! order, clears the buffer, and hands the snapshot to every registered
//! listener along with a flag saying whether a fullness condition (count,
//! size, or age) caused it.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// Buffer limits. Immutable once the buffer is constructed.
#[derive(Debug, Clone)]
pub struct MessageBufferConfig {
    /// Flush when this many messages are buffered
    pub count_limit: usize,
    /// Flush when buffered messages exceed this many bytes in total
    pub size_limit: u64,
    /// Flush when the oldest unflushed message has waited this long
    pub age_limit: Duration,
    /// Attempts for the wake-up call triggered by a flush
    pub push_retries: u32,
}

impl Default for MessageBufferConfig {
    fn default() -> Self {
        Self {
            count_limit: 10,
            size_limit: u64::MAX,
            age_limit: Duration::from_secs(300), // 5 minutes
            push_retries: 5,
        }
    }
}

/// A buffered message: opaque payload plus its encoded byte length
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedMessage<T> {
    /// The payload, already encoded by the caller
    pub payload: T,
    /// Encoded length in bytes, as reported at insert time
    pub size_bytes: u64,
}

/// Flush listener: receives the flushed batch in insertion order and
/// whether a fullness condition (count/size/age) triggered the flush.
pub type FlushListener<T> = Arc<dyn Fn(&[BufferedMessage<T>], bool) + Send + Sync>;

/// One-shot age timer. `done` guards against the timer firing and a
/// count/size flush both consuming the same cancellation.
struct AgeTimer {
    done: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl AgeTimer {
    /// Cancel if the timer has not fired yet; safe to call from the timer
    /// task itself (the swap is then a no-op).
    fn cancel(&self) {
        self.done.swap(true, Ordering::AcqRel);
        self.task.abort();
    }
}

struct BufferState<T> {
    entries: Vec<BufferedMessage<T>>,
    total_bytes: u64,
    age_timer: Option<AgeTimer>,
}

/// Generic transport-agnostic message buffer.
///
/// `add_message` and the flush paths serialize on one mutex; listener
/// invocation happens after the buffer is cleared and outside the lock, so
/// a listener that re-enters `add_message` observes an empty buffer.
///
/// Age timers are spawned on the ambient tokio runtime; constructing and
/// using a buffer requires a runtime context. The timer holds only a weak
/// reference, so dropping the buffer also retires its timer.
pub struct MessageBuffer<T> {
    config: MessageBufferConfig,
    state: Mutex<BufferState<T>>,
    listeners: RwLock<Vec<FlushListener<T>>>,
}

impl<T: Send + 'static> MessageBuffer<T> {
    /// Create a buffer with the given limits
    pub fn new(config: MessageBufferConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(BufferState {
                entries: Vec::new(),
                total_bytes: 0,
                age_timer: None,
            }),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Create a buffer with default limits
    pub fn with_defaults() -> Arc<Self> {
        Self::new(MessageBufferConfig::default())
    }

    /// Register a flush listener. All listeners receive every flush.
    pub fn add_listener(&self, listener: FlushListener<T>) {
        self.listeners.write().push(listener);
    }

    /// Buffer limits in effect
    pub fn config(&self) -> &MessageBufferConfig {
        &self.config
    }

    /// Append a message. The first message since the buffer was last empty
    /// starts the age timer; exceeding the count or size limit cancels the
    /// timer and flushes with `triggered_by_full = true`.
    pub fn add_message(self: &Arc<Self>, payload: T, size_bytes: u64) {
        let batch = {
            let mut state = self.state.lock();
            state.entries.push(BufferedMessage {
                payload,
                size_bytes,
            });
            state.total_bytes = state.total_bytes.saturating_add(size_bytes);

            if state.entries.len() == 1 {
                state.age_timer = Some(self.start_age_timer());
            }

            if state.entries.len() >= self.config.count_limit
                || state.total_bytes >= self.config.size_limit
            {
                Self::drain_locked(&mut state)
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            debug!(messages = batch.len(), "buffer full, flushing");
            self.notify(&batch, true);
        }
    }

    /// Flush whatever is buffered, cancelling any pending age timer.
    /// A no-op on an empty buffer: listeners are not invoked.
    pub fn flush_now(self: &Arc<Self>) {
        let batch = {
            let mut state = self.state.lock();
            Self::drain_locked(&mut state)
        };

        if let Some(batch) = batch {
            debug!(messages = batch.len(), "manual flush");
            self.notify(&batch, false);
        }
    }

    /// Number of currently buffered messages
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True when nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Cumulative byte size of buffered messages
    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    /// Snapshot-and-clear under the lock. Returns None when empty.
    fn drain_locked(state: &mut BufferState<T>) -> Option<Vec<BufferedMessage<T>>> {
        if let Some(timer) = state.age_timer.take() {
            timer.cancel();
        }
        if state.entries.is_empty() {
            return None;
        }
        state.total_bytes = 0;
        Some(std::mem::take(&mut state.entries))
    }

    fn start_age_timer(self: &Arc<Self>) -> AgeTimer {
        let done = Arc::new(AtomicBool::new(false));
        let fired = Arc::clone(&done);
        let weak: Weak<Self> = Arc::downgrade(self);
        let age_limit = self.config.age_limit;

        let task = tokio::spawn(async move {
            tokio::time::sleep(age_limit).await;

            // One-shot: lose the race against a count/size/manual flush
            // and this firing is void.
            if fired
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            let Some(buffer) = weak.upgrade() else {
                return;
            };

            let batch = {
                let mut state = buffer.state.lock();
                Self::drain_locked(&mut state)
            };

            if let Some(batch) = batch {
                debug!(messages = batch.len(), "age limit reached, flushing");
                buffer.notify(&batch, true);
            }
        });

        AgeTimer { done, task }
    }

    /// Invoke every listener with the same snapshot. A panicking listener
    /// is isolated; the buffer and the remaining listeners are unaffected.
    fn notify(&self, batch: &[BufferedMessage<T>], triggered_by_full: bool) {
        let listeners: Vec<FlushListener<T>> = self.listeners.read().clone();
        for listener in &listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(batch, triggered_by_full)
            }));
            if result.is_err() {
                warn!("flush listener panicked; continuing with remaining listeners");
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
