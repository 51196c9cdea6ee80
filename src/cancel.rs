//! Cancellation and completion signalling
//! Set-once events shared between the broker, connections and the caller

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why the run is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// External request (ctrl-c or embedder)
    User,
    /// The configured global deadline expired
    TimeLimit,
}

struct CancelInner {
    flag: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    condvar: Condvar,
}

/// Process-wide cancellation token; the first cancel wins
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                reason: Mutex::new(None),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self, reason: CancelReason) {
        let mut slot = self.inner.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
            self.inner.flag.store(true, Ordering::SeqCst);
            self.inner.condvar.notify_all();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Relaxed)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.inner.reason.lock()
    }

    /// Block until cancelled or the timeout elapses; returns the reason if set
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CancelReason> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.reason.lock();
        while slot.is_none() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.inner.condvar.wait_for(&mut slot, deadline - now);
        }
        *slot
    }
}

/// Manual-reset completion event (the broker's done signal)
#[derive(Clone)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn set(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock() = true;
        condvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Returns true if the event was signalled before the timeout
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, condvar) = &*self.inner;
        let mut state = lock.lock();
        while !*state {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            condvar.wait_for(&mut state, deadline - now);
        }
        *state
    }
}
