//! Synchronization Primitives
//!
//! Blocking building blocks shared by the chains of one sequence run:
//! - [`Event`]: a one-shot latch (start barriers, join releases, stop flag)
//! - [`TimeReference`]: the zero point of absolute waits
//! - [`JoinPoint`]: the meeting point of the chains entering a Branch block

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

/// A latch that stays set once set. Clones share the same latch.
#[derive(Debug, Clone, Default)]
pub struct Event {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sets the latch and wakes every waiter.
    pub fn set(&self) {
        *self.flag() = true;
        self.inner.1.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.flag()
    }

    /// Blocks until the latch is set.
    pub fn wait(&self) {
        let mut flag = self.flag();
        while !*flag {
            flag = self.inner.1.wait(flag).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Blocks until the latch is set or the timeout expires.
    ///
    /// Returns true if the latch is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut flag = self.flag();
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            flag = self
                .inner
                .1
                .wait_timeout(flag, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }
}

/// Shared zero point of a sequence run.
///
/// Written at the start of the run and by TimeInit blocks, read by absolute
/// Wait blocks.
#[derive(Debug, Clone)]
pub struct TimeReference {
    origin: Arc<RwLock<Instant>>,
}

impl TimeReference {
    pub fn new() -> Self {
        Self {
            origin: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Moves the zero point to now.
    pub fn reset(&self) {
        *self.origin.write().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Time elapsed since the zero point.
    pub fn elapsed(&self) -> Duration {
        self.origin
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Blocks until `target` has elapsed since the zero point.
    ///
    /// The zero point is re-read after each sleep, so a concurrent reset
    /// pushes the deadline back. Returns false if `stop` is set first.
    pub fn wait_until(&self, target: Duration, stop: &Event) -> bool {
        loop {
            let remaining = target.saturating_sub(self.elapsed());
            if remaining.is_zero() {
                return !stop.is_set();
            }
            if stop.wait_timeout(remaining) {
                return false;
            }
        }
    }
}

impl Default for TimeReference {
    fn default() -> Self {
        Self::new()
    }
}

/// Meeting point of the chains entering a Branch block.
///
/// Fires once `expected` arrivals have been counted; the chain executing
/// the Branch block then releases the chains gated behind it.
#[derive(Debug)]
pub struct JoinPoint {
    expected: usize,
    arrived: AtomicUsize,
    complete: Event,
    release: Event,
}

impl JoinPoint {
    pub fn new(expected: usize) -> Self {
        let join = Self {
            expected,
            arrived: AtomicUsize::new(0),
            complete: Event::new(),
            release: Event::new(),
        };
        if expected == 0 {
            join.complete.set();
        }
        join
    }

    /// Counts one arrival.
    pub fn arrive(&self) {
        let arrived = self.arrived.fetch_add(1, Ordering::SeqCst) + 1;
        if arrived >= self.expected {
            self.complete.set();
        }
    }

    pub fn arrived(&self) -> usize {
        self.arrived.load(Ordering::SeqCst)
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.arrived() >= self.expected
    }

    /// Blocks until every expected arrival happened.
    ///
    /// The completion latch is also set by a stop request; returns false if
    /// woken before all arrivals.
    pub fn wait_all(&self) -> bool {
        self.complete.wait();
        self.is_complete()
    }

    /// Opens the barrier of the chains gated behind this join point.
    pub fn release(&self) {
        self.release.set();
    }

    pub fn is_released(&self) -> bool {
        self.release.is_set()
    }

    /// Latch set on completion (or stop).
    pub fn completion_event(&self) -> &Event {
        &self.complete
    }

    /// Latch opened by [`release`](Self::release) (or stop).
    pub fn release_event(&self) -> &Event {
        &self.release
    }
}
