//! An interruptible rendezvous barrier.
//!
//! `std::sync::Barrier` cannot be forced to release its waiters early, which
//! makes it unusable for shutdown: a worker parked inside it would block the
//! `join` in `Drop` forever. This is a "mutex + condvar + generation
//! counter" barrier instead, with a shared `must_exit` flag checked both
//! before and after the wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// How long a parked thread waits between `must_exit` re-checks. Bounded so
/// shutdown is always observed promptly even if a spurious wakeup is missed.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

struct State {
    count: usize,
    generation: u64,
}

/// A barrier for exactly `size` participants per generation, releasable
/// early via [`Barrier::release_all`] in conjunction with a shared
/// `must_exit` flag.
pub struct Barrier {
    state: Mutex<State>,
    condvar: Condvar,
    size: usize,
    must_exit: Arc<AtomicBool>,
}

/// The outcome of a [`Barrier::wait`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// This generation completed normally.
    Completed,
    /// The wait was abandoned because `must_exit` was observed.
    ShuttingDown,
}

impl Barrier {
    pub fn new(size: usize, must_exit: Arc<AtomicBool>) -> Self {
        assert!(size > 0, "a barrier must have at least one participant");
        Self {
            state: Mutex::new(State { count: 0, generation: 0 }),
            condvar: Condvar::new(),
            size,
            must_exit,
        }
    }

    /// Blocks the caller until `size` participants have called `wait` for
    /// the current generation, or until `must_exit` is observed.
    pub fn wait(&self) -> WaitResult {
        if self.must_exit.load(Ordering::Acquire) {
            return WaitResult::ShuttingDown;
        }

        let mut guard = self.state.lock();
        let my_generation = guard.generation;
        guard.count += 1;

        if guard.count == self.size {
            guard.count = 0;
            guard.generation = guard.generation.wrapping_add(1);
            self.condvar.notify_all();
            return WaitResult::Completed;
        }

        while guard.generation == my_generation {
            if self.must_exit.load(Ordering::Acquire) {
                return WaitResult::ShuttingDown;
            }
            self.condvar.wait_for(&mut guard, POLL_INTERVAL);
        }

        WaitResult::Completed
    }

    /// Wakes every thread currently parked in [`Barrier::wait`]. Called once
    /// during shutdown, after `must_exit` has been set, so each waiter's
    /// post-wakeup `must_exit` check observes the shutdown request.
    pub fn release_all(&self) {
        self.condvar.notify_all();
    }
}
