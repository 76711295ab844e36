//! Worker-team synchronization helpers: one-shot signals and cooperative
//! workshares.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// A one-shot, idempotent signal. Waiters block until the first `signal`.
#[derive(Default)]
pub struct OnceSignal {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl OnceSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut fired = self.fired.lock().expect("once signal poisoned");
        if !*fired {
            *fired = true;
            self.cv.notify_all();
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.fired.lock().expect("once signal poisoned")
    }

    pub fn wait(&self) {
        let mut fired = self.fired.lock().expect("once signal poisoned");
        while !*fired {
            fired = self.cv.wait(fired).expect("once signal poisoned");
        }
    }
}

/// What one `help` call accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkshareResult {
    /// Whether this call did any work.
    pub contributed: bool,
    /// Whether the workshare has nothing left and never will.
    pub completed: bool,
}

impl WorkshareResult {
    pub fn idle_complete() -> Self {
        WorkshareResult { contributed: false, completed: true }
    }
}

/// A queue of work items processed cooperatively by whoever shows up.
///
/// Producers `push` until `fill_complete`; any thread may `contribute` to
/// drain. `completed` only reads true once the fill is closed, the queue is
/// empty, and no item is mid-processing.
pub struct Workshare<T> {
    items: Mutex<VecDeque<T>>,
    filled: AtomicBool,
    in_flight: AtomicUsize,
}

impl<T> Default for Workshare<T> {
    fn default() -> Self {
        Workshare {
            items: Mutex::new(VecDeque::new()),
            filled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }
}

impl<T> Workshare<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: T) {
        debug_assert!(!self.filled.load(Ordering::Acquire), "push after fill_complete");
        self.items.lock().expect("workshare poisoned").push_back(item);
    }

    pub fn fill_complete(&self) {
        self.filled.store(true, Ordering::Release);
    }

    /// Drain currently-queued items through `f`.
    pub fn contribute(&self, mut f: impl FnMut(T)) -> WorkshareResult {
        let mut contributed = false;
        loop {
            let item = {
                let mut q = self.items.lock().expect("workshare poisoned");
                match q.pop_front() {
                    Some(it) => {
                        self.in_flight.fetch_add(1, Ordering::AcqRel);
                        it
                    }
                    None => break,
                }
            };
            f(item);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            contributed = true;
        }
        let completed = self.filled.load(Ordering::Acquire)
            && self.in_flight.load(Ordering::Acquire) == 0
            && self.items.lock().expect("workshare poisoned").is_empty();
        WorkshareResult { contributed, completed }
    }
}
