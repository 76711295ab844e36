//! A fetch-add counter shared across ranks.
//!
//! Rank 0 owns the value; with more than one rank it runs a background
//! server thread answering fetch-add requests over point-to-point messages.
//! With one rank (or on rank 0 itself) the counter degenerates to a local
//! atomic.

use crate::{Collective, Tag};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tracing::debug;

pub struct SharedAccumulator {
    atom: Arc<AtomicU64>,
    collective: Arc<dyn Collective>,
    tag: Tag,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl SharedAccumulator {
    pub fn new(collective: Arc<dyn Collective>, tag: Tag) -> Self {
        SharedAccumulator {
            atom: Arc::new(AtomicU64::new(0)),
            collective,
            tag,
            server: Mutex::new(None),
        }
    }

    /// Set the starting value and, on a multi-rank root, start the server.
    pub fn initialize(&self, init: u64) {
        self.atom.store(init, Ordering::Relaxed);
        if self.collective.size() > 1 && self.collective.rank() == 0 {
            let atom = self.atom.clone();
            let collective = self.collective.clone();
            let tag = self.tag;
            let handle = std::thread::spawn(move || {
                while let Some((val, src)) = collective.recv_server_u64(tag) {
                    let prev = atom.fetch_add(val, Ordering::Relaxed);
                    collective.send_u64(prev, src, tag);
                }
                debug!(target: "collective.accumulate", "accumulator server stopped");
            });
            *self.server.lock().expect("server slot poisoned") = Some(handle);
        }
    }

    /// Atomically add `val`, returning the previous value.
    pub fn fetch_add(&self, val: u64) -> u64 {
        if self.collective.rank() == 0 || self.collective.size() == 1 {
            return self.atom.fetch_add(val, Ordering::Relaxed);
        }
        self.collective.send_u64(val, 0, self.tag);
        self.collective.recv_u64(0, self.tag)
    }
}

impl Drop for SharedAccumulator {
    fn drop(&mut self) {
        if let Some(handle) = self.server.lock().expect("server slot poisoned").take() {
            self.collective.cancel_server(self.tag);
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Standalone;

    #[test]
    fn standalone_is_a_local_atomic() {
        let acc = SharedAccumulator::new(Arc::new(Standalone), Tag::ACCUMULATOR);
        acc.initialize(10);
        assert_eq!(acc.fetch_add(5), 10);
        assert_eq!(acc.fetch_add(1), 15);
        assert_eq!(acc.fetch_add(0), 16);
    }
}
