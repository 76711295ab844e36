//! Per-(thread, stream) timepoint staging with bounded-disorder sorting.
//!
//! Streams declare a disorder bound K. The sort buffer holds K+2 slots: K+1
//! working entries plus one to detect that the input was more than
//! K-disordered. Once the working set is full, each new point evicts the
//! buffered minimum in sorted order; a new point older than that minimum is
//! an over-bound violation and the whole stream must be replayed.

use crate::context::Context;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// Timestamps are nanoseconds.
pub type Ns = u64;

/// Staging vectors hand off to Sinks in batches of this size.
pub const STAGING_FLUSH: usize = 4096;

/// The fallback disorder bound tried after the declared bound fails.
pub const FALLBACK_DISORDER: u32 = 1023;

pub trait Timestamped {
    fn time(&self) -> Ns;
}

/// A context-stream timepoint: "thread was at `context` at `time`".
#[derive(Debug, Clone)]
pub struct CtxTimepoint {
    pub time: Ns,
    pub context: Arc<Context>,
}

impl Timestamped for CtxTimepoint {
    fn time(&self) -> Ns {
        self.time
    }
}

/// A metric-stream timepoint: "metric had `value` at `time`".
#[derive(Debug, Clone, Copy)]
pub struct MetricTimepoint {
    pub time: Ns,
    pub value: f64,
}

impl Timestamped for MetricTimepoint {
    fn time(&self) -> Ns {
        self.time
    }
}

struct HeapEntry<T>(T);

impl<T: Timestamped> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.time() == other.0.time()
    }
}
impl<T: Timestamped> Eq for HeapEntry<T> {}
impl<T: Timestamped> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T: Timestamped> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.time().cmp(&other.0.time())
    }
}

/// Bounded-disorder sort buffer.
///
/// `bound == 0` means the stream declared itself in-order and the buffer is
/// bypassed entirely.
pub struct SortBuf<T> {
    bound: usize,
    heap: BinaryHeap<Reverse<HeapEntry<T>>>,
}

impl<T: Timestamped> Default for SortBuf<T> {
    fn default() -> Self {
        SortBuf { bound: 0, heap: BinaryHeap::new() }
    }
}

impl<T: Timestamped> SortBuf<T> {
    /// `bound` is the total slot count, K+2 for a K-disordered stream.
    pub fn new(bound: usize) -> Self {
        assert!(bound >= 2, "sort buffer needs a detection slot");
        SortBuf { bound, heap: BinaryHeap::with_capacity(bound) }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// The working set keeps one slot free for over-bound detection.
    pub fn full(&self) -> bool {
        self.heap.len() >= self.bound.saturating_sub(1)
    }

    /// Add a point while the working set is filling.
    pub fn push(&mut self, v: T) {
        debug_assert!(!self.full());
        self.heap.push(Reverse(HeapEntry(v)));
    }

    /// Evict the buffered minimum to make room for `v`. The second return is
    /// true when `v` is older than the eviction, i.e. the stream exceeded its
    /// disorder bound and the eviction must not be delivered.
    pub fn replace(&mut self, v: T) -> (T, bool) {
        debug_assert!(self.full());
        let Reverse(HeapEntry(evicted)) = self.heap.pop().expect("replace on empty sort buffer");
        let over = v.time() < evicted.time();
        if !over {
            self.heap.push(Reverse(HeapEntry(v)));
        }
        (evicted, over)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Drain the remaining points in ascending time order.
    pub fn sorted(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(Reverse(HeapEntry(v))) = self.heap.pop() {
            out.push(v);
        }
        out
    }
}

/// All staging state for one (thread, stream).
pub struct TimepointsData<T> {
    pub staging: Vec<T>,
    pub sort_buf: SortBuf<T>,
    /// Set when the stream gave up on bounded sorting; the whole stream is
    /// collected in `staging` and sorted at thread finalization.
    pub unbounded_disorder: bool,
}

impl<T: Timestamped> TimepointsData<T> {
    pub fn new(disorder_bound: u32) -> Self {
        let mut staging = Vec::new();
        staging.reserve(STAGING_FLUSH);
        TimepointsData {
            staging,
            sort_buf: if disorder_bound > 0 {
                // K+1 to detect >K disorder, plus one more working slot.
                SortBuf::new(disorder_bound as usize + 2)
            } else {
                SortBuf::default()
            },
            unbounded_disorder: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Timestamped for u64 {
        fn time(&self) -> Ns {
            *self
        }
    }

    fn run_stream(k: u32, times: &[u64]) -> Result<Vec<u64>, usize> {
        // Mirrors the pipeline's enqueue loop; Err(i) marks an over-bound
        // violation at input index i.
        let mut tpd = TimepointsData::<u64>::new(k);
        let mut out = Vec::new();
        for (i, &t) in times.iter().enumerate() {
            if tpd.sort_buf.bound() > 0 {
                if !tpd.sort_buf.full() {
                    tpd.sort_buf.push(t);
                    continue;
                }
                let (evicted, over) = tpd.sort_buf.replace(t);
                if over {
                    return Err(i);
                }
                out.push(evicted);
            } else {
                out.push(t);
            }
        }
        out.extend(tpd.sort_buf.sorted());
        Ok(out)
    }

    #[test]
    fn bounded_disorder_sorts() {
        // K=2 tolerates this interleaving.
        assert_eq!(run_stream(2, &[5, 3, 6, 4, 7, 8]), Ok(vec![3, 4, 5, 6, 7, 8]));
    }

    #[test]
    fn over_bound_detected() {
        // K=1 cannot absorb the 4 arriving after 10.
        assert_eq!(run_stream(1, &[5, 3, 10, 4]), Err(3));
    }

    #[test]
    fn in_order_stream_bypasses() {
        assert_eq!(run_stream(0, &[1, 2, 3]), Ok(vec![1, 2, 3]));
    }

    #[test]
    fn exact_bound_still_fits() {
        // Adjacent swaps are 1-disordered.
        assert_eq!(run_stream(1, &[2, 1, 4, 3, 6, 5]), Ok(vec![1, 2, 3, 4, 5, 6]));
    }
}
