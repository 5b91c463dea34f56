//! Timer heap: a min-heap of `(deadline, callback)`, with cancellation.
//!
//! Ordering is the classic reversed-`Ord` trick so that [`BinaryHeap`]
//! (a max-heap) pops the *earliest* deadline first, with ties broken by
//! insertion order so FIFO-within-a-tick (§5) holds.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::FiberId;
use crate::hub::Hub;

pub type TimerCallback = Box<dyn FnOnce(&Hub) + Send>;

/// A handle returned by [`TimerHeap::schedule`]. Cheap to clone and to
/// hold onto past the timer firing; [`TimerHeap::cancel`] on an
/// already-fired or already-cancelled handle is a documented no-op.
#[derive(Clone)]
pub struct TimerHandle {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }
}

struct TimerEntry {
    id: u64,
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
    /// `None` for a global timer; `Some(fiber)` for a local timer, which
    /// is eligible for bulk cancellation when `fiber` exits.
    bound_fiber: Option<FiberId>,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (max-heap) yields the earliest
        // deadline first; ties broken by insertion order (lower id
        // first), which realizes "earlier insertion wins" from §4.B.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
pub struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    next_id: AtomicU64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        delay: std::time::Duration,
        bound_fiber: Option<FiberId>,
        callback: TimerCallback,
    ) -> TimerHandle {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.heap.push(TimerEntry {
            id,
            deadline: Instant::now() + delay,
            cancelled: cancelled.clone(),
            bound_fiber,
            callback,
        });
        TimerHandle { id, cancelled }
    }

    /// Earliest pending (non-cancelled) deadline, if any. Cancelled
    /// entries still at the top are skipped without being popped, since
    /// we only peek here; `expire_ready` is what actually drains them.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|e| !e.cancelled.load(AtomicOrdering::SeqCst))
            .map(|e| e.deadline)
            .min()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Removes and invokes every non-cancelled callback whose deadline is
    /// `<= now`, in non-decreasing deadline order (ties by insertion
    /// order). Cancelled entries are dropped silently.
    pub fn expire_ready(&mut self, now: Instant, hub: &Hub) {
        let mut ready = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            ready.push(self.heap.pop().unwrap());
        }
        for entry in ready {
            if !entry.cancelled.load(AtomicOrdering::SeqCst) {
                (entry.callback)(hub);
            }
        }
    }

    /// Cancels every still-pending timer bound to `fiber`. Called when a
    /// fiber exits (invariant 6: timers belonging to a dead fiber must
    /// not fire).
    pub fn cancel_all_for_fiber(&mut self, fiber: FiberId) {
        for entry in self.heap.iter() {
            if entry.bound_fiber == Some(fiber) {
                entry.cancelled.store(true, AtomicOrdering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use std::sync::Mutex;
    use std::time::Duration;

    fn dummy_hub() -> Hub {
        Hub::new_for_test()
    }

    #[test]
    fn fires_in_deadline_order() {
        let hub = dummy_hub();
        let mut timers = TimerHeap::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        timers.schedule(Duration::from_millis(20), None, Box::new(move |_| o1.lock().unwrap().push(2)));
        let o2 = order.clone();
        timers.schedule(Duration::from_millis(5), None, Box::new(move |_| o2.lock().unwrap().push(1)));

        std::thread::sleep(Duration::from_millis(30));
        timers.expire_ready(Instant::now(), &hub);

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn cancel_is_idempotent() {
        let hub = dummy_hub();
        let mut timers = TimerHeap::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let handle = timers.schedule(Duration::from_millis(0), None, Box::new(move |_| {
            f.store(true, AtomicOrdering::SeqCst);
        }));
        handle.cancel();
        handle.cancel();
        timers.expire_ready(Instant::now() + Duration::from_millis(1), &hub);
        assert!(!fired.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let hub = dummy_hub();
        let mut timers = TimerHeap::new();
        let now = Instant::now();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let o = order.clone();
            timers.schedule(Duration::from_millis(0), None, Box::new(move |_| o.lock().unwrap().push(i)));
        }
        timers.expire_ready(now + Duration::from_millis(1), &hub);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
