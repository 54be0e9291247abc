//! Bounded FIFO queue for communicating records between producer and
//! consumer threads.
//!
//! [`BoundedQueue`] is bounded both by element count and by the
//! aggregate byte cost of the held elements (see [`Footprint`]). What
//! happens when a non-blocking enqueue meets a full queue is decided by
//! the policy type parameter:
//!
//! - [`FailIfFull`]: the enqueue fails with [`QueueFull`].
//! - [`KeepNewest`]: the oldest elements are evicted until the new item
//!   fits; the dequeued value carries the number of elements dropped
//!   since the previous dequeue.
//! - [`RejectNewest`]: the new item is discarded; the dequeued value
//!   carries the drop count as for `KeepNewest`.
//!
//! The policy is a zero-sized type resolved at compile time, so the hot
//! path never branches through dynamic dispatch.
//!
//! # Example
//!
//! ```
//! use conveyor::{BoundedQueue, KeepNewest};
//!
//! let q: BoundedQueue<u64, KeepNewest> = BoundedQueue::with_bounds(2, usize::MAX);
//! q.enqueue_nowait(1);
//! q.enqueue_nowait(2);
//! // Full: the head (1) is evicted to make room.
//! assert_eq!(q.enqueue_nowait(3), 1);
//! assert_eq!(q.dequeue_nowait(), Some((2, 1)));
//! assert_eq!(q.dequeue_nowait(), Some((3, 0)));
//! ```

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::trace::debug;

/// Error returned by [`FailIfFull`] enqueues on a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot add item to a full queue")]
pub struct QueueFull;

/// Byte cost of one queue element, used for the memory bound.
///
/// The default implementation charges the in-memory size of the value.
/// Types that own heap storage should override it to include that
/// storage, the way the provided `Vec`/`String` impls do.
pub trait Footprint {
    /// Returns the number of bytes this element accounts for.
    fn footprint(&self) -> usize {
        mem::size_of_val(self)
    }
}

macro_rules! impl_footprint {
    ($($t:ty),* $(,)?) => {
        $(
            impl Footprint for $t {}
        )*
    };
}

impl_footprint! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool, char,
    &'static str,
}

impl Footprint for String {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.len()
    }
}

impl<T> Footprint for Vec<T> {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.len() * mem::size_of::<T>()
    }
}

impl Footprint for Box<[u8]> {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.len()
    }
}

/// State handed to a policy while the queue mutex is held.
///
/// Not part of the public API; it appears in [`EnqPolicy`] signatures
/// only so the policy types can be implemented without exposing the
/// queue internals.
#[doc(hidden)]
pub struct EnqCx<'a, T> {
    elements: &'a mut VecDeque<T>,
    dropped: &'a mut usize,
    size: &'a AtomicUsize,
    used: &'a AtomicUsize,
    capacity: usize,
    memory: usize,
    not_empty: &'a Condvar,
}

impl<T: Footprint> EnqCx<'_, T> {
    fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Appends the item and signals one waiting consumer.
    fn insert(&mut self, item: T, item_size: usize) {
        self.elements.push_back(item);
        self.size.fetch_add(1, Ordering::Relaxed);
        self.used.fetch_add(item_size, Ordering::Relaxed);
        self.not_empty.notify_one();
    }
}

/// Admission policy applied by [`BoundedQueue::enqueue_nowait`] when the
/// queue is full.
///
/// Implemented by the three zero-sized policy types; not intended for
/// implementation outside this crate.
pub trait EnqPolicy<T: Footprint> {
    /// The type handed back by the dequeue operations.
    type Value;
    /// The type returned by [`BoundedQueue::enqueue_nowait`].
    type EnqOutcome;

    #[doc(hidden)]
    fn enq_nowait(cx: &mut EnqCx<'_, T>, item: T) -> Self::EnqOutcome;

    #[doc(hidden)]
    fn dequeued(item: T, dropped: &mut usize) -> Self::Value;
}

/// Policy: a non-blocking enqueue on a full queue fails with
/// [`QueueFull`] and counts one drop. Dequeued values are bare elements.
pub struct FailIfFull;

impl<T: Footprint> EnqPolicy<T> for FailIfFull {
    type Value = T;
    type EnqOutcome = Result<(), QueueFull>;

    fn enq_nowait(cx: &mut EnqCx<'_, T>, item: T) -> Result<(), QueueFull> {
        let item_size = item.footprint();
        if cx.len() >= cx.capacity || cx.used() + item_size > cx.memory {
            *cx.dropped += 1;
            return Err(QueueFull);
        }
        cx.insert(item, item_size);
        Ok(())
    }

    fn dequeued(item: T, _dropped: &mut usize) -> T {
        item
    }
}

/// Policy: a non-blocking enqueue on a full queue evicts elements from
/// the head until the new item fits, returning the number of elements
/// removed. If the queue empties without making room, the new item
/// itself counts as one more drop. Dequeued values are
/// `(element, drops since previous dequeue)` pairs.
pub struct KeepNewest;

impl<T: Footprint> EnqPolicy<T> for KeepNewest {
    type Value = (T, usize);
    type EnqOutcome = usize;

    fn enq_nowait(cx: &mut EnqCx<'_, T>, item: T) -> usize {
        let mut removed = 0;
        let item_size = item.footprint();
        while cx.len() == cx.capacity || cx.used() + item_size > cx.memory {
            let Some(head) = cx.elements.pop_front() else {
                break;
            };
            cx.size.fetch_sub(1, Ordering::Relaxed);
            cx.used.fetch_sub(head.footprint(), Ordering::Relaxed);
            removed += 1;
        }
        if cx.len() < cx.capacity && cx.used() + item_size <= cx.memory {
            cx.insert(item, item_size);
        } else {
            // Could not make room even on an empty queue; the new item
            // is dropped as well.
            removed += 1;
        }
        *cx.dropped += removed;
        removed
    }

    fn dequeued(item: T, dropped: &mut usize) -> (T, usize) {
        (item, mem::take(dropped))
    }
}

/// Policy: a non-blocking enqueue on a full queue discards the new item
/// and returns 1; otherwise it inserts and returns 0. Dequeued values
/// are `(element, drops since previous dequeue)` pairs.
pub struct RejectNewest;

impl<T: Footprint> EnqPolicy<T> for RejectNewest {
    type Value = (T, usize);
    type EnqOutcome = usize;

    fn enq_nowait(cx: &mut EnqCx<'_, T>, item: T) -> usize {
        let item_size = item.footprint();
        if cx.len() < cx.capacity && cx.used() + item_size <= cx.memory {
            cx.insert(item, item_size);
            return 0;
        }
        *cx.dropped += 1;
        1
    }

    fn dequeued(item: T, dropped: &mut usize) -> (T, usize) {
        (item, mem::take(dropped))
    }
}

struct Inner<T> {
    elements: VecDeque<T>,
    dropped: usize,
}

/// FIFO queue bounded by element count and aggregate byte cost.
///
/// All operations take `&self`; one mutex guards the element sequence
/// and the drop counter, while count, byte use, and the bounds are
/// mirrored in atomics so the snapshot getters never contend with
/// producers and consumers.
///
/// The queue must be dropped only after all producers and consumers
/// have quiesced; concurrent use during destruction is a logic error,
/// exactly as for any other owned value shared behind an `Arc`.
pub struct BoundedQueue<T: Footprint, P: EnqPolicy<T> = FailIfFull> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    size: AtomicUsize,
    used: AtomicUsize,
    capacity: AtomicUsize,
    memory: AtomicUsize,
    reader_ready: AtomicBool,
    ready_time: Mutex<Instant>,
    _policy: PhantomData<P>,
}

/// Queue whose enqueues fail when full.
pub type FailIfFullQueue<T> = BoundedQueue<T, FailIfFull>;
/// Queue that evicts its oldest elements to admit new ones.
pub type KeepNewestQueue<T> = BoundedQueue<T, KeepNewest>;
/// Queue that discards new elements when full.
pub type RejectNewestQueue<T> = BoundedQueue<T, RejectNewest>;

impl<T: Footprint, P: EnqPolicy<T>> Default for BoundedQueue<T, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Footprint, P: EnqPolicy<T>> BoundedQueue<T, P> {
    /// Creates a queue with effectively unbounded capacity and memory.
    pub fn new() -> Self {
        Self::with_bounds(usize::MAX, usize::MAX)
    }

    /// Creates a queue bounded to `capacity` elements and `memory` bytes.
    pub fn with_bounds(capacity: usize, memory: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                elements: VecDeque::new(),
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            size: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            capacity: AtomicUsize::new(capacity),
            memory: AtomicUsize::new(memory),
            reader_ready: AtomicBool::new(false),
            ready_time: Mutex::new(Instant::now()),
            _policy: PhantomData,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The wait-level "full" condition. Deliberately distinct from the
    /// policy-level check, which also accounts for the incoming item's
    /// footprint.
    fn is_full_snapshot(&self) -> bool {
        self.size.load(Ordering::Relaxed) >= self.capacity.load(Ordering::Relaxed)
            || self.used.load(Ordering::Relaxed) >= self.memory.load(Ordering::Relaxed)
    }

    fn enq_cx<'a>(&'a self, inner: &'a mut Inner<T>) -> EnqCx<'a, T> {
        let Inner { elements, dropped } = inner;
        EnqCx {
            elements,
            dropped,
            size: &self.size,
            used: &self.used,
            capacity: self.capacity.load(Ordering::Relaxed),
            memory: self.memory.load(Ordering::Relaxed),
            not_empty: &self.not_empty,
        }
    }

    /// Adds `item` according to the enqueue policy, never blocking.
    ///
    /// The return type is policy-specific: `Result<(), QueueFull>` for
    /// [`FailIfFull`], the removed/dropped element count for
    /// [`KeepNewest`] and [`RejectNewest`].
    pub fn enqueue_nowait(&self, item: T) -> P::EnqOutcome {
        let mut inner = self.lock_inner();
        P::enq_nowait(&mut self.enq_cx(&mut inner), item)
    }

    /// Adds `item`, blocking until the queue is not full.
    pub fn enqueue_wait(&self, item: T) {
        let mut inner = self.lock_inner();
        while self.is_full_snapshot() {
            inner = self
                .not_full
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let item_size = item.footprint();
        self.enq_cx(&mut inner).insert(item, item_size);
    }

    /// Adds `item`, blocking for at most `dur` if the queue is full.
    ///
    /// Returns `true` if the item was inserted. On timeout the item is
    /// discarded and counted as a drop, and `false` is returned.
    pub fn enqueue_timed(&self, item: T, dur: Duration) -> bool {
        let mut inner = self.lock_inner();
        if self.is_full_snapshot() {
            inner = self
                .not_full
                .wait_timeout(inner, dur)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        if self.is_full_snapshot() {
            inner.dropped += 1;
            return false;
        }
        let item_size = item.footprint();
        self.enq_cx(&mut inner).insert(item, item_size);
        true
    }

    /// Removes the head if the queue is non-empty, never blocking.
    pub fn dequeue_nowait(&self) -> Option<P::Value> {
        let mut inner = self.lock_inner();
        self.remove_head_if_possible(&mut inner)
    }

    /// Removes the head, blocking until the queue is non-empty.
    pub fn dequeue_wait(&self) -> P::Value {
        let mut inner = self.lock_inner();
        loop {
            if let Some(value) = self.remove_head_if_possible(&mut inner) {
                return value;
            }
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Removes the head, blocking for at most `dur` if the queue is
    /// empty. Returns `None` if no element became available.
    pub fn dequeue_timed(&self, dur: Duration) -> Option<P::Value> {
        let mut inner = self.lock_inner();
        if inner.elements.is_empty() {
            inner = self
                .not_empty
                .wait_timeout(inner, dur)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        self.remove_head_if_possible(&mut inner)
    }

    fn remove_head_if_possible(&self, inner: &mut Inner<T>) -> Option<P::Value> {
        let head = inner.elements.pop_front()?;
        self.size.fetch_sub(1, Ordering::Relaxed);
        self.not_full.notify_one();
        self.used.fetch_sub(head.footprint(), Ordering::Relaxed);
        Some(P::dequeued(head, &mut inner.dropped))
    }

    /// Returns `true` if the queue holds no elements.
    pub fn is_empty(&self) -> bool {
        self.size.load(Ordering::Relaxed) == 0
    }

    /// Returns `true` if the queue can accept no further elements.
    pub fn is_full(&self) -> bool {
        let _inner = self.lock_inner();
        self.is_full_snapshot()
    }

    /// Number of elements currently held.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Aggregate byte cost of the held elements.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Maximum number of elements.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Maximum aggregate byte cost.
    pub fn memory(&self) -> usize {
        self.memory.load(Ordering::Relaxed)
    }

    /// Sets the element bound. Only allowed while the queue is empty;
    /// returns `true` iff the value was applied.
    pub fn set_capacity(&self, capacity: usize) -> bool {
        let inner = self.lock_inner();
        let is_empty = inner.elements.is_empty();
        if is_empty {
            self.capacity.store(capacity, Ordering::Relaxed);
        }
        is_empty
    }

    /// Sets the memory bound in bytes. Only allowed while the queue is
    /// empty; returns `true` iff the value was applied.
    pub fn set_memory(&self, memory: usize) -> bool {
        let inner = self.lock_inner();
        let is_empty = inner.elements.is_empty();
        if is_empty {
            self.memory.store(memory, Ordering::Relaxed);
        }
        is_empty
    }

    /// Removes all elements, counting them as drops. Returns the number
    /// of elements removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock_inner();
        let cleared = self.size.load(Ordering::Relaxed);
        inner.dropped += cleared;
        inner.elements.clear();
        self.size.store(0, Ordering::Relaxed);
        self.used.store(0, Ordering::Relaxed);
        self.not_full.notify_all();
        debug!("cleared {cleared} elements from queue");
        cleared
    }

    /// Adds `n` drops reported by an external collaborator to the drop
    /// counter, so they surface through the next dequeued pair.
    pub fn add_externally_dropped(&self, n: usize) {
        let mut inner = self.lock_inner();
        inner.dropped += n;
    }

    /// Drops recorded since the last pair dequeue (or since creation).
    pub fn dropped_count(&self) -> usize {
        self.lock_inner().dropped
    }

    /// Liveness hint: whether a consumer has announced itself.
    pub fn reader_ready(&self) -> bool {
        self.reader_ready.load(Ordering::Relaxed)
    }

    /// Records that a consumer is (or is no longer) attached, stamping
    /// the ready time.
    pub fn set_reader_ready(&self, ready: bool) {
        *self
            .ready_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.reader_ready.store(ready, Ordering::Relaxed);
    }

    /// The instant at which the reader-ready flag was last set.
    pub fn ready_time(&self) -> Instant {
        *self
            .ready_time
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fail_if_full_counts_drops() {
        let q: FailIfFullQueue<&str> = BoundedQueue::with_bounds(2, usize::MAX);
        assert_eq!(q.enqueue_nowait("a"), Ok(()));
        assert_eq!(q.enqueue_nowait("b"), Ok(()));
        assert_eq!(q.enqueue_nowait("c"), Err(QueueFull));
        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue_nowait(), Some("a"));
        assert_eq!(q.dequeue_nowait(), Some("b"));
        assert_eq!(q.dequeue_nowait(), None);
    }

    #[test]
    fn keep_newest_evicts_head() {
        let q: KeepNewestQueue<&str> = BoundedQueue::with_bounds(2, usize::MAX);
        assert_eq!(q.enqueue_nowait("a"), 0);
        assert_eq!(q.enqueue_nowait("b"), 0);
        assert_eq!(q.enqueue_nowait("c"), 1);
        assert_eq!(q.dequeue_nowait(), Some(("b", 1)));
        assert_eq!(q.dequeue_nowait(), Some(("c", 0)));
        assert_eq!(q.dequeue_nowait(), None);
    }

    #[test]
    fn keep_newest_drops_oversized_item() {
        // An item that cannot fit even into an empty queue counts as a
        // drop itself.
        let q: KeepNewestQueue<Vec<u8>> = BoundedQueue::with_bounds(16, 64);
        assert_eq!(q.enqueue_nowait(vec![0u8; 8]), 0);
        assert_eq!(q.enqueue_nowait(vec![0u8; 500]), 2);
        assert_eq!(q.len(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn reject_newest_keeps_head() {
        let q: RejectNewestQueue<u32> = BoundedQueue::with_bounds(2, usize::MAX);
        assert_eq!(q.enqueue_nowait(1), 0);
        assert_eq!(q.enqueue_nowait(2), 0);
        assert_eq!(q.enqueue_nowait(3), 1);
        assert_eq!(q.dequeue_nowait(), Some((1, 1)));
        assert_eq!(q.dequeue_nowait(), Some((2, 0)));
    }

    #[test]
    fn memory_bound_applies_before_capacity() {
        let q: FailIfFullQueue<Vec<u8>> = BoundedQueue::with_bounds(100, 100);
        assert_eq!(q.enqueue_nowait(vec![0u8; 40]), Ok(()));
        assert!(q.used() > 40);
        assert_eq!(q.enqueue_nowait(vec![0u8; 60]), Err(QueueFull));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn fifo_order_across_threads() {
        let q: Arc<FailIfFullQueue<u64>> = Arc::new(BoundedQueue::with_bounds(8, usize::MAX));
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                for i in 0..1000u64 {
                    q.enqueue_wait(i);
                }
            })
        };
        for expected in 0..1000u64 {
            assert_eq!(q.dequeue_wait(), expected);
        }
        producer.join().unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn accounting_matches_successful_operations() {
        let q: KeepNewestQueue<String> = BoundedQueue::with_bounds(4, usize::MAX);
        let mut expected_used = 0;
        for i in 0..4 {
            let s = "x".repeat(i + 1);
            expected_used += s.footprint();
            q.enqueue_nowait(s);
        }
        assert_eq!(q.len(), 4);
        assert_eq!(q.used(), expected_used);
        let (head, drops) = q.dequeue_nowait().unwrap();
        assert_eq!(drops, 0);
        assert_eq!(q.used(), expected_used - head.footprint());
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn drop_accounting_totals() {
        // Rejected + evicted + externally-reported drops all surface
        // through dequeued pairs or remain pending after clear.
        let q: KeepNewestQueue<u64> = BoundedQueue::with_bounds(2, usize::MAX);
        q.enqueue_nowait(1);
        q.enqueue_nowait(2);
        assert_eq!(q.enqueue_nowait(3), 1); // evicts 1
        q.add_externally_dropped(5);
        let (_, drops) = q.dequeue_nowait().unwrap();
        assert_eq!(drops, 6);
        let (_, drops) = q.dequeue_nowait().unwrap();
        assert_eq!(drops, 0);
        q.enqueue_nowait(4);
        assert_eq!(q.clear(), 1);
        assert_eq!(q.dropped_count(), 1);
    }

    #[test]
    fn bounds_mutable_only_while_empty() {
        let q: FailIfFullQueue<u32> = BoundedQueue::with_bounds(2, usize::MAX);
        assert!(q.set_capacity(8));
        assert_eq!(q.capacity(), 8);
        assert!(q.set_memory(1024));
        q.enqueue_nowait(7).unwrap();
        assert!(!q.set_capacity(2));
        assert_eq!(q.capacity(), 8);
        assert!(!q.set_memory(64));
        assert_eq!(q.memory(), 1024);
        q.dequeue_nowait();
        assert!(q.set_capacity(2));
    }

    #[test]
    fn timed_enqueue_times_out_and_counts_drop() {
        let q: FailIfFullQueue<u32> = BoundedQueue::with_bounds(1, usize::MAX);
        q.enqueue_nowait(1).unwrap();
        assert!(!q.enqueue_timed(2, Duration::from_millis(10)));
        assert_eq!(q.dropped_count(), 1);
        q.dequeue_nowait();
        assert!(q.enqueue_timed(3, Duration::from_millis(10)));
        assert_eq!(q.dequeue_nowait(), Some(3));
    }

    #[test]
    fn timed_dequeue_wakes_on_enqueue() {
        let q: Arc<FailIfFullQueue<u32>> = Arc::new(BoundedQueue::new());
        assert_eq!(q.dequeue_timed(Duration::from_millis(5)), None);
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.enqueue_nowait(42).unwrap();
            })
        };
        assert_eq!(q.dequeue_timed(Duration::from_secs(5)), Some(42));
        producer.join().unwrap();
    }

    #[test]
    fn blocking_enqueue_resumes_after_dequeue() {
        let q: Arc<FailIfFullQueue<u32>> = Arc::new(BoundedQueue::with_bounds(1, usize::MAX));
        q.enqueue_nowait(1).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.enqueue_wait(2))
        };
        thread::sleep(Duration::from_millis(10));
        assert_eq!(q.dequeue_wait(), 1);
        producer.join().unwrap();
        assert_eq!(q.dequeue_wait(), 2);
    }

    #[test]
    fn reader_ready_hint() {
        let q: FailIfFullQueue<u32> = BoundedQueue::new();
        assert!(!q.reader_ready());
        let before = q.ready_time();
        q.set_reader_ready(true);
        assert!(q.reader_ready());
        assert!(q.ready_time() >= before);
        q.set_reader_ready(false);
        assert!(!q.reader_ready());
    }
}
