//! The lock-free FIFO queue.
//!
//! A Michael–Scott queue whose `head` and `tail` are tagged words. The head
//! always points at a sentinel: the value of a `pop` is read out of
//! `head.next`, and the CAS that advances `head` turns that next node into
//! the new sentinel. The displaced sentinel goes back to a free-pool lane,
//! where its counter is bumped before the node's next life. That is the
//! tagged variant of retire-and-reclaim, with no hazard slots anywhere.
//!
//! Both `push` and `pop` use the standard two-CAS discipline: whoever finds
//! the tail lagging behind a linked node helps swing it forward before
//! retrying its own step.

use core::fmt::Debug;
use core::fmt::Formatter;
use core::fmt::Result as FmtResult;
use core::marker::PhantomData;

use crate::backoff::Backoff;
use crate::backoff::PauseBackoff;
use crate::heap;
use crate::node::PoolNode;
use crate::params::DefaultParams;
use crate::params::Params;
use crate::padded::CachePadded;
use crate::pool::LaneSet;
use crate::pool::QueuePool;
use crate::registry::RegisterError;
use crate::registry::ThreadRegistry;
use crate::tagged::AtomicTagged;
use crate::tagged::TaggedPtr;
use crate::sync::atomic::Ordering;

// -----------------------------------------------------------------------------
// Tagged Queue
// -----------------------------------------------------------------------------

/// A lock-free Michael–Scott queue over tagged words.
///
/// Nodes are drawn from per-lane queue-shaped free pools with a per-lane
/// allocation budget; a queue built by [`with_nodes`] refuses pushes once
/// the chosen lane is out of both spare nodes and budget.
///
/// # Examples
///
/// ```
/// use warden::TaggedQueue;
///
/// let queue: TaggedQueue<u64> = TaggedQueue::new();
/// let mut queue_ref = queue.register().unwrap();
///
/// assert!(queue_ref.push(10));
/// assert!(queue_ref.push(20));
///
/// assert_eq!(queue_ref.pop(), Some(10));
/// assert_eq!(queue_ref.pop(), Some(20));
/// assert_eq!(queue_ref.pop(), None);
/// ```
///
/// [`with_nodes`]: Self::with_nodes
pub struct TaggedQueue<T, P = DefaultParams, B = PauseBackoff>
where
  P: Params + ?Sized,
{
  head: CachePadded<AtomicTagged<PoolNode<T>>>,
  tail: CachePadded<AtomicTagged<PoolNode<T>>>,
  lanes: LaneSet<QueuePool<T>>,
  registry: ThreadRegistry,
  marker: PhantomData<(fn(P), fn() -> B)>,
}

impl<T, P, B> TaggedQueue<T, P, B>
where
  T: Copy,
  P: Params + ?Sized,
  B: Backoff,
{
  /// Creates an unbounded queue with empty pools.
  #[inline]
  pub fn new() -> Self {
    Self::with_nodes(0, u64::MAX)
  }

  /// Creates a queue whose lanes are pre-populated with `init` spare nodes
  /// each and may allocate at most `max` nodes each.
  pub fn with_nodes(init: u64, max: u64) -> Self {
    let sentinel: TaggedPtr<PoolNode<T>> = TaggedPtr::pack(heap::construct(PoolNode::empty()), 0);

    Self {
      head: CachePadded::new(AtomicTagged::new(sentinel)),
      tail: CachePadded::new(AtomicTagged::new(sentinel)),
      lanes: LaneSet::new(P::LANES.get(), init, max),
      registry: ThreadRegistry::new(P::THREADS.get()),
      marker: PhantomData,
    }
  }

  /// Registers the calling thread. The thread's lane cursor starts at its
  /// registry index, so threads spread across lanes from the outset.
  #[inline]
  pub fn register(&self) -> Result<TaggedQueueRef<'_, T, P, B>, RegisterError> {
    let index: usize = self.registry.claim()?;

    Ok(TaggedQueueRef {
      queue: self,
      lane: index,
      backoff: B::default(),
    })
  }

  /// Nodes allocated against lane `lane`'s budget. Diagnostic only.
  #[inline]
  pub fn node_count(&self, lane: usize) -> u64 {
    self.lanes.lane(lane).node_count()
  }
}

impl<T, P, B> Default for TaggedQueue<T, P, B>
where
  T: Copy,
  P: Params + ?Sized,
  B: Backoff,
{
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

impl<T, P, B> Drop for TaggedQueue<T, P, B>
where
  P: Params + ?Sized,
{
  fn drop(&mut self) {
    let mut node: *mut PoolNode<T> = self.head.load(Ordering::Relaxed).address();

    while !node.is_null() {
      // SAFETY: `Drop` has exclusive access; the tail lives inside the chain
      // reachable from the head, and pooled nodes live in the lanes.
      let next: *mut PoolNode<T> = unsafe { (*node).next() }.load(Ordering::Relaxed).address();

      // SAFETY: As above.
      unsafe {
        heap::destroy(node);
      }

      node = next;
    }
  }
}

// SAFETY: The queue owns its nodes; payloads move with it.
unsafe impl<T, P, B> Send for TaggedQueue<T, P, B>
where
  T: Send,
  P: Params + ?Sized,
{
}

// SAFETY: Shared mutation is tagged CAS only.
unsafe impl<T, P, B> Sync for TaggedQueue<T, P, B>
where
  T: Send,
  P: Params + ?Sized,
{
}

impl<T, P, B> Debug for TaggedQueue<T, P, B>
where
  P: Params + ?Sized,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("TaggedQueue")
      .field("lanes", &self.lanes.len())
      .field("threads", &self.registry.claimed())
      .finish_non_exhaustive()
  }
}

// -----------------------------------------------------------------------------
// Per-thread Ref
// -----------------------------------------------------------------------------

/// A registered thread's view of a [`TaggedQueue`].
pub struct TaggedQueueRef<'queue, T, P, B>
where
  P: Params + ?Sized,
{
  queue: &'queue TaggedQueue<T, P, B>,
  lane: usize,
  backoff: B,
}

impl<T, P, B> TaggedQueueRef<'_, T, P, B>
where
  T: Copy,
  P: Params + ?Sized,
  B: Backoff,
{
  #[inline]
  fn next_lane(&mut self) -> usize {
    let lane: usize = self.lane;
    self.lane = lane.wrapping_add(1);
    lane
  }

  /// Appends `value`; returns `false` when the chosen lane is out of both
  /// spare nodes and budget.
  pub fn push(&mut self, value: T) -> bool {
    let queue = self.queue;
    let lane: usize = self.next_lane();

    let Some(node) = queue.lanes.lane(lane).acquire(value, &mut self.backoff) else {
      return false;
    };

    // A recycled node's `next` still holds its previous life's link; sever
    // it before publication. `relink` advances the word's counter, so a
    // link CAS prepared against the previous life cannot land here.
    // SAFETY: The node is private until the link CAS publishes it.
    unsafe {
      (*node.address()).relink(core::ptr::null_mut(), Ordering::Release);
    }

    loop {
      let tail: TaggedPtr<PoolNode<T>> = queue.tail.load(Ordering::Acquire);

      // SAFETY: Queue nodes are never deallocated while the queue lives; a
      // stale `tail` yields a failing CAS, never a fault.
      let next: TaggedPtr<PoolNode<T>> =
        unsafe { (*tail.address()).next() }.load(Ordering::Acquire);

      // Consistency check: `next` belongs to this tail's life only if the
      // tail word has not moved on.
      if tail != queue.tail.load(Ordering::Acquire) {
        continue;
      }

      if next.is_null() {
        // SAFETY: As above.
        let link = unsafe { (*tail.address()).next() }.compare_exchange(
          next,
          next.advance(node.address()),
          Ordering::AcqRel,
          Ordering::Acquire,
        );

        if link.is_ok() {
          // The tail swing may fail: someone helped us already.
          let _ = queue.tail.compare_exchange(
            tail,
            tail.advance(node.address()),
            Ordering::Release,
            Ordering::Relaxed,
          );

          return true;
        }

        self.backoff.wait();
      } else if queue
        .tail
        .compare_exchange(tail, tail.advance(next.address()), Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
      {
        self.backoff.wait();
      }
    }
  }

  /// Removes the oldest value, or `None` when the queue is empty.
  pub fn pop(&mut self) -> Option<T> {
    let queue = self.queue;

    let (head, value) = loop {
      let head: TaggedPtr<PoolNode<T>> = queue.head.load(Ordering::Acquire);
      let tail: TaggedPtr<PoolNode<T>> = queue.tail.load(Ordering::Acquire);

      // SAFETY: Queue nodes are never deallocated while the queue lives.
      let next: TaggedPtr<PoolNode<T>> =
        unsafe { (*head.address()).next() }.load(Ordering::Acquire);

      // Consistency check: the (head, tail, next) triple describes one
      // moment only if the head word has not moved on.
      if head != queue.head.load(Ordering::Acquire) {
        continue;
      }

      // Pointer comparison: the words' counters advance independently.
      if head.address() == tail.address() {
        if next.is_null() {
          return None;
        }

        // Help the lagging tail along.
        if queue
          .tail
          .compare_exchange(tail, tail.advance(next.address()), Ordering::AcqRel, Ordering::Relaxed)
          .is_err()
        {
          self.backoff.wait();
        }
      } else {
        // The value lives in the successor; `head` itself is the sentinel.
        // SAFETY: `next` is non-null whenever `head != tail`. The read may
        // race a recycling producer, in which case the head CAS below fails
        // (its counter moved) and the value is discarded.
        let value: T = unsafe { (*next.address()).value() };

        match queue.head.compare_exchange(
          head,
          head.advance(next.address()),
          Ordering::AcqRel,
          Ordering::Acquire,
        ) {
          Ok(_) => break (head, value),
          Err(_) => self.backoff.wait(),
        }
      }
    };

    let lane: usize = self.next_lane();

    // The displaced sentinel is ours; its next life gets a bumped counter
    // when the pool reissues it.
    queue.lanes.lane(lane).release(head, &mut self.backoff);

    Some(value)
  }
}

impl<T, P, B> Debug for TaggedQueueRef<'_, T, P, B>
where
  P: Params + ?Sized,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("TaggedQueueRef").field("lane", &self.lane).finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(not(any(loom, shuttle)))]
#[cfg(test)]
mod tests {
  use std::collections::HashSet;
  use std::sync::Arc;
  use std::sync::Barrier;
  use std::thread;

  use crate::backoff::NoBackoff;
  use crate::params::Buckets;
  use crate::params::Lanes;
  use crate::params::Params;
  use crate::params::Threads;
  use crate::queue::TaggedQueue;

  struct OneLane;

  impl Params for OneLane {
    const THREADS: Threads = Threads::new(8);
    const BUCKETS: Buckets = Buckets::new(8);
    const LANES: Lanes = Lanes::new(1);
  }

  #[test]
  fn fifo_order() {
    let queue: TaggedQueue<u64> = TaggedQueue::new();
    let mut queue_ref = queue.register().unwrap();

    assert!(queue_ref.push(10));
    assert!(queue_ref.push(20));
    assert!(queue_ref.push(30));

    assert_eq!(queue_ref.pop(), Some(10));
    assert_eq!(queue_ref.pop(), Some(20));
    assert_eq!(queue_ref.pop(), Some(30));
    assert_eq!(queue_ref.pop(), None);
  }

  #[test]
  fn empty_queue() {
    let queue: TaggedQueue<u64> = TaggedQueue::new();
    let mut queue_ref = queue.register().unwrap();

    assert_eq!(queue_ref.pop(), None);
    assert!(queue_ref.push(1));
    assert_eq!(queue_ref.pop(), Some(1));
    assert_eq!(queue_ref.pop(), None);
  }

  // Scenario: A bounded queue with a stalled consumer.
  // Expected: The push that would exceed the budget fails; one pop frees
  // exactly one slot.
  #[test]
  fn bounded_backpressure() {
    let queue: TaggedQueue<u64, OneLane, NoBackoff> = TaggedQueue::with_nodes(0, 4);
    let mut queue_ref = queue.register().unwrap();

    for value in 0..4 {
      assert!(queue_ref.push(value));
    }

    assert!(!queue_ref.push(4));
    assert_eq!(queue.node_count(0), 4);

    assert_eq!(queue_ref.pop(), Some(0));
    assert!(queue_ref.push(4));
    assert!(!queue_ref.push(5));

    // Drain in order.
    for value in 1..5 {
      assert_eq!(queue_ref.pop(), Some(value));
    }

    assert_eq!(queue_ref.pop(), None);
  }

  #[test]
  fn recycles_through_pool() {
    let queue: TaggedQueue<u64, OneLane, NoBackoff> = TaggedQueue::with_nodes(1, 1);
    let mut queue_ref = queue.register().unwrap();

    for round in 0..100 {
      assert!(queue_ref.push(round));
      assert_eq!(queue_ref.pop(), Some(round));
    }

    assert_eq!(queue.node_count(0), 1);
  }

  // Scenario: One producer, several consumers.
  // Expected: Consumed values form disjoint subsequences of the pushed
  // sequence and nothing is lost or duplicated.
  #[test]
  fn spmc_multiset() {
    const CONSUMERS: usize = 3;
    const TOTAL: u64 = 3000;

    let queue: Arc<TaggedQueue<u64, OneLane, NoBackoff>> = Arc::new(TaggedQueue::new());
    let barrier: Arc<Barrier> = Arc::new(Barrier::new(CONSUMERS + 1));

    let consumers: Vec<_> = (0..CONSUMERS)
      .map(|_| {
        let queue = Arc::clone(&queue);
        let barrier = Arc::clone(&barrier);

        thread::spawn(move || {
          let mut queue_ref = queue.register().unwrap();
          let mut taken: Vec<u64> = Vec::new();

          barrier.wait();

          loop {
            match queue_ref.pop() {
              Some(u64::MAX) => break,
              Some(value) => taken.push(value),
              None => thread::yield_now(),
            }
          }

          taken
        })
      })
      .collect();

    let mut producer = queue.register().unwrap();

    barrier.wait();

    for value in 0..TOTAL {
      while !producer.push(value) {
        thread::yield_now();
      }
    }

    // One stop marker per consumer.
    for _ in 0..CONSUMERS {
      while !producer.push(u64::MAX) {
        thread::yield_now();
      }
    }

    let mut seen: HashSet<u64> = HashSet::new();

    for consumer in consumers {
      let taken: Vec<u64> = consumer.join().unwrap();

      // FIFO per consumer: each consumer's view is strictly increasing.
      for window in taken.windows(2) {
        assert!(window[0] < window[1]);
      }

      for value in taken {
        assert!(seen.insert(value), "value {value} popped twice");
      }
    }

    assert_eq!(seen.len() as u64, TOTAL);
  }
}
