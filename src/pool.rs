//! Tagged-pointer free-node pools.
//!
//! The tagged containers never deallocate a node while the container lives;
//! popped nodes go back into a pool and are reissued on the next push. A
//! pool's head (and tail) are tagged words, and every word, the `next`
//! fields included, advances its counter by exactly one on each successful
//! CAS (or, for a private node, on each [`relink`]). A CAS prepared against
//! a word's previous life therefore always fails, which is the ABA defense
//! of the whole tagged family. [`get`] additionally returns the popped
//! node's word with the counter bumped, so each reuse of a node carries a
//! fresh tagged identity.
//!
//! Both shapes keep one permanent terminal node: an empty pool is a chain of
//! exactly that node, mirroring the sentinel discipline of the Michael–Scott
//! queue. A `get` that would hand out the terminal returns `None` instead.
//!
//! [`LaneSet`] spreads a container's node supply across several pools with a
//! per-lane allocation budget; threads pick lanes round-robin so producers
//! and consumers do not all collide on one head word.
//!
//! [`get`]: FreePool::get
//! [`relink`]: crate::node::PoolNode::relink

use crate::array::Array;
use crate::backoff::Backoff;
use crate::backoff::NoBackoff;
use crate::heap;
use crate::node::PoolNode;
use crate::padded::CachePadded;
use crate::tagged::AtomicTagged;
use crate::tagged::TaggedPtr;
use crate::sync::atomic::AtomicU64;
use crate::sync::atomic::Ordering;

// -----------------------------------------------------------------------------
// Pool Contract
// -----------------------------------------------------------------------------

/// A lock-free holder of spare nodes.
pub(crate) trait FreePool {
  type Value;

  /// Creates an empty pool holding only its permanent terminal node.
  fn new() -> Self;

  /// Pops a spare node, returning its tagged word with the counter bumped.
  ///
  /// Returns `None` when only the terminal node remains.
  fn get<B>(&self, backoff: &mut B) -> Option<TaggedPtr<PoolNode<Self::Value>>>
  where
    B: Backoff;

  /// Pushes a node back into the pool.
  ///
  /// The node must be unreachable from the owning container; its payload is
  /// dead from this point on.
  fn save<B>(&self, node: TaggedPtr<PoolNode<Self::Value>>, backoff: &mut B)
  where
    B: Backoff;
}

/// Destroys every node in a pool chain, the terminal included.
///
/// # Safety
///
/// Must only run with exclusive access (pool teardown).
unsafe fn drain_chain<T>(head: TaggedPtr<PoolNode<T>>) {
  let mut node: *mut PoolNode<T> = head.address();

  while !node.is_null() {
    // SAFETY: Teardown has exclusive access; each node is destroyed once.
    let next: *mut PoolNode<T> = unsafe { (*node).next().load(Ordering::Relaxed) }.address();

    // SAFETY: As above.
    unsafe {
      heap::destroy(node);
    }

    node = next;
  }
}

// -----------------------------------------------------------------------------
// Stack-shaped Pool
// -----------------------------------------------------------------------------

/// A Treiber-stack pool of spare nodes under a single tagged head.
pub(crate) struct StackPool<T> {
  head: CachePadded<AtomicTagged<PoolNode<T>>>,
}

impl<T> FreePool for StackPool<T> {
  type Value = T;

  #[inline]
  fn new() -> Self {
    let terminal: *mut PoolNode<T> = heap::construct(PoolNode::empty());

    Self {
      head: CachePadded::new(AtomicTagged::new(TaggedPtr::pack(terminal, 0))),
    }
  }

  fn get<B>(&self, backoff: &mut B) -> Option<TaggedPtr<PoolNode<T>>>
  where
    B: Backoff,
  {
    let mut head: TaggedPtr<PoolNode<T>> = self.head.load(Ordering::Acquire);

    loop {
      // SAFETY: Pool nodes are never deallocated while the pool lives; a
      // stale `head` yields a stale `next`, which the CAS then rejects.
      let next: TaggedPtr<PoolNode<T>> =
        unsafe { (*head.address()).next() }.load(Ordering::Relaxed);

      if next.is_null() {
        return None;
      }

      // The head word only ever advances its counter, so this succeeds only
      // if nothing popped or pushed since `head` was read, making the
      // `next` read above consistent.
      match self.head.compare_exchange(
        head,
        head.advance(next.address()),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return Some(head.bump()),
        Err(actual) => {
          head = actual;
          backoff.wait();
        }
      }
    }
  }

  fn save<B>(&self, node: TaggedPtr<PoolNode<T>>, backoff: &mut B)
  where
    B: Backoff,
  {
    loop {
      let head: TaggedPtr<PoolNode<T>> = self.head.load(Ordering::Acquire);

      // SAFETY: The caller owns `node` until the CAS below publishes it.
      unsafe {
        (*node.address()).relink(head.address(), Ordering::Relaxed);
      }

      if self
        .head
        .compare_exchange(head, head.advance(node.address()), Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
      {
        return;
      }

      backoff.wait();
    }
  }
}

impl<T> Drop for StackPool<T> {
  fn drop(&mut self) {
    // SAFETY: `Drop` has exclusive access.
    unsafe {
      drain_chain(self.head.load(Ordering::Relaxed));
    }
  }
}

// SAFETY: The pool owns its nodes; payloads are dead while pooled.
unsafe impl<T: Send> Send for StackPool<T> {}

// SAFETY: All shared mutation goes through tagged CAS.
unsafe impl<T: Send> Sync for StackPool<T> {}

// -----------------------------------------------------------------------------
// Queue-shaped Pool
// -----------------------------------------------------------------------------

/// A Michael–Scott FIFO pool of spare nodes.
///
/// FIFO recycling maximizes the time between two lives of the same node,
/// which keeps the 16-bit counters far apart in practice.
pub(crate) struct QueuePool<T> {
  head: CachePadded<AtomicTagged<PoolNode<T>>>,
  tail: CachePadded<AtomicTagged<PoolNode<T>>>,
}

impl<T> FreePool for QueuePool<T> {
  type Value = T;

  #[inline]
  fn new() -> Self {
    let terminal: *mut PoolNode<T> = heap::construct(PoolNode::empty());

    Self {
      head: CachePadded::new(AtomicTagged::new(TaggedPtr::pack(terminal, 0))),
      tail: CachePadded::new(AtomicTagged::new(TaggedPtr::pack(terminal, 0))),
    }
  }

  fn get<B>(&self, backoff: &mut B) -> Option<TaggedPtr<PoolNode<T>>>
  where
    B: Backoff,
  {
    loop {
      let head: TaggedPtr<PoolNode<T>> = self.head.load(Ordering::Acquire);
      let tail: TaggedPtr<PoolNode<T>> = self.tail.load(Ordering::Acquire);

      // SAFETY: Pool nodes are never deallocated while the pool lives.
      let next: TaggedPtr<PoolNode<T>> =
        unsafe { (*head.address()).next() }.load(Ordering::Acquire);

      // Consistency check: `next` belongs to this head's life only if the
      // head word has not moved on.
      if head != self.head.load(Ordering::Acquire) {
        continue;
      }

      // Pointer comparison: the words' counters advance independently.
      if head.address() == tail.address() {
        if next.is_null() {
          return None;
        }

        // Help the lagging tail along.
        if self
          .tail
          .compare_exchange(tail, tail.advance(next.address()), Ordering::Release, Ordering::Relaxed)
          .is_err()
        {
          backoff.wait();
        }
      } else {
        match self.head.compare_exchange(
          head,
          head.advance(next.address()),
          Ordering::AcqRel,
          Ordering::Acquire,
        ) {
          Ok(_) => return Some(head.bump()),
          Err(_) => backoff.wait(),
        }
      }
    }
  }

  fn save<B>(&self, node: TaggedPtr<PoolNode<T>>, backoff: &mut B)
  where
    B: Backoff,
  {
    // SAFETY: The caller owns `node` until the link CAS publishes it.
    // Severing through `relink` keeps the next word's counter advancing
    // across the node's lives.
    unsafe {
      (*node.address()).relink(core::ptr::null_mut(), Ordering::Release);
    }

    loop {
      let tail: TaggedPtr<PoolNode<T>> = self.tail.load(Ordering::Acquire);

      // SAFETY: As above; a stale `tail` yields a CAS failure, not a fault.
      let next: TaggedPtr<PoolNode<T>> =
        unsafe { (*tail.address()).next() }.load(Ordering::Acquire);

      // Consistency check, as in `get`.
      if tail != self.tail.load(Ordering::Acquire) {
        continue;
      }

      if next.is_null() {
        // SAFETY: As above. Installing `next.counter + 1` means a CAS
        // prepared before this tail node was recycled cannot land on its
        // next life.
        let link = unsafe { (*tail.address()).next() }.compare_exchange(
          next,
          next.advance(node.address()),
          Ordering::AcqRel,
          Ordering::Acquire,
        );

        if link.is_ok() {
          let _ = self.tail.compare_exchange(
            tail,
            tail.advance(node.address()),
            Ordering::Release,
            Ordering::Relaxed,
          );

          return;
        }

        backoff.wait();
      } else if self
        .tail
        .compare_exchange(tail, tail.advance(next.address()), Ordering::Release, Ordering::Relaxed)
        .is_err()
      {
        backoff.wait();
      }
    }
  }
}

impl<T> Drop for QueuePool<T> {
  fn drop(&mut self) {
    // SAFETY: `Drop` has exclusive access; the tail lives inside the chain
    // reachable from the head.
    unsafe {
      drain_chain(self.head.load(Ordering::Relaxed));
    }
  }
}

// SAFETY: The pool owns its nodes; payloads are dead while pooled.
unsafe impl<T: Send> Send for QueuePool<T> {}

// SAFETY: All shared mutation goes through tagged CAS.
unsafe impl<T: Send> Sync for QueuePool<T> {}

// -----------------------------------------------------------------------------
// Budgeted Lanes
// -----------------------------------------------------------------------------

/// One pool plus its allocation budget.
pub(crate) struct Lane<F> {
  count: AtomicU64,
  max: u64,
  pool: F,
}

impl<F> Lane<F>
where
  F: FreePool,
{
  fn new(init: u64, max: u64) -> Self {
    let lane: Self = Self {
      count: AtomicU64::new(init),
      max: if max < init { init } else { max },
      pool: F::new(),
    };

    let mut backoff: NoBackoff = NoBackoff;

    for _ in 0..init {
      let node: *mut PoolNode<F::Value> = heap::construct(PoolNode::empty());

      lane.pool.save(TaggedPtr::pack(node, 0), &mut backoff);
    }

    lane
  }

  /// Takes a node with `value` written, reusing a pooled node when one is
  /// available and allocating against the budget otherwise.
  ///
  /// Returns `None` when the pool is dry and the lane's budget is spent; the
  /// budget counter is rolled back before returning so accounting never
  /// drifts.
  pub(crate) fn acquire<B>(&self, value: F::Value, backoff: &mut B) -> Option<TaggedPtr<PoolNode<F::Value>>>
  where
    B: Backoff,
  {
    if let Some(node) = self.pool.get(backoff) {
      // SAFETY: `get` transferred the node to us; nothing else sees it yet.
      unsafe {
        (*node.address()).set_value(value);
      }

      return Some(node);
    }

    if self.count.fetch_add(1, Ordering::AcqRel) >= self.max {
      self.count.fetch_sub(1, Ordering::Relaxed);
      return None;
    }

    Some(TaggedPtr::pack(heap::construct(PoolNode::with(value)), 0))
  }

  /// Takes a node with both `next` and `value` pre-initialized.
  pub(crate) fn acquire_linked<B>(
    &self,
    next: TaggedPtr<PoolNode<F::Value>>,
    value: F::Value,
    backoff: &mut B,
  ) -> Option<TaggedPtr<PoolNode<F::Value>>>
  where
    B: Backoff,
  {
    let node: TaggedPtr<PoolNode<F::Value>> = self.acquire(value, backoff)?;

    // SAFETY: The node is still private to us.
    unsafe {
      (*node.address()).relink(next.address(), Ordering::Relaxed);
    }

    Some(node)
  }

  /// Returns a retired node to this lane's pool.
  pub(crate) fn release<B>(&self, node: TaggedPtr<PoolNode<F::Value>>, backoff: &mut B)
  where
    B: Backoff,
  {
    self.pool.save(node, backoff);
  }

  /// Nodes allocated against this lane's budget. Diagnostic only.
  pub(crate) fn node_count(&self) -> u64 {
    self.count.load(Ordering::Relaxed)
  }
}

/// A fixed set of budgeted lanes; threads pick lanes round-robin.
pub(crate) struct LaneSet<F> {
  lanes: Array<Lane<F>>,
}

impl<F> LaneSet<F>
where
  F: FreePool,
{
  pub(crate) fn new(lanes: usize, init: u64, max: u64) -> Self {
    Self {
      lanes: Array::new(lanes, |_, slot| {
        slot.write(Lane::new(init, max));
      }),
    }
  }

  #[inline]
  pub(crate) fn lane(&self, index: usize) -> &Lane<F> {
    self.lanes.get(index % self.lanes.len())
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.lanes.len()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
