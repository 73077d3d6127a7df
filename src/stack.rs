//! Lock-free LIFO stacks.
//!
//! Two Treiber variants that differ only in how they keep popped nodes from
//! being freed under a racing reader:
//!
//! - [`HazardStack`] protects the head in a hazard slot before dereferencing
//!   it and retires popped nodes through the hazard domain.
//! - [`TaggedStack`] needs no protection at all: the head is a tagged word,
//!   nodes come from counter-versioned free pools, and a pool-resident node
//!   is never deallocated while the stack lives. A racing pop can read
//!   stale bytes, but its CAS can never succeed on a recycled node.
//!
//! Both keep a permanent bottom sentinel so an empty stack is a chain of
//! exactly one node.

use core::fmt::Debug;
use core::fmt::Formatter;
use core::fmt::Result as FmtResult;
use core::marker::PhantomData;

use crate::backoff::Backoff;
use crate::backoff::PauseBackoff;
use crate::hazard::HazardDomain;
use crate::heap;
use crate::node::HazardNode;
use crate::node::PoolNode;
use crate::params::DefaultParams;
use crate::params::Params;
use crate::params::ParamsExt;
use crate::padded::CachePadded;
use crate::pool::LaneSet;
use crate::pool::StackPool;
use crate::registry::RegisterError;
use crate::registry::ThreadRegistry;
use crate::tagged::AtomicTagged;
use crate::tagged::TaggedPtr;
use crate::sync::atomic::AtomicPtr;
use crate::sync::atomic::Ordering;

// -----------------------------------------------------------------------------
// Hazard-pointer Stack
// -----------------------------------------------------------------------------

/// A Treiber stack reclaimed through hazard pointers.
///
/// # Examples
///
/// ```
/// use warden::HazardStack;
///
/// let stack: HazardStack<u64> = HazardStack::new();
/// let mut stack_ref = stack.register().unwrap();
///
/// stack_ref.push(10);
/// stack_ref.push(20);
///
/// assert_eq!(stack_ref.pop(), Some(20));
/// assert_eq!(stack_ref.pop(), Some(10));
/// assert_eq!(stack_ref.pop(), None);
/// ```
pub struct HazardStack<T, P = DefaultParams, B = PauseBackoff>
where
  P: Params + ?Sized,
{
  head: CachePadded<AtomicPtr<HazardNode<T>>>,
  domain: HazardDomain<HazardNode<T>>,
  registry: ThreadRegistry,
  marker: PhantomData<(fn(P), fn() -> B)>,
}

impl<T, P, B> HazardStack<T, P, B>
where
  T: Copy,
  P: Params + ?Sized,
  B: Backoff,
{
  /// Creates a new, empty stack.
  #[inline]
  pub fn new() -> Self {
    Self {
      head: CachePadded::new(AtomicPtr::new(heap::construct(HazardNode::sentinel()))),
      domain: HazardDomain::new(P::THREADS.get(), P::RETIRE_CAP),
      registry: ThreadRegistry::new(P::THREADS.get()),
      marker: PhantomData,
    }
  }

  /// Registers the calling thread.
  #[inline]
  pub fn register(&self) -> Result<HazardStackRef<'_, T, P, B>, RegisterError> {
    Ok(HazardStackRef {
      stack: self,
      index: self.registry.claim()?,
      backoff: B::default(),
    })
  }
}

impl<T, P, B> Default for HazardStack<T, P, B>
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

impl<T, P, B> Drop for HazardStack<T, P, B>
where
  P: Params + ?Sized,
{
  fn drop(&mut self) {
    let mut node: *mut HazardNode<T> = self.head.load(Ordering::Relaxed);

    while !node.is_null() {
      // SAFETY: `Drop` has exclusive access; each chained node is destroyed
      // once. Retired nodes live in the domain, not in the chain.
      let next: *mut HazardNode<T> = unsafe { (*node).next() }.load(Ordering::Relaxed);

      // SAFETY: As above.
      unsafe {
        heap::destroy(node);
      }

      node = next;
    }
  }
}

// SAFETY: The stack owns its nodes; payloads move with it.
unsafe impl<T, P, B> Send for HazardStack<T, P, B>
where
  T: Send,
  P: Params + ?Sized,
{
}

// SAFETY: Shared mutation is CAS-only; per-thread state is reached through
// unique registry indices.
unsafe impl<T, P, B> Sync for HazardStack<T, P, B>
where
  T: Send,
  P: Params + ?Sized,
{
}

impl<T, P, B> Debug for HazardStack<T, P, B>
where
  P: Params + ?Sized,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("HazardStack")
      .field("threads", &self.registry.claimed())
      .finish_non_exhaustive()
  }
}

/// A registered thread's view of a [`HazardStack`].
pub struct HazardStackRef<'stack, T, P, B>
where
  P: Params + ?Sized,
{
  stack: &'stack HazardStack<T, P, B>,
  index: usize,
  backoff: B,
}

impl<T, P, B> HazardStackRef<'_, T, P, B>
where
  T: Copy,
  P: Params + ?Sized,
  B: Backoff,
{
  /// Pushes `value` onto the stack.
  pub fn push(&mut self, value: T) {
    let stack = self.stack;
    let node: *mut HazardNode<T> = HazardDomain::alloc(HazardNode::with(value));

    loop {
      let head: *mut HazardNode<T> = stack.head.load(Ordering::Acquire);

      stack.domain.protect(self.index, 0, head);

      if head != stack.head.load(Ordering::Acquire) {
        continue;
      }

      // SAFETY: The node is still private; the CAS below publishes it.
      unsafe {
        (*node).next().store(head, Ordering::Relaxed);
      }

      if stack
        .head
        .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
      {
        break;
      }

      self.backoff.wait();
    }

    stack.domain.clear(self.index, 0);
  }

  /// Pops the most recently pushed value, or `None` when the stack is empty.
  pub fn pop(&mut self) -> Option<T> {
    let stack = self.stack;

    let (head, value) = loop {
      let head: *mut HazardNode<T> = stack.head.load(Ordering::Acquire);

      stack.domain.protect(self.index, 0, head);

      if head != stack.head.load(Ordering::Acquire) {
        continue;
      }

      // SAFETY: `head` is protected and re-validated, so it cannot have been
      // reclaimed; at worst it is stale and the CAS below fails.
      let next: *mut HazardNode<T> = unsafe { (*head).next() }.load(Ordering::Acquire);

      if next.is_null() {
        // Only the bottom sentinel has no successor.
        stack.domain.clear(self.index, 0);
        return None;
      }

      // SAFETY: Non-sentinel (it has a successor), protected, validated.
      let value: T = unsafe { (*head).value() };

      if stack
        .head
        .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
      {
        break (head, value);
      }

      self.backoff.wait();
    };

    stack.domain.clear(self.index, 0);

    // SAFETY: The CAS unlinked `head`; this thread owns it now.
    unsafe {
      stack.domain.retire(self.index, head);
    }

    Some(value)
  }
}

impl<T, P, B> Debug for HazardStackRef<'_, T, P, B>
where
  P: Params + ?Sized,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("HazardStackRef").field("index", &self.index).finish()
  }
}

// -----------------------------------------------------------------------------
// Tagged-pointer Stack
// -----------------------------------------------------------------------------

/// A Treiber stack over tagged words and counter-versioned node pools.
///
/// Nodes are drawn from per-lane free pools with a per-lane allocation
/// budget; a stack built by [`with_nodes`] refuses pushes once every lane's
/// budget is spent and its pool is dry.
///
/// # Examples
///
/// ```
/// use warden::TaggedStack;
///
/// let stack: TaggedStack<u64> = TaggedStack::new();
/// let mut stack_ref = stack.register().unwrap();
///
/// assert!(stack_ref.push(1));
/// assert_eq!(stack_ref.pop(), Some(1));
/// assert_eq!(stack_ref.pop(), None);
/// ```
///
/// [`with_nodes`]: Self::with_nodes
pub struct TaggedStack<T, P = DefaultParams, B = PauseBackoff>
where
  P: Params + ?Sized,
{
  head: CachePadded<AtomicTagged<PoolNode<T>>>,
  lanes: LaneSet<StackPool<T>>,
  registry: ThreadRegistry,
  marker: PhantomData<(fn(P), fn() -> B)>,
}

impl<T, P, B> TaggedStack<T, P, B>
where
  T: Copy,
  P: Params + ?Sized,
  B: Backoff,
{
  /// Creates an unbounded stack with empty pools.
  #[inline]
  pub fn new() -> Self {
    Self::with_nodes(0, u64::MAX)
  }

  /// Creates a stack whose lanes are pre-populated with `init` spare nodes
  /// each and may allocate at most `max` nodes each.
  pub fn with_nodes(init: u64, max: u64) -> Self {
    Self {
      head: CachePadded::new(AtomicTagged::new(TaggedPtr::pack(
        heap::construct(PoolNode::empty()),
        0,
      ))),
      lanes: LaneSet::new(P::LANES.get(), init, max),
      registry: ThreadRegistry::new(P::THREADS.get()),
      marker: PhantomData,
    }
  }

  /// Registers the calling thread. The thread's lane cursor starts at its
  /// registry index, so threads spread across lanes from the outset.
  #[inline]
  pub fn register(&self) -> Result<TaggedStackRef<'_, T, P, B>, RegisterError> {
    let index: usize = self.registry.claim()?;

    Ok(TaggedStackRef {
      stack: self,
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

impl<T, P, B> Default for TaggedStack<T, P, B>
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

impl<T, P, B> Drop for TaggedStack<T, P, B>
where
  P: Params + ?Sized,
{
  fn drop(&mut self) {
    let mut node: *mut PoolNode<T> = self.head.load(Ordering::Relaxed).address();

    while !node.is_null() {
      // SAFETY: `Drop` has exclusive access; pooled nodes live in the lanes,
      // not in this chain, so each node is destroyed exactly once.
      let next: *mut PoolNode<T> = unsafe { (*node).next() }.load(Ordering::Relaxed).address();

      // SAFETY: As above.
      unsafe {
        heap::destroy(node);
      }

      node = next;
    }
  }
}

// SAFETY: The stack owns its nodes; payloads move with it.
unsafe impl<T, P, B> Send for TaggedStack<T, P, B>
where
  T: Send,
  P: Params + ?Sized,
{
}

// SAFETY: Shared mutation is tagged CAS only.
unsafe impl<T, P, B> Sync for TaggedStack<T, P, B>
where
  T: Send,
  P: Params + ?Sized,
{
}

impl<T, P, B> Debug for TaggedStack<T, P, B>
where
  P: Params + ?Sized,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("TaggedStack")
      .field("lanes", &self.lanes.len())
      .field("threads", &self.registry.claimed())
      .finish_non_exhaustive()
  }
}

/// A registered thread's view of a [`TaggedStack`].
pub struct TaggedStackRef<'stack, T, P, B>
where
  P: Params + ?Sized,
{
  stack: &'stack TaggedStack<T, P, B>,
  lane: usize,
  backoff: B,
}

impl<T, P, B> TaggedStackRef<'_, T, P, B>
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

  /// Pushes `value`; returns `false` when the chosen lane is out of both
  /// spare nodes and budget.
  pub fn push(&mut self, value: T) -> bool {
    let stack = self.stack;
    let lane: usize = self.next_lane();

    let mut head: TaggedPtr<PoolNode<T>> = stack.head.load(Ordering::Acquire);

    let Some(node) = stack
      .lanes
      .lane(lane)
      .acquire_linked(head, value, &mut self.backoff)
    else {
      return false;
    };

    loop {
      // SAFETY: The node stays private until the CAS publishes it.
      unsafe {
        (*node.address()).relink(head.address(), Ordering::Relaxed);
      }

      match stack.head.compare_exchange(
        head,
        head.advance(node.address()),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return true,
        Err(actual) => {
          head = actual;
          self.backoff.wait();
        }
      }
    }
  }

  /// Pops the most recently pushed value, or `None` when the stack is empty.
  pub fn pop(&mut self) -> Option<T> {
    let stack = self.stack;

    let mut head: TaggedPtr<PoolNode<T>> = stack.head.load(Ordering::Acquire);

    let value: T = loop {
      // SAFETY: Stack nodes are never deallocated while the stack lives;
      // reading through a stale `head` yields stale bytes that the failing
      // CAS below discards.
      let next: TaggedPtr<PoolNode<T>> =
        unsafe { (*head.address()).next() }.load(Ordering::Relaxed);

      if next.is_null() {
        // Only the bottom sentinel has no successor.
        return None;
      }

      // SAFETY: As above.
      let value: T = unsafe { (*head.address()).value() };

      // The head word's counter only advances, so success means nothing
      // popped or pushed since `head` was read and both reads above were
      // consistent.
      match stack.head.compare_exchange(
        head,
        head.advance(next.address()),
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => break value,
        Err(actual) => {
          head = actual;
          self.backoff.wait();
        }
      }
    };

    let lane: usize = self.next_lane();

    // The CAS transferred the node to us; its next life gets a bumped
    // counter when the pool reissues it.
    stack.lanes.lane(lane).release(head, &mut self.backoff);

    Some(value)
  }
}

impl<T, P, B> Debug for TaggedStackRef<'_, T, P, B>
where
  P: Params + ?Sized,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("TaggedStackRef").field("lane", &self.lane).finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
