//! The lock-free ordered set, a Harris-style linked list.
//!
//! The list is singly linked behind a permanent head sentinel and kept in
//! ascending value order. Removal is two-phased: `remove` sets the low bit
//! of the victim's `next` pointer (logical deletion, the linearization
//! point) and leaves the physical unlink to whichever traversal next walks
//! past the node. A traversal that unlinks a marked node hands it to the
//! hazard domain; the node is destroyed once no hazard slot can still see
//! it.
//!
//! `search` maintains the two-slot protection discipline: `prev` lives in
//! the thread's slot 0 and `curr` in slot 1, each published *before* the
//! validating re-read of `prev->next`. Any mismatch in that re-read means
//! the window moved underneath us and the walk restarts from the head.

use core::fmt::Debug;
use core::fmt::Formatter;
use core::fmt::Result as FmtResult;
use core::marker::PhantomData;

use crate::backoff::Backoff;
use crate::backoff::SleepBackoff;
use crate::hazard::HazardDomain;
use crate::heap;
use crate::node::clear_mark;
use crate::node::is_marked;
use crate::node::with_mark;
use crate::node::HazardNode;
use crate::params::DefaultParams;
use crate::params::Params;
use crate::params::ParamsExt;
use crate::registry::RegisterError;
use crate::registry::ThreadRegistry;
use crate::sync::atomic::Ordering;

// -----------------------------------------------------------------------------
// Hazard-slot Scope Guard
// -----------------------------------------------------------------------------

pub(crate) struct ClearSlots<'domain, N> {
  domain: &'domain HazardDomain<N>,
  index: usize,
}

impl<'domain, N> ClearSlots<'domain, N> {
  #[inline]
  pub(crate) fn new(domain: &'domain HazardDomain<N>, index: usize) -> Self {
    Self { domain, index }
  }
}

impl<N> Drop for ClearSlots<'_, N> {
  #[inline]
  fn drop(&mut self) {
    self.domain.clear(self.index, 0);
    self.domain.clear(self.index, 1);
  }
}

// -----------------------------------------------------------------------------
// Ordered Set
// -----------------------------------------------------------------------------

/// A lock-free ordered set over a Harris linked list.
///
/// Values are kept in ascending order; the set holds at most one copy of
/// each value. Threads participate through [`register`], which returns a
/// [`OrderedSetRef`] carrying the thread's hazard slots and back-off state.
///
/// # Type Parameters
///
/// - `T`: The payload; must be trivially copyable (`Copy`) and totally
///   ordered.
/// - `P`: Configuration, most importantly the thread cap.
/// - `B`: The back-off strategy for contended retries.
///
/// # Examples
///
/// ```
/// use warden::OrderedSet;
///
/// let set: OrderedSet<u64> = OrderedSet::new();
/// let mut set_ref = set.register().unwrap();
///
/// assert!(set_ref.add(5));
/// assert!(!set_ref.add(5));
/// assert!(set_ref.contains(&5));
/// assert!(set_ref.remove(&5));
/// assert!(!set_ref.contains(&5));
/// ```
///
/// [`register`]: Self::register
pub struct OrderedSet<T, P = DefaultParams, B = SleepBackoff>
where
  P: Params + ?Sized,
{
  head: *mut HazardNode<T>,
  domain: HazardDomain<HazardNode<T>>,
  registry: ThreadRegistry,
  marker: PhantomData<(fn(P), fn() -> B)>,
}

impl<T, P, B> OrderedSet<T, P, B>
where
  T: Copy + Ord,
  P: Params + ?Sized,
  B: Backoff,
{
  /// Creates a new, empty set.
  #[inline]
  pub fn new() -> Self {
    Self {
      head: heap::construct(HazardNode::sentinel()),
      domain: HazardDomain::new(P::THREADS.get(), P::RETIRE_CAP),
      registry: ThreadRegistry::new(P::THREADS.get()),
      marker: PhantomData,
    }
  }

  /// Registers the calling thread, claiming one of the `P::THREADS` indices
  /// for the lifetime of the set.
  ///
  /// Each thread should register once and keep its ref; indices are not
  /// recycled.
  #[inline]
  pub fn register(&self) -> Result<OrderedSetRef<'_, T, P, B>, RegisterError> {
    Ok(OrderedSetRef {
      set: self,
      index: self.registry.claim()?,
      backoff: B::default(),
    })
  }

  /// The number of threads registered so far.
  #[inline]
  pub fn threads(&self) -> usize {
    self.registry.claimed()
  }
}

impl<T, P, B> Default for OrderedSet<T, P, B>
where
  T: Copy + Ord,
  P: Params + ?Sized,
  B: Backoff,
{
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

impl<T, P, B> Drop for OrderedSet<T, P, B>
where
  P: Params + ?Sized,
{
  fn drop(&mut self) {
    let mut node: *mut HazardNode<T> = self.head;

    while !node.is_null() {
      // SAFETY: `Drop` has exclusive access; marked successors are still
      // chained, so stripping the mark recovers the real pointer.
      let next: *mut HazardNode<T> =
        clear_mark(unsafe { (*node).next() }.load(Ordering::Relaxed));

      // SAFETY: Every chained node is owned by the set and destroyed once;
      // retired nodes live in the domain, not in the chain.
      unsafe {
        heap::destroy(node);
      }

      node = next;
    }
  }
}

// SAFETY: The set owns its nodes; payloads move with it.
unsafe impl<T, P, B> Send for OrderedSet<T, P, B>
where
  T: Send,
  P: Params + ?Sized,
{
}

// SAFETY: Shared mutation is CAS-only; per-thread state is reached through
// unique registry indices.
unsafe impl<T, P, B> Sync for OrderedSet<T, P, B>
where
  T: Send,
  P: Params + ?Sized,
{
}

impl<T, P, B> Debug for OrderedSet<T, P, B>
where
  P: Params + ?Sized,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("OrderedSet")
      .field("threads", &self.registry.claimed())
      .finish_non_exhaustive()
  }
}

// -----------------------------------------------------------------------------
// Per-thread Ref
// -----------------------------------------------------------------------------

struct Window<T> {
  prev: *mut HazardNode<T>,
  curr: *mut HazardNode<T>,
}

/// A registered thread's view of an [`OrderedSet`].
///
/// Operations take `&mut self`: the ref owns its thread's hazard slots and
/// retire list, so it must not be shared across threads.
pub struct OrderedSetRef<'set, T, P, B>
where
  P: Params + ?Sized,
{
  set: &'set OrderedSet<T, P, B>,
  index: usize,
  backoff: B,
}

impl<T, P, B> OrderedSetRef<'_, T, P, B>
where
  T: Copy + Ord,
  P: Params + ?Sized,
  B: Backoff,
{
  /// Returns `true` if `value` is in the set.
  pub fn contains(&mut self, value: &T) -> bool {
    let set = self.set;
    let _clear: ClearSlots<'_, _> = ClearSlots::new(&set.domain, self.index);

    let window: Window<T> = self.search(value);

    // SAFETY: `curr` is hazard-protected by `search` and not a sentinel.
    !window.curr.is_null() && unsafe { (*window.curr).value() } == *value
  }

  /// Inserts `value`; returns `false` if it was already present.
  pub fn add(&mut self, value: T) -> bool {
    let set = self.set;
    let node: *mut HazardNode<T> = HazardDomain::alloc(HazardNode::with(value));
    let _clear: ClearSlots<'_, _> = ClearSlots::new(&set.domain, self.index);

    loop {
      let window: Window<T> = self.search(&value);

      // SAFETY: `curr` is hazard-protected by `search`.
      if !window.curr.is_null() && unsafe { (*window.curr).value() } == value {
        // SAFETY: The node was never published.
        unsafe {
          HazardDomain::free_now(node);
        }

        return false;
      }

      // SAFETY: The node is still private; the CAS below publishes it.
      unsafe {
        (*node).next().store(window.curr, Ordering::Relaxed);
      }

      // SAFETY: `prev` is hazard-protected and unmarked per the `search`
      // contract; a stale window makes the CAS fail, never fault.
      let link = unsafe { (*window.prev).next() }.compare_exchange(
        window.curr,
        node,
        Ordering::AcqRel,
        Ordering::Acquire,
      );

      if link.is_ok() {
        return true;
      }

      self.backoff.wait();
    }
  }

  /// Removes `value`; returns `false` if it was absent.
  ///
  /// The linearization point is the CAS that sets the deletion mark;
  /// physical unlinking is left to later traversals.
  pub fn remove(&mut self, value: &T) -> bool {
    let set = self.set;
    let _clear: ClearSlots<'_, _> = ClearSlots::new(&set.domain, self.index);

    loop {
      let window: Window<T> = self.search(value);

      // SAFETY: `curr` is hazard-protected by `search`.
      if window.curr.is_null() || unsafe { (*window.curr).value() } != *value {
        return false;
      }

      // SAFETY: As above.
      let next: *mut HazardNode<T> = unsafe { (*window.curr).next() }.load(Ordering::Acquire);

      if is_marked(next) {
        // Someone else is deleting this node; re-search and re-decide.
        continue;
      }

      // Release so a searcher that observes the mark also observes the
      // payload writes that preceded it.
      // SAFETY: As above.
      let mark = unsafe { (*window.curr).next() }.compare_exchange(
        next,
        with_mark(next),
        Ordering::Release,
        Ordering::Relaxed,
      );

      if mark.is_ok() {
        return true;
      }

      self.backoff.wait();
    }
  }

  /// Locates the first live node whose value is `>= value`.
  ///
  /// Post-conditions: `prev` is live and protected in slot 0, `curr` equals
  /// `prev->next` (unmarked) and is protected in slot 1, or is null at the
  /// list's end. Marked runs encountered on the way are unlinked and
  /// retired.
  fn search(&mut self, value: &T) -> Window<T> {
    let set = self.set;
    let domain: &HazardDomain<HazardNode<T>> = &set.domain;

    'restart: loop {
      let mut prev: *mut HazardNode<T> = set.head;

      domain.protect(self.index, 0, prev);

      // SAFETY: The head sentinel is never retired.
      let mut curr: *mut HazardNode<T> = unsafe { (*prev).next() }.load(Ordering::Acquire);

      debug_assert!(!is_marked(curr));
      domain.protect(self.index, 1, curr);

      // SAFETY: As above.
      if curr != unsafe { (*prev).next() }.load(Ordering::Acquire) {
        continue 'restart;
      }

      loop {
        if curr.is_null() {
          return Window { prev, curr };
        }

        // SAFETY: `curr` was validated against `prev->next` after being
        // published in slot 1, so it cannot have been reclaimed.
        let mut next: *mut HazardNode<T> = unsafe { (*curr).next() }.load(Ordering::Acquire);

        while is_marked(next) {
          let cleared: *mut HazardNode<T> = clear_mark(next);

          // SAFETY: `prev` is protected in slot 0. The CAS may fail because
          // `prev` itself got marked; restarting handles that.
          let unlink = unsafe { (*prev).next() }.compare_exchange(
            curr,
            cleared,
            Ordering::AcqRel,
            Ordering::Acquire,
          );

          if unlink.is_err() {
            self.backoff.wait();
            continue 'restart;
          }

          debug_assert!(!is_marked(curr));

          // SAFETY: The CAS above unlinked `curr`; this thread owns it now.
          unsafe {
            domain.retire(self.index, curr);
          }

          if cleared.is_null() {
            return Window {
              prev,
              curr: cleared,
            };
          }

          curr = cleared;
          domain.protect(self.index, 1, curr);

          // SAFETY: As above.
          if curr != unsafe { (*prev).next() }.load(Ordering::Acquire) {
            continue 'restart;
          }

          // SAFETY: Validated and protected just above.
          next = unsafe { (*curr).next() }.load(Ordering::Acquire);
        }

        // SAFETY: `curr` is protected and validated; non-sentinel.
        if unsafe { (*curr).value() } >= *value {
          return Window { prev, curr };
        }

        prev = curr;
        domain.protect(self.index, 0, prev);
        curr = next;
        domain.protect(self.index, 1, curr);

        // SAFETY: `prev` is protected in slot 0.
        if curr != unsafe { (*prev).next() }.load(Ordering::Acquire) {
          continue 'restart;
        }
      }
    }
  }
}

impl<T, P, B> Debug for OrderedSetRef<'_, T, P, B>
where
  P: Params + ?Sized,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("OrderedSetRef").field("index", &self.index).finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
