//! Node types shared by the containers.
//!
//! Three shapes, one per reclamation regime:
//!
//! - [`PoolNode`]: `next` is a tagged word; lives in tagged containers and
//!   their free pools, where the counter in the word defeats ABA.
//! - [`HazardNode`]: `next` is a raw atomic pointer whose low bit is the
//!   logical-deletion mark; reclaimed through the hazard domain.
//! - [`BucketNode`]: a hazard node extended with the split-ordered key and
//!   the bucket-sentinel flag of the hash set.
//!
//! Payloads are `MaybeUninit` because sentinel and pool-resident nodes carry
//! no value; the accessors are `unsafe` and the containers uphold the
//! initialized-before-read discipline.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr;

use crate::tagged::AtomicTagged;
use crate::tagged::TaggedPtr;
use crate::sync::atomic::AtomicPtr;
use crate::sync::atomic::Ordering;

// -----------------------------------------------------------------------------
// Deletion Mark
// -----------------------------------------------------------------------------

/// Low bit of a `next` pointer: set when the owning node is logically
/// removed.
pub(crate) const REMOVED_MARK: usize = 0x1;

#[inline]
pub(crate) fn is_marked<N>(ptr: *mut N) -> bool {
  ptr as usize & REMOVED_MARK != 0
}

#[inline]
pub(crate) fn with_mark<N>(ptr: *mut N) -> *mut N {
  (ptr as usize | REMOVED_MARK) as *mut N
}

#[inline]
pub(crate) fn clear_mark<N>(ptr: *mut N) -> *mut N {
  (ptr as usize & !REMOVED_MARK) as *mut N
}

// -----------------------------------------------------------------------------
// Pool Node
// -----------------------------------------------------------------------------

/// A node of the tagged-pointer containers and their free pools.
pub(crate) struct PoolNode<T> {
  next: AtomicTagged<PoolNode<T>>,
  value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> PoolNode<T> {
  /// A node with no successor and no value; pool terminals start like this.
  #[inline]
  pub(crate) fn empty() -> Self {
    Self {
      next: AtomicTagged::new(TaggedPtr::null()),
      value: UnsafeCell::new(MaybeUninit::uninit()),
    }
  }

  #[inline]
  pub(crate) fn with(value: T) -> Self {
    Self {
      next: AtomicTagged::new(TaggedPtr::null()),
      value: UnsafeCell::new(MaybeUninit::new(value)),
    }
  }

  #[inline]
  pub(crate) fn next(&self) -> &AtomicTagged<PoolNode<T>> {
    &self.next
  }

  /// Points `next` at `successor`, advancing the word's counter.
  ///
  /// The node must be private to the caller. Advancing (rather than
  /// resetting) the counter keeps the word monotone across the node's
  /// lives, so a CAS prepared against the previous life cannot land on the
  /// next one.
  #[inline]
  pub(crate) fn relink(&self, successor: *mut PoolNode<T>, order: Ordering) {
    let observed: TaggedPtr<PoolNode<T>> = self.next.load(Ordering::Relaxed);

    self.next.store(observed.advance(successor), order);
  }

  /// Writes the payload.
  ///
  /// # Safety
  ///
  /// The node must be private to the caller (freshly allocated or just
  /// popped from a pool, not yet published).
  #[inline]
  pub(crate) unsafe fn set_value(&self, value: T) {
    // SAFETY: Caller guarantees exclusive access.
    unsafe {
      (*self.value.get()).write(value);
    }
  }

  /// Copies the payload out.
  ///
  /// # Safety
  ///
  /// The payload must have been written by [`set_value`] or [`with`] since
  /// the node last left a pool.
  ///
  /// [`set_value`]: Self::set_value
  /// [`with`]: Self::with
  #[inline]
  pub(crate) unsafe fn value(&self) -> T
  where
    T: Copy,
  {
    // SAFETY: Caller guarantees the payload is initialized; `T: Copy` makes
    // the read non-destructive.
    unsafe { (*self.value.get()).assume_init_read() }
  }
}

// -----------------------------------------------------------------------------
// Hazard Node
// -----------------------------------------------------------------------------

/// A node of the hazard-pointer containers.
pub(crate) struct HazardNode<T> {
  next: AtomicPtr<HazardNode<T>>,
  value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> HazardNode<T> {
  /// A valueless node: list heads and the stack's bottom sentinel.
  #[inline]
  pub(crate) fn sentinel() -> Self {
    Self {
      next: AtomicPtr::new(ptr::null_mut()),
      value: UnsafeCell::new(MaybeUninit::uninit()),
    }
  }

  #[inline]
  pub(crate) fn with(value: T) -> Self {
    Self {
      next: AtomicPtr::new(ptr::null_mut()),
      value: UnsafeCell::new(MaybeUninit::new(value)),
    }
  }

  #[inline]
  pub(crate) fn next(&self) -> &AtomicPtr<HazardNode<T>> {
    &self.next
  }

  /// Copies the payload out.
  ///
  /// # Safety
  ///
  /// The node must not be a sentinel.
  #[inline]
  pub(crate) unsafe fn value(&self) -> T
  where
    T: Copy,
  {
    // SAFETY: Caller guarantees the node was built by `with`.
    unsafe { (*self.value.get()).assume_init_read() }
  }
}

// -----------------------------------------------------------------------------
// Bucket Node
// -----------------------------------------------------------------------------

/// A hash-set node: hazard node plus split-ordered key and sentinel flag.
pub(crate) struct BucketNode<T> {
  next: AtomicPtr<BucketNode<T>>,
  key: u64,
  is_sentinel: bool,
  value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> BucketNode<T> {
  /// A permanent bucket head; never removable, carries no value.
  #[inline]
  pub(crate) fn sentinel(key: u64) -> Self {
    Self {
      next: AtomicPtr::new(ptr::null_mut()),
      key,
      is_sentinel: true,
      value: UnsafeCell::new(MaybeUninit::uninit()),
    }
  }

  #[inline]
  pub(crate) fn with(key: u64, value: T) -> Self {
    Self {
      next: AtomicPtr::new(ptr::null_mut()),
      key,
      is_sentinel: false,
      value: UnsafeCell::new(MaybeUninit::new(value)),
    }
  }

  #[inline]
  pub(crate) fn next(&self) -> &AtomicPtr<BucketNode<T>> {
    &self.next
  }

  #[inline]
  pub(crate) fn key(&self) -> u64 {
    self.key
  }

  #[inline]
  pub(crate) fn is_sentinel(&self) -> bool {
    self.is_sentinel
  }

  /// Copies the payload out.
  ///
  /// # Safety
  ///
  /// The node must not be a sentinel.
  #[inline]
  pub(crate) unsafe fn value(&self) -> T
  where
    T: Copy,
  {
    debug_assert!(!self.is_sentinel);

    // SAFETY: Caller guarantees the node was built by `with`.
    unsafe { (*self.value.get()).assume_init_read() }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
