//! Counter-versioned pointer words.
//!
//! A [`TaggedPtr`] packs a 48-bit pointer and a 16-bit counter into one
//! 64-bit word. Every time a node leaves a free pool its counter is bumped,
//! so a CAS that observed the node's previous life fails even though the
//! address is the same. This is the crate's defense against ABA on recycled
//! nodes; see the pool types for the bump discipline.

use core::fmt::Debug;
use core::fmt::Formatter;
use core::fmt::Result as FmtResult;
use core::marker::PhantomData;

use crate::sync::atomic::AtomicU64;
use crate::sync::atomic::Ordering;

const PTR_BITS: u32 = 48;
const PTR_MASK: u64 = (1 << PTR_BITS) - 1;

// Node allocations are at least 8-byte aligned, so the low three bits of a
// packed pointer are free for markers.
const ALIGN_MASK: u64 = !0x7;

// The 48-bit payload assumes x86-64/AArch64 canonical user-space addresses.
const _: () = assert!(
  size_of::<*mut ()>() == size_of::<u64>(),
  "tagged pointers require a 64-bit platform",
);

// -----------------------------------------------------------------------------
// Tagged Ptr
// -----------------------------------------------------------------------------

/// A pointer packed with a 16-bit version counter.
///
/// Word layout: bits `0..48` carry the pointer payload, bits `48..64` the
/// counter. The counter is monotonic modulo 2¹⁶: every successful CAS that
/// replaces a tagged word installs a value whose counter exceeds the observed
/// one by exactly one (see [`bump`]).
///
/// [`bump`]: Self::bump
#[repr(transparent)]
pub(crate) struct TaggedPtr<T> {
  bits: u64,
  marker: PhantomData<*mut T>,
}

impl<T> TaggedPtr<T> {
  /// The null word: null pointer, counter zero.
  #[inline]
  pub(crate) const fn null() -> Self {
    Self {
      bits: 0,
      marker: PhantomData,
    }
  }

  /// Packs `ptr` and `counter` into a tagged word.
  #[inline]
  pub(crate) fn pack(ptr: *mut T, counter: u16) -> Self {
    Self {
      bits: (ptr as u64 & PTR_MASK) | (u64::from(counter) << PTR_BITS),
      marker: PhantomData,
    }
  }

  #[inline]
  pub(crate) const fn from_bits(bits: u64) -> Self {
    Self {
      bits,
      marker: PhantomData,
    }
  }

  #[inline]
  pub(crate) const fn into_bits(self) -> u64 {
    self.bits
  }

  /// Returns the pointer payload.
  #[inline]
  pub(crate) const fn ptr(self) -> *mut T {
    (self.bits & PTR_MASK) as *mut T
  }

  /// Returns the pointer payload with the low three bits cleared.
  ///
  /// Use this when the word may carry marker bits and the raw address of the
  /// (aligned) node is needed.
  #[inline]
  pub(crate) const fn address(self) -> *mut T {
    (self.bits & PTR_MASK & ALIGN_MASK) as *mut T
  }

  /// Returns the version counter.
  #[inline]
  pub(crate) const fn counter(self) -> u16 {
    (self.bits >> PTR_BITS) as u16
  }

  /// The word a successful CAS must install over an observed word `self`:
  /// the new pointer with `self`'s counter plus one.
  ///
  /// Every tagged location (head, tail, every `next`) keeps its own counter
  /// monotone this way, so a CAS prepared against a word's previous life
  /// can never land.
  #[inline]
  pub(crate) fn advance(self, ptr: *mut T) -> Self {
    Self::pack(ptr, self.counter().wrapping_add(1))
  }

  /// Returns the same pointer with the counter incremented (wrapping).
  #[inline]
  pub(crate) fn bump(self) -> Self {
    self.advance(self.ptr())
  }

  /// Returns `true` if the pointer payload is null.
  #[inline]
  pub(crate) const fn is_null(self) -> bool {
    self.bits & PTR_MASK == 0
  }
}

impl<T> Clone for TaggedPtr<T> {
  #[inline]
  fn clone(&self) -> Self {
    *self
  }
}

impl<T> Copy for TaggedPtr<T> {}

impl<T> PartialEq for TaggedPtr<T> {
  #[inline]
  fn eq(&self, other: &Self) -> bool {
    self.bits == other.bits
  }
}

impl<T> Eq for TaggedPtr<T> {}

impl<T> Debug for TaggedPtr<T> {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("TaggedPtr")
      .field("ptr", &self.ptr())
      .field("counter", &self.counter())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Atomic Tagged Ptr
// -----------------------------------------------------------------------------

/// An atomic cell holding a [`TaggedPtr`].
#[repr(transparent)]
pub(crate) struct AtomicTagged<T> {
  bits: AtomicU64,
  marker: PhantomData<*mut T>,
}

impl<T> AtomicTagged<T> {
  #[inline]
  pub(crate) fn new(value: TaggedPtr<T>) -> Self {
    Self {
      bits: AtomicU64::new(value.into_bits()),
      marker: PhantomData,
    }
  }

  #[inline]
  pub(crate) fn load(&self, order: Ordering) -> TaggedPtr<T> {
    TaggedPtr::from_bits(self.bits.load(order))
  }

  #[inline]
  pub(crate) fn store(&self, value: TaggedPtr<T>, order: Ordering) {
    self.bits.store(value.into_bits(), order);
  }

  /// CAS on the full 64-bit word: pointer and counter compare together.
  #[inline]
  pub(crate) fn compare_exchange(
    &self,
    current: TaggedPtr<T>,
    new: TaggedPtr<T>,
    success: Ordering,
    failure: Ordering,
  ) -> Result<TaggedPtr<T>, TaggedPtr<T>> {
    self
      .bits
      .compare_exchange(current.into_bits(), new.into_bits(), success, failure)
      .map(TaggedPtr::from_bits)
      .map_err(TaggedPtr::from_bits)
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
