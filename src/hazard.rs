//! The hazard-pointer domain.
//!
//! Every hazard-pointer container owns one `HazardDomain`. Each registered
//! thread gets a cache-padded row of [`HP_NUM`] slot pointers and a private
//! retire list. A traverser publishes the node it is about to dereference in
//! one of its slots ([`protect`]), re-validates that the node is still the
//! shared value, and only then dereferences; an unlinker hands removed nodes
//! to [`retire`], which defers destruction until a scan proves no slot in
//! any row still points at them.
//!
//! The scan is the classic sweep: snapshot all non-null slots, sort them,
//! binary-search each retired pointer, destroy the misses, and compact the
//! hits back to the front of the list. With the retire cap at
//! `2 × HP_NUM × THREADS`, at least half of every scanned list is
//! reclaimable, so the amortized cost per retire is O(1) and no retire list
//! ever grows past its cap.
//!
//! [`protect`]: HazardDomain::protect
//! [`retire`]: HazardDomain::retire

use core::cell::UnsafeCell;
use core::ptr;

use crate::array::Array;
use crate::heap;
use crate::padded::CachePadded;
use crate::params::HP_NUM;
use crate::sync::atomic::AtomicPtr;
use crate::sync::atomic::Ordering;

// -----------------------------------------------------------------------------
// Per-thread State
// -----------------------------------------------------------------------------

struct SlotRow<N> {
  slots: [AtomicPtr<N>; HP_NUM],
}

impl<N> SlotRow<N> {
  #[inline]
  fn new() -> Self {
    Self {
      slots: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
    }
  }
}

struct RetireRow<N> {
  nodes: Vec<*mut N>,
}

// -----------------------------------------------------------------------------
// Hazard Domain
// -----------------------------------------------------------------------------

/// Per-thread protection slots and deferred reclamation.
///
/// `thread` arguments are registry indices; rows are exclusively written by
/// their owning thread. The container enforces this by wiring the index into
/// a handle whose operations take `&mut self`.
pub(crate) struct HazardDomain<N> {
  slots: Array<CachePadded<SlotRow<N>>>,
  retired: Array<CachePadded<UnsafeCell<RetireRow<N>>>>,
  retire_cap: usize,
}

impl<N> HazardDomain<N> {
  #[inline]
  pub(crate) fn new(threads: usize, retire_cap: usize) -> Self {
    Self {
      slots: Array::new(threads, |_, slot| {
        slot.write(CachePadded::new(SlotRow::new()));
      }),
      retired: Array::new(threads, |_, slot| {
        slot.write(CachePadded::new(UnsafeCell::new(RetireRow {
          nodes: Vec::with_capacity(retire_cap),
        })));
      }),
      retire_cap,
    }
  }

  /// Publishes `node` in slot `slot` of thread `thread`.
  ///
  /// Release-ordered so that a scanning thread which observes the slot also
  /// observes it before deciding a retired pointer's fate. The caller must
  /// re-validate the shared location *after* publishing and before
  /// dereferencing.
  #[inline]
  pub(crate) fn protect(&self, thread: usize, slot: usize, node: *mut N) {
    self.slots.get(thread).slots[slot].store(node, Ordering::Release);
  }

  /// Clears slot `slot` of thread `thread`.
  #[inline]
  pub(crate) fn clear(&self, thread: usize, slot: usize) {
    self.slots.get(thread).slots[slot].store(ptr::null_mut(), Ordering::Release);
  }

  /// Reads a slot. Diagnostic only.
  #[allow(dead_code, reason = "diagnostic counterpart of `protect`")]
  #[inline]
  pub(crate) fn hazard(&self, thread: usize, slot: usize) -> *mut N {
    self.slots.get(thread).slots[slot].load(Ordering::Acquire)
  }

  /// Allocates a fresh node outside any shared structure.
  #[inline]
  pub(crate) fn alloc(node: N) -> *mut N {
    heap::construct(node)
  }

  /// Destroys a node immediately.
  ///
  /// # Safety
  ///
  /// `node` must never have been linked into a shared structure; no other
  /// thread can hold it in a hazard slot.
  #[inline]
  pub(crate) unsafe fn free_now(node: *mut N) {
    // SAFETY: Caller guarantees exclusive ownership.
    unsafe {
      heap::destroy(node);
    }
  }

  /// Appends `node` to thread `thread`'s retire list, scanning when the list
  /// reaches its cap.
  ///
  /// # Safety
  ///
  /// - The caller must own registry index `thread`.
  /// - `node` must have been unlinked from every shared structure, and
  ///   ownership of it passes to the domain.
  pub(crate) unsafe fn retire(&self, thread: usize, node: *mut N) {
    // SAFETY: The owning thread is the only one touching this row.
    let row: &mut RetireRow<N> = unsafe { &mut *self.retired.get(thread).get() };

    row.nodes.push(node);

    if row.nodes.len() >= self.retire_cap {
      // SAFETY: Row exclusivity as above; nodes in the row are unlinked.
      unsafe {
        Self::sweep(&self.slots, row);
      }
    }
  }

  /// The number of pointers currently awaiting reclamation for `thread`.
  ///
  /// # Safety
  ///
  /// The caller must own registry index `thread`.
  #[cfg(test)]
  pub(crate) unsafe fn retired_len(&self, thread: usize) -> usize {
    // SAFETY: The owning thread is the only one touching this row.
    unsafe { (*self.retired.get(thread).get()).nodes.len() }
  }

  /// Destroys every retired pointer no hazard slot protects; compacts the
  /// survivors to the front of the list.
  ///
  /// # Safety
  ///
  /// `row` must be exclusively borrowed by its owning thread and must only
  /// contain unlinked nodes owned by the domain.
  unsafe fn sweep(slots: &Array<CachePadded<SlotRow<N>>>, row: &mut RetireRow<N>) {
    let mut hazards: Vec<*mut N> = Vec::with_capacity(slots.len() * HP_NUM);

    for slot_row in slots.as_slice() {
      for slot in &slot_row.slots {
        let ptr: *mut N = slot.load(Ordering::Acquire);

        if !ptr.is_null() {
          hazards.push(ptr);
        }
      }
    }

    hazards.sort_unstable();

    let mut kept: usize = 0;

    for index in 0..row.nodes.len() {
      let node: *mut N = row.nodes[index];

      if hazards.binary_search(&node).is_ok() {
        row.nodes[kept] = node;
        kept += 1;
      } else {
        // SAFETY: The node is unlinked and no slot protected it across the
        // snapshot, so no thread can reach it anymore.
        unsafe {
          heap::destroy(node);
        }
      }
    }

    row.nodes.truncate(kept);
  }
}

impl<N> Drop for HazardDomain<N> {
  fn drop(&mut self) {
    for cell in self.retired.as_slice() {
      // SAFETY: `Drop` has exclusive access; every pointer still in a retire
      // list is owned by the domain and destroyed exactly once.
      let row: &mut RetireRow<N> = unsafe { &mut *cell.get() };

      for &node in &row.nodes {
        // SAFETY: As above.
        unsafe {
          heap::destroy(node);
        }
      }

      row.nodes.clear();
    }
  }
}

// SAFETY: Retired nodes own `N` values, which move with the domain.
unsafe impl<N: Send> Send for HazardDomain<N> {}

// SAFETY: Slot rows are atomics; retire rows are only touched through their
// owning thread's unique registry index.
unsafe impl<N: Send> Sync for HazardDomain<N> {}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(not(any(loom, shuttle)))]
#[cfg(test)]
mod tests {
  use crate::hazard::HazardDomain;
  use crate::params::HP_NUM;

  macro_rules! make_counted {
    ($name:ident) => {
      static DROPS: ::core::sync::atomic::AtomicU32 = ::core::sync::atomic::AtomicU32::new(0);

      struct $name(#[allow(dead_code)] u64);

      impl $name {
        fn drops() -> u32 {
          DROPS.load(::core::sync::atomic::Ordering::Relaxed)
        }
      }

      impl Drop for $name {
        fn drop(&mut self) {
          DROPS.fetch_add(1, ::core::sync::atomic::Ordering::Relaxed);
        }
      }
    };
  }

  #[test]
  fn protect_and_read_back() {
    let domain: HazardDomain<u64> = HazardDomain::new(2, 8);
    let node: *mut u64 = HazardDomain::alloc(5);

    domain.protect(0, 3, node);

    assert_eq!(domain.hazard(0, 3), node);
    assert!(domain.hazard(1, 3).is_null());

    domain.clear(0, 3);

    assert!(domain.hazard(0, 3).is_null());

    unsafe {
      HazardDomain::free_now(node);
    }
  }

  // Scenario: A thread retires nodes until its list hits the cap.
  // Expected: The scan destroys every unprotected node and keeps the
  // protected one, which the next scan destroys once the slot clears.
  #[test]
  fn sweep_spares_protected_nodes() {
    make_counted!(Counted);

    let cap: usize = 4;
    let domain: HazardDomain<Counted> = HazardDomain::new(1, cap);

    let shielded: *mut Counted = HazardDomain::alloc(Counted(0));
    domain.protect(0, 0, shielded);

    unsafe {
      domain.retire(0, shielded);

      for value in 1..cap as u64 {
        domain.retire(0, HazardDomain::alloc(Counted(value)));
      }

      // The cap-triggering retire swept everything except the shielded node.
      assert_eq!(domain.retired_len(0), 1);
    }

    assert_eq!(Counted::drops(), cap as u32 - 1);

    domain.clear(0, 0);

    unsafe {
      for value in 0..cap as u64 - 1 {
        domain.retire(0, HazardDomain::alloc(Counted(value)));
      }

      assert_eq!(domain.retired_len(0), 0);
    }

    assert_eq!(Counted::drops(), 2 * cap as u32 - 1);
  }

  // Scenario: Protection published from one thread index shields a node
  // retired by another.
  #[test]
  fn sweep_honors_foreign_slots() {
    make_counted!(Counted);

    let domain: HazardDomain<Counted> = HazardDomain::new(2, 2);

    let node: *mut Counted = HazardDomain::alloc(Counted(0));
    domain.protect(1, HP_NUM - 1, node);

    unsafe {
      domain.retire(0, node);
      domain.retire(0, HazardDomain::alloc(Counted(1)));

      assert_eq!(domain.retired_len(0), 1);
    }

    assert_eq!(Counted::drops(), 1);

    domain.clear(1, HP_NUM - 1);
    drop(domain);

    // Drop reclaims whatever was still pending.
    assert_eq!(Counted::drops(), 2);
  }

  #[test]
  fn drop_reclaims_pending() {
    make_counted!(Counted);

    let domain: HazardDomain<Counted> = HazardDomain::new(1, 64);

    unsafe {
      for value in 0..5 {
        domain.retire(0, HazardDomain::alloc(Counted(value)));
      }
    }

    assert_eq!(Counted::drops(), 0);

    drop(domain);

    assert_eq!(Counted::drops(), 5);
  }
}
