//! Typed node allocation.
//!
//! A thin construct/destroy façade over the global allocator. Containers go
//! through these helpers so node ownership transfers read uniformly at the
//! call sites that link, retire, and reclaim.

/// Allocates and constructs a node, returning an owning raw pointer.
#[inline]
pub(crate) fn construct<T>(value: T) -> *mut T {
  Box::into_raw(Box::new(value))
}

/// Runs the destructor and frees the allocation.
///
/// # Safety
///
/// `ptr` must have come from [`construct`] and must not be reachable from any
/// shared structure; it is destroyed exactly once.
#[inline]
pub(crate) unsafe fn destroy<T>(ptr: *mut T) {
  // SAFETY: Caller guarantees `ptr` originated from `Box::into_raw` and is
  // exclusively owned here.
  drop(unsafe { Box::from_raw(ptr) });
}

#[cfg(not(any(loom, shuttle)))]
#[cfg(test)]
mod tests {
  use core::sync::atomic::AtomicU32;
  use core::sync::atomic::Ordering;

  use crate::heap;

  #[test]
  fn construct_destroy_balance() {
    static DROPS: AtomicU32 = AtomicU32::new(0);

    struct Counted;

    impl Drop for Counted {
      fn drop(&mut self) {
        DROPS.fetch_add(1, Ordering::Relaxed);
      }
    }

    let ptr: *mut Counted = heap::construct(Counted);

    assert_eq!(DROPS.load(Ordering::Relaxed), 0);

    unsafe {
      heap::destroy(ptr);
    }

    assert_eq!(DROPS.load(Ordering::Relaxed), 1);
  }
}
