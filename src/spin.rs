//! A test-and-set spin lock.
//!
//! Only the striped reference set uses this; the lock-free containers never
//! block. Kept minimal: an atomic flag flipped with an acquire CAS, released
//! with a release store, back-off between failed attempts.

use crate::backoff::Backoff;
use crate::backoff::PauseBackoff;
use crate::sync::atomic::AtomicBool;
use crate::sync::atomic::Ordering;

/// A spin lock parameterized by its back-off strategy.
pub(crate) struct SpinLock<B = PauseBackoff> {
  flag: AtomicBool,
  marker: core::marker::PhantomData<B>,
}

impl<B> SpinLock<B>
where
  B: Backoff,
{
  #[inline]
  pub(crate) fn new() -> Self {
    Self {
      flag: AtomicBool::new(false),
      marker: core::marker::PhantomData,
    }
  }

  /// Acquires the lock, spinning until it is free.
  #[inline]
  pub(crate) fn lock(&self) -> SpinGuard<'_, B> {
    let mut backoff: B = B::default();

    loop {
      if self
        .flag
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
      {
        return SpinGuard { lock: self };
      }

      backoff.wait();
    }
  }

  #[inline]
  fn unlock(&self) {
    self.flag.store(false, Ordering::Release);
  }
}

/// Releases the lock on drop.
pub(crate) struct SpinGuard<'lock, B>
where
  B: Backoff,
{
  lock: &'lock SpinLock<B>,
}

impl<B> Drop for SpinGuard<'_, B>
where
  B: Backoff,
{
  #[inline]
  fn drop(&mut self) {
    self.lock.unlock();
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(not(any(loom, shuttle)))]
#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::thread;

  use crate::backoff::PauseBackoff;
  use crate::spin::SpinLock;

  #[test]
  fn exclusion() {
    let lock: Arc<SpinLock<PauseBackoff>> = Arc::new(SpinLock::new());
    let total: Arc<std::sync::atomic::AtomicU64> = Arc::new(std::sync::atomic::AtomicU64::new(0));

    let threads: Vec<_> = (0..4)
      .map(|_| {
        let lock = Arc::clone(&lock);
        let total = Arc::clone(&total);

        thread::spawn(move || {
          for _ in 0..1000 {
            let _guard = lock.lock();
            let seen = total.load(std::sync::atomic::Ordering::Relaxed);
            total.store(seen + 1, std::sync::atomic::Ordering::Relaxed);
          }
        })
      })
      .collect();

    for thread in threads {
      thread.join().unwrap();
    }

    assert_eq!(total.load(std::sync::atomic::Ordering::Relaxed), 4000);
  }

  #[test]
  fn guard_releases() {
    let lock: SpinLock<PauseBackoff> = SpinLock::new();

    drop(lock.lock());
    drop(lock.lock());
  }
}
