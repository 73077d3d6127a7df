//! Lock-based reference containers.
//!
//! These exist to define behavioral parity for the lock-free containers:
//! identical external signatures and result semantics, no ordering
//! guarantees beyond what a sequential implementation provides. The stress
//! and bench suites run the same workloads against both families.

use core::cell::UnsafeCell;
use core::hash::BuildHasher;
use core::hash::Hash;
use core::mem::MaybeUninit;
use std::collections::hash_map::RandomState;
use std::collections::HashSet as StdHashSet;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::array::Array;
use crate::backoff::PauseBackoff;
use crate::spin::SpinLock;
use crate::sync::atomic::AtomicBool;
use crate::sync::atomic::Ordering;

// -----------------------------------------------------------------------------
// Locked Ordered Set
// -----------------------------------------------------------------------------

/// An ordered set under one mutex: the parity oracle for
/// [`OrderedSet`](crate::OrderedSet).
pub struct LockedSet<T> {
  data: Mutex<Vec<T>>,
}

impl<T> LockedSet<T>
where
  T: Copy + Ord,
{
  #[inline]
  pub fn new() -> Self {
    Self {
      data: Mutex::new(Vec::new()),
    }
  }

  pub fn contains(&self, value: &T) -> bool {
    self.data.lock().unwrap().binary_search(value).is_ok()
  }

  pub fn add(&self, value: T) -> bool {
    let mut data = self.data.lock().unwrap();

    match data.binary_search(&value) {
      Ok(_) => false,
      Err(position) => {
        data.insert(position, value);
        true
      }
    }
  }

  pub fn remove(&self, value: &T) -> bool {
    let mut data = self.data.lock().unwrap();

    match data.binary_search(value) {
      Ok(position) => {
        data.remove(position);
        true
      }
      Err(_) => false,
    }
  }
}

impl<T> Default for LockedSet<T>
where
  T: Copy + Ord,
{
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

// -----------------------------------------------------------------------------
// Striped Hash Set
// -----------------------------------------------------------------------------

struct Stripe<T> {
  lock: SpinLock<PauseBackoff>,
  data: UnsafeCell<StdHashSet<T>>,
}

/// A hash set striped over spin locks: the parity oracle for
/// [`HashSet`](crate::HashSet).
pub struct StripedSet<T, S = RandomState> {
  stripes: Array<Stripe<T>>,
  hasher: S,
}

impl<T> StripedSet<T, RandomState>
where
  T: Copy + Hash + Eq,
{
  #[inline]
  pub fn new() -> Self {
    Self::with_stripes_and_hasher(1024, RandomState::new())
  }
}

impl<T, S> StripedSet<T, S>
where
  T: Copy + Hash + Eq,
  S: BuildHasher,
{
  pub fn with_stripes_and_hasher(stripes: usize, hasher: S) -> Self {
    Self {
      stripes: Array::new(stripes.max(1), |_, slot: &mut MaybeUninit<Stripe<T>>| {
        slot.write(Stripe {
          lock: SpinLock::new(),
          data: UnsafeCell::new(StdHashSet::new()),
        });
      }),
      hasher,
    }
  }

  #[inline]
  fn stripe(&self, value: &T) -> &Stripe<T> {
    let stripe: usize = (self.hasher.hash_one(value) % self.stripes.len() as u64) as usize;

    self.stripes.get(stripe)
  }

  pub fn contains(&self, value: &T) -> bool {
    let stripe: &Stripe<T> = self.stripe(value);
    let _guard = stripe.lock.lock();

    // SAFETY: The stripe lock is held.
    unsafe { (*stripe.data.get()).contains(value) }
  }

  pub fn add(&self, value: T) -> bool {
    let stripe: &Stripe<T> = self.stripe(&value);
    let _guard = stripe.lock.lock();

    // SAFETY: The stripe lock is held.
    unsafe { (*stripe.data.get()).insert(value) }
  }

  pub fn remove(&self, value: &T) -> bool {
    let stripe: &Stripe<T> = self.stripe(value);
    let _guard = stripe.lock.lock();

    // SAFETY: The stripe lock is held.
    unsafe { (*stripe.data.get()).remove(value) }
  }
}

impl<T> Default for StripedSet<T, RandomState>
where
  T: Copy + Hash + Eq,
{
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

// SAFETY: Stripe data is only reached under its spin lock.
unsafe impl<T: Send, S: Send> Send for StripedSet<T, S> {}

// SAFETY: As above; the hasher is only read.
unsafe impl<T: Send, S: Sync> Sync for StripedSet<T, S> {}

// -----------------------------------------------------------------------------
// Locked Stack & Queue
// -----------------------------------------------------------------------------

/// A LIFO stack under one mutex: the parity oracle for the lock-free
/// stacks.
pub struct LockedStack<T> {
  data: Mutex<Vec<T>>,
}

impl<T> LockedStack<T> {
  #[inline]
  pub fn new() -> Self {
    Self {
      data: Mutex::new(Vec::new()),
    }
  }

  pub fn push(&self, value: T) -> bool {
    self.data.lock().unwrap().push(value);
    true
  }

  pub fn pop(&self) -> Option<T> {
    self.data.lock().unwrap().pop()
  }
}

impl<T> Default for LockedStack<T> {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

/// A FIFO queue under one mutex: the parity oracle for
/// [`TaggedQueue`](crate::TaggedQueue).
pub struct LockedQueue<T> {
  data: Mutex<VecDeque<T>>,
}

impl<T> LockedQueue<T> {
  #[inline]
  pub fn new() -> Self {
    Self {
      data: Mutex::new(VecDeque::new()),
    }
  }

  pub fn push(&self, value: T) -> bool {
    self.data.lock().unwrap().push_back(value);
    true
  }

  pub fn pop(&self) -> Option<T> {
    self.data.lock().unwrap().pop_front()
  }
}

impl<T> Default for LockedQueue<T> {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

// -----------------------------------------------------------------------------
// SPSC Ring Queue
// -----------------------------------------------------------------------------

struct RingSlot<T> {
  full: AtomicBool,
  value: UnsafeCell<MaybeUninit<T>>,
}

/// A fixed-capacity ring for exactly one producer and one consumer.
///
/// [`split`] hands out the two endpoints; each owns its own cursor, so
/// neither side ever takes a lock. A `push` into a still-occupied slot
/// fails, which bounds the queue at `N` elements.
///
/// # Examples
///
/// ```
/// use warden::SpscRing;
///
/// let ring: SpscRing<u64, 4> = SpscRing::new();
/// let (mut producer, mut consumer) = ring.split();
///
/// assert!(producer.push(1));
/// assert!(producer.push(2));
/// assert_eq!(consumer.pop(), Some(1));
/// assert_eq!(consumer.pop(), Some(2));
/// assert_eq!(consumer.pop(), None);
/// ```
///
/// [`split`]: Self::split
pub struct SpscRing<T, const N: usize> {
  slots: [RingSlot<T>; N],
  split: AtomicBool,
}

impl<T, const N: usize> SpscRing<T, N>
where
  T: Copy,
{
  #[inline]
  pub fn new() -> Self {
    Self {
      slots: core::array::from_fn(|_| RingSlot {
        full: AtomicBool::new(false),
        value: UnsafeCell::new(MaybeUninit::uninit()),
      }),
      split: AtomicBool::new(false),
    }
  }

  /// Returns the producer and consumer endpoints.
  ///
  /// # Panics
  ///
  /// Panics if called twice: each endpoint must have exactly one owner.
  pub fn split(&self) -> (SpscProducer<'_, T, N>, SpscConsumer<'_, T, N>) {
    assert!(
      !self.split.swap(true, Ordering::AcqRel),
      "SpscRing::split called twice",
    );

    (
      SpscProducer {
        ring: self,
        cursor: 0,
      },
      SpscConsumer {
        ring: self,
        cursor: 0,
      },
    )
  }
}

impl<T, const N: usize> Default for SpscRing<T, N>
where
  T: Copy,
{
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

// SAFETY: Slot payloads are only touched by the single producer (before the
// `full` release store) or the single consumer (after the acquire load).
unsafe impl<T: Send, const N: usize> Send for SpscRing<T, N> {}

// SAFETY: As above.
unsafe impl<T: Send, const N: usize> Sync for SpscRing<T, N> {}

/// The producing endpoint of a [`SpscRing`].
pub struct SpscProducer<'ring, T, const N: usize> {
  ring: &'ring SpscRing<T, N>,
  cursor: usize,
}

impl<T, const N: usize> SpscProducer<'_, T, N>
where
  T: Copy,
{
  /// Appends `value`; returns `false` when the ring is full.
  pub fn push(&mut self, value: T) -> bool {
    let slot: &RingSlot<T> = &self.ring.slots[self.cursor % N];

    if slot.full.load(Ordering::Acquire) {
      return false;
    }

    // SAFETY: The slot is empty and only this producer writes payloads.
    unsafe {
      (*slot.value.get()).write(value);
    }

    slot.full.store(true, Ordering::Release);
    self.cursor += 1;

    true
  }
}

/// The consuming endpoint of a [`SpscRing`].
pub struct SpscConsumer<'ring, T, const N: usize> {
  ring: &'ring SpscRing<T, N>,
  cursor: usize,
}

impl<T, const N: usize> SpscConsumer<'_, T, N>
where
  T: Copy,
{
  /// Removes the oldest value, or `None` when the ring is empty.
  pub fn pop(&mut self) -> Option<T> {
    let slot: &RingSlot<T> = &self.ring.slots[self.cursor % N];

    if !slot.full.load(Ordering::Acquire) {
      return None;
    }

    // SAFETY: The slot is full, so the producer's payload write
    // happened-before the acquire load above.
    let value: T = unsafe { (*slot.value.get()).assume_init_read() };

    slot.full.store(false, Ordering::Release);
    self.cursor += 1;

    Some(value)
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

  use crate::locked::LockedQueue;
  use crate::locked::LockedSet;
  use crate::locked::LockedStack;
  use crate::locked::SpscRing;
  use crate::locked::StripedSet;

  #[test]
  fn locked_set_contract() {
    let set: LockedSet<u64> = LockedSet::new();

    assert!(set.add(5));
    assert!(set.add(3));
    assert!(!set.add(5));
    assert!(set.contains(&3));
    assert!(set.remove(&3));
    assert!(!set.contains(&3));
    assert!(!set.remove(&3));
  }

  #[test]
  fn striped_set_contract() {
    let set: StripedSet<u64> = StripedSet::new();

    assert!(set.add(5));
    assert!(!set.add(5));
    assert!(set.contains(&5));
    assert!(set.remove(&5));
    assert!(!set.contains(&5));
  }

  #[test]
  fn striped_set_concurrent_inserts() {
    let set: Arc<StripedSet<u64>> = Arc::new(StripedSet::with_stripes_and_hasher(
      16,
      std::collections::hash_map::RandomState::new(),
    ));

    let handles: Vec<_> = (0..4u64)
      .map(|thread| {
        let set = Arc::clone(&set);

        thread::spawn(move || {
          for value in (thread * 100)..(thread * 100 + 100) {
            assert!(set.add(value));
          }
        })
      })
      .collect();

    for handle in handles {
      handle.join().unwrap();
    }

    for value in 0..400 {
      assert!(set.contains(&value));
    }
  }

  #[test]
  fn locked_stack_and_queue() {
    let stack: LockedStack<u64> = LockedStack::new();
    let queue: LockedQueue<u64> = LockedQueue::new();

    for value in [10, 20, 30] {
      assert!(stack.push(value));
      assert!(queue.push(value));
    }

    assert_eq!(stack.pop(), Some(30));
    assert_eq!(queue.pop(), Some(10));
  }

  #[test]
  fn ring_bounds() {
    let ring: SpscRing<u64, 2> = SpscRing::new();
    let (mut producer, mut consumer) = ring.split();

    assert!(producer.push(1));
    assert!(producer.push(2));
    assert!(!producer.push(3));

    assert_eq!(consumer.pop(), Some(1));
    assert!(producer.push(3));
    assert_eq!(consumer.pop(), Some(2));
    assert_eq!(consumer.pop(), Some(3));
    assert_eq!(consumer.pop(), None);
  }

  #[test]
  #[should_panic = "split called twice"]
  fn ring_split_once() {
    let ring: SpscRing<u64, 2> = SpscRing::new();
    let _endpoints = ring.split();
    let _again = ring.split();
  }

  #[test]
  fn ring_across_threads() {
    let ring: Arc<SpscRing<u64, 8>> = Arc::new(SpscRing::new());
    let (mut producer, mut consumer) = ring.split();

    thread::scope(|scope| {
      scope.spawn(move || {
        for value in 0..1000 {
          while !producer.push(value) {
            thread::yield_now();
          }
        }
      });

      scope.spawn(move || {
        for expected in 0..1000 {
          loop {
            if let Some(value) = consumer.pop() {
              assert_eq!(value, expected);
              break;
            }

            thread::yield_now();
          }
        }
      });
    });
  }
}
