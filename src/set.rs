//! The lock-free hash set.
//!
//! One ordered Harris list holds every element of every bucket; the buckets
//! are carved out of it by permanent sentinel nodes. Ordering is by
//! *split-ordered key*: a member hashes to `reverse_bits(hash) | 1`, the
//! sentinel of bucket `b` sits at `reverse_bits(b)`. Reversing the bits puts
//! the bucket-selecting low bits of the hash at the top of the key, so each
//! bucket's members form one contiguous run that starts right after its
//! sentinel and ends before the next sentinel. Member keys are odd and
//! sentinel keys even, so a sentinel orders strictly before its members and
//! no member ever collides with a sentinel.
//!
//! An operation hashes its value, jumps straight to the bucket's sentinel
//! through the bucket table, and runs the ordinary list search from there
//! instead of from the front of the list. Values whose full hashes collide share a key;
//! the search disambiguates them by value equality inside the equal-key run.
//!
//! Why bit-reversed ordering: the sentinels for `N`, `2N`, `4N`, … buckets
//! land at arithmetically predictable positions in the list, so doubling the
//! bucket count (resizing, out of scope here) would never move an item.

use core::fmt::Debug;
use core::fmt::Formatter;
use core::fmt::Result as FmtResult;
use core::hash::BuildHasher;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ptr;
use std::collections::hash_map::RandomState;

use crate::array::Array;
use crate::backoff::Backoff;
use crate::backoff::SleepBackoff;
use crate::hazard::HazardDomain;
use crate::heap;
use crate::list::ClearSlots;
use crate::node::clear_mark;
use crate::node::is_marked;
use crate::node::with_mark;
use crate::node::BucketNode;
use crate::padded::CachePadded;
use crate::params::DefaultParams;
use crate::params::Params;
use crate::params::ParamsExt;
use crate::registry::RegisterError;
use crate::registry::ThreadRegistry;
use crate::sync::atomic::AtomicI64;
use crate::sync::atomic::Ordering;

const DEFAULT_LOAD_FACTOR: f32 = 2.0;

// -----------------------------------------------------------------------------
// Split-ordered Keys
// -----------------------------------------------------------------------------

/// The list key of a member with the given hash. Always odd.
#[inline]
fn member_key(hash: u64) -> u64 {
  hash.reverse_bits() | 1
}

/// The list key of bucket `bucket`'s sentinel. Always even.
#[inline]
fn sentinel_key(bucket: u64) -> u64 {
  bucket.reverse_bits()
}

// -----------------------------------------------------------------------------
// Load-factor Controller
// -----------------------------------------------------------------------------

/// Advisory occupancy tracking: per-thread signed deltas, summed on demand.
///
/// The sum is opportunistic: concurrent operations can make it stale by a
/// few elements in either direction, which is fine for a best-effort cap.
struct LoadFactor {
  counts: Array<CachePadded<AtomicI64>>,
  cap: i64,
}

impl LoadFactor {
  fn new(threads: usize, cap: i64) -> Self {
    Self {
      counts: Array::new(threads, |_, slot| {
        slot.write(CachePadded::new(AtomicI64::new(0)));
      }),
      cap,
    }
  }

  #[inline]
  fn increment(&self, thread: usize) {
    self.counts.get(thread).fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  fn decrement(&self, thread: usize) {
    self.counts.get(thread).fetch_sub(1, Ordering::Relaxed);
  }

  fn occupancy(&self) -> i64 {
    let mut sum: i64 = 0;

    for count in self.counts.as_slice() {
      sum = sum.wrapping_add(count.load(Ordering::Relaxed));
    }

    sum
  }
}

// -----------------------------------------------------------------------------
// Hash Set
// -----------------------------------------------------------------------------

/// A lock-free hash set with a fixed, compile-time bucket count.
///
/// # Type Parameters
///
/// - `T`: The payload; trivially copyable, hashable, comparable.
/// - `P`: Configuration, most importantly the thread cap and bucket count.
/// - `B`: The back-off strategy for contended retries.
/// - `S`: The hasher factory.
///
/// # Load Factor
///
/// Occupancy is tracked per thread and summed opportunistically; once the
/// sum reaches `load_factor × BUCKETS`, further [`add`] calls return
/// `false`. The cap is advisory, not an invariant: racing adds can overshoot
/// it by a handful of elements.
///
/// # Examples
///
/// ```
/// use warden::HashSet;
///
/// let set: HashSet<u64> = HashSet::new();
/// let mut set_ref = set.register().unwrap();
///
/// assert!(set_ref.add(9));
/// assert!(set_ref.contains(&9));
/// assert!(!set_ref.add(9));
/// assert!(set_ref.remove(&9));
/// ```
///
/// [`add`]: HashSetRef::add
pub struct HashSet<T, P = DefaultParams, B = SleepBackoff, S = RandomState>
where
  P: Params + ?Sized,
{
  head: *mut BucketNode<T>,
  buckets: Array<*mut BucketNode<T>>,
  domain: HazardDomain<BucketNode<T>>,
  registry: ThreadRegistry,
  controller: LoadFactor,
  hasher: S,
  marker: PhantomData<(fn(P), fn() -> B)>,
}

impl<T, P, B, S> HashSet<T, P, B, S>
where
  T: Copy + Hash + Eq,
  P: Params + ?Sized,
  B: Backoff,
  S: BuildHasher,
{
  /// Creates an empty set with the default load factor.
  #[inline]
  pub fn new() -> Self
  where
    S: Default,
  {
    Self::with_load_factor_and_hasher(DEFAULT_LOAD_FACTOR, S::default())
  }

  /// Creates an empty set with a custom load-factor cap.
  #[inline]
  pub fn with_load_factor(load_factor: f32) -> Self
  where
    S: Default,
  {
    Self::with_load_factor_and_hasher(load_factor, S::default())
  }

  /// Creates an empty set with a custom hasher factory.
  #[inline]
  pub fn with_hasher(hasher: S) -> Self {
    Self::with_load_factor_and_hasher(DEFAULT_LOAD_FACTOR, hasher)
  }

  /// Creates an empty set, linking all `P::BUCKETS` sentinels into the
  /// underlying list in ascending split-order.
  ///
  /// The first sentinel in that order (bucket 0, key 0) doubles as the
  /// list's front; teardown walks the whole chain from it.
  pub fn with_load_factor_and_hasher(load_factor: f32, hasher: S) -> Self {
    let buckets: usize = P::BUCKETS.get();

    let mut order: Vec<usize> = (0..buckets).collect();
    order.sort_by_key(|&bucket| sentinel_key(bucket as u64));

    let mut table: Vec<*mut BucketNode<T>> = vec![ptr::null_mut(); buckets];
    let mut head: *mut BucketNode<T> = ptr::null_mut();
    let mut tail: *mut BucketNode<T> = ptr::null_mut();

    for &bucket in &order {
      let node: *mut BucketNode<T> =
        heap::construct(BucketNode::sentinel(sentinel_key(bucket as u64)));

      if head.is_null() {
        head = node;
      } else {
        // SAFETY: Construction is single-threaded; nothing is shared yet.
        unsafe {
          (*tail).next().store(node, Ordering::Relaxed);
        }
      }

      table[bucket] = node;
      tail = node;
    }

    Self {
      head,
      buckets: Array::new(buckets, |bucket, slot| {
        slot.write(table[bucket]);
      }),
      domain: HazardDomain::new(P::THREADS.get(), P::RETIRE_CAP),
      registry: ThreadRegistry::new(P::THREADS.get()),
      controller: LoadFactor::new(P::THREADS.get(), (load_factor * buckets as f32) as i64),
      hasher,
      marker: PhantomData,
    }
  }

  /// Registers the calling thread.
  #[inline]
  pub fn register(&self) -> Result<HashSetRef<'_, T, P, B, S>, RegisterError> {
    Ok(HashSetRef {
      set: self,
      index: self.registry.claim()?,
      backoff: B::default(),
    })
  }

  /// The best-effort element count.
  #[inline]
  pub fn occupancy(&self) -> usize {
    self.controller.occupancy().max(0) as usize
  }

  /// The number of threads registered so far.
  #[inline]
  pub fn threads(&self) -> usize {
    self.registry.claimed()
  }
}

impl<T, P, B, S> Default for HashSet<T, P, B, S>
where
  T: Copy + Hash + Eq,
  P: Params + ?Sized,
  B: Backoff,
  S: BuildHasher + Default,
{
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

impl<T, P, B, S> Drop for HashSet<T, P, B, S>
where
  P: Params + ?Sized,
{
  fn drop(&mut self) {
    let mut node: *mut BucketNode<T> = self.head;

    while !node.is_null() {
      // SAFETY: `Drop` has exclusive access; marked successors are still
      // chained, so stripping the mark recovers the real pointer.
      let next: *mut BucketNode<T> =
        clear_mark(unsafe { (*node).next() }.load(Ordering::Relaxed));

      // SAFETY: Every chained node is owned by the set and destroyed once.
      unsafe {
        heap::destroy(node);
      }

      node = next;
    }
  }
}

// SAFETY: The set owns its nodes; payloads move with it.
unsafe impl<T, P, B, S> Send for HashSet<T, P, B, S>
where
  T: Send,
  P: Params + ?Sized,
  S: Send,
{
}

// SAFETY: Shared mutation is CAS-only; per-thread state is reached through
// unique registry indices; the hasher is only read.
unsafe impl<T, P, B, S> Sync for HashSet<T, P, B, S>
where
  T: Send,
  P: Params + ?Sized,
  S: Sync,
{
}

impl<T, P, B, S> Debug for HashSet<T, P, B, S>
where
  P: Params + ?Sized,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("HashSet")
      .field("buckets", &self.buckets.len())
      .field("threads", &self.registry.claimed())
      .finish_non_exhaustive()
  }
}

// -----------------------------------------------------------------------------
// Per-thread Ref
// -----------------------------------------------------------------------------

struct Window<T> {
  prev: *mut BucketNode<T>,
  curr: *mut BucketNode<T>,
}

/// A registered thread's view of a [`HashSet`].
pub struct HashSetRef<'set, T, P, B, S>
where
  P: Params + ?Sized,
{
  set: &'set HashSet<T, P, B, S>,
  index: usize,
  backoff: B,
}

impl<T, P, B, S> HashSetRef<'_, T, P, B, S>
where
  T: Copy + Hash + Eq,
  P: Params + ?Sized,
  B: Backoff,
  S: BuildHasher,
{
  /// Returns `true` if `value` is in the set.
  pub fn contains(&mut self, value: &T) -> bool {
    let set = self.set;
    let _clear: ClearSlots<'_, _> = ClearSlots::new(&set.domain, self.index);

    let hash: u64 = set.hasher.hash_one(value);
    let window: Window<T> = self.search(hash, value);

    // The search stops at an equal key only on a value match.
    !window.curr.is_null() && unsafe { (*window.curr).key() } == member_key(hash)
  }

  /// Inserts `value`; returns `false` on duplicate or when the advisory
  /// load-factor cap is reached.
  pub fn add(&mut self, value: T) -> bool {
    let set = self.set;

    if set.controller.occupancy() >= set.controller.cap {
      return false;
    }

    let hash: u64 = set.hasher.hash_one(&value);
    let node: *mut BucketNode<T> =
      HazardDomain::alloc(BucketNode::with(member_key(hash), value));
    let _clear: ClearSlots<'_, _> = ClearSlots::new(&set.domain, self.index);

    loop {
      let window: Window<T> = self.search(hash, &value);

      // SAFETY: `curr` is hazard-protected by `search`.
      if !window.curr.is_null() && unsafe { (*window.curr).key() } == member_key(hash) {
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
      // contract.
      let link = unsafe { (*window.prev).next() }.compare_exchange(
        window.curr,
        node,
        Ordering::AcqRel,
        Ordering::Acquire,
      );

      if link.is_ok() {
        set.controller.increment(self.index);
        return true;
      }

      self.backoff.wait();
    }
  }

  /// Removes `value`; returns `false` if it was absent.
  pub fn remove(&mut self, value: &T) -> bool {
    let set = self.set;
    let _clear: ClearSlots<'_, _> = ClearSlots::new(&set.domain, self.index);

    let hash: u64 = set.hasher.hash_one(value);

    loop {
      let window: Window<T> = self.search(hash, value);

      // SAFETY: `curr` is hazard-protected by `search`.
      if window.curr.is_null() || unsafe { (*window.curr).key() } != member_key(hash) {
        return false;
      }

      // SAFETY: As above.
      let next: *mut BucketNode<T> = unsafe { (*window.curr).next() }.load(Ordering::Acquire);

      if is_marked(next) {
        continue;
      }

      // SAFETY: As above.
      let mark = unsafe { (*window.curr).next() }.compare_exchange(
        next,
        with_mark(next),
        Ordering::Release,
        Ordering::Relaxed,
      );

      if mark.is_ok() {
        set.controller.decrement(self.index);
        return true;
      }

      self.backoff.wait();
    }
  }

  /// Runs the list search from `value`'s bucket sentinel.
  ///
  /// Stops at the first live node whose key exceeds `member_key(hash)`, or
  /// at the node matching both key and value. Sentinels carry even keys and
  /// members odd ones, so a sentinel can satisfy only the "exceeds" case;
  /// reaching the next bucket's sentinel is exactly how an absent value is
  /// discovered.
  fn search(&mut self, hash: u64, value: &T) -> Window<T> {
    let set = self.set;
    let domain: &HazardDomain<BucketNode<T>> = &set.domain;

    let key: u64 = member_key(hash);
    let bucket: usize = (hash & P::BUCKET_MASK) as usize;
    let start: *mut BucketNode<T> = *set.buckets.get(bucket);

    'restart: loop {
      let mut prev: *mut BucketNode<T> = start;

      domain.protect(self.index, 0, prev);

      // SAFETY: Sentinels are never retired.
      let mut curr: *mut BucketNode<T> = unsafe { (*prev).next() }.load(Ordering::Acquire);

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
        // published in slot 1.
        let mut next: *mut BucketNode<T> = unsafe { (*curr).next() }.load(Ordering::Acquire);

        while is_marked(next) {
          let cleared: *mut BucketNode<T> = clear_mark(next);

          // SAFETY: `prev` is protected in slot 0.
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

        // SAFETY: `curr` is protected and validated. The value is read only
        // behind an equal (odd) key, which rules sentinels out.
        let curr_key: u64 = unsafe { (*curr).key() };

        if curr_key > key || (curr_key == key && unsafe { (*curr).value() } == *value) {
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

impl<T, P, B, S> Debug for HashSetRef<'_, T, P, B, S>
where
  P: Params + ?Sized,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct("HashSetRef").field("index", &self.index).finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(not(any(loom, shuttle)))]
#[cfg(test)]
mod tests {
  use core::hash::BuildHasher;
  use core::hash::Hasher;
  use core::sync::atomic::Ordering;
  use std::sync::Arc;
  use std::sync::Barrier;
  use std::thread;

  use crate::backoff::NoBackoff;
  use crate::node::BucketNode;
  use crate::params::Buckets;
  use crate::params::Params;
  use crate::set::member_key;
  use crate::set::sentinel_key;
  use crate::set::HashSet;

  /// `hash(v) = v`, so bucket math in tests is readable.
  #[derive(Clone, Copy, Default)]
  struct Identity;

  struct IdentityHasher(u64);

  impl BuildHasher for Identity {
    type Hasher = IdentityHasher;

    fn build_hasher(&self) -> IdentityHasher {
      IdentityHasher(0)
    }
  }

  impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
      self.0
    }

    fn write(&mut self, _bytes: &[u8]) {
      unreachable!("tests hash u64 only");
    }

    fn write_u64(&mut self, value: u64) {
      self.0 = value;
    }
  }

  struct EightBuckets;

  impl Params for EightBuckets {
    const BUCKETS: Buckets = Buckets::new(8);
  }

  type SmallSet = HashSet<u64, EightBuckets, NoBackoff, Identity>;

  #[test]
  fn key_order() {
    // Sentinels are even and precede their members; members are odd.
    assert_eq!(sentinel_key(0), 0);
    assert!(member_key(0) > sentinel_key(0));
    assert!(member_key(9) > sentinel_key(1));
    assert!(member_key(9) < sentinel_key(3));
    assert_eq!(member_key(9) & 1, 1);
  }

  #[test]
  fn collision_run() {
    let set: SmallSet = SmallSet::new();
    let mut set_ref = set.register().unwrap();

    // 1, 9, 17 all land in bucket 1.
    assert!(set_ref.add(1));
    assert!(set_ref.add(9));
    assert!(set_ref.add(17));

    assert!(set_ref.contains(&1));
    assert!(set_ref.contains(&9));
    assert!(set_ref.contains(&17));

    assert!(set_ref.remove(&9));
    assert!(!set_ref.contains(&9));
    assert!(set_ref.contains(&1));
    assert!(set_ref.contains(&17));
  }

  // Invariant: following `next` from bucket sentinel `S_b` yields only live
  // nodes whose hash mod N equals b, until the next sentinel.
  #[test]
  fn bucket_discipline() {
    let set: SmallSet = SmallSet::new();
    let mut set_ref = set.register().unwrap();

    for value in 0..64 {
      assert!(set_ref.add(value));
    }

    for bucket in 0..8usize {
      let mut node: *mut BucketNode<u64> =
        unsafe { (**set.buckets.get(bucket)).next() }.load(Ordering::Relaxed);
      let mut run: Vec<u64> = Vec::new();

      while !node.is_null() {
        let node_ref: &BucketNode<u64> = unsafe { &*node };

        if node_ref.is_sentinel() {
          break;
        }

        run.push(unsafe { node_ref.value() });
        node = node_ref.next().load(Ordering::Relaxed);
      }

      assert_eq!(run.len(), 8, "bucket {bucket}");

      for value in run {
        assert_eq!(value as usize % 8, bucket);
      }
    }
  }

  #[test]
  fn duplicate_add() {
    let set: SmallSet = SmallSet::new();
    let mut set_ref = set.register().unwrap();

    assert!(set_ref.add(33));
    assert!(!set_ref.add(33));
    assert_eq!(set.occupancy(), 1);
  }

  #[test]
  fn load_factor_refuses() {
    // 8 buckets × load factor 0.5 → cap of 4 elements.
    let set: SmallSet = SmallSet::with_load_factor_and_hasher(0.5, Identity);
    let mut set_ref = set.register().unwrap();

    for value in 0..4 {
      assert!(set_ref.add(value));
    }

    assert!(!set_ref.add(4));
    assert!(set_ref.remove(&0));
    assert!(set_ref.add(4));
  }

  #[test]
  fn occupancy_tracks_deltas() {
    let set: SmallSet = SmallSet::new();
    let mut set_ref = set.register().unwrap();

    assert_eq!(set.occupancy(), 0);

    set_ref.add(1);
    set_ref.add(2);
    assert_eq!(set.occupancy(), 2);

    set_ref.remove(&1);
    assert_eq!(set.occupancy(), 1);
  }

  // Scenario: Producer and consumer threads hammer a uniform key range.
  // Expected: `contains` agrees with the per-value net of adds and removes.
  #[test]
  fn concurrent_parity() {
    const THREADS: usize = 4;
    const OPS: u64 = 2000;
    const KEYS: u64 = 64;

    let set: Arc<SmallSet> = Arc::new(SmallSet::new());
    let barrier: Arc<Barrier> = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
      .map(|thread| {
        let set = Arc::clone(&set);
        let barrier = Arc::clone(&barrier);

        thread::spawn(move || {
          let mut set_ref = set.register().unwrap();
          let mut deltas: Vec<i64> = vec![0; KEYS as usize];
          let mut state: u64 = 0x9E3779B97F4A7C15_u64.wrapping_mul(thread as u64 + 1);

          barrier.wait();

          for _ in 0..OPS {
            // xorshift; the workload only needs decorrelation.
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;

            let value: u64 = state % KEYS;

            if state & (1 << 40) == 0 {
              if set_ref.add(value) {
                deltas[value as usize] += 1;
              }
            } else if set_ref.remove(&value) {
              deltas[value as usize] -= 1;
            }
          }

          deltas
        })
      })
      .collect();

    let mut net: Vec<i64> = vec![0; KEYS as usize];

    for handle in handles {
      for (value, delta) in handle.join().unwrap().into_iter().enumerate() {
        net[value] += delta;
      }
    }

    let mut set_ref = set.register().unwrap();

    for value in 0..KEYS {
      let expected: bool = net[value as usize] == 1;

      assert!(net[value as usize] == 0 || net[value as usize] == 1);
      assert_eq!(set_ref.contains(&value), expected, "value {value}");
    }
  }
}
