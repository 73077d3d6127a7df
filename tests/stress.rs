//! Multi-threaded stress and parity tests.
//!
//! Each lock-free container is driven at saturation and checked against the
//! semantics its locked oracle defines: membership parity for the sets,
//! multiset conservation for the stacks and queues.

#![cfg(not(any(loom, shuttle)))]

use std::collections::HashSet as StdHashSet;
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use warden::Buckets;
use warden::HashSet;
use warden::HazardStack;
use warden::HazardStackRef;
use warden::Lanes;
use warden::LockedSet;
use warden::NoBackoff;
use warden::OrderedSet;
use warden::Params;
use warden::TaggedQueue;
use warden::TaggedStack;
use warden::TaggedStackRef;
use warden::Threads;

struct StressParams;

impl Params for StressParams {
  const THREADS: Threads = Threads::new(16);
  const BUCKETS: Buckets = Buckets::new(256);
  const LANES: Lanes = Lanes::new(4);
}

const THREADS: usize = 8;
const OPS: usize = 20_000;

fn rng_for(thread: usize) -> StdRng {
  StdRng::seed_from_u64(0xC0FFEE ^ thread as u64)
}

// -----------------------------------------------------------------------------
// Ordered Set
// -----------------------------------------------------------------------------

// Property: after any interleaving, `contains(v)` is true iff the most
// recent completed add/remove for `v` was an add. Verified by replaying
// every thread's successful operations against the per-value net.
#[test]
fn ordered_set_membership_parity() {
  const KEYS: u64 = 512;

  let set: Arc<OrderedSet<u64, StressParams, NoBackoff>> = Arc::new(OrderedSet::new());
  let barrier: Arc<Barrier> = Arc::new(Barrier::new(THREADS));

  let handles: Vec<_> = (0..THREADS)
    .map(|thread| {
      let set = Arc::clone(&set);
      let barrier = Arc::clone(&barrier);

      thread::spawn(move || {
        let mut set_ref = set.register().unwrap();
        let mut rng: StdRng = rng_for(thread);
        let mut deltas: Vec<i64> = vec![0; KEYS as usize];

        barrier.wait();

        for _ in 0..OPS {
          let value: u64 = rng.random_range(0..KEYS);

          if rng.random_bool(0.5) {
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
    assert!(net[value as usize] == 0 || net[value as usize] == 1);
    assert_eq!(
      set_ref.contains(&value),
      net[value as usize] == 1,
      "value {value}",
    );
  }
}

// The same operation tape applied to the lock-free set and its locked
// oracle must produce identical results when replayed by one thread.
#[test]
fn ordered_set_sequential_oracle() {
  let lock_free: OrderedSet<u64> = OrderedSet::new();
  let oracle: LockedSet<u64> = LockedSet::new();

  let mut set_ref = lock_free.register().unwrap();
  let mut rng: StdRng = rng_for(0);

  for _ in 0..OPS {
    let value: u64 = rng.random_range(0..128);

    match rng.random_range(0..3) {
      0 => assert_eq!(set_ref.add(value), oracle.add(value)),
      1 => assert_eq!(set_ref.remove(&value), oracle.remove(&value)),
      _ => assert_eq!(set_ref.contains(&value), oracle.contains(&value)),
    }
  }
}

// -----------------------------------------------------------------------------
// Hash Set
// -----------------------------------------------------------------------------

// The 2-producers × 2-consumers parity sweep: at the end, `contains(v)`
// agrees with the per-value net of successful adds and removes.
#[test]
fn hash_set_producer_consumer_parity() {
  const KEYS: u64 = 1 << 20;

  let set: Arc<HashSet<u64, StressParams, NoBackoff>> = Arc::new(HashSet::new());
  let barrier: Arc<Barrier> = Arc::new(Barrier::new(4));

  let handles: Vec<_> = (0..4)
    .map(|thread| {
      let set = Arc::clone(&set);
      let barrier = Arc::clone(&barrier);

      thread::spawn(move || {
        let mut set_ref = set.register().unwrap();
        let mut rng: StdRng = rng_for(thread);
        let mut deltas: std::collections::HashMap<u64, i64> = std::collections::HashMap::new();
        let producing: bool = thread < 2;

        barrier.wait();

        for _ in 0..OPS {
          let value: u64 = rng.random_range(1..=KEYS);

          if producing {
            if set_ref.add(value) {
              *deltas.entry(value).or_insert(0) += 1;
            }
          } else if set_ref.remove(&value) {
            *deltas.entry(value).or_insert(0) -= 1;
          }
        }

        deltas
      })
    })
    .collect();

  let mut net: std::collections::HashMap<u64, i64> = std::collections::HashMap::new();

  for handle in handles {
    for (value, delta) in handle.join().unwrap() {
      *net.entry(value).or_insert(0) += delta;
    }
  }

  let mut set_ref = set.register().unwrap();

  for (value, delta) in net {
    assert!(delta == 0 || delta == 1, "value {value} net {delta}");
    assert_eq!(set_ref.contains(&value), delta == 1, "value {value}");
  }
}

// Retire lists must stay bounded under sustained churn: every node retired
// past the cap forces a scan, so memory cannot grow without bound. This is
// exercised simply by churning far more nodes than the cap and finishing
// without exhausting memory.
#[test]
fn hash_set_sustained_churn() {
  let set: Arc<HashSet<u64, StressParams, NoBackoff>> = Arc::new(HashSet::new());
  let barrier: Arc<Barrier> = Arc::new(Barrier::new(THREADS));

  let handles: Vec<_> = (0..THREADS)
    .map(|thread| {
      let set = Arc::clone(&set);
      let barrier = Arc::clone(&barrier);

      thread::spawn(move || {
        let mut set_ref = set.register().unwrap();

        barrier.wait();

        // Each thread churns its own key: every add/remove pair retires a
        // node, far exceeding RETIRE_CAP over the run.
        let value: u64 = thread as u64;

        for _ in 0..OPS {
          assert!(set_ref.add(value));
          assert!(set_ref.remove(&value));
        }
      })
    })
    .collect();

  for handle in handles {
    handle.join().unwrap();
  }

  assert_eq!(set.occupancy(), 0);
}

// -----------------------------------------------------------------------------
// Stacks
// -----------------------------------------------------------------------------

// Multiset conservation under mixed pushes and pops, for both variants.
#[test]
fn stacks_conserve_multiset() {
  trait Lifo {
    fn push(&mut self, value: u64) -> bool;
    fn pop(&mut self) -> Option<u64>;
  }

  impl Lifo for warden::HazardStackRef<'_, u64, StressParams, NoBackoff> {
    fn push(&mut self, value: u64) -> bool {
      HazardStackRef::push(self, value);
      true
    }

    fn pop(&mut self) -> Option<u64> {
      HazardStackRef::pop(self)
    }
  }

  impl Lifo for warden::TaggedStackRef<'_, u64, StressParams, NoBackoff> {
    fn push(&mut self, value: u64) -> bool {
      TaggedStackRef::push(self, value)
    }

    fn pop(&mut self) -> Option<u64> {
      TaggedStackRef::pop(self)
    }
  }

  fn drive<L: Lifo>(stack: &mut L) {
    let mut seen: StdHashSet<u64> = StdHashSet::new();
    let mut pushed: u64 = 0;

    for value in 0..1000 {
      if stack.push(value) {
        pushed += 1;
      }

      if value % 3 == 0
        && let Some(taken) = stack.pop()
      {
        assert!(seen.insert(taken));
      }
    }

    while let Some(taken) = stack.pop() {
      assert!(seen.insert(taken));
    }

    assert_eq!(seen.len() as u64, pushed);
  }

  let hazard: HazardStack<u64, StressParams, NoBackoff> = HazardStack::new();
  drive(&mut hazard.register().unwrap());

  let tagged: TaggedStack<u64, StressParams, NoBackoff> = TaggedStack::new();
  drive(&mut tagged.register().unwrap());
}

#[test]
fn tagged_stack_concurrent_multiset() {
  const PER_THREAD: u64 = 5_000;

  let stack: Arc<TaggedStack<u64, StressParams, NoBackoff>> = Arc::new(TaggedStack::new());
  let barrier: Arc<Barrier> = Arc::new(Barrier::new(THREADS));

  let handles: Vec<_> = (0..THREADS as u64)
    .map(|thread| {
      let stack = Arc::clone(&stack);
      let barrier = Arc::clone(&barrier);

      thread::spawn(move || {
        let mut stack_ref = stack.register().unwrap();
        let mut popped: Vec<u64> = Vec::new();

        barrier.wait();

        for op in 0..PER_THREAD {
          assert!(stack_ref.push(thread * PER_THREAD + op));

          if op % 2 == 1
            && let Some(value) = stack_ref.pop()
          {
            popped.push(value);
          }
        }

        popped
      })
    })
    .collect();

  let mut seen: StdHashSet<u64> = StdHashSet::new();

  for handle in handles {
    for value in handle.join().unwrap() {
      assert!(seen.insert(value), "value {value} popped twice");
    }
  }

  let mut stack_ref = stack.register().unwrap();

  while let Some(value) = stack_ref.pop() {
    assert!(seen.insert(value), "value {value} popped twice");
  }

  assert_eq!(seen.len() as u64, THREADS as u64 * PER_THREAD);
}

// -----------------------------------------------------------------------------
// Queue
// -----------------------------------------------------------------------------

// MPMC multiset conservation plus per-producer FIFO: consumers tag each
// value with its producer, and each producer's values must arrive in
// increasing order across the union of all consumers.
#[test]
fn queue_mpmc_order_and_multiset() {
  const PRODUCERS: u64 = 4;
  const CONSUMERS: usize = 4;
  const PER_PRODUCER: u64 = 10_000;

  let queue: Arc<TaggedQueue<u64, StressParams, NoBackoff>> = Arc::new(TaggedQueue::new());
  let barrier: Arc<Barrier> = Arc::new(Barrier::new(PRODUCERS as usize + CONSUMERS));

  let producers: Vec<_> = (0..PRODUCERS)
    .map(|producer| {
      let queue = Arc::clone(&queue);
      let barrier = Arc::clone(&barrier);

      thread::spawn(move || {
        let mut queue_ref = queue.register().unwrap();

        barrier.wait();

        for op in 0..PER_PRODUCER {
          // High bits identify the producer, low bits count up.
          let value: u64 = (producer << 32) | op;

          while !queue_ref.push(value) {
            thread::yield_now();
          }
        }
      })
    })
    .collect();

  let consumers: Vec<_> = (0..CONSUMERS)
    .map(|_| {
      let queue = Arc::clone(&queue);
      let barrier = Arc::clone(&barrier);

      thread::spawn(move || {
        let mut queue_ref = queue.register().unwrap();
        let mut taken: Vec<u64> = Vec::new();

        barrier.wait();

        loop {
          match queue_ref.pop() {
            Some(u64::MAX) => break,
            Some(value) => taken.push(value),
            None => thread::yield_now(),
          }
        }

        taken
      })
    })
    .collect();

  for producer in producers {
    producer.join().unwrap();
  }

  {
    let mut queue_ref = queue.register().unwrap();

    for _ in 0..CONSUMERS {
      while !queue_ref.push(u64::MAX) {
        thread::yield_now();
      }
    }
  }

  let mut seen: StdHashSet<u64> = StdHashSet::new();

  for consumer in consumers {
    let taken: Vec<u64> = consumer.join().unwrap();

    // Per-producer FIFO within one consumer's subsequence.
    let mut last: Vec<Option<u64>> = vec![None; PRODUCERS as usize];

    for value in taken {
      let producer: usize = (value >> 32) as usize;
      let sequence: u64 = value & u32::MAX as u64;

      if let Some(previous) = last[producer] {
        assert!(previous < sequence, "producer {producer} reordered");
      }

      last[producer] = Some(sequence);
      assert!(seen.insert(value), "value {value:#x} popped twice");
    }
  }

  assert_eq!(seen.len() as u64, PRODUCERS * PER_PRODUCER);
}
