//! Lock-free concurrent containers with explicit memory reclamation.
//!
//! `warden` provides an ordered set, a hash set, LIFO stacks, and a FIFO
//! queue that arbitrary threads may traverse and mutate without locks and
//! without quiescence. The hard part of such containers is not the CAS loop
//! but the question of when a removed node may be freed while a racing
//! reader might still dereference it; this crate ships both classic
//! answers and builds every container on exactly one of them:
//!
//! - **Hazard pointers** ([`OrderedSet`], [`HashSet`], [`HazardStack`]):
//!   each thread publishes the node it is about to read in a per-thread
//!   slot; removed nodes are *retired* and only destroyed once a scan
//!   proves no slot still points at them.
//! - **Tagged pointers** ([`TaggedStack`], [`TaggedQueue`]): nodes are
//!   never freed while the container lives. They recycle through free
//!   pools, and a 16-bit version counter packed into every pointer word
//!   makes a CAS on a recycled node fail instead of succeeding on stale
//!   state (the ABA problem).
//!
//! # Thread registration
//!
//! Per-thread state (hazard slots, retire lists, pool lane cursors) is
//! indexed by a small integer claimed once per thread via `register()`,
//! which returns a ref type whose operations take `&mut self`:
//!
//! ```
//! use warden::{OrderedSet, ConstParams};
//!
//! let set: OrderedSet<u64, ConstParams<4>> = OrderedSet::new();
//! let mut set_ref = set.register().unwrap();
//!
//! assert!(set_ref.add(3));
//! assert!(set_ref.contains(&3));
//! ```
//!
//! Registration past the compile-time thread cap fails with
//! [`RegisterError`].
//!
//! # Configuration
//!
//! Capacities are compile-time parameters through the [`Params`] trait:
//! the thread cap, the hash-set bucket count, and the free-pool lane
//! count. See [`ConstParams`] and [`DefaultParams`].
//!
//! # Progress
//!
//! All lock-free containers guarantee lock-free progress, not wait-free:
//! some thread always completes, but an individual thread may retry
//! indefinitely under adversarial scheduling. The [`Backoff`] strategies
//! exist to make that case vanishingly rare in practice.
//!
//! The locked containers ([`LockedSet`], [`StripedSet`], [`LockedStack`],
//! [`LockedQueue`], [`SpscRing`]) are reference implementations with the
//! same external contract, used as parity oracles by the test and bench
//! suites.

mod array;
mod backoff;
mod hazard;
mod heap;
mod list;
mod locked;
mod node;
mod padded;
mod params;
mod pool;
mod queue;
mod registry;
mod set;
mod spin;
mod stack;
mod tagged;
mod utils;

pub(crate) use crate::utils::alloc;
pub(crate) use crate::utils::sync;

pub mod config {
  //! Configuration parameters for capacities and derived constants.

  pub use crate::params::Buckets;
  pub use crate::params::CACHE_LINE;
  pub use crate::params::ConstParams;
  pub use crate::params::DebugParams;
  pub use crate::params::DefaultParams;
  pub use crate::params::HP_NUM;
  pub use crate::params::Lanes;
  pub use crate::params::Params;
  pub use crate::params::ParamsExt;
  pub use crate::params::RETIRE_FACTOR;
  pub use crate::params::Threads;
}

#[doc(inline)]
pub use self::config::Buckets;

#[doc(inline)]
pub use self::config::ConstParams;

#[doc(inline)]
pub use self::config::DefaultParams;

#[doc(inline)]
pub use self::config::Lanes;

#[doc(inline)]
pub use self::config::Params;

#[doc(inline)]
pub use self::config::Threads;

pub use self::backoff::Backoff;
pub use self::backoff::NoBackoff;
pub use self::backoff::PauseBackoff;
pub use self::backoff::RandomBackoff;
pub use self::backoff::SleepBackoff;

pub use self::registry::RegisterError;

pub use self::list::OrderedSet;
pub use self::list::OrderedSetRef;

pub use self::set::HashSet;
pub use self::set::HashSetRef;

pub use self::stack::HazardStack;
pub use self::stack::HazardStackRef;
pub use self::stack::TaggedStack;
pub use self::stack::TaggedStackRef;

pub use self::queue::TaggedQueue;
pub use self::queue::TaggedQueueRef;

pub use self::locked::LockedQueue;
pub use self::locked::LockedSet;
pub use self::locked::LockedStack;
pub use self::locked::SpscConsumer;
pub use self::locked::SpscProducer;
pub use self::locked::SpscRing;
pub use self::locked::StripedSet;
