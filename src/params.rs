use core::any;
use core::fmt::Debug;
use core::fmt::Formatter;
use core::fmt::Result as FmtResult;
use core::marker::PhantomData;

use crate::padded::CachePadded;

// -----------------------------------------------------------------------------
// Cache-line Properties
// -----------------------------------------------------------------------------

/// The size of a cache line in bytes.
///
/// Shared allocations are aligned to this value so that independently-written
/// atomics (hazard slot rows, retire lists, pool heads and tails) never share
/// a line. On most modern x86-64 systems this is 64 bytes; the padding wrapper
/// uses 128 where adjacent-line prefetching makes that the safer stride.
pub const CACHE_LINE: usize = size_of::<CachePadded<u8>>();

const _: () = assert!(
  CACHE_LINE.is_power_of_two(),
  "invalid params: `CACHE_LINE` must be a power of two",
);

// -----------------------------------------------------------------------------
// Hazard-pointer Properties
// -----------------------------------------------------------------------------

/// The number of hazard slots owned by each registered thread.
///
/// Two slots are enough for every traversal in this crate (`prev` and `curr`
/// of a list window); the remaining slots are headroom for composed
/// operations.
pub const HP_NUM: usize = 8;

/// Retire-list scaling factor.
///
/// A thread's retire list holds up to `RETIRE_FACTOR × HP_NUM × THREADS`
/// pointers before a scan is forced, which guarantees that at least half of
/// the scanned pointers are reclaimable.
pub const RETIRE_FACTOR: usize = 2;

// -----------------------------------------------------------------------------
// Configurable Params
// -----------------------------------------------------------------------------

/// Configuration parameters for the containers in this crate.
///
/// All capacities are fixed at compile time. The simplest way to use custom
/// parameters is through [`ConstParams`]:
///
/// ```
/// use warden::{HazardStack, ConstParams};
///
/// // A stack that admits at most 16 registered threads.
/// type MyStack<T> = HazardStack<T, ConstParams<16>>;
/// ```
///
/// For full control, implement `Params` directly:
///
/// ```
/// use warden::{Params, Threads, Buckets, Lanes};
///
/// struct Wide;
///
/// impl Params for Wide {
///   const THREADS: Threads = Threads::new(256);
///   const BUCKETS: Buckets = Buckets::new(1 << 16);
///   const LANES: Lanes = Lanes::new(8);
/// }
/// ```
pub trait Params {
  /// The maximum number of threads that may register with a container.
  ///
  /// Registration beyond this cap fails with [`RegisterError`].
  ///
  /// [`RegisterError`]: crate::RegisterError
  const THREADS: Threads = DefaultParams::THREADS;

  /// The number of hash-set buckets.
  ///
  /// Rounded up to the nearest power of two and clamped to
  /// [`Buckets::MIN`]`..=`[`Buckets::MAX`].
  const BUCKETS: Buckets = DefaultParams::BUCKETS;

  /// The number of free-node pool lanes used by the tagged containers.
  ///
  /// Threads are spread across lanes round-robin to keep the node-supply
  /// path off a single contended head.
  const LANES: Lanes = DefaultParams::LANES;
}

// -----------------------------------------------------------------------------
// Configurable Params - Extensions
// -----------------------------------------------------------------------------

/// Derived parameters computed from [`Params`].
///
/// Automatically implemented for every `Params` type; exposed for debugging
/// configuration via [`ParamsExt::debug`].
pub trait ParamsExt: Params + Sealed {
  /// Total hazard slots across all registrable threads.
  const HP_SLOTS: usize = HP_NUM * Self::THREADS.get();

  /// Per-thread retire-list capacity; reaching it triggers a scan.
  const RETIRE_CAP: usize = RETIRE_FACTOR * HP_NUM * Self::THREADS.get();

  /// Mask reducing a hash to its bucket index.
  const BUCKET_MASK: u64 = Self::BUCKETS.get() as u64 - 1;

  #[inline]
  fn debug() -> DebugParams<Self> {
    DebugParams {
      marker: PhantomData,
    }
  }
}

mod private {
  pub trait Sealed {}
}

use private::Sealed;

impl<P> Sealed for P where P: Params + ?Sized {}
impl<P> ParamsExt for P where P: Params + ?Sized {}

// -----------------------------------------------------------------------------
// Debug Params
// -----------------------------------------------------------------------------

/// A helper type for displaying [`Params`] configuration.
///
/// Returned by [`ParamsExt::debug`]; implements [`Debug`] to display all
/// derived configuration values.
#[derive(Clone, Copy)]
pub struct DebugParams<P>
where
  P: ?Sized,
{
  marker: PhantomData<fn(P)>,
}

impl<P> Debug for DebugParams<P>
where
  P: Params + ?Sized,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    f.debug_struct(any::type_name::<P>())
      .field("THREADS", &P::THREADS)
      .field("BUCKETS", &P::BUCKETS)
      .field("LANES", &P::LANES)
      .field("HP_SLOTS", &P::HP_SLOTS)
      .field("RETIRE_CAP", &P::RETIRE_CAP)
      .field("BUCKET_MASK", &format_args!("{:0>64b}", P::BUCKET_MASK))
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Default Params
// -----------------------------------------------------------------------------

/// The default configuration: 64 threads, 1,024 buckets, 4 pool lanes.
#[derive(Clone, Copy)]
#[non_exhaustive]
pub struct DefaultParams;

impl Debug for DefaultParams {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    Debug::fmt(&<Self as ParamsExt>::debug(), f)
  }
}

impl Params for DefaultParams {
  const THREADS: Threads = Threads::new(64);
  const BUCKETS: Buckets = Buckets::new(1024);
  const LANES: Lanes = Lanes::new(4);
}

// -----------------------------------------------------------------------------
// Const-Generic Params
// -----------------------------------------------------------------------------

/// A [`Params`] implementation with a compile-time thread cap.
///
/// `N` is clamped to [`Threads::MIN`]`..=`[`Threads::MAX`]; the remaining
/// parameters keep their defaults.
///
/// ```
/// use warden::{TaggedQueue, ConstParams};
///
/// let queue: TaggedQueue<u64, ConstParams<8>> = TaggedQueue::new();
/// ```
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConstParams<const N: usize>;

impl<const N: usize> Params for ConstParams<N> {
  const THREADS: Threads = Threads::new(N);
}

// -----------------------------------------------------------------------------
// Threads
// -----------------------------------------------------------------------------

/// A validated thread-cap value.
///
/// `Threads` is clamped to [`MIN`]`..=`[`MAX`] on construction.
///
/// [`MIN`]: Self::MIN
/// [`MAX`]: Self::MAX
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Threads(usize);

impl Threads {
  /// The minimum supported thread cap: 1.
  pub const MIN: Self = Self(1);

  /// The maximum supported thread cap: 4,096.
  pub const MAX: Self = Self(4096);

  /// Creates a new `Threads`, clamping to [`MIN`]`..=`[`MAX`].
  ///
  /// [`MIN`]: Self::MIN
  /// [`MAX`]: Self::MAX
  #[inline]
  pub const fn new(value: usize) -> Self {
    if value < Self::MIN.0 {
      Self::MIN
    } else if value > Self::MAX.0 {
      Self::MAX
    } else {
      Self(value)
    }
  }

  /// Returns the thread cap as a [`usize`].
  #[inline]
  pub const fn get(self) -> usize {
    self.0
  }
}

impl Debug for Threads {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    Debug::fmt(&self.0, f)
  }
}

// -----------------------------------------------------------------------------
// Buckets
// -----------------------------------------------------------------------------

/// A validated hash-set bucket count.
///
/// `Buckets` is a power of two in the range [`MIN`]`..=`[`MAX`]; arbitrary
/// values are rounded up and clamped on construction.
///
/// [`MIN`]: Self::MIN
/// [`MAX`]: Self::MAX
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Buckets(usize);

impl Buckets {
  /// The minimum supported bucket count: 8.
  pub const MIN: Self = Self(8);

  /// The maximum supported bucket count: 16,777,216 (2²⁴).
  pub const MAX: Self = Self(1 << 24);

  /// Creates a new `Buckets`, rounding up to the nearest power of two and
  /// clamping to [`MIN`]`..=`[`MAX`].
  ///
  /// [`MIN`]: Self::MIN
  /// [`MAX`]: Self::MAX
  #[inline]
  pub const fn new(value: usize) -> Self {
    let Some(rounded) = value.checked_next_power_of_two() else {
      return Self::MAX;
    };

    if rounded < Self::MIN.0 {
      Self::MIN
    } else if rounded > Self::MAX.0 {
      Self::MAX
    } else {
      Self(rounded)
    }
  }

  /// Returns the bucket count as a [`usize`].
  #[inline]
  pub const fn get(self) -> usize {
    self.0
  }

  /// Returns the base-2 logarithm of the bucket count.
  #[inline]
  pub const fn log2(self) -> u32 {
    self.0.trailing_zeros()
  }
}

impl Debug for Buckets {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "{:?} (1 << {:?})", self.0, self.log2())
  }
}

// -----------------------------------------------------------------------------
// Lanes
// -----------------------------------------------------------------------------

/// A validated free-pool lane count, clamped to [`MIN`]`..=`[`MAX`].
///
/// [`MIN`]: Self::MIN
/// [`MAX`]: Self::MAX
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Lanes(usize);

impl Lanes {
  /// The minimum supported lane count: 1.
  pub const MIN: Self = Self(1);

  /// The maximum supported lane count: 64.
  pub const MAX: Self = Self(64);

  /// Creates a new `Lanes`, clamping to [`MIN`]`..=`[`MAX`].
  ///
  /// [`MIN`]: Self::MIN
  /// [`MAX`]: Self::MAX
  #[inline]
  pub const fn new(value: usize) -> Self {
    if value < Self::MIN.0 {
      Self::MIN
    } else if value > Self::MAX.0 {
      Self::MAX
    } else {
      Self(value)
    }
  }

  /// Returns the lane count as a [`usize`].
  #[inline]
  pub const fn get(self) -> usize {
    self.0
  }
}

impl Debug for Lanes {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    Debug::fmt(&self.0, f)
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
