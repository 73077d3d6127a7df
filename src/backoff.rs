//! Back-off strategies for contended retry loops.
//!
//! Every CAS loop in this crate waits between attempts through one of these
//! strategies so that colliding threads decorrelate instead of hammering the
//! same line in lock-step. The strategy is a type parameter on each
//! container; state lives in the per-thread handle, so no synchronization is
//! needed inside `wait`.

use core::time::Duration;

use crate::sync::hint;

/// A strategy for pausing a thread between failed CAS attempts.
pub trait Backoff: Default {
  /// Blocks the calling thread briefly.
  fn wait(&mut self);
}

// -----------------------------------------------------------------------------
// Pause Backoff
// -----------------------------------------------------------------------------

const PAUSE_BASE: u64 = 50;
const PAUSE_GROWTH: u64 = 2;
const PAUSE_CAP: u64 = 256 * PAUSE_BASE;

/// Exponentially growing runs of CPU pause hints.
///
/// Starts at 50 pause instructions, doubles on every call, and resets to the
/// base once the run would exceed 256×50.
#[derive(Debug)]
pub struct PauseBackoff {
  count: u64,
}

impl Default for PauseBackoff {
  #[inline]
  fn default() -> Self {
    Self { count: PAUSE_BASE }
  }
}

impl Backoff for PauseBackoff {
  #[inline]
  fn wait(&mut self) {
    let next: u64 = self.count * PAUSE_GROWTH;

    self.count = if next <= PAUSE_CAP { next } else { PAUSE_BASE };

    for _ in 0..self.count {
      hint::spin_loop();
    }
  }
}

// -----------------------------------------------------------------------------
// Sleep Backoff
// -----------------------------------------------------------------------------

const SLEEP_NANOS: u64 = 50;

/// Suspends the thread for roughly 50 nanoseconds.
///
/// The actual delay is at the mercy of the OS timer slack; on a loaded box
/// this frequently rounds up to a scheduler quantum, which is exactly what a
/// saturated retry storm needs.
#[derive(Debug, Default)]
pub struct SleepBackoff;

impl Backoff for SleepBackoff {
  #[inline]
  fn wait(&mut self) {
    std::thread::sleep(Duration::from_nanos(SLEEP_NANOS));
  }
}

// -----------------------------------------------------------------------------
// Random Backoff
// -----------------------------------------------------------------------------

const SPIN_MIN: u64 = 1;
const SPIN_MAX: u64 = 1000;

/// A uniformly-distributed 1..1000 busy spin.
///
/// Randomized jitter shakes colliding threads apart faster than any
/// deterministic schedule when more than two contenders race for one word.
#[derive(Debug, Default)]
pub struct RandomBackoff;

impl Backoff for RandomBackoff {
  #[inline]
  fn wait(&mut self) {
    use rand::Rng;

    let spins: u64 = rand::rng().random_range(SPIN_MIN..SPIN_MAX);

    for _ in 0..spins {
      hint::spin_loop();
    }
  }
}

// -----------------------------------------------------------------------------
// No Backoff
// -----------------------------------------------------------------------------

/// A no-op strategy: retry immediately.
#[derive(Debug, Default)]
pub struct NoBackoff;

impl Backoff for NoBackoff {
  #[inline]
  fn wait(&mut self) {
    // do nothing
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(not(any(loom, shuttle)))]
#[cfg(test)]
mod tests {
  use crate::backoff::Backoff;
  use crate::backoff::NoBackoff;
  use crate::backoff::PAUSE_BASE;
  use crate::backoff::PAUSE_CAP;
  use crate::backoff::PauseBackoff;
  use crate::backoff::RandomBackoff;
  use crate::backoff::SleepBackoff;

  #[test]
  fn pause_doubles_and_resets() {
    let mut backoff: PauseBackoff = PauseBackoff::default();

    backoff.wait();
    assert_eq!(backoff.count, PAUSE_BASE * 2);

    while backoff.count < PAUSE_CAP {
      backoff.wait();
    }

    assert_eq!(backoff.count, PAUSE_CAP);

    backoff.wait();
    assert_eq!(backoff.count, PAUSE_BASE);
  }

  #[test]
  fn all_strategies_return() {
    PauseBackoff::default().wait();
    SleepBackoff.wait();
    RandomBackoff.wait();
    NoBackoff.wait();
  }
}
