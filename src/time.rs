//! Monotonic time source for the depot's contention-driven resize policy.
//!
//! The allocator core has no notion of wall-clock time; it only needs a
//! monotonically nondecreasing nanosecond counter to measure contention
//! bursts. Production embedders supply their own [`Clock`] (typically a
//! cycle counter); hosted builds use [`NullClock`], under which the resize
//! window never closes and every contended acquisition counts toward the
//! same burst.

/// A monotonic nanosecond clock.
pub trait Clock: Send + Sync {
    /// Returns a nondecreasing timestamp in nanoseconds.
    fn now_ns(&self) -> u64;
}

/// A clock that never advances. Useful for hosted tests that want
/// deterministic control over when the resize window resets, and as the
/// crate default when no real time source is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullClock;

impl Clock for NullClock {
    fn now_ns(&self) -> u64 {
        0
    }
}

#[cfg(feature = "std")]
extern crate std;

/// A clock backed by [`std::time::Instant`]. Only available with the `std`
/// feature, for hosted tests and benchmarks that want to exercise the real
/// resize-timeout logic.
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct StdClock {
    origin: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    /// Creates a clock whose epoch is the moment of construction.
    pub fn new() -> Self {
        StdClock {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}
