//! A general-purpose object-cache allocator for kernel-like environments,
//! modeled on Bonwick's slab allocator and the Bonwick-Adams "Magazines and
//! Vmem" extension.
//!
//! Layered bottom-up: an [`arena`] supplier hands out page-granularity
//! memory; the [`slab`] layer carves that into fixed-size object frames,
//! either threading a freelist through free objects directly (pro-touch) or
//! tracking them externally through [`bufctl`] records indexed by a hash
//! table; the [`depot`] pools magazines of free objects across CPUs; the
//! [`pcpu`] layer gives each CPU a lock-free fast path over two magazine
//! slots; [`cache`] ties all of it together behind the `KmemCache` facade;
//! [`boot`] builds the four caches every cache hierarchy bootstraps with.

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

/// The backing page-granularity arena contract and its hosted implementation.
pub mod arena;
/// Process-wide bootstrap of the four static caches and the cache registry.
pub mod boot;
/// Bufctls and the hash index used by the large/no-touch regime.
pub mod bufctl;
/// The cache facade tying every layer together.
pub mod cache;
/// The per-cache magazine depot and its contention-driven resize policy.
pub mod depot;
/// Error types returned from fallible cache operations.
pub mod error;
/// Flags passed to cache creation and individual allocations.
pub mod flags;
/// Magazines: the unit of batch transfer between per-CPU caches and the depot.
pub mod magazine;
/// The per-CPU two-magazine allocation fast path.
pub mod pcpu;
/// The slab layer: small/pro-touch and large/no-touch object frames.
pub mod slab;
/// A monotonic clock abstraction for the depot's resize policy.
pub mod time;

pub use arena::{Arena, BaseArena};
pub use bufctl::{Bufctl, HashIndex};
pub use cache::{CacheCtor, CacheDtor, KmemCache};
pub use depot::Depot;
pub use error::{CacheError, Result};
pub use flags::{AllocFlags, CacheFlags};
pub use magazine::Magazine;
pub use pcpu::PerCpuCache;
pub use slab::{Regime, Slab};
pub use time::{Clock, NullClock};

#[cfg(feature = "std")]
pub use time::StdClock;

#[cfg(any(test, feature = "std"))]
extern crate std;
