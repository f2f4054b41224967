//! Flags passed to cache creation and to individual allocations.

use bitflags::bitflags;

bitflags! {
    /// Flags supplied to [`crate::cache::KmemCache::create`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Size the cache's import amount from the source arena's
        /// `qcache_max` hint instead of `NUM_BUF_PER_SLAB * object_size`.
        /// Intended for the small helper caches an arena uses internally.
        const QCACHE = 1 << 0;
        /// Force the bufctl/hash regime even if the object would otherwise
        /// be small enough to thread a freelist through its own storage.
        /// Required whenever object memory must not be touched by the
        /// allocator.
        const NOTOUCH = 1 << 1;
    }
}

bitflags! {
    /// Flags supplied to [`crate::cache::KmemCache::alloc`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// The caller may block in lower allocators. Only meaningful once
        /// the fast path falls through to the slab layer; the per-CPU and
        /// depot tiers never block regardless of this flag.
        const WAIT = 1 << 0;
        /// Never block; a failed arena import returns `Err` instead of
        /// retrying.
        const ATOMIC = 1 << 1;
        /// On out-of-memory, return `Err` from `alloc` rather than aborting
        /// the process. Has no effect on constructor failures, which always
        /// surface as a failed allocation regardless of this flag.
        const ERROR = 1 << 2;
    }
}

impl Default for AllocFlags {
    fn default() -> Self {
        AllocFlags::WAIT
    }
}
