//! Process-wide bootstrap: builds the four static caches and the global
//! cache registry.
//!
//! Creation order matters: the magazine cache must exist before any other
//! cache can populate its per-CPU array, because doing so allocates two
//! magazines per CPU. The magazine cache breaks that circularity by
//! obtaining its own per-CPU magazines through [`crate::slab`]'s raw
//! slab-level allocation path instead of through itself.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::arena::Arena;
use crate::bufctl::Bufctl;
use crate::cache::KmemCache;
use crate::flags::CacheFlags;
use crate::slab::Slab;
use crate::time::Clock;

/// The four caches every cache hierarchy bootstraps with, plus the registry
/// of every cache created afterward.
pub struct BootCaches {
    /// Source of every magazine any cache in the process ever holds.
    pub magazine: Box<KmemCache>,
    /// Would-be allocator for `KmemCache` metadata; see `DESIGN.md` for why
    /// this cache carries no real metadata traffic in this crate.
    pub cache: Box<KmemCache>,
    /// Would-be allocator for `Slab` metadata; see `DESIGN.md`.
    pub slab: Box<KmemCache>,
    /// Would-be allocator for `Bufctl` records; see `DESIGN.md`.
    pub bufctl: Box<KmemCache>,
    registry: spin::Mutex<Vec<NonNull<KmemCache>>>,
}

unsafe impl Send for BootCaches {}
unsafe impl Sync for BootCaches {}

static BOOT: spin::Once<BootCaches> = spin::Once::new();

/// Builds the four static caches against `arena`, sized for `nr_cpus`
/// logical CPUs, using `clock` for every depot's contention timing. Safe to
/// call more than once; only the first call's arguments take effect.
pub fn init(arena: &'static dyn Arena, nr_cpus: usize, clock_factory: fn() -> Box<dyn Clock>) -> &'static BootCaches {
    BOOT.call_once(|| {
        let magazine = KmemCache::bootstrap_magazine_cache(arena, nr_cpus, clock_factory());

        let cache = KmemCache::create(
            "kmem_cache",
            core::mem::size_of::<KmemCache>(),
            core::mem::align_of::<KmemCache>(),
            CacheFlags::NOTOUCH,
            arena,
            None,
            None,
            core::ptr::null_mut(),
            nr_cpus,
            clock_factory(),
            &magazine,
        );
        let slab = KmemCache::create(
            "kmem_slab",
            core::mem::size_of::<Slab>(),
            core::mem::align_of::<Slab>(),
            CacheFlags::NOTOUCH,
            arena,
            None,
            None,
            core::ptr::null_mut(),
            nr_cpus,
            clock_factory(),
            &magazine,
        );
        let bufctl = KmemCache::create(
            "kmem_bufctl",
            core::mem::size_of::<Bufctl>(),
            core::mem::align_of::<Bufctl>(),
            CacheFlags::empty(),
            arena,
            None,
            None,
            core::ptr::null_mut(),
            nr_cpus,
            clock_factory(),
            &magazine,
        );

        let boot = BootCaches {
            magazine,
            cache,
            slab,
            bufctl,
            registry: spin::Mutex::new(Vec::new()),
        };
        {
            let mut reg = boot.registry.lock();
            reg.push(NonNull::from(&*boot.magazine));
            reg.push(NonNull::from(&*boot.cache));
            reg.push(NonNull::from(&*boot.slab));
            reg.push(NonNull::from(&*boot.bufctl));
        }

        #[cfg(feature = "log")]
        log::debug!("kmem: bootstrap complete, {} static caches registered", boot.registry.lock().len());

        boot
    })
}

/// Returns the already-initialized boot caches.
///
/// # Panics
/// If called before [`init`].
pub fn boot_caches() -> &'static BootCaches {
    BOOT.get().expect("kmem::boot::init must run before any cache is created")
}

impl BootCaches {
    /// Registers a cache created after bootstrap on the process-global
    /// list, for the observability surface described by the allocator's
    /// external interface.
    pub fn register(&self, cache: &KmemCache) {
        self.registry.lock().push(NonNull::from(cache));
    }

    /// Removes a cache from the process-global list. Callers must do this
    /// before the cache itself is freed.
    pub fn unregister(&self, cache: &KmemCache) {
        let target = NonNull::from(cache);
        self.registry.lock().retain(|&c| c != target);
    }

    /// Number of caches currently registered, live or bootstrap.
    pub fn registered_count(&self) -> usize {
        self.registry.lock().len()
    }
}
