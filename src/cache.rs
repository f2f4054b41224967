//! The cache facade: creation, destruction, reap, and the alloc/free fast
//! path that ties the per-CPU cache, depot, slab layer, and hash index
//! together.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arena::{self, Arena};
use crate::bufctl::{Bufctl, HashIndex};
use crate::depot::Depot;
use crate::error::{CacheError, Result};
use crate::flags::{AllocFlags, CacheFlags};
use crate::magazine::{self, Magazine, MAG_MIN_SZ};
use crate::pcpu::PerCpuCache;
use crate::slab::{Regime, Slab, LARGE_CUTOFF, NUM_BUF_PER_SLAB};
use crate::time::Clock;

/// Cache names are truncated to this many bytes.
pub const NAME_LEN: usize = 24;

/// `ctor(obj, priv, flags) -> 0 | nonzero`. Runs exactly once per object
/// before it is first handed to a caller after being (re)obtained from the
/// slab layer. A nonzero result aborts the allocation.
pub type CacheCtor = fn(NonNull<u8>, *mut u8, AllocFlags) -> i32;

/// `dtor(obj, priv)`. Runs exactly once before an object's storage returns
/// to the slab layer.
pub type CacheDtor = fn(NonNull<u8>, *mut u8);

struct CacheLists {
    full: Vec<NonNull<Slab>>,
    partial: Vec<NonNull<Slab>>,
    empty: Vec<NonNull<Slab>>,
    hash: Option<HashIndex>,
}

fn untrack(list: &mut Vec<NonNull<Slab>>, target: NonNull<Slab>) {
    list.retain(|&s| s != target);
}

fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(NAME_LEN);
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}

/// A typed allocator for fixed-size objects.
pub struct KmemCache {
    name: String,
    object_size: usize,
    align: usize,
    import_amt: usize,
    flags: CacheFlags,
    regime: Regime,
    arena: &'static dyn Arena,
    ctor: Option<CacheCtor>,
    dtor: Option<CacheDtor>,
    priv_data: *mut u8,
    lists: spin::Mutex<CacheLists>,
    depot: Depot,
    pcpu: Vec<PerCpuCache>,
    nr_cur_alloc: AtomicUsize,
    /// `None` for the magazine cache itself: it obtains the magazines for
    /// its own per-CPU slots directly from its slab layer (`alloc_from_slab`),
    /// bypassing the magazine/depot tiers, since those tiers cannot exist
    /// yet. Every other cache holds `Some` pointer at the one process-wide
    /// magazine cache and allocates/frees magazines through its normal
    /// alloc/free path like any other client.
    magazine_cache: Option<NonNull<KmemCache>>,
}

// SAFETY: `priv_data` and `magazine_cache` are raw pointers with no
// thread-confined meaning of their own; every field they gate access to is
// behind this cache's own lock or a per-CPU slot's lock.
unsafe impl Send for KmemCache {}
unsafe impl Sync for KmemCache {}

impl KmemCache {
    /// Creates a new cache. `magazine_cache` must be the process's
    /// bootstrap magazine cache (see [`crate::boot`]).
    ///
    /// # Panics
    /// If `align` is zero or exceeds the page size: an invariant violation,
    /// fatal per the allocator's error policy.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        name: &str,
        object_size: usize,
        align: usize,
        flags: CacheFlags,
        arena: &'static dyn Arena,
        ctor: Option<CacheCtor>,
        dtor: Option<CacheDtor>,
        priv_data: *mut u8,
        nr_cpus: usize,
        clock: Box<dyn Clock>,
        magazine_cache: &KmemCache,
    ) -> Box<KmemCache> {
        Self::create_internal(
            name,
            object_size,
            align,
            flags,
            arena,
            ctor,
            dtor,
            priv_data,
            nr_cpus,
            clock,
            Some(NonNull::from(magazine_cache)),
        )
    }

    /// Builds a magazine cache: the source of every magazine any other
    /// cache in the hierarchy holds. [`crate::boot::init`] calls this
    /// exactly once for the process-wide magazine cache; tests and
    /// benchmarks that want an isolated hierarchy call it directly too.
    pub fn bootstrap_magazine_cache(
        arena: &'static dyn Arena,
        nr_cpus: usize,
        clock: Box<dyn Clock>,
    ) -> Box<KmemCache> {
        Self::create_internal(
            "kmem_magazine",
            size_of::<Magazine>(),
            size_of::<usize>(),
            CacheFlags::empty(),
            arena,
            Some(magazine::ctor_shim),
            Some(magazine::dtor_shim),
            core::ptr::null_mut(),
            nr_cpus,
            clock,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn create_internal(
        name: &str,
        object_size: usize,
        align: usize,
        flags: CacheFlags,
        arena: &'static dyn Arena,
        ctor: Option<CacheCtor>,
        dtor: Option<CacheDtor>,
        priv_data: *mut u8,
        nr_cpus: usize,
        clock: Box<dyn Clock>,
        magazine_cache: Option<NonNull<KmemCache>>,
    ) -> Box<KmemCache> {
        assert!(align != 0 && align <= arena::PAGE_SIZE, "kmem: invalid alignment for cache {name:?}");
        let effective_size = arena::round_up(object_size, align).max(align);
        let regime = if flags.contains(CacheFlags::NOTOUCH) || effective_size > LARGE_CUTOFF {
            Regime::Large
        } else {
            Regime::Small
        };
        let import_amt = if flags.contains(CacheFlags::QCACHE) {
            arena::round_up_pow2(3 * arena.qcache_max())
        } else {
            arena::page_round_up(NUM_BUF_PER_SLAB * effective_size)
        };
        let hash = matches!(regime, Regime::Large).then(HashIndex::new);

        let mut boxed = Box::new(KmemCache {
            name: truncate_name(name),
            object_size: effective_size,
            align,
            import_amt,
            flags,
            regime,
            arena,
            ctor,
            dtor,
            priv_data,
            lists: spin::Mutex::new(CacheLists {
                full: Vec::new(),
                partial: Vec::new(),
                empty: Vec::new(),
                hash,
            }),
            depot: Depot::new(clock),
            pcpu: Vec::new(),
            nr_cur_alloc: AtomicUsize::new(0),
            magazine_cache,
        });

        let mut pcpu = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus {
            let loaded = boxed.bootstrap_magazine(cpu);
            let previous = boxed.bootstrap_magazine(cpu);
            pcpu.push(PerCpuCache::new(loaded, previous, MAG_MIN_SZ));
        }
        boxed.pcpu = pcpu;

        #[cfg(feature = "log")]
        log::debug!(
            "kmem: created cache {:?} (object_size={}, regime={:?}, import_amt={})",
            boxed.name,
            boxed.object_size,
            boxed.regime,
            boxed.import_amt
        );

        boxed
    }

    /// Obtains one fresh, empty magazine during per-CPU array construction.
    fn bootstrap_magazine(&self, cpu: usize) -> NonNull<Magazine> {
        self.alloc_magazine(cpu, AllocFlags::WAIT)
            .expect("kmem: failed to bootstrap per-CPU magazines")
    }

    /// Destroys a cache. No concurrent use may be in flight.
    ///
    /// # Panics
    /// If the full or partial slab list is non-empty: objects are still
    /// outstanding, an invariant violation.
    pub fn destroy(mut cache: Box<KmemCache>) {
        for pcpu in cache.pcpu.drain(..) {
            let state = pcpu.into_inner();
            cache.depot.put(state.loaded);
            cache.depot.put(state.previous);
        }

        for mag in cache.depot.drain_all() {
            let mut m = mag;
            while let Some(obj) = unsafe { m.as_mut() }.pop() {
                cache.free_to_slab(obj);
            }
            cache.free_magazine(mag);
        }

        let mut lists = cache.lists.lock();
        assert!(
            lists.full.is_empty() && lists.partial.is_empty(),
            "kmem: destroying cache {:?} with outstanding objects",
            cache.name
        );
        for slab in lists.empty.drain(..) {
            unsafe { Slab::destroy(slab, cache.arena) };
        }
        drop(lists);

        #[cfg(feature = "log")]
        log::debug!("kmem: destroyed cache {:?}", cache.name);
    }

    /// Destroys every slab on the empty list. Partial and full slabs are
    /// left untouched.
    pub fn reap(&self) {
        let mut lists = self.lists.lock();
        let reaped = lists.empty.len();
        for slab in lists.empty.drain(..) {
            unsafe { Slab::destroy(slab, self.arena) };
        }
        drop(lists);

        #[cfg(feature = "log")]
        if reaped > 0 {
            log::debug!("kmem: reaped {} empty slab(s) from cache {:?}", reaped, self.name);
        }
    }

    /// Cache name, truncated to [`NAME_LEN`] bytes at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of objects currently allocated from this cache, across every
    /// slab, magazine, and per-CPU slot.
    pub fn nr_cur_alloc(&self) -> usize {
        self.nr_cur_alloc.load(Ordering::Relaxed)
    }

    /// Lifetime allocation count for one CPU's per-CPU cache.
    pub fn nr_allocs_ever(&self, cpu: usize) -> u64 {
        self.pcpu[cpu].nr_allocs_ever()
    }

    /// Allocates one object.
    ///
    /// Fails with [`CacheError::OutOfMemory`] when `flags` carries `ATOMIC`
    /// or `ERROR` and the arena cannot satisfy a growth request; otherwise
    /// an out-of-memory condition is fatal. Fails with
    /// [`CacheError::ConstructorFailure`], never fatally, if the
    /// constructor rejects the object.
    pub fn alloc(&self, cpu: usize, flags: AllocFlags) -> Result<NonNull<u8>> {
        let pcpu = &self.pcpu[cpu];
        loop {
            let mut state = pcpu.acquire();
            if let Some(obj) = unsafe { state.loaded.as_mut() }.pop() {
                state.nr_allocs_ever += 1;
                return Ok(obj);
            }
            if !unsafe { state.previous.as_ref() }.is_empty() {
                core::mem::swap(&mut state.loaded, &mut state.previous);
                continue;
            }
            if let Some(full) = self.depot.take_full() {
                let returning = state.previous;
                self.depot.put(returning);
                state.previous = state.loaded;
                state.loaded = full;
                continue;
            }
            drop(state);
            return self.alloc_from_slab(flags);
        }
    }

    /// Frees an object previously returned by [`KmemCache::alloc`] on this
    /// cache. Freeing an object allocated from a different cache is
    /// undefined behavior.
    pub fn free(&self, cpu: usize, obj: NonNull<u8>) {
        let pcpu = &self.pcpu[cpu];
        loop {
            let mut state = pcpu.acquire();
            if unsafe { state.loaded.as_ref() }.len() < state.magsize {
                unsafe { state.loaded.as_mut() }.push(obj);
                return;
            }
            if unsafe { state.previous.as_ref() }.len() < state.magsize {
                core::mem::swap(&mut state.loaded, &mut state.previous);
                continue;
            }
            state.magsize = self.depot.magsize();
            if let Some(empty) = self.depot.take_empty() {
                let returning = state.previous;
                self.depot.put(returning);
                state.previous = state.loaded;
                state.loaded = empty;
                continue;
            }
            drop(state);
            match self.alloc_magazine(cpu, AllocFlags::ATOMIC) {
                Some(mag) => {
                    self.depot.put(mag);
                    continue;
                }
                None => {
                    if let Some(dtor) = self.dtor {
                        dtor(obj, self.priv_data);
                    }
                    self.free_to_slab(obj);
                    return;
                }
            }
        }
    }

    fn alloc_magazine(&self, cpu: usize, flags: AllocFlags) -> Option<NonNull<Magazine>> {
        match self.magazine_cache {
            None => self.alloc_from_slab(flags).ok().map(NonNull::cast),
            Some(mc) => unsafe { mc.as_ref() }.alloc(cpu, flags).ok().map(NonNull::cast),
        }
    }

    fn free_magazine(&self, mag: NonNull<Magazine>) {
        match self.magazine_cache {
            None => self.free_to_slab(mag.cast()),
            Some(mc) => unsafe { mc.as_ref() }.free(0, mag.cast()),
        }
    }

    /// Obtains one object directly from the slab layer, growing the cache
    /// if necessary. Runs the constructor after releasing the cache lock.
    fn alloc_from_slab(&self, flags: AllocFlags) -> Result<NonNull<u8>> {
        let obj = {
            let mut lists = self.lists.lock();
            let slab_ptr = Self::select_slab(&mut lists, self, flags)?;
            let obj = match self.regime {
                Regime::Small => unsafe { (*slab_ptr.as_ptr()).pop_small() },
                Regime::Large => {
                    let bufctl = unsafe { (*slab_ptr.as_ptr()).pop_large() };
                    let addr = unsafe { bufctl.as_ref() }.buf_addr;
                    lists
                        .hash
                        .as_mut()
                        .expect("large-regime cache missing hash index")
                        .insert(bufctl);
                    addr
                }
            };
            Self::restack_after_alloc(&mut lists, slab_ptr);
            obj
        };

        if let Some(ctor) = self.ctor {
            let rc = ctor(obj, self.priv_data, flags);
            if rc != 0 {
                self.free_to_slab(obj);
                return Err(CacheError::ConstructorFailure);
            }
        }
        self.nr_cur_alloc.fetch_add(1, Ordering::Relaxed);
        Ok(obj)
    }

    /// Returns an object to the slab layer. Does not run the destructor:
    /// callers that need the destructor run must invoke it first.
    fn free_to_slab(&self, obj: NonNull<u8>) {
        let mut lists = self.lists.lock();
        let slab_ptr = match self.regime {
            Regime::Small => unsafe { Slab::locate_small(obj) },
            Regime::Large => {
                let bufctl = lists
                    .hash
                    .as_mut()
                    .expect("large-regime cache missing hash index")
                    .remove(obj);
                let slab = unsafe { bufctl.as_ref() }.slab;
                unsafe { (*slab.as_ptr()).push_large(bufctl) };
                slab
            }
        };
        if matches!(self.regime, Regime::Small) {
            unsafe { (*slab_ptr.as_ptr()).push_small(obj) };
        }
        Self::restack_after_free(&mut lists, slab_ptr);
        self.nr_cur_alloc.fetch_sub(1, Ordering::Relaxed);
    }

    fn select_slab(
        lists: &mut CacheLists,
        cache: &KmemCache,
        flags: AllocFlags,
    ) -> Result<NonNull<Slab>> {
        if let Some(slab) = lists.partial.pop() {
            return Ok(slab);
        }
        if lists.empty.is_empty() {
            cache.cache_grow(lists, flags)?;
        }
        Ok(lists.empty.pop().expect("cache_grow did not add a slab"))
    }

    /// Imports one slab's worth of memory from the arena and appends it to
    /// the empty list. Always requests atomic (non-blocking) semantics from
    /// the arena, per the slab-growth contract.
    fn cache_grow(&self, lists: &mut CacheLists, flags: AllocFlags) -> Result<()> {
        let grow_flags = flags | AllocFlags::ATOMIC;
        let slab = match self.regime {
            Regime::Small => Slab::grow_small(self.arena, self.object_size, grow_flags),
            Regime::Large => Slab::grow_large(self.arena, self.object_size, self.import_amt, grow_flags),
        };
        match slab {
            Some(s) => {
                #[cfg(feature = "log")]
                log::debug!(
                    "kmem: cache {:?} grew by one {:?}-regime slab",
                    self.name,
                    self.regime
                );
                lists.empty.push(s);
                Ok(())
            }
            None if flags.contains(AllocFlags::ATOMIC) || flags.contains(AllocFlags::ERROR) => {
                Err(CacheError::OutOfMemory)
            }
            None => panic!("kmem: out of memory growing cache {:?}", self.name),
        }
    }

    fn restack_after_alloc(lists: &mut CacheLists, slab_ptr: NonNull<Slab>) {
        let full = unsafe { slab_ptr.as_ref() }.is_full();
        if full {
            lists.full.push(slab_ptr);
        } else {
            lists.partial.push(slab_ptr);
        }
    }

    fn restack_after_free(lists: &mut CacheLists, slab_ptr: NonNull<Slab>) {
        untrack(&mut lists.full, slab_ptr);
        untrack(&mut lists.partial, slab_ptr);
        let empty = unsafe { slab_ptr.as_ref() }.is_empty();
        if empty {
            lists.empty.push(slab_ptr);
        } else {
            lists.partial.push(slab_ptr);
        }
    }

    /// Sum of `busy` over every slab, recomputed from scratch. Used by
    /// tests to cross-check [`KmemCache::nr_cur_alloc`] against the
    /// invariant it is supposed to track.
    #[cfg(test)]
    fn sum_busy(&self) -> usize {
        let lists = self.lists.lock();
        let mut total = 0;
        for &s in lists.full.iter().chain(lists.partial.iter()).chain(lists.empty.iter()) {
            total += unsafe { s.as_ref() }.busy();
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::BaseArena;
    use crate::time::NullClock;

    static ARENA: BaseArena = BaseArena::new();

    fn noop_ctor(_obj: NonNull<u8>, _priv: *mut u8, _flags: AllocFlags) -> i32 {
        0
    }

    fn new_magazine_cache(nr_cpus: usize) -> Box<KmemCache> {
        KmemCache::bootstrap_magazine_cache(&ARENA, nr_cpus, Box::new(NullClock))
    }

    fn new_cache(mag: &KmemCache, obj_size: usize, nr_cpus: usize) -> Box<KmemCache> {
        KmemCache::create(
            "test",
            obj_size,
            8,
            CacheFlags::empty(),
            &ARENA,
            None,
            None,
            core::ptr::null_mut(),
            nr_cpus,
            Box::new(NullClock),
            mag,
        )
    }

    #[test]
    fn cache_warm_lifo_round_trip() {
        let mag = new_magazine_cache(1);
        let cache = new_cache(&mag, 64, 1);
        let a = cache.alloc(0, AllocFlags::WAIT).unwrap();
        cache.free(0, a);
        let b = cache.alloc(0, AllocFlags::WAIT).unwrap();
        assert_eq!(a, b);
        KmemCache::destroy(cache);
        KmemCache::destroy(mag);
    }

    #[test]
    fn nr_cur_alloc_matches_busy_sum() {
        let mag = new_magazine_cache(1);
        let cache = new_cache(&mag, 64, 1);
        let mut objs = alloc::vec::Vec::new();
        for _ in 0..20 {
            objs.push(cache.alloc(0, AllocFlags::WAIT).unwrap());
        }
        assert_eq!(cache.nr_cur_alloc(), 20);
        assert_eq!(cache.nr_cur_alloc(), cache.sum_busy());
        for obj in objs {
            cache.free(0, obj);
        }
        KmemCache::destroy(cache);
        KmemCache::destroy(mag);
    }

    #[test]
    fn large_regime_tracks_bufctls_in_hash_index() {
        let mag = new_magazine_cache(1);
        let cache = new_cache(&mag, LARGE_CUTOFF + 1, 1);
        let obj = cache.alloc(0, AllocFlags::WAIT).unwrap();
        assert_eq!(cache.nr_cur_alloc(), 1);
        cache.free(0, obj);
        KmemCache::destroy(cache);
        KmemCache::destroy(mag);
    }

    #[test]
    fn constructor_failure_does_not_leak_the_slot() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        fn flaky_ctor(_obj: NonNull<u8>, _priv: *mut u8, _flags: AllocFlags) -> i32 {
            let n = CALLS.fetch_add(1, Ordering::Relaxed);
            if (n + 1) % 3 == 0 {
                1
            } else {
                0
            }
        }
        let mag = new_magazine_cache(1);
        let cache = KmemCache::create(
            "ctor_test",
            64,
            8,
            CacheFlags::empty(),
            &ARENA,
            Some(flaky_ctor),
            None,
            core::ptr::null_mut(),
            1,
            Box::new(NullClock),
            &mag,
        );
        assert!(cache.alloc(0, AllocFlags::WAIT).is_ok());
        assert!(cache.alloc(0, AllocFlags::WAIT).is_ok());
        assert!(matches!(
            cache.alloc(0, AllocFlags::WAIT),
            Err(CacheError::ConstructorFailure)
        ));
        assert_eq!(cache.nr_cur_alloc(), 2);
        KmemCache::destroy(cache);
        KmemCache::destroy(mag);
    }

    #[test]
    fn atomic_oom_returns_error_instead_of_panicking() {
        struct FailingArena;
        impl Arena for FailingArena {
            fn arena_alloc(&self, _size: usize, _flags: AllocFlags) -> Option<NonNull<u8>> {
                None
            }
            unsafe fn arena_free(&self, _addr: NonNull<u8>, _size: usize) {}
        }
        static FAILING: FailingArena = FailingArena;
        let mag = new_magazine_cache(1);
        let cache = KmemCache::create(
            "oom_test",
            64,
            8,
            CacheFlags::empty(),
            &FAILING,
            Some(noop_ctor),
            None,
            core::ptr::null_mut(),
            1,
            Box::new(NullClock),
            &mag,
        );
        assert!(matches!(
            cache.alloc(0, AllocFlags::ATOMIC),
            Err(CacheError::OutOfMemory)
        ));
        assert_eq!(cache.nr_cur_alloc(), 0);
    }
}
