//! The slab layer: turns arena imports into fixed-size object frames.
//!
//! Two representations are chosen once, at cache creation, and never change
//! for the lifetime of a cache: *small* (pro-touch, freelist threaded
//! through the free objects themselves, one page per slab) and *large*
//! (no-touch, external bufctl records, one hash-sized import per slab).

extern crate alloc;

use core::mem::size_of;
use core::ptr::NonNull;

use crate::arena::{self, Arena, PAGE_SIZE};
use crate::bufctl::Bufctl;
use crate::flags::AllocFlags;

/// Objects at or below this size use the pro-touch regime by default; above
/// it (or when [`crate::flags::CacheFlags::NOTOUCH`] is set) a cache uses
/// the no-touch/bufctl regime. Chosen so that [`crate::magazine::Magazine`]
/// itself, the one structure this crate must bootstrap through the small
/// regime, safely clears the cutoff.
pub const LARGE_CUTOFF: usize = 1024;

/// Default number of object slots a non-qcache, large-regime slab aims for
/// when sizing its import from the arena.
pub const NUM_BUF_PER_SLAB: usize = 8;

/// Which of the two slab representations a cache uses. Fixed at cache
/// creation; never changes afterward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Freelist threaded through free objects; one page per slab.
    Small,
    /// External bufctls, tracked through the cache's hash index.
    Large,
}

enum SlabBody {
    Small {
        free_obj: Option<NonNull<u8>>,
    },
    Large {
        free_bufctl: Option<NonNull<Bufctl>>,
    },
}

/// Ownership record for one arena import.
pub struct Slab {
    /// Base address of the imported region.
    mem: NonNull<u8>,
    /// Size of the imported region, needed to return it to the arena.
    mem_size: usize,
    /// Number of slots currently allocated.
    busy: usize,
    /// Total number of slots this slab was built with.
    total: usize,
    body: SlabBody,
}

unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

/// Reads back the out-of-line [`Slab`] pointer stashed at the tail of a
/// pro-touch page. Every small-regime object address can be mapped back to
/// its slab purely by rounding down to the page boundary and reading this
/// footer word — no hash lookup, no list walk.
#[inline]
unsafe fn footer_slot(page_start: usize) -> *mut usize {
    (page_start + PAGE_SIZE - size_of::<usize>()) as *mut usize
}

impl Slab {
    /// Net object capacity of a pro-touch page: the whole page minus the
    /// footer word, divided into `obj_size` slots.
    pub const fn small_capacity(obj_size: usize) -> usize {
        (PAGE_SIZE - size_of::<usize>()) / obj_size
    }

    /// Obtains one page from `arena` and threads a freelist through it.
    /// Returns `None` if the arena import fails (propagated as `OutOfMemory`
    /// by the caller).
    pub(crate) fn grow_small(
        arena: &dyn Arena,
        obj_size: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<Slab>> {
        debug_assert!(obj_size >= size_of::<*mut u8>());
        let nr_slots = Self::small_capacity(obj_size);
        debug_assert!(nr_slots > 0, "object too large for the small regime");
        let mem = arena.arena_alloc(PAGE_SIZE, flags)?;
        let page_start = mem.as_ptr() as usize;

        // Thread the freelist: slot i's first word points at slot i-1;
        // the head (last slot built) is the most recently freed-looking one.
        let mut head: Option<NonNull<u8>> = None;
        for i in 0..nr_slots {
            let slot = unsafe { mem.as_ptr().add(i * obj_size) };
            unsafe {
                (slot as *mut *mut u8).write(head.map_or(core::ptr::null_mut(), |h| h.as_ptr()));
            }
            head = NonNull::new(slot);
        }

        let slab_ptr = Self::alloc_record(Slab {
            mem,
            mem_size: PAGE_SIZE,
            busy: 0,
            total: nr_slots,
            body: SlabBody::Small { free_obj: head },
        });

        unsafe {
            footer_slot(page_start).write(slab_ptr.as_ptr() as usize);
        }
        Some(slab_ptr)
    }

    /// Imports `import_amt` bytes from `arena` and builds one bufctl per
    /// slot, chained into this slab's free list.
    pub(crate) fn grow_large(
        arena: &dyn Arena,
        obj_size: usize,
        import_amt: usize,
        flags: AllocFlags,
    ) -> Option<NonNull<Slab>> {
        let nr_slots = import_amt / obj_size;
        debug_assert!(nr_slots > 0, "import_amt too small for one object");
        let mem = arena.arena_alloc(import_amt, flags)?;

        let slab_ptr = Self::alloc_record(Slab {
            mem,
            mem_size: import_amt,
            busy: 0,
            total: nr_slots,
            body: SlabBody::Large { free_bufctl: None },
        });

        let mut head: Option<NonNull<Bufctl>> = None;
        for i in 0..nr_slots {
            let addr = unsafe { NonNull::new_unchecked(mem.as_ptr().add(i * obj_size)) };
            let mut bufctl_ptr = Self::alloc_bufctl(Bufctl::new(addr, slab_ptr));
            unsafe {
                bufctl_ptr.as_mut().link = head;
            }
            head = Some(bufctl_ptr);
        }
        if let SlabBody::Large { free_bufctl } = unsafe { &mut (*slab_ptr.as_ptr()).body } {
            *free_bufctl = head;
        }
        Some(slab_ptr)
    }

    /// Number of slots currently allocated.
    pub fn busy(&self) -> usize {
        self.busy
    }

    /// Total number of slots this slab was built with.
    pub fn total(&self) -> usize {
        self.total
    }

    /// True if no slot is allocated (`busy == 0`).
    pub fn is_empty(&self) -> bool {
        self.busy == 0
    }

    /// True if every slot is allocated (`busy == total`).
    pub fn is_full(&self) -> bool {
        self.busy == self.total
    }

    /// Pops one free slot from a small-regime slab. Caller guarantees this
    /// slab is not already fully busy.
    pub(crate) fn pop_small(&mut self) -> NonNull<u8> {
        let SlabBody::Small { free_obj } = &mut self.body else {
            panic!("pop_small called on a large-regime slab");
        };
        let obj = free_obj.expect("pop_small called on a fully busy slab");
        let next = unsafe { *(obj.as_ptr() as *const *mut u8) };
        *free_obj = NonNull::new(next);
        self.busy += 1;
        obj
    }

    /// Prepends `obj` to a small-regime slab's threaded freelist.
    pub(crate) fn push_small(&mut self, obj: NonNull<u8>) {
        let SlabBody::Small { free_obj } = &mut self.body else {
            panic!("push_small called on a large-regime slab");
        };
        unsafe {
            (obj.as_ptr() as *mut *mut u8)
                .write(free_obj.map_or(core::ptr::null_mut(), |h| h.as_ptr()));
        }
        *free_obj = Some(obj);
        self.busy -= 1;
    }

    /// Pops one bufctl from a large-regime slab's free chain.
    pub(crate) fn pop_large(&mut self) -> NonNull<Bufctl> {
        let SlabBody::Large { free_bufctl } = &mut self.body else {
            panic!("pop_large called on a small-regime slab");
        };
        let bufctl = free_bufctl.expect("pop_large called on a fully busy slab");
        *free_bufctl = unsafe { bufctl.as_ref() }.link;
        self.busy += 1;
        bufctl
    }

    /// Prepends `bufctl` to a large-regime slab's free chain.
    pub(crate) fn push_large(&mut self, mut bufctl: NonNull<Bufctl>) {
        let SlabBody::Large { free_bufctl } = &mut self.body else {
            panic!("push_large called on a small-regime slab");
        };
        unsafe {
            bufctl.as_mut().link = *free_bufctl;
        }
        *free_bufctl = Some(bufctl);
        self.busy -= 1;
    }

    /// Which representation this slab uses.
    pub fn regime(&self) -> Regime {
        match self.body {
            SlabBody::Small { .. } => Regime::Small,
            SlabBody::Large { .. } => Regime::Large,
        }
    }

    /// Locates the owning slab of a small-regime object purely by address
    /// arithmetic: round down to the page, read the footer back-pointer.
    ///
    /// # Safety
    /// `addr` must be an address previously handed out by a small-regime
    /// slab built by this module.
    pub(crate) unsafe fn locate_small(addr: NonNull<u8>) -> NonNull<Slab> {
        let page_start = arena::page_round_down(addr.as_ptr() as usize);
        let raw = unsafe { *footer_slot(page_start) };
        unsafe { NonNull::new_unchecked(raw as *mut Slab) }
    }

    /// Returns this slab's underlying arena region and frees the slab
    /// record (and, for the large regime, every bufctl). Caller must
    /// guarantee the slab is empty (`busy == 0`).
    ///
    /// # Safety
    /// `slab` must not be referenced by any list or index afterward.
    pub(crate) unsafe fn destroy(slab: NonNull<Slab>, arena: &dyn Arena) {
        let slab_ref = unsafe { slab.as_ref() };
        debug_assert_eq!(slab_ref.busy, 0, "destroying a non-empty slab");
        let mem = slab_ref.mem;
        let mem_size = slab_ref.mem_size;
        if let SlabBody::Large { free_bufctl } = &slab_ref.body {
            let mut cur = *free_bufctl;
            while let Some(bufctl) = cur {
                let next = unsafe { bufctl.as_ref() }.link;
                Self::free_bufctl(bufctl);
                cur = next;
            }
        }
        Self::free_record(slab);
        unsafe {
            arena.arena_free(mem, mem_size);
        }
    }

    fn alloc_record(slab: Slab) -> NonNull<Slab> {
        let layout = core::alloc::Layout::new::<Slab>();
        let ptr = arena::raw_alloc(layout).cast::<Slab>();
        unsafe {
            ptr.as_ptr().write(slab);
        }
        ptr
    }

    fn free_record(slab: NonNull<Slab>) {
        let layout = core::alloc::Layout::new::<Slab>();
        unsafe {
            core::ptr::drop_in_place(slab.as_ptr());
            arena::raw_dealloc(slab.cast::<u8>(), layout);
        }
    }

    fn alloc_bufctl(bufctl: Bufctl) -> NonNull<Bufctl> {
        let layout = core::alloc::Layout::new::<Bufctl>();
        let ptr = arena::raw_alloc(layout).cast::<Bufctl>();
        unsafe {
            ptr.as_ptr().write(bufctl);
        }
        ptr
    }

    fn free_bufctl(bufctl: NonNull<Bufctl>) {
        let layout = core::alloc::Layout::new::<Bufctl>();
        unsafe {
            core::ptr::drop_in_place(bufctl.as_ptr());
            arena::raw_dealloc(bufctl.cast::<u8>(), layout);
        }
    }
}

#[cfg(test)]
#[allow(clippy::undocumented_unsafe_blocks)]
mod tests {
    use super::*;
    use crate::arena::BaseArena;

    #[test]
    fn small_slab_freelist_has_expected_capacity() {
        let arena = BaseArena::new();
        let obj_size = 64;
        let slab_ptr = Slab::grow_small(&arena, obj_size, AllocFlags::WAIT).unwrap();
        let slab = unsafe { &mut *slab_ptr.as_ptr() };
        let expected = Slab::small_capacity(obj_size);
        assert_eq!(slab.total(), expected);
        let mut popped = alloc::vec::Vec::new();
        for _ in 0..expected {
            popped.push(slab.pop_small());
        }
        assert!(slab.is_full());
        for p in popped {
            slab.push_small(p);
        }
        assert!(slab.is_empty());
        unsafe { Slab::destroy(slab_ptr, &arena) };
    }

    #[test]
    fn small_slab_objects_locate_back_to_their_slab() {
        let arena = BaseArena::new();
        let obj_size = 64;
        let slab_ptr = Slab::grow_small(&arena, obj_size, AllocFlags::WAIT).unwrap();
        let obj = unsafe { (*slab_ptr.as_ptr()).pop_small() };
        let located = unsafe { Slab::locate_small(obj) };
        assert_eq!(located, slab_ptr);
        unsafe { (*slab_ptr.as_ptr()).push_small(obj) };
        unsafe { Slab::destroy(slab_ptr, &arena) };
    }

    #[test]
    fn large_slab_bufctls_chain_every_slot() {
        let arena = BaseArena::new();
        let obj_size = 2048;
        let import_amt = arena::page_round_up(NUM_BUF_PER_SLAB * obj_size);
        let slab_ptr = Slab::grow_large(&arena, obj_size, import_amt, AllocFlags::WAIT).unwrap();
        let expected = import_amt / obj_size;
        assert_eq!(unsafe { slab_ptr.as_ref() }.total(), expected);
        let mut bufctls = alloc::vec::Vec::new();
        for _ in 0..expected {
            bufctls.push(unsafe { (*slab_ptr.as_ptr()).pop_large() });
        }
        assert!(unsafe { slab_ptr.as_ref() }.is_full());
        for b in bufctls {
            unsafe { (*slab_ptr.as_ptr()).push_large(b) };
        }
        unsafe { Slab::destroy(slab_ptr, &arena) };
    }
}
