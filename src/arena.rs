//! The arena supplier contract.
//!
//! The page-granularity arena this allocator imports from is a named
//! collaborator, not part of this crate: production builds plug in a real
//! vmem-style arena. [`BaseArena`] is the minimal, always-available
//! implementation this crate bootstraps itself against and that its test
//! suite exercises; it wraps the process's global allocator the same way a
//! `base_arena` wraps the bootstrap page allocator in a real kernel.

extern crate alloc;

use alloc::alloc::{alloc, alloc_zeroed, dealloc, handle_alloc_error};
use core::alloc::Layout;
use core::ptr::NonNull;

use crate::flags::AllocFlags;

/// Page size assumed by the small/pro-touch slab layout. The source arena
/// for pro-touch caches must hand back memory aligned to this boundary.
pub const PAGE_SIZE: usize = 4096;

/// Rounds `addr` down to the start of its containing page.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `size` up to a whole number of pages.
#[inline]
pub const fn page_round_up(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Rounds `size` up to the next power of two.
#[inline]
pub const fn round_up_pow2(size: usize) -> usize {
    if size <= 1 {
        return 1;
    }
    1usize << (usize::BITS - (size - 1).leading_zeros())
}

/// Rounds `size` up to a multiple of `align`. `align` need not be a power of
/// two here; the page and pointer-width roundings above cover those cases.
#[inline]
pub const fn round_up(size: usize, align: usize) -> usize {
    size.div_ceil(align) * align
}

/// Page-granularity address-space supplier.
///
/// Implementations must be safe to call from interrupt context when
/// `flags` requests [`AllocFlags::ATOMIC`] — no blocking, no recursive
/// allocation from this same cache hierarchy.
pub trait Arena: Send + Sync {
    /// Imports `size` bytes from the arena. Returns `None` if the request
    /// cannot be satisfied without blocking (when `flags` is atomic) or at
    /// all.
    fn arena_alloc(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>>;

    /// Returns a previously imported region of `size` bytes to the arena.
    ///
    /// # Safety
    /// `addr` must have been returned by a prior `arena_alloc(size, _)` on
    /// the same arena and not already freed.
    unsafe fn arena_free(&self, addr: NonNull<u8>, size: usize);

    /// Hint used to size qcache imports: caches created with
    /// [`crate::flags::CacheFlags::QCACHE`] import `3 * qcache_max` bytes
    /// per slab, rounded up to a power of two.
    fn qcache_max(&self) -> usize {
        PAGE_SIZE
    }
}

/// The arena every bootstrap cache imports from: a thin, page-aligned
/// wrapper over the process's global allocator.
///
/// Kept deliberately dependency-free of the rest of this crate so the four
/// bootstrap caches (`kmem_magazine`, `kmem_cache`, `kmem_slab`,
/// `kmem_bufctl`) never need anything beyond it, matching the no-cycle
/// requirement described in the bootstrap design.
#[derive(Debug, Default)]
pub struct BaseArena;

impl BaseArena {
    /// Creates a new base arena handle. Stateless: every instance wraps the
    /// same global allocator.
    pub const fn new() -> Self {
        BaseArena
    }

    fn layout_for(size: usize) -> Layout {
        // Page-aligned so pro-touch small-regime slabs can locate their
        // footer by rounding an object address down to a page boundary.
        Layout::from_size_align(page_round_up(size.max(1)), PAGE_SIZE)
            .expect("arena size/align overflowed isize::MAX")
    }
}

impl Arena for BaseArena {
    fn arena_alloc(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        let layout = Self::layout_for(size);
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            if flags.contains(AllocFlags::ATOMIC) || flags.contains(AllocFlags::ERROR) {
                return None;
            }
            handle_alloc_error(layout);
        }
        NonNull::new(ptr)
    }

    unsafe fn arena_free(&self, addr: NonNull<u8>, size: usize) {
        let layout = Self::layout_for(size);
        unsafe { dealloc(addr.as_ptr(), layout) };
    }
}

/// Raw, non-page-aligned allocation helper used for the metadata structures
/// (`Cache`, `Slab`, `Bufctl`, hash tables) that ride on top of the global
/// allocator directly rather than through a cache's own arena. This mirrors
/// how a real kernel's slab metadata ultimately rests on `base_alloc`.
pub(crate) fn raw_alloc(layout: Layout) -> NonNull<u8> {
    let ptr = unsafe { alloc(layout) };
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    unsafe { NonNull::new_unchecked(ptr) }
}

/// # Safety
/// `ptr`/`layout` must match a prior [`raw_alloc`] call.
pub(crate) unsafe fn raw_dealloc(ptr: NonNull<u8>, layout: Layout) {
    unsafe { dealloc(ptr.as_ptr(), layout) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_round_up(0x1234), 0x2000);
        assert_eq!(page_round_up(PAGE_SIZE), PAGE_SIZE);
    }

    #[test]
    fn pow2_rounding() {
        assert_eq!(round_up_pow2(1), 1);
        assert_eq!(round_up_pow2(5), 8);
        assert_eq!(round_up_pow2(64), 64);
        assert_eq!(round_up_pow2(65), 128);
    }

    #[test]
    fn base_arena_round_trips() {
        let arena = BaseArena::new();
        let addr = arena.arena_alloc(256, AllocFlags::WAIT).unwrap();
        unsafe { arena.arena_free(addr, 256) };
    }

    #[test]
    fn base_arena_pages_are_page_aligned() {
        let arena = BaseArena::new();
        let addr = arena.arena_alloc(8, AllocFlags::WAIT).unwrap();
        assert_eq!(addr.as_ptr() as usize % PAGE_SIZE, 0);
        unsafe { arena.arena_free(addr, 8) };
    }
}
