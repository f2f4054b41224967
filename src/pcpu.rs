//! Per-CPU cache: the two-magazine fast path.
//!
//! A per-CPU cache is only ever touched by code running on its own CPU with
//! interrupts disabled, so it carries no lock in the sense of mutual
//! exclusion between CPUs. [`spin::Mutex`] is used here purely as the
//! stand-in for "interrupts disabled" described in the design notes: on a
//! hosted build there are no real interrupts, so a `try_lock` that panics on
//! contention is the reentrancy guard — the same CPU must never recursively
//! enter its own per-CPU cache.

use core::ptr::NonNull;

use crate::magazine::Magazine;

/// The two magazine slots and bookkeeping for one logical CPU.
pub(crate) struct PerCpuState {
    pub(crate) loaded: NonNull<Magazine>,
    pub(crate) previous: NonNull<Magazine>,
    /// Most recent view of the depot's magazine capacity. Refreshed lazily
    /// on the free path; never consulted on the alloc path.
    pub(crate) magsize: usize,
    pub(crate) nr_allocs_ever: u64,
}

unsafe impl Send for PerCpuState {}

/// Per-CPU allocation fast path for one logical CPU.
pub struct PerCpuCache {
    state: spin::Mutex<PerCpuState>,
}

unsafe impl Sync for PerCpuCache {}

impl PerCpuCache {
    pub(crate) fn new(loaded: NonNull<Magazine>, previous: NonNull<Magazine>, magsize: usize) -> Self {
        PerCpuCache {
            state: spin::Mutex::new(PerCpuState {
                loaded,
                previous,
                magsize,
                nr_allocs_ever: 0,
            }),
        }
    }

    /// Models disabling interrupts and selecting this CPU's per-CPU cache.
    /// Panics if already held, which on this crate's single-threaded-per-CPU
    /// model can only mean a reentrant call from the same logical CPU —
    /// fatal under the real IRQ-disable discipline too.
    pub(crate) fn acquire(&self) -> spin::MutexGuard<'_, PerCpuState> {
        self.state
            .try_lock()
            .expect("per-CPU cache re-entered with interrupts already disabled")
    }

    /// Lifetime allocation count, for the `nr_allocs_ever` observability
    /// attribute.
    pub fn nr_allocs_ever(&self) -> u64 {
        self.acquire().nr_allocs_ever
    }

    /// Consumes this per-CPU cache, yielding its two magazine slots. Used
    /// by cache destruction to drain every CPU's slots into the depot.
    pub(crate) fn into_inner(self) -> PerCpuState {
        self.state.into_inner()
    }
}
