//! The depot: a cache's global pool of magazines, plus the
//! contention-driven policy that grows magazine capacity over time.

extern crate alloc;

use alloc::boxed::Box;
use core::ptr::NonNull;

use crate::magazine::{Magazine, MAG_CAPACITY, MAG_MIN_SZ};
use crate::time::Clock;

/// How long a burst of contended depot acquisitions is allowed to persist
/// before the window resets, in nanoseconds. Matches the source design's
/// `resize_timeout_ns`.
const RESIZE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Number of contended acquisitions inside one window that triggers a
/// magazine capacity bump. Matches the source design's `resize_threshold`.
const RESIZE_THRESHOLD: u32 = 1;

fn push(head: &mut Option<NonNull<Magazine>>, mut mag: NonNull<Magazine>) {
    unsafe {
        mag.as_mut().link = *head;
    }
    *head = Some(mag);
}

fn pop(head: &mut Option<NonNull<Magazine>>) -> Option<NonNull<Magazine>> {
    let mag = (*head)?;
    *head = unsafe { mag.as_ref() }.link;
    Some(mag)
}

struct DepotInner {
    not_empty: Option<NonNull<Magazine>>,
    not_empty_len: usize,
    empty: Option<NonNull<Magazine>>,
    empty_len: usize,
    magsize: usize,
    busy_count: u32,
    busy_start: u64,
}

/// Per-cache global pool of magazines, partitioned into *not-empty* and
/// *empty* lists.
pub struct Depot {
    inner: spin::Mutex<DepotInner>,
    clock: Box<dyn Clock>,
}

unsafe impl Send for Depot {}
unsafe impl Sync for Depot {}

impl Depot {
    /// Creates an empty depot, starting at [`MAG_MIN_SZ`] capacity, timing
    /// contention against `clock`.
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Depot {
            inner: spin::Mutex::new(DepotInner {
                not_empty: None,
                not_empty_len: 0,
                empty: None,
                empty_len: 0,
                magsize: MAG_MIN_SZ,
                busy_count: 0,
                busy_start: 0,
            }),
            clock,
        }
    }

    fn with_lock<R>(&self, f: impl FnOnce(&mut DepotInner) -> R) -> R {
        let (contended, mut guard) = match self.inner.try_lock() {
            Some(g) => (false, g),
            None => (true, self.inner.lock()),
        };
        Self::note_contention(&mut guard, contended, self.clock.now_ns());
        f(&mut guard)
    }

    fn note_contention(inner: &mut DepotInner, contended: bool, now_ns: u64) {
        if !contended || inner.not_empty_len == 0 {
            return;
        }
        if now_ns > inner.busy_start + RESIZE_TIMEOUT_NS {
            inner.busy_start = now_ns;
            inner.busy_count = 0;
        }
        inner.busy_count += 1;
        if inner.busy_count > RESIZE_THRESHOLD {
            inner.magsize = (inner.magsize + 1).min(MAG_CAPACITY);
            inner.busy_count = 0;
            inner.busy_start = now_ns;

            #[cfg(feature = "log")]
            log::debug!("kmem: depot resized magazine capacity to {}", inner.magsize);
        }
    }

    /// Current magazine capacity. Per-CPU caches copy this lazily, on their
    /// next free-path depot visit.
    pub fn magsize(&self) -> usize {
        self.with_lock(|inner| inner.magsize)
    }

    /// Detaches a magazine from the not-empty list, if one exists.
    pub fn take_full(&self) -> Option<NonNull<Magazine>> {
        self.with_lock(|inner| {
            let mag = pop(&mut inner.not_empty);
            if mag.is_some() {
                inner.not_empty_len -= 1;
            }
            mag
        })
    }

    /// Detaches a magazine from the empty list, if one exists.
    pub fn take_empty(&self) -> Option<NonNull<Magazine>> {
        self.with_lock(|inner| {
            let mag = pop(&mut inner.empty);
            if mag.is_some() {
                inner.empty_len -= 1;
            }
            mag
        })
    }

    /// Returns `mag` to whichever list matches its current emptiness.
    pub fn put(&self, mag: NonNull<Magazine>) {
        self.with_lock(|inner| {
            if unsafe { mag.as_ref() }.is_empty() {
                push(&mut inner.empty, mag);
                inner.empty_len += 1;
            } else {
                push(&mut inner.not_empty, mag);
                inner.not_empty_len += 1;
            }
        });
    }

    /// Number of magazines currently on the not-empty list.
    pub fn not_empty_len(&self) -> usize {
        self.with_lock(|inner| inner.not_empty_len)
    }

    /// Number of magazines currently on the empty list.
    pub fn empty_len(&self) -> usize {
        self.with_lock(|inner| inner.empty_len)
    }

    /// Drains and returns every magazine on both lists, for cache
    /// destruction. After this call the depot holds no magazines.
    pub(crate) fn drain_all(&self) -> alloc::vec::Vec<NonNull<Magazine>> {
        self.with_lock(|inner| {
            let mut out = alloc::vec::Vec::new();
            while let Some(m) = pop(&mut inner.not_empty) {
                out.push(m);
            }
            while let Some(m) = pop(&mut inner.empty) {
                out.push(m);
            }
            inner.not_empty_len = 0;
            inner.empty_len = 0;
            out
        })
    }
}
