//! Bufctls and the hash index that map an object address back to its
//! bufctl — the large/no-touch regime's substitute for a freelist threaded
//! through the objects themselves.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::slab::Slab;

/// Initial bucket count of a cache's hash index. Small enough that most
/// caches never grow past it.
const STATIC_NR_HASH_LISTS: usize = 8;

/// Average chain length that triggers a table growth.
const HASH_GROW_THRESHOLD: usize = 4;

/// External control record for one object slot, used whenever the
/// allocator is not allowed to write into the object's own storage.
pub struct Bufctl {
    /// Address of the object slot this bufctl controls.
    pub(crate) buf_addr: NonNull<u8>,
    /// The slab this bufctl's slot belongs to.
    pub(crate) slab: NonNull<Slab>,
    /// Link for whichever single list currently owns this bufctl: a slab's
    /// free bufctl list, or one bucket of the cache's hash index.
    pub(crate) link: Option<NonNull<Bufctl>>,
}

// SAFETY: bufctls move between a slab's freelist and the cache hash index
// only under the cache lock; no field is thread-confined on its own.
unsafe impl Send for Bufctl {}
unsafe impl Sync for Bufctl {}

impl Bufctl {
    pub(crate) fn new(buf_addr: NonNull<u8>, slab: NonNull<Slab>) -> Self {
        Bufctl {
            buf_addr,
            slab,
            link: None,
        }
    }
}

fn hash_addr(addr: NonNull<u8>) -> usize {
    // Fibonacci hashing: addresses are usually aligned, so fold out the
    // low zero bits before mixing.
    let a = addr.as_ptr() as usize;
    (a >> 4).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Closed-addressed `object address -> bufctl` hash table, one per
/// large/no-touch-regime cache.
pub struct HashIndex {
    buckets: Vec<Option<NonNull<Bufctl>>>,
    nr_items: usize,
}

unsafe impl Send for HashIndex {}
unsafe impl Sync for HashIndex {}

impl HashIndex {
    /// Creates an empty hash index with [`STATIC_NR_HASH_LISTS`] buckets.
    pub fn new() -> Self {
        HashIndex {
            buckets: vec![None; STATIC_NR_HASH_LISTS],
            nr_items: 0,
        }
    }

    /// Number of bufctls currently tracked.
    pub fn len(&self) -> usize {
        self.nr_items
    }

    /// True if no bufctl is currently tracked.
    pub fn is_empty(&self) -> bool {
        self.nr_items == 0
    }

    fn bucket_of(&self, addr: NonNull<u8>) -> usize {
        hash_addr(addr) % self.buckets.len()
    }

    /// Records that `bufctl` now controls its object address. Called on
    /// alloc, immediately after a bufctl is popped from a slab's freelist.
    pub fn insert(&mut self, bufctl: NonNull<Bufctl>) {
        let idx = self.bucket_of(unsafe { bufctl.as_ref() }.buf_addr);
        unsafe {
            (*bufctl.as_ptr()).link = self.buckets[idx];
        }
        self.buckets[idx] = Some(bufctl);
        self.nr_items += 1;
        self.maybe_grow();
    }

    /// Looks up and unlinks the bufctl for `addr`. Fatal if `addr` is not
    /// tracked: that indicates a double free or a free of a foreign
    /// address.
    pub fn remove(&mut self, addr: NonNull<u8>) -> NonNull<Bufctl> {
        let idx = self.bucket_of(addr);
        let mut prev: Option<NonNull<Bufctl>> = None;
        let mut cur = self.buckets[idx];
        while let Some(node) = cur {
            let node_ref = unsafe { node.as_ref() };
            if node_ref.buf_addr == addr {
                let next = node_ref.link;
                match prev {
                    Some(p) => unsafe { (*p.as_ptr()).link = next },
                    None => self.buckets[idx] = next,
                }
                self.nr_items -= 1;
                return node;
            }
            prev = cur;
            cur = node_ref.link;
        }
        panic!("kmem: free of untracked address {:p} (double free or foreign free)", addr.as_ptr());
    }

    /// Grows the table once the average chain length crosses
    /// [`HASH_GROW_THRESHOLD`]. Allocation failure here is non-fatal: the
    /// cache keeps running on the current, now-overloaded table.
    fn maybe_grow(&mut self) {
        if self.nr_items <= self.buckets.len() * HASH_GROW_THRESHOLD {
            return;
        }
        let new_len = self.buckets.len() * 2;
        let mut new_buckets: Vec<Option<NonNull<Bufctl>>> = Vec::new();
        if new_buckets.try_reserve_exact(new_len).is_err() {
            #[cfg(feature = "log")]
            log::warn!(
                "kmem: hash index growth allocation failed at {} items over {} buckets, continuing overloaded",
                self.nr_items,
                self.buckets.len()
            );
            return;
        }
        new_buckets.resize(new_len, None);
        let old_buckets = core::mem::replace(&mut self.buckets, new_buckets);
        for head in old_buckets {
            let mut cur = head;
            while let Some(node) = cur {
                let next = unsafe { node.as_ref() }.link;
                let idx = hash_addr(unsafe { node.as_ref() }.buf_addr) % self.buckets.len();
                unsafe {
                    (*node.as_ptr()).link = self.buckets[idx];
                }
                self.buckets[idx] = Some(node);
                cur = next;
            }
        }

        #[cfg(feature = "log")]
        log::debug!("kmem: hash index grown to {} buckets", self.buckets.len());
    }
}

impl Default for HashIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    fn fake_bufctl(addr: usize) -> NonNull<Bufctl> {
        let slab = NonNull::dangling();
        let buf_addr = NonNull::new(addr as *mut u8).unwrap();
        let boxed = Box::new(Bufctl::new(buf_addr, slab));
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }

    #[test]
    fn insert_then_remove_round_trips() {
        let mut hash = HashIndex::new();
        let bc = fake_bufctl(0x4000);
        hash.insert(bc);
        assert_eq!(hash.len(), 1);
        let found = hash.remove(NonNull::new(0x4000 as *mut u8).unwrap());
        assert_eq!(found, bc);
        assert_eq!(hash.len(), 0);
        unsafe { drop(Box::from_raw(bc.as_ptr())) };
    }

    #[test]
    fn grows_and_preserves_every_entry() {
        let mut hash = HashIndex::new();
        let mut handles = alloc::vec::Vec::new();
        for i in 0..200usize {
            let bc = fake_bufctl(0x1000 + i * 64);
            hash.insert(bc);
            handles.push(bc);
        }
        assert!(hash.buckets.len() > STATIC_NR_HASH_LISTS);
        for (i, bc) in handles.iter().enumerate() {
            let addr = NonNull::new((0x1000 + i * 64) as *mut u8).unwrap();
            let found = hash.remove(addr);
            assert_eq!(found, *bc);
        }
        assert!(hash.is_empty());
        for bc in handles {
            unsafe { drop(Box::from_raw(bc.as_ptr())) };
        }
    }

    #[test]
    #[should_panic(expected = "untracked address")]
    fn remove_of_unknown_address_is_fatal() {
        let mut hash = HashIndex::new();
        let _ = hash.remove(NonNull::new(0xdead as *mut u8).unwrap());
    }
}
