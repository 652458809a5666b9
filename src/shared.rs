//! Mutex-guarded heap handle for hosts that run threads.
//!
//! The heap core is single-owner; when the host has real threads (and no
//! interpreter-level lock serialising them), every public entry point must
//! run under one process-wide mutex. [`LockedHeap`] is that wrapper: a thin
//! forwarding layer over [`Heap`] behind a [`parking_lot::Mutex`].

use std::fmt;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::heap::{AllocFlags, Heap, HeapInfo};

#[derive(Debug)]
pub struct LockedHeap {
    inner: Mutex<Heap>,
}

// SAFETY: every access to the inner heap goes through the mutex, and the
// heap's raw pointers only ever reference its own backing region.
unsafe impl Send for LockedHeap {}
// SAFETY: see above
unsafe impl Sync for LockedHeap {}

impl LockedHeap {
    pub fn new(heap: Heap) -> Self {
        Self {
            inner: Mutex::new(heap),
        }
    }

    /// Run `f` with exclusive access to the heap. The escape hatch for
    /// anything without a forwarding method, including the
    /// start/root/end collection protocol (which must stay inside one
    /// critical section so no other thread interleaves).
    pub fn with<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn alloc(
        &self,
        n_bytes: usize,
        flags: AllocFlags,
        long_lived: bool,
    ) -> Option<NonNull<u8>> {
        self.inner.lock().alloc(n_bytes, flags, long_lived)
    }

    pub fn free(&self, ptr: *mut u8) {
        self.inner.lock().free(ptr);
    }

    pub fn realloc(&self, ptr: *mut u8, n_bytes: usize, allow_move: bool) -> Option<NonNull<u8>> {
        self.inner.lock().realloc(ptr, n_bytes, allow_move)
    }

    pub fn nbytes(&self, ptr: *const u8) -> usize {
        self.inner.lock().nbytes(ptr)
    }

    pub fn has_finaliser(&self, ptr: *const u8) -> bool {
        self.inner.lock().has_finaliser(ptr)
    }

    pub fn make_long_lived(&self, ptr: NonNull<u8>) -> NonNull<u8> {
        self.inner.lock().make_long_lived(ptr)
    }

    pub fn never_free(&self, ptr: *mut u8) -> bool {
        self.inner.lock().never_free(ptr)
    }

    pub fn collect(&self) -> usize {
        self.inner.lock().collect()
    }

    pub fn sweep_all(&self) -> usize {
        self.inner.lock().sweep_all()
    }

    pub fn info(&self) -> HeapInfo {
        self.inner.lock().info()
    }

    pub fn lock(&self) {
        self.inner.lock().lock();
    }

    pub fn unlock(&self) {
        self.inner.lock().unlock();
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().is_locked()
    }

    pub fn alloc_possible(&self) -> bool {
        self.inner.lock().alloc_possible()
    }

    pub fn dump_info(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        self.inner.lock().dump_info(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapSettings;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn threads_get_distinct_allocations() {
        let heap = Arc::new(LockedHeap::new(Heap::new(
            HeapSettings {
                heap_size: 1 << 20,
                ..HeapSettings::default()
            },
            None,
        )));

        let threads = 4usize;
        let iters = 500usize;
        let mut handles = Vec::new();
        for _ in 0..threads {
            let heap = heap.clone();
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::with_capacity(iters);
                for index in 0..iters {
                    let size = 16 + (index % 48);
                    let ptr = heap
                        .alloc(size, AllocFlags::empty(), false)
                        .expect("allocation under contention");
                    seen.push(ptr.as_ptr() as usize);
                }
                seen
            }));
        }

        let mut all = HashSet::new();
        let mut ptrs = Vec::new();
        for handle in handles {
            for addr in handle.join().expect("thread panicked") {
                assert!(all.insert(addr), "duplicate pointer across threads");
                ptrs.push(addr);
            }
        }

        for addr in ptrs {
            heap.free(addr as *mut u8);
        }
        assert_eq!(heap.info().used, 0);
    }

    #[test]
    fn collection_under_contention_respects_roots() {
        let heap = Arc::new(LockedHeap::new(Heap::new(HeapSettings::default(), None)));
        let rooted = heap.alloc(64, AllocFlags::empty(), false).expect("alloc");
        assert!(heap.never_free(rooted.as_ptr()));
        let rooted_addr = rooted.as_ptr() as usize;

        let churner = {
            let heap = heap.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    // alloc + free must be one critical section: a collection
                    // on the other thread would otherwise sweep the unrooted
                    // object first and turn the free into a double free
                    heap.with(|h| {
                        if let Some(p) = h.alloc(32, AllocFlags::empty(), false) {
                            h.free(p.as_ptr());
                        }
                    });
                }
            })
        };
        for _ in 0..20 {
            heap.collect();
        }
        churner.join().expect("churner panicked");

        assert_eq!(heap.nbytes(rooted_addr as *const u8), 64);
    }
}
