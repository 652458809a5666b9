//! Conservative, non-moving mark-and-sweep heap.
//!
//! A single contiguous region is carved into fixed-size blocks. Block state
//! lives outside the pool in a packed allocation table (two bits per block:
//! free, head, tail, marked head), with an optional one-bit-per-block
//! finaliser table next to it. Objects carry no size header; an object is a
//! head block plus the run of tail blocks behind it.
//!
//! The collector is conservative: any pointer-aligned word that lands on a
//! head block keeps that object alive. Roots come from host-registered
//! memory ranges, from explicit submissions between [`Heap::collect_start`]
//! and [`Heap::collect_end`], and from the permanent-pointer registry.
//!
//! This crate is decoupled from any specific interpreter. Consumers provide:
//! - conservative root ranges via [`Heap::add_root_range`] (or the
//!   start/root/end protocol),
//! - an optional [`FinalizerFn`] invoked for dying objects that requested it,
//! - an optional [`FatalFn`] for the unrecoverable heap-not-initialised case.

use std::fmt;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr::{self, NonNull};

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::system::Region;

// ── Public API types ──────────────────────────────────────────────────

/// Finaliser callback, invoked during sweep for each dying object whose
/// allocation requested one and whose leading type word is non-null.
///
/// The heap lock is held while the callback runs: any allocation it attempts
/// returns `None` and any free it attempts is skipped. Panics from the
/// callback are caught and discarded.
///
/// # Safety
///
/// `obj` points at the object's head block; it is valid for the object's
/// full block run and becomes dangling as soon as the callback returns.
pub type FinalizerFn = unsafe fn(obj: *mut u8);

/// Diverging hook for the one unrecoverable fault: touching a heap that was
/// never initialised or has been torn down. Hosts with a safe-mode reset
/// install it via [`HeapSettings::fatal_hook`]; the default is `panic!`.
pub type FatalFn = fn(msg: &'static str) -> !;

bitflags! {
    /// Allocation request modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Run the finaliser for this object before its blocks are reclaimed.
        const HAS_FINALISER = 1 << 0;
    }
}

// ── Heap settings ─────────────────────────────────────────────────────

/// Configuration for the block heap.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total size of the owned mapping created by [`Heap::new`], in bytes.
    /// Ignored by [`Heap::with_region`].
    pub heap_size: usize,
    /// Allocation granule. Power of two, at least two pointer words (the
    /// permanent registry stores a next-link plus pointer slots per block).
    pub bytes_per_block: usize,
    /// Reserve the finaliser table. When off, `HAS_FINALISER` is ignored.
    pub enable_finaliser: bool,
    /// Capacity of the mark stack, in block indices. Overflow is recovered
    /// by rescanning the whole table, so this only bounds memory, not
    /// correctness.
    pub mark_stack_size: usize,
    /// Zero every freed block during sweep. Slow; useful to surface stale
    /// references early.
    pub clear_on_sweep: bool,
    /// Zero whole allocations instead of only the trailing slack of the
    /// final block.
    pub conservative_clear: bool,
    /// Replacement for the default `panic!` on unrecoverable faults.
    pub fatal_hook: Option<FatalFn>,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: 1 << 20, // 1 MB
            bytes_per_block: 16,
            enable_finaliser: true,
            mark_stack_size: 64,
            clear_on_sweep: false,
            conservative_clear: false,
            fatal_hook: None,
        }
    }
}

impl HeapSettings {
    fn validate(&self) -> Result<(), &'static str> {
        if !self.bytes_per_block.is_power_of_two() {
            return Err("bytes_per_block must be a power of two");
        }
        if self.bytes_per_block < 2 * mem::size_of::<usize>() {
            return Err("bytes_per_block must hold at least two words");
        }
        if self.mark_stack_size == 0 {
            return Err("mark_stack_size must be > 0");
        }
        Ok(())
    }
}

// ── Block map constants ───────────────────────────────────────────────

/// Unallocated block.
const BLOCK_FREE: u8 = 0;
/// First block of an allocated object.
const BLOCK_HEAD: u8 = 1;
/// Continuation block of an allocated object.
const BLOCK_TAIL: u8 = 2;
/// Head block reached during the current mark phase.
const BLOCK_MARK: u8 = 3;

const BITS_PER_BYTE: usize = 8;
/// Two bits of state per block, four blocks per allocation-table byte.
const BLOCKS_PER_ATB: usize = 4;
/// One finaliser bit per block, eight blocks per finaliser-table byte.
const BLOCKS_PER_FTB: usize = 8;
/// Number of per-size first-free buckets. Sizes above the last bucket share
/// it.
const FREE_HINT_BUCKETS: usize = 8;

#[inline(always)]
fn block_shift(block: usize) -> u32 {
    (2 * (block & (BLOCKS_PER_ATB - 1))) as u32
}

// ── Heap state ────────────────────────────────────────────────────────

/// Summary of heap occupancy, as reported by [`Heap::info`].
///
/// `total`, `used` and `free` are in bytes; `max_free` and `max_block` are
/// run lengths in blocks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapInfo {
    pub total: usize,
    pub used: usize,
    pub free: usize,
    pub max_free: usize,
    pub num_1block: usize,
    pub num_2block: usize,
    pub max_block: usize,
}

/// A host memory range scanned conservatively for roots every collection.
#[derive(Debug, Clone, Copy)]
struct RootRange {
    start: NonNull<usize>,
    words: usize,
}

/// The block heap. Single-owner; wrap in [`crate::LockedHeap`] when the host
/// runs threads.
#[derive(Debug)]
pub struct Heap {
    settings: HeapSettings,
    /// Owned backing mapping, present when built via [`Heap::new`].
    region: Option<Region>,
    atb_start: *mut u8,
    atb_len: usize,
    ftb_start: *mut u8,
    ftb_len: usize,
    pool_start: *mut u8,
    pool_end: *mut u8,
    /// Per-size lower bounds (allocation-table byte indices) for where free
    /// runs may still be found. Loose bounds, not exact; reset by every sweep.
    first_free_atb: [usize; FREE_HINT_BUCKETS],
    /// Upper bound (allocation-table byte index) for where a free block may
    /// exist.
    last_free_atb: usize,
    /// Lowest address a long-lived allocation has been placed at. Divides
    /// the heap into the short-lived region below and the long-lived region
    /// at or above.
    lowest_long_lived: usize,
    /// Reentrancy guard: while > 0, allocation returns `None` and free is
    /// skipped.
    lock_depth: u32,
    auto_collect: bool,
    /// Blocks allocated since the last collection.
    alloc_amount: usize,
    /// Collect before scanning once `alloc_amount` reaches this, in blocks.
    alloc_threshold: Option<usize>,
    stack_overflow: bool,
    mark_stack: Box<[usize]>,
    /// Head of the permanent-pointer registry, or null. Registry nodes are
    /// ordinary heap blocks: slot 0 links to the next node, the remaining
    /// slots hold registered pointers.
    permanent_head: *mut u8,
    root_ranges: Vec<RootRange>,
    finalizer: Option<FinalizerFn>,
}

impl Heap {
    /// Create a heap over a fresh anonymous mapping of
    /// [`HeapSettings::heap_size`] bytes.
    ///
    /// Panics on invalid settings or if the mapping cannot be created.
    pub fn new(settings: HeapSettings, finalizer: Option<FinalizerFn>) -> Heap {
        settings.validate().expect("invalid heap settings");
        assert!(settings.heap_size > 0, "heap_size must be > 0");
        let region = Region::map(settings.heap_size).expect("map heap region");
        let start = region.start();
        let len = region.len();
        // SAFETY: the mapping is owned by the heap and outlives it
        let mut heap = unsafe { Heap::from_raw_region(settings, finalizer, start, len) };
        heap.region = Some(region);
        heap
    }

    /// Create a heap over an externally supplied region `[start, start+len)`.
    ///
    /// # Safety
    ///
    /// The region must be readable and writable for the heap's whole
    /// lifetime and not aliased by anything that assumes its contents.
    pub unsafe fn with_region(
        settings: HeapSettings,
        finalizer: Option<FinalizerFn>,
        start: NonNull<u8>,
        len: usize,
    ) -> Heap {
        settings.validate().expect("invalid heap settings");
        // SAFETY: guaranteed by the caller
        unsafe { Heap::from_raw_region(settings, finalizer, start, len) }
    }

    /// Partition `[start, start+len)` into allocation table, finaliser table
    /// and the end-aligned block pool, sized so every table slot maps to a
    /// real block.
    unsafe fn from_raw_region(
        settings: HeapSettings,
        finalizer: Option<FinalizerFn>,
        start: NonNull<u8>,
        len: usize,
    ) -> Heap {
        let bpb = settings.bytes_per_block;
        let start_addr = start.as_ptr() as usize;
        // align the region end down to a block boundary
        let end_addr = (start_addr + len) & !(bpb - 1);
        assert!(end_addr > start_addr, "heap region too small");
        let total = end_addr - start_addr;

        // Solve total = A + F + P for the table length A, where
        // F = A * blocks_per_atb / blocks_per_ftb and
        // P = A * blocks_per_atb * bytes_per_block.
        let atb_len = if settings.enable_finaliser {
            total * BITS_PER_BYTE
                / (BITS_PER_BYTE
                    + BITS_PER_BYTE * BLOCKS_PER_ATB / BLOCKS_PER_FTB
                    + BITS_PER_BYTE * BLOCKS_PER_ATB * bpb)
        } else {
            total / (1 + BLOCKS_PER_ATB * bpb)
        };
        assert!(atb_len > 0, "heap region too small");

        let ftb_len = if settings.enable_finaliser {
            (atb_len * BLOCKS_PER_ATB).div_ceil(BLOCKS_PER_FTB)
        } else {
            0
        };
        let pool_blocks = atb_len * BLOCKS_PER_ATB;

        let atb_start = start.as_ptr();
        // SAFETY: atb_len + ftb_len + pool bytes fit in the region by
        // construction of atb_len
        let ftb_start = unsafe { atb_start.add(atb_len) };
        let pool_start = (end_addr - pool_blocks * bpb) as *mut u8;
        debug_assert!(pool_start as usize >= ftb_start as usize + ftb_len);

        // SAFETY: both tables lie inside the region
        unsafe {
            ptr::write_bytes(atb_start, 0, atb_len);
            if ftb_len > 0 {
                ptr::write_bytes(ftb_start, 0, ftb_len);
            }
        }

        debug!(
            target: "gc",
            atb_len,
            ftb_len,
            pool_blocks,
            pool_bytes = pool_blocks * bpb,
            "heap initialised"
        );

        let mark_stack = vec![0usize; settings.mark_stack_size].into_boxed_slice();
        Heap {
            settings,
            region: None,
            atb_start,
            atb_len,
            ftb_start,
            ftb_len,
            pool_start,
            pool_end: end_addr as *mut u8,
            first_free_atb: [0; FREE_HINT_BUCKETS],
            last_free_atb: atb_len - 1,
            lowest_long_lived: end_addr,
            lock_depth: 0,
            auto_collect: true,
            alloc_amount: 0,
            alloc_threshold: None,
            stack_overflow: false,
            mark_stack,
            permanent_head: ptr::null_mut(),
            root_ranges: Vec::new(),
            finalizer,
        }
    }

    /// Run finalisers on every live object and invalidate the heap. Queries
    /// return 0/false afterwards; allocation trips the fatal hook.
    pub fn deinit(&mut self) {
        if self.pool_start.is_null() {
            return;
        }
        self.sweep_all();
        self.pool_start = ptr::null_mut();
        self.pool_end = ptr::null_mut();
    }

    fn fatal(&self, msg: &'static str) -> ! {
        if let Some(hook) = self.settings.fatal_hook {
            hook(msg);
        }
        panic!("{msg}");
    }

    // ── Packed table accessors ────────────────────────────────────────

    #[inline(always)]
    fn total_blocks(&self) -> usize {
        self.atb_len * BLOCKS_PER_ATB
    }

    #[inline(always)]
    fn atb_byte(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.atb_len);
        // SAFETY: index is within the table
        unsafe { self.atb_start.add(index) }
    }

    #[inline(always)]
    fn block_kind(&self, block: usize) -> u8 {
        // SAFETY: every table byte is mapped
        (unsafe { self.atb_byte(block / BLOCKS_PER_ATB).read() } >> block_shift(block)) & 0x3
    }

    #[inline(always)]
    fn any_to_free(&mut self, block: usize) {
        let byte = self.atb_byte(block / BLOCKS_PER_ATB);
        // SAFETY: the table byte is mapped
        unsafe { byte.write(byte.read() & !(BLOCK_MARK << block_shift(block))) };
    }

    #[inline(always)]
    fn free_to_head(&mut self, block: usize) {
        let byte = self.atb_byte(block / BLOCKS_PER_ATB);
        // SAFETY: the table byte is mapped
        unsafe { byte.write(byte.read() | (BLOCK_HEAD << block_shift(block))) };
    }

    #[inline(always)]
    fn free_to_tail(&mut self, block: usize) {
        let byte = self.atb_byte(block / BLOCKS_PER_ATB);
        // SAFETY: the table byte is mapped
        unsafe { byte.write(byte.read() | (BLOCK_TAIL << block_shift(block))) };
    }

    #[inline(always)]
    fn head_to_mark(&mut self, block: usize) {
        let byte = self.atb_byte(block / BLOCKS_PER_ATB);
        // SAFETY: the table byte is mapped
        unsafe { byte.write(byte.read() | (BLOCK_MARK << block_shift(block))) };
    }

    #[inline(always)]
    fn mark_to_head(&mut self, block: usize) {
        let byte = self.atb_byte(block / BLOCKS_PER_ATB);
        // SAFETY: the table byte is mapped
        unsafe { byte.write(byte.read() & !(BLOCK_TAIL << block_shift(block))) };
    }

    #[inline(always)]
    fn ftb_enabled(&self) -> bool {
        self.settings.enable_finaliser
    }

    #[inline(always)]
    fn ftb_get(&self, block: usize) -> bool {
        debug_assert!(block / BLOCKS_PER_FTB < self.ftb_len);
        // SAFETY: every finaliser-table byte is mapped
        (unsafe { self.ftb_start.add(block / BLOCKS_PER_FTB).read() }
            >> (block & (BLOCKS_PER_FTB - 1)))
            & 1
            != 0
    }

    #[inline(always)]
    fn ftb_set(&mut self, block: usize) {
        debug_assert!(block / BLOCKS_PER_FTB < self.ftb_len);
        // SAFETY: every finaliser-table byte is mapped
        unsafe {
            let byte = self.ftb_start.add(block / BLOCKS_PER_FTB);
            byte.write(byte.read() | 1u8 << (block & (BLOCKS_PER_FTB - 1)));
        }
    }

    #[inline(always)]
    fn ftb_clear(&mut self, block: usize) {
        debug_assert!(block / BLOCKS_PER_FTB < self.ftb_len);
        // SAFETY: every finaliser-table byte is mapped
        unsafe {
            let byte = self.ftb_start.add(block / BLOCKS_PER_FTB);
            byte.write(byte.read() & !(1u8 << (block & (BLOCKS_PER_FTB - 1))));
        }
    }

    /// Checked conversion from an arbitrary word to a block index: succeeds
    /// only for block-aligned addresses inside the pool. This is the whole
    /// of conservative pointer verification; callers still check the block
    /// kind.
    #[inline(always)]
    fn verify_word(&self, word: usize) -> Option<usize> {
        if word & (self.settings.bytes_per_block - 1) != 0 {
            return None;
        }
        let pool_start = self.pool_start as usize;
        if word < pool_start || word >= self.pool_end as usize {
            return None;
        }
        Some((word - pool_start) / self.settings.bytes_per_block)
    }

    #[inline(always)]
    fn block_addr(&self, block: usize) -> *mut u8 {
        debug_assert!(block < self.total_blocks());
        // SAFETY: block is within the pool
        unsafe { self.pool_start.add(block * self.settings.bytes_per_block) }
    }

    /// Length of the block chain starting at `block` (head plus tails),
    /// bounded by the end of the table.
    fn chain_blocks(&self, block: usize) -> usize {
        let total = self.total_blocks();
        let mut n = 1;
        while block + n < total && self.block_kind(block + n) == BLOCK_TAIL {
            n += 1;
        }
        n
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Whether the heap is initialised and can serve allocations.
    pub fn alloc_possible(&self) -> bool {
        !self.pool_start.is_null()
    }

    /// Byte length of the object `ptr` points at, or 0 if `ptr` is not a
    /// live head pointer.
    pub fn nbytes(&self, ptr: *const u8) -> usize {
        let Some(block) = self.verify_word(ptr as usize) else {
            return 0;
        };
        if self.block_kind(block) != BLOCK_HEAD {
            return 0;
        }
        self.chain_blocks(block) * self.settings.bytes_per_block
    }

    /// Whether the object's allocation requested a finaliser.
    pub fn has_finaliser(&self, ptr: *const u8) -> bool {
        if !self.ftb_enabled() {
            return false;
        }
        match self.verify_word(ptr as usize) {
            Some(block) => self.ftb_get(block),
            None => false,
        }
    }

    // ── Reentrancy control ────────────────────────────────────────────

    /// Pin the heap against collection and allocation. Nestable.
    pub fn lock(&mut self) {
        self.lock_depth += 1;
    }

    pub fn unlock(&mut self) {
        debug_assert!(self.lock_depth > 0, "unbalanced unlock");
        self.lock_depth -= 1;
    }

    pub fn is_locked(&self) -> bool {
        self.lock_depth != 0
    }

    // ── Collection tuning ─────────────────────────────────────────────

    /// Collect eagerly once roughly `bytes` have been allocated since the
    /// previous collection.
    pub fn set_threshold(&mut self, bytes: usize) {
        self.alloc_threshold = Some(bytes / self.settings.bytes_per_block);
    }

    pub fn clear_threshold(&mut self) {
        self.alloc_threshold = None;
    }

    /// When disabled, a failing allocation returns `None` instead of forcing
    /// a collection first.
    pub fn set_auto_collect(&mut self, enabled: bool) {
        self.auto_collect = enabled;
    }

    // ── Allocator ─────────────────────────────────────────────────────

    /// Allocate `n_bytes`, rounded up to whole blocks.
    ///
    /// Short-lived requests scan the table forward from the per-size hint;
    /// `long_lived` requests scan backward from the end so churn stays
    /// concentrated at the start of the heap. Exhaustion triggers one
    /// collection and one retry. Returns `None` for zero-size requests,
    /// while the heap is locked, or when memory is still short after the
    /// retry.
    pub fn alloc(
        &mut self,
        n_bytes: usize,
        flags: AllocFlags,
        long_lived: bool,
    ) -> Option<NonNull<u8>> {
        let bpb = self.settings.bytes_per_block;
        let n_blocks = n_bytes.div_ceil(bpb);
        if n_blocks == 0 {
            return None;
        }
        if self.pool_start.is_null() {
            self.fatal("allocation outside an initialised heap");
        }
        if self.lock_depth > 0 {
            return None;
        }
        trace!(target: "gc", n_bytes, n_blocks, long_lived, "alloc");

        let mut collected = !self.auto_collect;
        if let Some(threshold) = self.alloc_threshold {
            if !collected && self.alloc_amount >= threshold {
                self.collect();
                collected = true;
            }
        }

        let (start_block, end_block) = loop {
            match self.find_free_run(n_blocks, long_lived, collected) {
                Some(run) => break run,
                None => {
                    if collected {
                        return None;
                    }
                    debug!(target: "gc", n_bytes, "no free run, triggering collection");
                    self.collect();
                    collected = true;
                }
            }
        };

        if !long_lived {
            // Advance every bucket that could have been satisfied by the run
            // we just consumed to one past the allocation.
            if n_blocks <= FREE_HINT_BUCKETS {
                let next_free_atb = (end_block + 1) / BLOCKS_PER_ATB;
                for hint in &mut self.first_free_atb[n_blocks - 1..] {
                    *hint = next_free_atb;
                }
            }
        } else {
            self.last_free_atb = start_block.saturating_sub(1) / BLOCKS_PER_ATB;
        }

        self.free_to_head(start_block);
        for block in start_block + 1..=end_block {
            self.free_to_tail(block);
        }

        let ret = self.block_addr(start_block);
        if long_lived && (ret as usize) < self.lowest_long_lived {
            self.lowest_long_lived = ret as usize;
        }
        self.alloc_amount += n_blocks;

        // Stale words in the slack of the final block could otherwise be
        // taken for pointers and keep unrelated objects alive.
        // SAFETY: the run is inside the pool
        unsafe {
            if self.settings.conservative_clear {
                ptr::write_bytes(ret, 0, n_blocks * bpb);
            } else {
                ptr::write_bytes(ret.add(n_bytes), 0, n_blocks * bpb - n_bytes);
            }
        }

        if flags.contains(AllocFlags::HAS_FINALISER) && self.ftb_enabled() {
            // clear the type word in case the caller never initialises it
            // SAFETY: the head block holds at least one word
            unsafe { ret.cast::<usize>().write(0) };
            self.ftb_set(start_block);
        }

        trace!(target: "gc", ptr = ?ret, "alloc done");
        NonNull::new(ret)
    }

    /// Scan for `n_blocks` consecutive free blocks. With `collected` false
    /// the scan abandons (returns `None`) as soon as it would cross the
    /// long-lived boundary, so the caller collects before one region starts
    /// eating the other's free space.
    fn find_free_run(
        &self,
        n_blocks: usize,
        long_lived: bool,
        collected: bool,
    ) -> Option<(usize, usize)> {
        let bucket = n_blocks.min(FREE_HINT_BUCKETS) - 1;
        let first_free = self.first_free_atb[bucket];
        let last_free = self.last_free_atb;
        let crossover =
            (self.lowest_long_lived - self.pool_start as usize) / self.settings.bytes_per_block;
        let mut n_free = 0usize;

        if !long_lived {
            for index in first_free..=last_free {
                // SAFETY: index is within the table
                let byte = unsafe { self.atb_start.add(index).read() };
                for slot in 0..BLOCKS_PER_ATB {
                    if (byte >> (2 * slot)) & 0x3 == BLOCK_FREE {
                        n_free += 1;
                        if n_free >= n_blocks {
                            let end = index * BLOCKS_PER_ATB + slot;
                            return Some((end + 1 - n_blocks, end));
                        }
                    } else {
                        if !collected && index * BLOCKS_PER_ATB + slot >= crossover {
                            return None;
                        }
                        n_free = 0;
                    }
                }
            }
        } else {
            let mut index = last_free + 1;
            while index > first_free {
                index -= 1;
                // SAFETY: index is within the table
                let byte = unsafe { self.atb_start.add(index).read() };
                for slot in (0..BLOCKS_PER_ATB).rev() {
                    if (byte >> (2 * slot)) & 0x3 == BLOCK_FREE {
                        n_free += 1;
                        if n_free >= n_blocks {
                            let start = index * BLOCKS_PER_ATB + slot;
                            return Some((start, start + n_blocks - 1));
                        }
                    } else {
                        if !collected && index * BLOCKS_PER_ATB + slot < crossover {
                            return None;
                        }
                        n_free = 0;
                    }
                }
            }
        }
        None
    }

    // ── Free ──────────────────────────────────────────────────────────

    /// Return an object's blocks to the free state.
    ///
    /// Null, foreign and misaligned pointers are ignored. While the heap is
    /// locked the call does nothing; the object stays allocated until the
    /// next collection picks it up.
    pub fn free(&mut self, ptr: *mut u8) {
        if self.lock_depth > 0 {
            return;
        }
        if ptr.is_null() {
            return;
        }
        if self.pool_start.is_null() {
            self.fatal("free outside an initialised heap");
        }
        let Some(start_block) = self.verify_word(ptr as usize) else {
            return;
        };
        if self.block_kind(start_block) != BLOCK_HEAD {
            debug_assert!(false, "free of a non-head block");
            return;
        }
        trace!(target: "gc", ptr = ?ptr, "free");

        if self.ftb_enabled() {
            self.ftb_clear(start_block);
        }

        let n_blocks = self.chain_blocks(start_block);
        for block in start_block..start_block + n_blocks {
            self.any_to_free(block);
        }

        // Only this size's hint moves down; there is a decent chance the
        // same size gets allocated again, and narrower hints would let
        // smaller requests fragment the hole.
        let bucket = n_blocks.min(FREE_HINT_BUCKETS) - 1;
        let freed_atb = start_block / BLOCKS_PER_ATB;
        if freed_atb < self.first_free_atb[bucket] {
            self.first_free_atb[bucket] = freed_atb;
        }
        if freed_atb > self.last_free_atb {
            self.last_free_atb = freed_atb;
        }
    }

    // ── Realloc ───────────────────────────────────────────────────────

    /// Resize an allocation, in place when possible.
    ///
    /// `realloc(null, n, _)` allocates; `realloc(p, 0, _)` frees and returns
    /// `None`. Shrinking frees trailing blocks. Growing first claims free
    /// blocks directly behind the object; only when that fails and
    /// `allow_move` is set does the object move (finaliser bit preserved).
    pub fn realloc(
        &mut self,
        ptr: *mut u8,
        n_bytes: usize,
        allow_move: bool,
    ) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return self.alloc(n_bytes, AllocFlags::empty(), false);
        }
        if n_bytes == 0 {
            self.free(ptr);
            return None;
        }
        if self.lock_depth > 0 {
            return None;
        }
        let block = self.verify_word(ptr as usize)?;
        if self.block_kind(block) != BLOCK_HEAD {
            debug_assert!(false, "realloc of a non-head block");
            return None;
        }

        let bpb = self.settings.bytes_per_block;
        let new_blocks = n_bytes.div_ceil(bpb);
        let max_block = self.total_blocks();

        // Measure the existing chain, then count free blocks behind it until
        // enough for the request or something else is in the way.
        let mut n_blocks = 1usize;
        let mut n_free = 0usize;
        for probe in block + 1..max_block {
            let kind = self.block_kind(probe);
            if kind == BLOCK_TAIL {
                n_blocks += 1;
                continue;
            }
            if kind == BLOCK_FREE {
                n_free += 1;
                if n_blocks + n_free >= new_blocks {
                    break;
                }
                continue;
            }
            break;
        }

        if new_blocks == n_blocks {
            return NonNull::new(ptr);
        }

        if new_blocks < n_blocks {
            // shrink: drop the trailing tail blocks
            for tail in block + new_blocks..block + n_blocks {
                self.any_to_free(tail);
            }
            let freed_atb = (block + new_blocks) / BLOCKS_PER_ATB;
            let bucket = (n_blocks - new_blocks).min(FREE_HINT_BUCKETS) - 1;
            if freed_atb < self.first_free_atb[bucket] {
                self.first_free_atb[bucket] = freed_atb;
            }
            if freed_atb > self.last_free_atb {
                self.last_free_atb = freed_atb;
            }
            trace!(target: "gc", ptr = ?ptr, n_blocks, new_blocks, "realloc shrink");
            return NonNull::new(ptr);
        }

        if new_blocks <= n_blocks + n_free {
            // grow in place
            for tail in block + n_blocks..block + new_blocks {
                debug_assert_eq!(self.block_kind(tail), BLOCK_FREE);
                self.free_to_tail(tail);
            }
            // the claimed blocks carry stale bytes from their previous life
            // SAFETY: the grown chain is inside the pool
            unsafe {
                ptr::write_bytes(
                    ptr.add(n_blocks * bpb),
                    0,
                    (new_blocks - n_blocks) * bpb,
                );
            }
            trace!(target: "gc", ptr = ?ptr, n_blocks, new_blocks, "realloc grow in place");
            return NonNull::new(ptr);
        }

        if !allow_move {
            return None;
        }

        let flags = if self.ftb_enabled() && self.ftb_get(block) {
            AllocFlags::HAS_FINALISER
        } else {
            AllocFlags::empty()
        };
        let fresh = self.alloc(n_bytes, flags, false)?;
        trace!(target: "gc", from = ?ptr, to = ?fresh.as_ptr(), "realloc move");
        // SAFETY: distinct live allocations; the old chain is n_blocks long
        unsafe {
            ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), n_blocks * bpb);
        }
        self.free(ptr);
        Some(fresh)
    }

    // ── Long-lived migration ──────────────────────────────────────────

    /// Move an object into the long-lived region when that helps.
    ///
    /// Returns the pointer unchanged when the object already lives there,
    /// is invalid, or no better placement exists. Otherwise the object is
    /// copied and the new pointer returned; the old copy is left for the
    /// collector, so callers must guarantee no other live references exist.
    pub fn make_long_lived(&mut self, ptr: NonNull<u8>) -> NonNull<u8> {
        if ptr.as_ptr() as usize >= self.lowest_long_lived {
            return ptr;
        }
        let n_bytes = self.nbytes(ptr.as_ptr());
        if n_bytes == 0 {
            return ptr;
        }
        let flags = if self.has_finaliser(ptr.as_ptr()) {
            AllocFlags::HAS_FINALISER
        } else {
            AllocFlags::empty()
        };
        let Some(fresh) = self.alloc(n_bytes, flags, true) else {
            return ptr;
        };
        if fresh.as_ptr() < ptr.as_ptr() {
            // no closer to the long-lived end than the original
            self.free(fresh.as_ptr());
            return ptr;
        }
        // SAFETY: distinct live allocations of at least n_bytes
        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), n_bytes);
        }
        fresh
    }

    // ── Permanent-pointer registry ────────────────────────────────────

    /// Keep `ptr` unconditionally live across collections.
    ///
    /// The registry is a linked list of heap blocks rooted at a dedicated
    /// slot that is marked every collection; slot 0 of each node links to
    /// the next node, the remaining slots hold registered pointers. Returns
    /// `false` when `ptr` is not a live heap pointer or a fresh node cannot
    /// be allocated.
    pub fn never_free(&mut self, ptr: *mut u8) -> bool {
        if self.nbytes(ptr) == 0 {
            return false;
        }
        let slots = self.settings.bytes_per_block / mem::size_of::<*mut u8>();

        let mut node = self.permanent_head.cast::<*mut u8>();
        let mut tail: *mut *mut u8 = ptr::null_mut();
        while !node.is_null() {
            for slot in 1..slots {
                // SAFETY: registry nodes are whole live blocks
                unsafe {
                    if (*node.add(slot)).is_null() {
                        node.add(slot).write(ptr);
                        return true;
                    }
                }
            }
            tail = node;
            // SAFETY: slot 0 is the next-node link
            node = unsafe { *node }.cast::<*mut u8>();
        }

        // every node is full (or there is none yet): append a fresh one
        let Some(fresh) =
            self.alloc(self.settings.bytes_per_block, AllocFlags::empty(), true)
        else {
            return false;
        };
        let fresh = fresh.as_ptr().cast::<*mut u8>();
        // SAFETY: freshly allocated block-sized node
        unsafe {
            ptr::write_bytes(fresh.cast::<u8>(), 0, self.settings.bytes_per_block);
            fresh.add(1).write(ptr);
        }
        if self.permanent_head.is_null() {
            self.permanent_head = fresh.cast::<u8>();
        } else {
            // SAFETY: tail is the last registry node walked above
            unsafe { tail.write(fresh.cast::<u8>()) };
        }
        true
    }

    // ── Root registration ─────────────────────────────────────────────

    /// Register a memory range scanned conservatively for roots at every
    /// collection start: typically the interpreter's global state and an
    /// optional interpreter-managed stack.
    ///
    /// # Safety
    ///
    /// `start..start+words` must stay readable for the heap's lifetime.
    pub unsafe fn add_root_range(&mut self, start: NonNull<usize>, words: usize) {
        self.root_ranges.push(RootRange { start, words });
    }

    // ── Mark engine ───────────────────────────────────────────────────

    /// Treat a word as a potential pointer: if it lands on an unmarked head
    /// block, mark that object and everything reachable from it.
    fn mark_word(&mut self, word: usize) {
        let Some(block) = self.verify_word(word) else {
            return;
        };
        if self.block_kind(block) == BLOCK_HEAD {
            trace!(target: "gc", block, "mark root");
            self.head_to_mark(block);
            self.mark_subtree(block);
        }
    }

    /// Depth-first walk from a freshly marked block. Children are marked
    /// and pushed; when the stack is full the push is dropped and the
    /// sticky overflow flag set, to be repaired by a full-table rescan.
    fn mark_subtree(&mut self, mut block: usize) {
        let bpb = self.settings.bytes_per_block;
        let words_per_block = bpb / mem::size_of::<usize>();
        let mut sp = 0usize;
        loop {
            let n_blocks = self.chain_blocks(block);

            // scan the object's memory as an array of potential pointers
            let base = self.block_addr(block).cast::<usize>();
            for offset in 0..n_blocks * words_per_block {
                // SAFETY: the chain is inside the pool and word-aligned
                let word = unsafe { base.add(offset).read() };
                let Some(child) = self.verify_word(word) else {
                    continue;
                };
                if self.block_kind(child) == BLOCK_HEAD {
                    self.head_to_mark(child);
                    if sp < self.mark_stack.len() {
                        self.mark_stack[sp] = child;
                        sp += 1;
                    } else {
                        self.stack_overflow = true;
                    }
                }
            }

            if sp == 0 {
                break;
            }
            sp -= 1;
            block = self.mark_stack[sp];
        }
    }

    /// While the sticky overflow flag is set: clear it and re-walk the
    /// subtree of every marked block. Terminates because each pass either
    /// marks new blocks or leaves the flag clear.
    fn run_overflow_recovery(&mut self) {
        while self.stack_overflow {
            debug!(target: "gc", "mark stack overflowed, rescanning");
            self.stack_overflow = false;
            for block in 0..self.total_blocks() {
                if self.block_kind(block) == BLOCK_MARK {
                    self.mark_subtree(block);
                }
            }
        }
    }

    // ── Sweep engine ──────────────────────────────────────────────────

    /// Free every unmarked head and its tails, firing finalisers; demote
    /// surviving marks back to heads. Returns the number of freed heads.
    fn sweep(&mut self) -> usize {
        let bpb = self.settings.bytes_per_block;
        let mut freed = 0usize;
        let mut free_tail = false;
        let mut any_live = false;
        for block in 0..self.total_blocks() {
            match self.block_kind(block) {
                BLOCK_HEAD => {
                    if self.ftb_enabled() && self.ftb_get(block) {
                        let obj = self.block_addr(block);
                        // a null type word means the object was never
                        // initialised; nothing to finalise
                        // SAFETY: the head block holds at least one word
                        let type_word = unsafe { obj.cast::<usize>().read() };
                        if type_word != 0 {
                            if let Some(finalize) = self.finalizer {
                                // the lock is held here, so the callback
                                // cannot mutate the heap; panics are contained
                                let _ = catch_unwind(AssertUnwindSafe(|| {
                                    // SAFETY: obj is live until this sweep step
                                    unsafe { finalize(obj) }
                                }));
                            }
                        }
                        self.ftb_clear(block);
                    }
                    free_tail = true;
                    self.any_to_free(block);
                    if self.settings.clear_on_sweep {
                        // SAFETY: block is inside the pool
                        unsafe { ptr::write_bytes(self.block_addr(block), 0, bpb) };
                    }
                    freed += 1;
                    trace!(target: "gc", block, "sweep");
                }
                BLOCK_TAIL => {
                    if free_tail {
                        self.any_to_free(block);
                        if self.settings.clear_on_sweep {
                            // SAFETY: block is inside the pool
                            unsafe { ptr::write_bytes(self.block_addr(block), 0, bpb) };
                        }
                    }
                }
                BLOCK_MARK => {
                    self.mark_to_head(block);
                    free_tail = false;
                    any_live = true;
                }
                _ => {}
            }
        }
        if !any_live {
            // empty heap: the long-lived boundary returns to the end and
            // re-lowers as long-lived objects are allocated again
            self.lowest_long_lived = self.pool_end as usize;
        }
        freed
    }

    // ── Collection driver ─────────────────────────────────────────────

    /// Begin a collection: take the heap lock and mark everything reachable
    /// from the registered root ranges and the permanent registry. The host
    /// may submit further roots via [`Heap::collect_root`] /
    /// [`Heap::collect_ptr`] before calling [`Heap::collect_end`].
    pub fn collect_start(&mut self) {
        self.lock_depth += 1;
        self.stack_overflow = false;
        self.alloc_amount = 0;
        debug!(target: "gc", "collection start");

        let ranges = self.root_ranges.clone();
        for range in ranges {
            // SAFETY: readability promised by add_root_range's caller
            unsafe { self.collect_root_range(range.start.as_ptr(), range.words) };
        }
        self.mark_word(self.permanent_head as usize);
    }

    /// Submit one potential root pointer.
    pub fn collect_ptr(&mut self, ptr: *const u8) {
        self.mark_word(ptr as usize);
    }

    /// Submit a batch of potential root pointers.
    pub fn collect_root(&mut self, ptrs: &[*const u8]) {
        for &ptr in ptrs {
            self.mark_word(ptr as usize);
        }
    }

    /// Conservatively scan `words` words starting at `start` for roots.
    ///
    /// # Safety
    ///
    /// The range must be readable.
    pub unsafe fn collect_root_range(&mut self, start: *const usize, words: usize) {
        for offset in 0..words {
            // SAFETY: readability promised by the caller
            let word = unsafe { start.add(offset).read() };
            self.mark_word(word);
        }
    }

    /// Finish a collection: recover from mark-stack overflow, sweep, reset
    /// the allocator hints and release the heap lock. Returns the number of
    /// objects freed.
    pub fn collect_end(&mut self) -> usize {
        self.run_overflow_recovery();
        let freed = self.sweep();
        self.first_free_atb = [0; FREE_HINT_BUCKETS];
        self.last_free_atb = self.atb_len - 1;
        debug_assert!(self.lock_depth > 0);
        self.lock_depth -= 1;
        debug!(target: "gc", freed, "collection end");
        freed
    }

    /// Run a full collection against the registered roots. Returns the
    /// number of objects freed.
    pub fn collect(&mut self) -> usize {
        self.collect_start();
        self.collect_end()
    }

    /// Sweep every object without marking anything, firing all pending
    /// finalisers. For teardown; the permanent registry is cleared, since
    /// its nodes die with everything else.
    pub fn sweep_all(&mut self) -> usize {
        self.lock_depth += 1;
        self.stack_overflow = false;
        self.permanent_head = ptr::null_mut();
        self.collect_end()
    }

    // ── Diagnostics ───────────────────────────────────────────────────

    /// Walk the allocation table and summarise occupancy.
    pub fn info(&self) -> HeapInfo {
        let mut info = HeapInfo {
            total: self.pool_end as usize - self.pool_start as usize,
            ..HeapInfo::default()
        };
        let total_blocks = self.total_blocks();
        let mut len = 0usize;
        let mut len_free = 0usize;
        let mut block = 0usize;
        let mut finish = total_blocks == 0;
        while !finish {
            let mut kind = self.block_kind(block);
            match kind {
                BLOCK_FREE => {
                    info.free += 1;
                    len_free += 1;
                    len = 0;
                }
                BLOCK_HEAD => {
                    info.used += 1;
                    len = 1;
                }
                BLOCK_TAIL => {
                    info.used += 1;
                    len += 1;
                }
                _ => {}
            }

            block += 1;
            finish = block == total_blocks;
            if !finish {
                kind = self.block_kind(block);
            }

            // close out object and free runs at their boundaries
            if finish || kind == BLOCK_FREE || kind == BLOCK_HEAD {
                if len == 1 {
                    info.num_1block += 1;
                } else if len == 2 {
                    info.num_2block += 1;
                }
                if len > info.max_block {
                    info.max_block = len;
                }
                if finish || kind == BLOCK_HEAD {
                    if len_free > info.max_free {
                        info.max_free = len_free;
                    }
                    len_free = 0;
                }
            }
        }
        info.used *= self.settings.bytes_per_block;
        info.free *= self.settings.bytes_per_block;
        info
    }

    /// Write a one-line-per-64-blocks map of the allocation table
    /// (`.` free, `h` head, `=` tail, `m` marked head).
    pub fn dump_alloc_table(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        const BLOCKS_PER_LINE: usize = 64;
        let total = self.total_blocks();
        writeln!(out, "heap layout; pool from {:p}:", self.pool_start)?;
        let mut block = 0usize;
        while block < total {
            // abbreviate long stretches of fully free lines
            let mut probe = block;
            while probe < total && self.block_kind(probe) == BLOCK_FREE {
                probe += 1;
            }
            if probe - block >= 2 * BLOCKS_PER_LINE {
                writeln!(
                    out,
                    "       ({} lines all free)",
                    (probe - block) / BLOCKS_PER_LINE
                )?;
                block = probe & !(BLOCKS_PER_LINE - 1);
                continue;
            }

            write!(
                out,
                "{:05x}: ",
                (block * self.settings.bytes_per_block) & 0xfffff
            )?;
            let line_end = (block + BLOCKS_PER_LINE).min(total);
            while block < line_end {
                let c = match self.block_kind(block) {
                    BLOCK_FREE => '.',
                    BLOCK_HEAD => 'h',
                    BLOCK_TAIL => '=',
                    _ => 'm',
                };
                out.write_char(c)?;
                block += 1;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Write the [`Heap::info`] summary in a compact, human-readable form.
    pub fn dump_info(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let info = self.info();
        writeln!(
            out,
            "heap: total: {}, used: {}, free: {}",
            info.total, info.used, info.free
        )?;
        writeln!(
            out,
            " 1-blocks: {}, 2-blocks: {}, max blk sz: {}, max free sz: {}",
            info.num_1block, info.num_2block, info.max_block, info.max_free
        )
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // fire remaining finalisers before the region goes away
        if !self.pool_start.is_null() {
            self.sweep_all();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
