//! Bump allocator backing the memtable.
//!
//! Allocations are carved from 4 KiB blocks and never freed
//! individually; the whole arena drops with its memtable. Requests
//! larger than a quarter block get a dedicated block so the residue of
//! the current block is not wasted on them.
//!
//! # Concurrency
//!
//! Allocation is **not** thread-safe: only the single writer the
//! memtable admits may allocate. Concurrent readers may call
//! [`Arena::memory_usage`] at any time; it is an atomic counter.
//! Allocated bytes are never moved or reused, so references handed out
//! stay valid for the arena's lifetime.

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a standard arena block.
const BLOCK_SIZE: usize = 4096;

/// Bump allocator of fixed-size blocks.
pub struct Arena {
    /// Allocation cursor within the current block.
    state: UnsafeCell<AllocState>,

    /// Every block ever allocated; dropped together.
    blocks: RefCell<Vec<Box<[u8]>>>,

    /// Total bytes reserved, readable concurrently.
    memory_usage: AtomicUsize,
}

struct AllocState {
    ptr: *mut u8,
    remaining: usize,
}

// Writers are serialized by the memtable; readers only touch
// `memory_usage` and previously returned stable pointers.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// An empty arena; the first allocation reserves the first block.
    pub fn new() -> Arena {
        Arena {
            state: UnsafeCell::new(AllocState {
                ptr: std::ptr::null_mut(),
                remaining: 0,
            }),
            blocks: RefCell::new(Vec::new()),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Allocate `bytes` with no alignment guarantee beyond 1.
    ///
    /// # Safety contract
    ///
    /// Must only be called by the memtable's single writer.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);
        let state = unsafe { &mut *self.state.get() };
        if bytes <= state.remaining {
            let result = state.ptr;
            state.ptr = unsafe { state.ptr.add(bytes) };
            state.remaining -= bytes;
            return result;
        }
        self.allocate_fallback(bytes)
    }

    /// Allocate `bytes` aligned to pointer size.
    pub fn allocate_aligned(&self, bytes: usize) -> *mut u8 {
        let align = std::mem::size_of::<*mut u8>();
        debug_assert!(align.is_power_of_two());

        let state = unsafe { &mut *self.state.get() };
        let current_mod = (state.ptr as usize) & (align - 1);
        let slop = if current_mod == 0 { 0 } else { align - current_mod };
        let needed = bytes + slop;

        if needed <= state.remaining {
            let result = unsafe { state.ptr.add(slop) };
            state.ptr = unsafe { state.ptr.add(needed) };
            state.remaining -= needed;
            return result;
        }
        // Fallback blocks come from Box<[u8]> and are always
        // pointer-aligned at the start.
        self.allocate_fallback(bytes)
    }

    fn allocate_fallback(&self, bytes: usize) -> *mut u8 {
        if bytes > BLOCK_SIZE / 4 {
            // Large objects get their own block so the current block's
            // residue can still serve small requests.
            return self.allocate_new_block(bytes);
        }

        let ptr = self.allocate_new_block(BLOCK_SIZE);
        let state = unsafe { &mut *self.state.get() };
        state.ptr = unsafe { ptr.add(bytes) };
        state.remaining = BLOCK_SIZE - bytes;
        ptr
    }

    fn allocate_new_block(&self, block_bytes: usize) -> *mut u8 {
        let mut block = vec![0u8; block_bytes].into_boxed_slice();
        let ptr = block.as_mut_ptr();
        self.blocks.borrow_mut().push(block);
        self.memory_usage.fetch_add(
            block_bytes + std::mem::size_of::<Box<[u8]>>(),
            Ordering::Relaxed,
        );
        ptr
    }

    /// Total bytes reserved by the arena so far.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
