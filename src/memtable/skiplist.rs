//! Lock-free-read skiplist over arena-allocated nodes.
//!
//! The ordered index under the memtable. Supports insertion and
//! bidirectional positioned iteration; entries are never deleted or
//! updated in place, which is what makes the concurrency contract
//! simple:
//!
//! - **One writer at a time** (the write path serializes callers).
//! - **Any number of readers**, without locks. Writers publish a new
//!   node by storing its predecessor links with release ordering;
//!   readers traverse with acquire loads and therefore never observe a
//!   node whose own forward links are still uninitialized.
//!
//! Node heights follow a geometric distribution with p = 1/4, capped at
//! 12 levels, giving O(log n) expected search cost.
//!
//! Keys are arbitrary byte strings copied into the arena; the list
//! never owns heap memory of its own and drops with the arena.

use std::cmp::Ordering as CmpOrdering;
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use super::arena::Arena;

/// Maximum node height.
pub const MAX_HEIGHT: usize = 12;

/// Denominator of the height distribution: a node reaches level `h`
/// with probability `(1/BRANCHING)^h`.
const BRANCHING: u32 = 4;

/// Byte-string ordering used by the list.
pub trait KeyComparator: Send + Sync {
    /// Three-way comparison of two stored keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> CmpOrdering;
}

// ------------------------------------------------------------------------------------------------
// Node layout
// ------------------------------------------------------------------------------------------------

/// A node with a variable-height trailing array of forward links.
///
/// Only `next[0]` is declared; nodes are allocated with room for
/// `height` links and the extra slots are reached by pointer offset.
#[repr(C)]
struct Node {
    key_ptr: *const u8,
    key_len: usize,
    next: [AtomicPtr<Node>; 1],
}

impl Node {
    #[inline]
    fn key(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.key_ptr, self.key_len) }
    }

    /// Load the level-`n` successor with acquire ordering.
    #[inline]
    unsafe fn next(&self, n: usize) -> *mut Node {
        unsafe { (*self.next.as_ptr().add(n)).load(Ordering::Acquire) }
    }

    /// Publish the level-`n` successor with release ordering.
    #[inline]
    unsafe fn set_next(&self, n: usize, node: *mut Node) {
        unsafe { (*self.next.as_ptr().add(n)).store(node, Ordering::Release) }
    }

    /// Unordered link store, safe only before the node is published.
    #[inline]
    unsafe fn set_next_relaxed(&self, n: usize, node: *mut Node) {
        unsafe { (*self.next.as_ptr().add(n)).store(node, Ordering::Relaxed) }
    }

    /// Unordered link load, safe where a happens-before edge already
    /// exists (e.g. under the writer).
    #[inline]
    unsafe fn next_relaxed(&self, n: usize) -> *mut Node {
        unsafe { (*self.next.as_ptr().add(n)).load(Ordering::Relaxed) }
    }
}

// ------------------------------------------------------------------------------------------------
// Skiplist
// ------------------------------------------------------------------------------------------------

/// Ordered byte-string index with single-writer / multi-reader access.
pub struct SkipList<C: KeyComparator> {
    cmp: C,
    arena: Arc<Arena>,
    head: *mut Node,
    /// Height of the tallest node; only grows.
    max_height: AtomicUsize,
    /// Height generator state; touched only by the single writer.
    rnd: UnsafeCell<u32>,
}

unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    /// An empty list whose nodes and keys live in `arena`.
    pub fn new(cmp: C, arena: Arc<Arena>) -> SkipList<C> {
        let head = Self::new_node_in(&arena, &[], MAX_HEIGHT);
        SkipList {
            cmp,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            rnd: UnsafeCell::new(0xdeadbeef & 0x7fff_ffff),
        }
    }

    /// Insert `key`, copying it into the arena.
    ///
    /// Requires that nothing equal to `key` is already present, and
    /// that the caller is the list's single writer.
    pub fn insert(&self, key: &[u8]) {
        let mut prev: [*mut Node; MAX_HEIGHT] = [self.head; MAX_HEIGHT];
        let x = self.find_greater_or_equal(key, Some(&mut prev));
        debug_assert!(
            x.is_null() || self.cmp.compare(unsafe { (*x).key() }, key) != CmpOrdering::Equal,
            "duplicate key inserted into skiplist"
        );

        let height = self.random_height();
        if height > self.max_height() {
            // prev[] already points at head for the new levels. Racing
            // readers that observe the new height before the node is
            // linked just fall through head's null links, which is fine.
            self.max_height.store(height, Ordering::Relaxed);
        }

        let node = Self::new_node_in(&self.arena, key, height);
        for level in 0..height {
            unsafe {
                (*node).set_next_relaxed(level, (*prev[level]).next_relaxed(level));
                (*prev[level]).set_next(level, node);
            }
        }
    }

    /// Whether an entry equal to `key` is present.
    pub fn contains(&self, key: &[u8]) -> bool {
        let x = self.find_greater_or_equal(key, None);
        !x.is_null() && self.cmp.compare(unsafe { (*x).key() }, key) == CmpOrdering::Equal
    }


    #[inline]
    fn max_height(&self) -> usize {
        self.max_height.load(Ordering::Relaxed)
    }

    fn new_node_in(arena: &Arena, key: &[u8], height: usize) -> *mut Node {
        let key_ptr = if key.is_empty() {
            std::ptr::NonNull::<u8>::dangling().as_ptr() as *const u8
        } else {
            let mem = arena.allocate(key.len());
            unsafe {
                std::ptr::copy_nonoverlapping(key.as_ptr(), mem, key.len());
            }
            mem as *const u8
        };

        let size = std::mem::size_of::<Node>()
            + (height - 1) * std::mem::size_of::<AtomicPtr<Node>>();
        let node = arena.allocate_aligned(size) as *mut Node;
        unsafe {
            (*node).key_ptr = key_ptr;
            (*node).key_len = key.len();
            let links = (*node).next.as_mut_ptr();
            for level in 0..height {
                links.add(level).write(AtomicPtr::new(std::ptr::null_mut()));
            }
        }
        node
    }

    fn random_height(&self) -> usize {
        // Lehmer generator, park-miller constants.
        let rnd = unsafe { &mut *self.rnd.get() };
        let mut height = 1;
        loop {
            let product = (*rnd as u64) * 16807;
            *rnd = ((product >> 31) + (product & 0x7fff_ffff)) as u32;
            if *rnd >= 0x7fff_ffff {
                *rnd -= 0x7fff_ffff;
            }
            if height < MAX_HEIGHT && *rnd % BRANCHING == 0 {
                height += 1;
            } else {
                return height;
            }
        }
    }

    fn key_is_after_node(&self, key: &[u8], node: *mut Node) -> bool {
        !node.is_null() && self.cmp.compare(unsafe { (*node).key() }, key) == CmpOrdering::Less
    }

    /// First node whose key is `>= key`, optionally recording the
    /// predecessor at every level.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if self.key_is_after_node(key, next) {
                x = next;
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Last node whose key is `< key`, or head.
    fn find_less_than(&self, key: &[u8]) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if next.is_null()
                || self.cmp.compare(unsafe { (*next).key() }, key) != CmpOrdering::Less
            {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Last node in the list, or head when empty.
    fn find_last(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if next.is_null() {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Cursor over a [`SkipList`]; safe to use concurrently with the writer.
pub struct SkipListIter<C: KeyComparator> {
    list: Arc<SkipList<C>>,
    node: *const Node,
}

unsafe impl<C: KeyComparator> Send for SkipListIter<C> {}

impl<C: KeyComparator> SkipListIter<C> {
    /// A cursor over `list`; the shared reference keeps the list (and
    /// its arena) alive for the iterator's whole life.
    pub fn new(list: Arc<SkipList<C>>) -> SkipListIter<C> {
        SkipListIter {
            list,
            node: std::ptr::null(),
        }
    }

    /// Whether the cursor is positioned at an entry.
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Key at the current entry; the slice is backed by the arena the
    /// iterator keeps alive.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe { std::slice::from_raw_parts((*self.node).key_ptr, (*self.node).key_len) }
    }

    /// Position at the first entry `>= key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.node = self.list.find_greater_or_equal(key, None);
    }

    /// Position at the front of the list.
    pub fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    /// Position at the back of the list.
    pub fn seek_to_last(&mut self) {
        let last = self.list.find_last();
        self.node = if std::ptr::eq(last, self.list.head) {
            std::ptr::null()
        } else {
            last
        };
    }

    /// Advance one entry.
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    /// Retreat one entry.
    ///
    /// Implemented by searching from the top rather than with back
    /// links, which keeps nodes small and publication single-sided.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let before = self.list.find_less_than(unsafe { (*self.node).key() });
        self.node = if std::ptr::eq(before, self.list.head) {
            std::ptr::null()
        } else {
            before
        };
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
