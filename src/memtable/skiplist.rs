//! Arena-backed skip list.
//!
//! Thread safety: writes require external synchronization (one writer at a
//! time); any number of readers may run concurrently with the writer. New
//! nodes are published with release stores on the tower pointers and
//! observed with acquire loads, so a reader always sees fully initialized
//! nodes. Nodes are never unlinked or freed before the list itself drops.
//!
//! The list height is read with relaxed ordering. A reader observing a
//! stale, smaller height merely starts its descent lower; a reader
//! observing a raised height before the new levels are linked finds null
//! pointers there, which sort after every key.

use std::cell::UnsafeCell;
use std::cmp::Ordering;
use std::mem::offset_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as AtomicOrder};

use super::arena::Arena;
use crate::util::random::Random;

/// Maximum tower height.
pub const MAX_HEIGHT: usize = 12;

/// A level above the first is kept with probability `1 / BRANCHING`.
const BRANCHING: u32 = 4;

/// Comparator over the raw keys stored in the list.
pub trait KeyComparator: Send + Sync {
    /// Three-way comparison.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

#[repr(C)]
struct Node {
    key_ptr: *const u8,
    key_len: usize,
    // First level of the tower. Towers taller than one level extend past
    // the end of the struct; the arena allocation covers them.
    next: [AtomicPtr<Node>; 1],
}

unsafe fn node_key<'a>(node: *mut Node) -> &'a [u8] {
    let len = (*node).key_len;
    if len == 0 {
        &[]
    } else {
        std::slice::from_raw_parts((*node).key_ptr, len)
    }
}

// Tower slots are addressed from the node base pointer so the access stays
// within the provenance of the arena allocation.
unsafe fn tower_slot<'a>(node: *mut Node, level: usize) -> &'a AtomicPtr<Node> {
    let base = (node as *mut u8).add(offset_of!(Node, next));
    &*(base as *const AtomicPtr<Node>).add(level)
}

unsafe fn next(node: *mut Node, level: usize) -> *mut Node {
    // Acquire so the returned node is observed fully initialized.
    tower_slot(node, level).load(AtomicOrder::Acquire)
}

unsafe fn set_next(node: *mut Node, level: usize, x: *mut Node) {
    // Release publishes the node initialized by the writer.
    tower_slot(node, level).store(x, AtomicOrder::Release)
}

unsafe fn no_barrier_next(node: *mut Node, level: usize) -> *mut Node {
    tower_slot(node, level).load(AtomicOrder::Relaxed)
}

unsafe fn no_barrier_set_next(node: *mut Node, level: usize, x: *mut Node) {
    tower_slot(node, level).store(x, AtomicOrder::Relaxed)
}

/// Ordered map of opaque byte keys. Insert-only; duplicates are disallowed.
pub struct SkipList<C: KeyComparator> {
    comparator: C,
    arena: Arena,
    head: *mut Node,
    /// Height of the entire list. Modified only by the writer.
    max_height: AtomicUsize,
    /// Height generator. Touched only by the (externally serialized) writer.
    rnd: UnsafeCell<Random>,
}

unsafe impl<C: KeyComparator> Send for SkipList<C> {}
unsafe impl<C: KeyComparator> Sync for SkipList<C> {}

impl<C: KeyComparator> SkipList<C> {
    /// Create an empty list that allocates from its own arena.
    pub fn new(comparator: C) -> Self {
        let arena = Arena::new();
        let head = Self::new_node_in(&arena, &[], MAX_HEIGHT);
        Self {
            comparator,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            rnd: UnsafeCell::new(Random::new(0xdeadbeef)),
        }
    }

    /// The arena backing this list's nodes and keys.
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    fn new_node_in(arena: &Arena, key: &[u8], height: usize) -> *mut Node {
        let key_ptr = if key.is_empty() {
            NonNull::<u8>::dangling().as_ptr() as *const u8
        } else {
            arena.allocate_copy(key) as *const u8
        };

        let size = offset_of!(Node, next) + height * std::mem::size_of::<AtomicPtr<Node>>();
        let node = arena.allocate_aligned(size) as *mut Node;
        unsafe {
            ptr::addr_of_mut!((*node).key_ptr).write(key_ptr);
            ptr::addr_of_mut!((*node).key_len).write(key.len());
            for level in 0..height {
                let base = (node as *mut u8).add(offset_of!(Node, next));
                (base as *mut AtomicPtr<Node>)
                    .add(level)
                    .write(AtomicPtr::new(ptr::null_mut()));
            }
        }
        node
    }

    fn max_height(&self) -> usize {
        self.max_height.load(AtomicOrder::Relaxed)
    }

    fn random_height(&self) -> usize {
        // Safety: only the externally serialized writer calls this.
        let rnd = unsafe { &mut *self.rnd.get() };
        let mut height = 1;
        while height < MAX_HEIGHT && rnd.one_in(BRANCHING) {
            height += 1;
        }
        height
    }

    /// True if `key` sorts after the key in `node`. Null is infinite.
    fn key_is_after_node(&self, key: &[u8], node: *mut Node) -> bool {
        !node.is_null() && self.comparator.compare(unsafe { node_key(node) }, key) == Ordering::Less
    }

    /// Earliest node at or after `key`, or null. When `prev` is supplied it
    /// is filled with the predecessor at every level, for use by `insert`.
    fn find_greater_or_equal(
        &self,
        key: &[u8],
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let nxt = unsafe { next(x, level) };
            if self.key_is_after_node(key, nxt) {
                // Keep searching in this level's list.
                x = nxt;
            } else {
                if let Some(prev) = prev.as_mut() {
                    prev[level] = x;
                }
                if level == 0 {
                    return nxt;
                }
                level -= 1;
            }
        }
    }

    /// Latest node strictly before `key`, or the head sentinel.
    fn find_less_than(&self, key: &[u8]) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let nxt = unsafe { next(x, level) };
            if nxt.is_null()
                || self.comparator.compare(unsafe { node_key(nxt) }, key) != Ordering::Less
            {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = nxt;
            }
        }
    }

    /// Last node in the list, or the head sentinel if empty.
    fn find_last(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let nxt = unsafe { next(x, level) };
            if nxt.is_null() {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = nxt;
            }
        }
    }

    /// Insert `key`, copying it into the arena.
    ///
    /// Requires external synchronization: exactly one thread may be inside
    /// `insert` at a time. Nothing equal to `key` may already be present.
    pub fn insert(&self, key: &[u8]) {
        let mut prev = [ptr::null_mut(); MAX_HEIGHT];
        let x = self.find_greater_or_equal(key, Some(&mut prev));

        debug_assert!(
            x.is_null() || self.comparator.compare(unsafe { node_key(x) }, key) != Ordering::Equal,
            "duplicate key inserted into skip list"
        );

        let height = self.random_height();
        if height > self.max_height() {
            for slot in prev.iter_mut().take(height).skip(self.max_height()) {
                *slot = self.head;
            }
            // Relaxed is fine: a reader that sees the new height before the
            // new links finds nulls in head's upper levels and drops down.
            self.max_height.store(height, AtomicOrder::Relaxed);
        }

        let x = Self::new_node_in(&self.arena, key, height);
        for (level, &prev_node) in prev.iter().enumerate().take(height) {
            unsafe {
                // The relaxed store into the new node is ordered by the
                // release store that publishes it from prev.
                no_barrier_set_next(x, level, no_barrier_next(prev_node, level));
                set_next(prev_node, level, x);
            }
        }
    }

    /// True if an entry equal to `key` is in the list.
    pub fn contains(&self, key: &[u8]) -> bool {
        let x = self.find_greater_or_equal(key, None);
        !x.is_null() && self.comparator.compare(unsafe { node_key(x) }, key) == Ordering::Equal
    }

    /// Iterate over the list. The iterator starts out invalid.
    pub fn iter(&self) -> SkipListIter<'_, C> {
        SkipListIter {
            list: self,
            node: ptr::null_mut(),
        }
    }
}

/// Cursor over a [`SkipList`].
pub struct SkipListIter<'a, C: KeyComparator> {
    list: &'a SkipList<C>,
    node: *mut Node,
}

impl<'a, C: KeyComparator> SkipListIter<'a, C> {
    /// True when positioned at a node.
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Key at the current position. Requires `valid()`.
    pub fn key(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        unsafe { node_key(self.node) }
    }

    /// Advance to the next node. Requires `valid()`.
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { next(self.node, 0) };
    }

    /// Retreat to the previous node. Requires `valid()`.
    ///
    /// Nodes carry no back pointers; this searches for the last node whose
    /// key is strictly less than the current key.
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        self.node = self.list.find_less_than(self.key());
        if self.node == self.list.head {
            self.node = ptr::null_mut();
        }
    }

    /// Position at the first node with key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    /// Position at the first node. Valid iff the list is non-empty.
    pub fn seek_to_first(&mut self) {
        self.node = unsafe { next(self.list.head, 0) };
    }

    /// Position at the last node. Valid iff the list is non-empty.
    pub fn seek_to_last(&mut self) {
        self.node = self.list.find_last();
        if self.node == self.list.head {
            self.node = ptr::null_mut();
        }
    }
}
