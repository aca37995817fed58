//! Memory arena for memtable allocation.
//!
//! Serves allocations from 4 KiB blocks with a bump pointer. Nothing is
//! freed individually; every block is released when the arena is dropped,
//! which is when the owning memtable goes away.
//!
//! The arena is written by at most one thread at a time (the single writer
//! that owns memtable inserts). Concurrent readers never allocate; they only
//! dereference previously returned pointers, which stay valid and immutable
//! for the life of the arena. `memory_usage` may be read from any thread.

use std::alloc::{alloc, dealloc, Layout};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Size of a standard arena block.
const BLOCK_SIZE: usize = 4096;

/// Allocations above this get their own exact-sized block, leaving the
/// current bump block for small requests.
const LARGE_ALLOCATION: usize = BLOCK_SIZE / 4;

/// Bump allocator over 4 KiB blocks.
pub struct Arena {
    /// Bump pointer into the current block.
    alloc_ptr: UnsafeCell<*mut u8>,
    /// Bytes remaining in the current block.
    alloc_bytes_remaining: UnsafeCell<usize>,
    /// Every block ever allocated, with its layout for deallocation.
    blocks: UnsafeCell<Vec<(NonNull<u8>, Layout)>>,
    /// Approximate total bytes owned, including bookkeeping.
    memory_usage: AtomicUsize,
}

// One external writer at a time; readers never touch the mutable state.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            alloc_ptr: UnsafeCell::new(std::ptr::null_mut()),
            alloc_bytes_remaining: UnsafeCell::new(0),
            blocks: UnsafeCell::new(Vec::new()),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Allocate `bytes` of uninitialized memory.
    ///
    /// The returned pointer stays valid until the arena is dropped.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);

        unsafe {
            let remaining = *self.alloc_bytes_remaining.get();
            if bytes <= remaining {
                let result = *self.alloc_ptr.get();
                *self.alloc_ptr.get() = result.add(bytes);
                *self.alloc_bytes_remaining.get() = remaining - bytes;
                return result;
            }
        }

        self.allocate_fallback(bytes)
    }

    /// Allocate with the platform alignment for atomics and pointers
    /// (`max(8, pointer width)`).
    pub fn allocate_aligned(&self, bytes: usize) -> *mut u8 {
        let align = std::cmp::max(8, std::mem::size_of::<*mut u8>());
        debug_assert!(align.is_power_of_two());

        unsafe {
            let current = *self.alloc_ptr.get() as usize;
            let slop = (align - current % align) % align;
            let needed = bytes + slop;

            let remaining = *self.alloc_bytes_remaining.get();
            if needed <= remaining {
                let result = (*self.alloc_ptr.get()).add(slop);
                *self.alloc_ptr.get() = result.add(bytes);
                *self.alloc_bytes_remaining.get() = remaining - needed;
                debug_assert_eq!(result as usize % align, 0);
                return result;
            }
        }

        // Fallback blocks come from the global allocator at 8-byte
        // alignment, which satisfies the requirement directly.
        self.allocate_fallback(bytes)
    }

    /// Allocate and copy `data`, returning a pointer to the copy.
    pub fn allocate_copy(&self, data: &[u8]) -> *mut u8 {
        let ptr = self.allocate(data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        ptr
    }

    fn allocate_fallback(&self, bytes: usize) -> *mut u8 {
        if bytes > LARGE_ALLOCATION {
            // Give the request its own block so the bump pointer keeps
            // serving small allocations from the current block.
            return self.allocate_new_block(bytes);
        }

        let new_block = self.allocate_new_block(BLOCK_SIZE);
        unsafe {
            *self.alloc_ptr.get() = new_block.add(bytes);
            *self.alloc_bytes_remaining.get() = BLOCK_SIZE - bytes;
        }
        new_block
    }

    fn allocate_new_block(&self, block_bytes: usize) -> *mut u8 {
        let layout = Layout::from_size_align(block_bytes, 8).expect("arena block layout");

        let ptr = unsafe { alloc(layout) };
        let Some(non_null) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };

        unsafe {
            (*self.blocks.get()).push((non_null, layout));
        }
        self.memory_usage.fetch_add(
            block_bytes + std::mem::size_of::<*mut u8>(),
            Ordering::Relaxed,
        );
        ptr
    }

    /// Approximate total memory owned by the arena. Advisory only.
    pub fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let blocks = unsafe { &mut *self.blocks.get() };
        for (ptr, layout) in blocks.drain(..) {
            unsafe {
                dealloc(ptr.as_ptr(), layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::random::Random;

    #[test]
    fn test_empty() {
        let arena = Arena::new();
        assert_eq!(arena.memory_usage(), 0);
    }

    #[test]
    fn test_small_allocations_share_blocks() {
        let arena = Arena::new();

        let a = arena.allocate(16);
        let b = arena.allocate(16);
        assert!(!a.is_null());
        assert_eq!(unsafe { a.add(16) }, b);

        // One 4 KiB block covers both.
        assert_eq!(
            arena.memory_usage(),
            BLOCK_SIZE + std::mem::size_of::<*mut u8>()
        );
    }

    #[test]
    fn test_large_allocation_gets_own_block() {
        let arena = Arena::new();
        arena.allocate(16);
        let usage_before = arena.memory_usage();

        arena.allocate(2000);
        assert_eq!(
            arena.memory_usage(),
            usage_before + 2000 + std::mem::size_of::<*mut u8>()
        );

        // The bump block is undisturbed: the next small allocation is
        // adjacent to the first.
        let c = arena.allocate(16);
        assert_eq!(arena.memory_usage() - usage_before, 2000 + std::mem::size_of::<*mut u8>());
        assert!(!c.is_null());
    }

    #[test]
    fn test_aligned_allocations() {
        let arena = Arena::new();
        arena.allocate(1); // knock the bump pointer off alignment

        for _ in 0..100 {
            let ptr = arena.allocate_aligned(24);
            assert_eq!(ptr as usize % 8, 0);
        }
    }

    #[test]
    fn test_writes_land_in_distinct_memory() {
        let arena = Arena::new();
        let mut rnd = Random::new(301);
        let mut allocated: Vec<(*mut u8, usize)> = Vec::new();

        for i in 0..2000 {
            let size = match rnd.one_in(10) {
                true => rnd.uniform(4000) as usize + 1,
                false => rnd.uniform(20) as usize + 1,
            };
            let ptr = arena.allocate(size);
            unsafe {
                for b in 0..size {
                    // Fill with a pattern derived from the allocation index.
                    *ptr.add(b) = (i % 256) as u8;
                }
            }
            allocated.push((ptr, size));
        }

        for (i, (ptr, size)) in allocated.iter().enumerate() {
            unsafe {
                for b in 0..*size {
                    assert_eq!(*ptr.add(b), (i % 256) as u8);
                }
            }
        }
    }

    #[test]
    fn test_allocate_copy() {
        let arena = Arena::new();
        let data = b"memtable entry bytes";
        let ptr = arena.allocate_copy(data);
        let copied = unsafe { std::slice::from_raw_parts(ptr, data.len()) };
        assert_eq!(copied, data);
    }
}
