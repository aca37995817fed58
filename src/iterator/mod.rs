//! Iteration over sorted key/value sources.
//!
//! [`Iter`] is the capability set every iterator in the engine implements:
//! block iterators, memtable iterators, and the combinators that stack them
//! ([`TwoLevelIterator`], [`MergingIterator`]). Keys and values returned by
//! an iterator are valid until the next positioning call.
//!
//! Iterators may carry cleanup callbacks (typically releasing a cache
//! handle); callbacks run in LIFO order when the iterator is dropped.

mod merging;
mod two_level;

pub use merging::MergingIterator;
pub use two_level::{BlockIterFactory, TwoLevelIterator};

use crate::memtable::MemTableIterator;
use crate::sstable::block::BlockIter;
use crate::{Error, Result};

/// A cleanup callback run when an iterator is dropped.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Ordered iteration over byte keys and values.
///
/// An iterator is either *valid* (positioned at an entry) or not. `key` and
/// `value` may only be called when valid. Errors encountered while
/// positioning leave the iterator invalid with a non-OK [`Iter::status`];
/// construction itself never fails loudly.
pub trait Iter {
    /// True when positioned at an entry.
    fn valid(&self) -> bool;

    /// Position at the first entry.
    fn seek_to_first(&mut self);

    /// Position at the last entry.
    fn seek_to_last(&mut self);

    /// Position at the first entry with key >= `target`.
    fn seek(&mut self, target: &[u8]);

    /// Advance to the next entry. Requires `valid()`.
    fn next(&mut self);

    /// Retreat to the previous entry. Requires `valid()`.
    fn prev(&mut self);

    /// Key at the current entry. Requires `valid()`.
    fn key(&self) -> &[u8];

    /// Value at the current entry. Requires `valid()`.
    fn value(&self) -> &[u8];

    /// First error encountered, if any.
    fn status(&self) -> Result<()>;

    /// Register a callback to run when this iterator is dropped.
    fn register_cleanup(&mut self, cleanup: Cleanup);
}

impl<I: Iter + ?Sized> Iter for Box<I> {
    fn valid(&self) -> bool {
        (**self).valid()
    }
    fn seek_to_first(&mut self) {
        (**self).seek_to_first()
    }
    fn seek_to_last(&mut self) {
        (**self).seek_to_last()
    }
    fn seek(&mut self, target: &[u8]) {
        (**self).seek(target)
    }
    fn next(&mut self) {
        (**self).next()
    }
    fn prev(&mut self) {
        (**self).prev()
    }
    fn key(&self) -> &[u8] {
        (**self).key()
    }
    fn value(&self) -> &[u8] {
        (**self).value()
    }
    fn status(&self) -> Result<()> {
        (**self).status()
    }
    fn register_cleanup(&mut self, cleanup: Cleanup) {
        (**self).register_cleanup(cleanup)
    }
}

/// LIFO list of cleanup callbacks, run on drop.
#[derive(Default)]
pub struct CleanupList {
    callbacks: Vec<Cleanup>,
}

impl CleanupList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback.
    pub fn push(&mut self, cleanup: Cleanup) {
        self.callbacks.push(cleanup);
    }
}

impl Drop for CleanupList {
    fn drop(&mut self) {
        while let Some(cleanup) = self.callbacks.pop() {
            cleanup();
        }
    }
}

/// An iterator over nothing, optionally carrying an error status.
///
/// Used where an iterator must be produced but its source failed to open.
pub struct EmptyIter {
    status: Result<()>,
    cleanup: CleanupList,
}

impl EmptyIter {
    /// An empty iterator with OK status.
    pub fn new() -> Self {
        Self {
            status: Ok(()),
            cleanup: CleanupList::new(),
        }
    }

    /// An empty iterator reporting `error` from `status`.
    pub fn with_error(error: Error) -> Self {
        Self {
            status: Err(error),
            cleanup: CleanupList::new(),
        }
    }
}

impl Default for EmptyIter {
    fn default() -> Self {
        Self::new()
    }
}

impl Iter for EmptyIter {
    fn valid(&self) -> bool {
        false
    }
    fn seek_to_first(&mut self) {}
    fn seek_to_last(&mut self) {}
    fn seek(&mut self, _target: &[u8]) {}
    fn next(&mut self) {
        unreachable!("next on invalid iterator")
    }
    fn prev(&mut self) {
        unreachable!("prev on invalid iterator")
    }
    fn key(&self) -> &[u8] {
        unreachable!("key on invalid iterator")
    }
    fn value(&self) -> &[u8] {
        unreachable!("value on invalid iterator")
    }
    fn status(&self) -> Result<()> {
        self.status.clone()
    }
    fn register_cleanup(&mut self, cleanup: Cleanup) {
        self.cleanup.push(cleanup);
    }
}

/// The closed set of concrete iterators the engine produces.
///
/// Combinators and the database layer hold children through this enum;
/// trait objects are reserved for user-pluggable interfaces.
pub enum ChildIter {
    /// Memtable iterator.
    MemTable(MemTableIterator),
    /// Single-block iterator.
    Block(BlockIter),
    /// Sorted-table iterator (index block over data blocks).
    Table(TwoLevelIterator),
    /// Empty or failed source.
    Empty(EmptyIter),
}

macro_rules! dispatch {
    ($self:ident, $it:ident => $body:expr) => {
        match $self {
            ChildIter::MemTable($it) => $body,
            ChildIter::Block($it) => $body,
            ChildIter::Table($it) => $body,
            ChildIter::Empty($it) => $body,
        }
    };
}

impl Iter for ChildIter {
    fn valid(&self) -> bool {
        dispatch!(self, it => it.valid())
    }
    fn seek_to_first(&mut self) {
        dispatch!(self, it => it.seek_to_first())
    }
    fn seek_to_last(&mut self) {
        dispatch!(self, it => it.seek_to_last())
    }
    fn seek(&mut self, target: &[u8]) {
        dispatch!(self, it => it.seek(target))
    }
    fn next(&mut self) {
        dispatch!(self, it => it.next())
    }
    fn prev(&mut self) {
        dispatch!(self, it => it.prev())
    }
    fn key(&self) -> &[u8] {
        dispatch!(self, it => it.key())
    }
    fn value(&self) -> &[u8] {
        dispatch!(self, it => it.value())
    }
    fn status(&self) -> Result<()> {
        dispatch!(self, it => it.status())
    }
    fn register_cleanup(&mut self, cleanup: Cleanup) {
        dispatch!(self, it => it.register_cleanup(cleanup))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A vector-backed iterator for combinator tests.

    use super::*;

    pub struct VecIter {
        entries: Vec<(Vec<u8>, Vec<u8>)>,
        // usize::MAX marks "invalid".
        pos: usize,
        cleanup: CleanupList,
    }

    impl VecIter {
        /// Entries must already be sorted by the comparator under test.
        pub fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            Self {
                entries,
                pos: usize::MAX,
                cleanup: CleanupList::new(),
            }
        }
    }

    impl Iter for VecIter {
        fn valid(&self) -> bool {
            self.pos < self.entries.len()
        }
        fn seek_to_first(&mut self) {
            self.pos = if self.entries.is_empty() { usize::MAX } else { 0 };
        }
        fn seek_to_last(&mut self) {
            self.pos = self.entries.len().checked_sub(1).unwrap_or(usize::MAX);
        }
        fn seek(&mut self, target: &[u8]) {
            self.pos = self
                .entries
                .partition_point(|(k, _)| k.as_slice() < target);
            if self.pos >= self.entries.len() {
                self.pos = usize::MAX;
            }
        }
        fn next(&mut self) {
            assert!(self.valid());
            self.pos += 1;
            if self.pos >= self.entries.len() {
                self.pos = usize::MAX;
            }
        }
        fn prev(&mut self) {
            assert!(self.valid());
            self.pos = self.pos.checked_sub(1).unwrap_or(usize::MAX);
        }
        fn key(&self) -> &[u8] {
            &self.entries[self.pos].0
        }
        fn value(&self) -> &[u8] {
            &self.entries[self.pos].1
        }
        fn status(&self) -> Result<()> {
            Ok(())
        }
        fn register_cleanup(&mut self, cleanup: Cleanup) {
            self.cleanup.push(cleanup);
        }
    }
}
