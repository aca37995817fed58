//! Direction-aware k-way merge over child iterators.

use std::sync::Arc;

use super::{Cleanup, CleanupList, Iter};
use crate::util::comparator::Comparator;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges `n` sorted child iterators into one sorted stream.
///
/// Children may overlap arbitrarily; ties between children are broken by
/// child order, so earlier children win for equal keys when moving forward.
/// The merge is direction aware: switching between `next` and `prev`
/// repositions the non-current children around the current key first.
pub struct MergingIterator<I: Iter> {
    comparator: Arc<dyn Comparator>,
    children: Vec<I>,
    current: Option<usize>,
    direction: Direction,
    cleanup: CleanupList,
}

impl<I: Iter> MergingIterator<I> {
    /// Merge `children` under `comparator`.
    pub fn new(comparator: Arc<dyn Comparator>, children: Vec<I>) -> Self {
        Self {
            comparator,
            children,
            current: None,
            direction: Direction::Forward,
            cleanup: CleanupList::new(),
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if child.valid() {
                smallest = match smallest {
                    None => Some(i),
                    Some(s)
                        if self
                            .comparator
                            .compare(child.key(), self.children[s].key())
                            .is_lt() =>
                    {
                        Some(i)
                    }
                    other => other,
                };
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate().rev() {
            if child.valid() {
                largest = match largest {
                    None => Some(i),
                    Some(l)
                        if self
                            .comparator
                            .compare(child.key(), self.children[l].key())
                            .is_gt() =>
                    {
                        Some(i)
                    }
                    other => other,
                };
            }
        }
        self.current = largest;
    }
}

impl<I: Iter> Iter for MergingIterator<I> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.find_largest();
        self.direction = Direction::Reverse;
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.find_smallest();
        self.direction = Direction::Forward;
    }

    fn next(&mut self) {
        assert!(self.valid());
        let current = self.current.unwrap();

        // Ensure every child is positioned after key(). Already true while
        // moving forward, since current holds the smallest key; after a
        // direction switch the others must be repositioned explicitly.
        if self.direction != Direction::Forward {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && self.comparator.compare(&key, child.key()).is_eq() {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        assert!(self.valid());
        let current = self.current.unwrap();

        // Mirror image of next(): ensure every child is positioned before
        // key() when switching out of forward mode.
        if self.direction != Direction::Reverse {
            let key = self.children[current].key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    // Child is at the first entry >= key(); step back once.
                    child.prev();
                } else {
                    // Every entry in this child is < key().
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        self.children[self.current.unwrap()].key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        self.children[self.current.unwrap()].value()
    }

    fn status(&self) -> Result<()> {
        for child in &self.children {
            child.status()?;
        }
        Ok(())
    }

    fn register_cleanup(&mut self, cleanup: Cleanup) {
        self.cleanup.push(cleanup);
    }
}
