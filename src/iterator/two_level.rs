//! Two-level iteration: an index iterator over block handles, with data
//! block iterators materialized lazily.

use super::{Cleanup, CleanupList, Iter};
use crate::sstable::block::BlockIter;
use crate::{Error, Result};

/// Builds a data-block iterator from an encoded block handle.
pub type BlockIterFactory = Box<dyn FnMut(&[u8]) -> Result<BlockIter> + Send>;

/// Iterator over a sorted table: the index block keys point at data blocks,
/// which are opened on demand as the iterator moves.
///
/// Every positioning operation moves the index iterator first, rebuilds the
/// data iterator if its handle changed, then positions the data iterator
/// and skips over empty data blocks in the current direction.
pub struct TwoLevelIterator {
    index_iter: BlockIter,
    block_factory: BlockIterFactory,
    data_iter: Option<BlockIter>,
    /// Handle bytes the current data iterator was built from.
    data_block_handle: Vec<u8>,
    status: Result<()>,
    cleanup: CleanupList,
}

impl TwoLevelIterator {
    /// Create from an index iterator and a data-block factory.
    pub fn new(index_iter: BlockIter, block_factory: BlockIterFactory) -> Self {
        Self {
            index_iter,
            block_factory,
            data_iter: None,
            data_block_handle: Vec::new(),
            status: Ok(()),
            cleanup: CleanupList::new(),
        }
    }

    fn save_error(&mut self, error: Error) {
        if self.status.is_ok() {
            self.status = Err(error);
        }
    }

    fn data_valid(&self) -> bool {
        self.data_iter.as_ref().is_some_and(|it| it.valid())
    }

    fn set_data_iter(&mut self, iter: Option<BlockIter>) {
        if let Some(old) = &self.data_iter {
            if let Err(e) = old.status() {
                self.save_error(e);
            }
        }
        self.data_iter = iter;
    }

    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.set_data_iter(None);
            return;
        }

        let handle = self.index_iter.value();
        if self.data_iter.is_some() && self.data_block_handle == handle {
            // The data iterator is already over this block.
            return;
        }

        let handle = handle.to_vec();
        match (self.block_factory)(&handle) {
            Ok(iter) => {
                self.data_block_handle = handle;
                self.set_data_iter(Some(iter));
            }
            Err(e) => {
                self.save_error(e);
                self.data_block_handle.clear();
                self.set_data_iter(None);
            }
        }
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while !self.data_valid() {
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(data) = &mut self.data_iter {
                data.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while !self.data_valid() {
            if !self.index_iter.valid() {
                self.set_data_iter(None);
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(data) = &mut self.data_iter {
                data.seek_to_last();
            }
        }
    }
}

impl Iter for TwoLevelIterator {
    fn valid(&self) -> bool {
        self.data_valid()
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data) = &mut self.data_iter {
            data.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.data_iter.as_mut().unwrap().next();
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        assert!(self.valid());
        self.data_iter.as_mut().unwrap().prev();
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        assert!(self.valid());
        self.data_iter.as_ref().unwrap().key()
    }

    fn value(&self) -> &[u8] {
        assert!(self.valid());
        self.data_iter.as_ref().unwrap().value()
    }

    fn status(&self) -> Result<()> {
        self.index_iter.status()?;
        if let Some(data) = &self.data_iter {
            data.status()?;
        }
        self.status.clone()
    }

    fn register_cleanup(&mut self, cleanup: Cleanup) {
        self.cleanup.push(cleanup);
    }
}
