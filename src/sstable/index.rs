//! Index block: separator internal keys mapped to data-block handles.

use bytes::Bytes;

use crate::error::Result;
use crate::memtable::InternalKeyComparator;
use crate::sstable::block::{Block, BlockIterator};
use crate::sstable::footer::BlockHandle;

/// Lookup structure over a table's data blocks.
///
/// Each entry's key is >= every key in its data block and < every key in
/// the next one, so the block that may contain a target is the first
/// entry whose key is >= the target.
#[derive(Debug)]
pub struct IndexBlock {
    block: Block,
}

impl IndexBlock {
    /// Parses raw index-block contents.
    pub fn new(data: Bytes) -> Result<Self> {
        Ok(Self { block: Block::new(data)? })
    }

    /// Handle of the data block that may contain `target`, or `None`
    /// when `target` is past the end of the table.
    pub fn find_block(
        &self,
        target: &[u8],
        cmp: &InternalKeyComparator,
    ) -> Result<Option<BlockHandle>> {
        let mut iter = self.block.iter();
        iter.seek(target, cmp);
        if !iter.valid() {
            return Ok(None);
        }
        Ok(Some(BlockHandle::decode(iter.value())?))
    }

    /// Iterator over `(separator, handle)` entries.
    pub fn iter(&self) -> BlockIterator {
        self.block.iter()
    }

    /// Number of data blocks indexed.
    pub fn len(&self) -> usize {
        let mut iter = self.block.iter();
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        count
    }

    /// True if the table has no data blocks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
