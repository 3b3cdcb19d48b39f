//! Table builder.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::filter::FilterPolicy;
use crate::memtable::internal_key::extract_user_key;
use crate::memtable::InternalKeyComparator;
use crate::sstable::block::BlockBuilder;
use crate::sstable::footer::{BlockHandle, Footer};
use crate::sstable::{CompressionType, BLOCK_RESTART_INTERVAL};
use crate::util::crc;

/// Writes a table file from entries added in internal-key order.
///
/// ```text
/// let mut builder = TableBuilder::new(file, icmp, None, 4096);
/// builder.add(ikey1, value1)?;
/// builder.add(ikey2, value2)?;
/// let file_size = builder.finish()?;
/// ```
pub struct TableBuilder {
    writer: BufWriter<File>,
    comparator: InternalKeyComparator,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
    block_size: usize,

    data_block: BlockBuilder,
    /// User keys of every added entry, for the filter block.
    filter_keys: Vec<Vec<u8>>,
    index_block: BlockBuilder,
    /// Handle of the last flushed data block, waiting for its separator
    /// key (chosen once the next block's first key is known).
    pending_handle: Option<BlockHandle>,
    last_key: Vec<u8>,
    offset: u64,
    num_entries: u64,
    closed: bool,
}

impl TableBuilder {
    /// Creates a builder writing to `file`.
    pub fn new(
        file: File,
        comparator: InternalKeyComparator,
        filter_policy: Option<Arc<dyn FilterPolicy>>,
        block_size: usize,
    ) -> Self {
        Self {
            writer: BufWriter::new(file),
            comparator,
            filter_policy,
            block_size,
            data_block: BlockBuilder::new(BLOCK_RESTART_INTERVAL),
            filter_keys: Vec::new(),
            index_block: BlockBuilder::new(1),
            pending_handle: None,
            last_key: Vec::new(),
            offset: 0,
            num_entries: 0,
            closed: false,
        }
    }

    /// Appends one entry. `key` is an encoded internal key and must sort
    /// after every previously added key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        debug_assert!(!self.closed);
        if !self.last_key.is_empty()
            && self.comparator.compare(key, &self.last_key) != Ordering::Greater
        {
            return Err(Error::invalid_argument("keys added out of order"));
        }

        if let Some(handle) = self.pending_handle.take() {
            // The separator only has to sort >= the flushed block's keys
            // and < this one, which lets it be much shorter than either.
            let separator = self.comparator.find_shortest_separator(&self.last_key, key);
            self.index_block.add(&separator, &handle.encode());
        }

        if self.filter_policy.is_some() {
            self.filter_keys.push(extract_user_key(key).to_vec());
        }

        self.data_block.add(key, value);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;

        if self.data_block.current_size() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(&mut self.data_block, BlockBuilder::new(BLOCK_RESTART_INTERVAL));
        let handle = self.write_block(block.finish())?;
        self.pending_handle = Some(handle);
        Ok(())
    }

    fn write_block(&mut self, contents: Bytes) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        let tag = CompressionType::None as u8;
        let checksum = crc::mask(crc::extend(crc::value(&contents), &[tag]));

        self.writer.write_all(&contents)?;
        self.writer.write_all(&[tag])?;
        self.writer.write_all(&checksum.to_le_bytes())?;
        self.offset += contents.len() as u64 + 5;
        Ok(handle)
    }

    /// Writes the filter, index, and footer; syncs; returns the final
    /// file size.
    pub fn finish(&mut self) -> Result<u64> {
        debug_assert!(!self.closed);
        self.flush_data_block()?;
        self.closed = true;

        // Filter block over every user key in the table.
        let filter_handle = match &self.filter_policy {
            Some(policy) if !self.filter_keys.is_empty() => {
                let key_refs: Vec<&[u8]> = self.filter_keys.iter().map(|k| k.as_slice()).collect();
                let filter = policy.create_filter(&key_refs);
                self.write_block(Bytes::from(filter))?
            }
            _ => BlockHandle::default(),
        };

        // Final index entry covers the last data block.
        if let Some(handle) = self.pending_handle.take() {
            let successor = self.comparator.find_short_successor(&self.last_key);
            self.index_block.add(&successor, &handle.encode());
        }
        let index = std::mem::replace(&mut self.index_block, BlockBuilder::new(1));
        let index_handle = self.write_block(index.finish())?;

        Footer::new(filter_handle, index_handle).write_to(&mut self.writer)?;
        self.offset += crate::sstable::FOOTER_SIZE as u64;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.offset)
    }

    /// Marks the builder abandoned; the caller removes the partial file.
    pub fn abandon(&mut self) {
        self.closed = true;
    }

    /// Entries added so far.
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far (completed blocks only).
    pub fn file_size(&self) -> u64 {
        self.offset
    }
}
