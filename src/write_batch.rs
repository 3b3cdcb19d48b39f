//! Atomic batches of write operations.
//!
//! A batch is held in its wire representation, which is also what gets
//! framed into the write-ahead log:
//!
//! ```text
//! sequence: fixed64      // base sequence, stamped at commit time
//! count:    fixed32
//! entries:  count records, each
//!           type(1) || varstring(key) [ || varstring(value) ]
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use siltdb::{DB, Options, WriteBatch, WriteOptions};
//!
//! # fn main() -> Result<(), siltdb::Error> {
//! let db = DB::open("./data", Options::default().create_if_missing(true))?;
//! let mut batch = WriteBatch::new();
//! batch.put(b"key1", b"value1");
//! batch.delete(b"key2");
//! db.write(&WriteOptions::default(), batch)?;
//! # Ok(())
//! # }
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::memtable::{MemTable, SequenceNumber, ValueType};
use crate::util::coding::{
    decode_fixed32, decode_fixed64, get_length_prefixed_slice, put_length_prefixed_slice,
};

/// Size of the sequence + count header.
pub const BATCH_HEADER_SIZE: usize = 12;

/// An ordered collection of puts and deletes applied atomically.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: BytesMut,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        let mut rep = BytesMut::with_capacity(64);
        rep.resize(BATCH_HEADER_SIZE, 0);
        Self { rep }
    }

    /// Reconstructs a batch from its wire representation (log replay).
    pub fn from_contents(contents: &[u8]) -> Result<Self> {
        if contents.len() < BATCH_HEADER_SIZE {
            return Err(Error::corruption("malformed WriteBatch (too small)"));
        }
        Ok(Self { rep: BytesMut::from(contents) })
    }

    /// Queues an insert of `key -> value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    /// Queues a tombstone for `key`.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.put_u8(ValueType::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    /// Drops all queued operations.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_SIZE, 0);
    }

    /// Appends all of `other`'s operations to this batch.
    pub fn append(&mut self, other: &WriteBatch) {
        self.set_count(self.count() + other.count());
        self.rep.extend_from_slice(&other.rep[BATCH_HEADER_SIZE..]);
    }

    /// Number of queued operations.
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..12])
    }

    /// True if no operations are queued.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Size in bytes of the wire representation.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// The base sequence stamped into the header.
    pub(crate) fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep[0..8])
    }

    /// Stamps the base sequence. The sequence lives in the first eight
    /// bytes of the header, ahead of the count.
    pub(crate) fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[0..8].copy_from_slice(&sequence.to_le_bytes());
    }

    fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    /// The wire representation, framed into the log as one record.
    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Drives `handler` over each operation in insertion order.
    ///
    /// Fails with `Corruption` if the representation is malformed or the
    /// entry count disagrees with the header.
    pub fn iterate<H: WriteBatchHandler>(&self, handler: &mut H) -> Result<()> {
        let mut input = &self.rep[..];
        if input.len() < BATCH_HEADER_SIZE {
            return Err(Error::corruption("malformed WriteBatch (too small)"));
        }
        input = &input[BATCH_HEADER_SIZE..];

        let mut found = 0u32;
        while !input.is_empty() {
            found += 1;
            let tag = input[0];
            input = &input[1..];
            match ValueType::from_u8(tag) {
                Some(ValueType::Value) => {
                    let key = get_length_prefixed_slice(&mut input)
                        .map_err(|_| Error::corruption("bad WriteBatch Put"))?;
                    let value = get_length_prefixed_slice(&mut input)
                        .map_err(|_| Error::corruption("bad WriteBatch Put"))?;
                    handler.put(key, value);
                }
                Some(ValueType::Deletion) => {
                    let key = get_length_prefixed_slice(&mut input)
                        .map_err(|_| Error::corruption("bad WriteBatch Delete"))?;
                    handler.delete(key);
                }
                None => return Err(Error::corruption(format!("unknown WriteBatch tag {}", tag))),
            }
        }

        if found != self.count() {
            return Err(Error::corruption("WriteBatch has wrong count"));
        }
        Ok(())
    }

    /// Applies the batch to `mem`, assigning consecutive sequences from
    /// the stamped base.
    pub(crate) fn insert_into(&self, mem: &MemTable) -> Result<()> {
        let mut inserter = MemTableInserter { sequence: self.sequence(), mem };
        self.iterate(&mut inserter)
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Visitor over the operations of a batch.
pub trait WriteBatchHandler {
    /// Called for each queued insert.
    fn put(&mut self, key: &[u8], value: &[u8]);
    /// Called for each queued tombstone.
    fn delete(&mut self, key: &[u8]);
}

struct MemTableInserter<'a> {
    sequence: SequenceNumber,
    mem: &'a MemTable,
}

impl WriteBatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.sequence, ValueType::Value, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::Deletion, key, b"");
        self.sequence += 1;
    }
}
