//! Table block format.
//!
//! A block is a run of prefix-compressed entries followed by its restart
//! array:
//!
//! ```text
//! [entry 1] ... [entry N]
//! [restart offset 1: u32] ... [restart offset M: u32]
//! [num restarts: u32]
//! ```
//!
//! Each entry:
//!
//! ```text
//! [shared: u32] [unshared: u32] [value_len: u32] [key suffix] [value]
//! ```
//!
//! At a restart point `shared` is zero, so the full key is present;
//! seeks binary-search the restart array and scan forward from there.

use std::cmp::Ordering;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::memtable::InternalKeyComparator;

const ENTRY_HEADER_SIZE: usize = 12;

/// An immutable, parsed block.
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    /// Wraps raw block contents.
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("block too small"));
        }
        let num_restarts = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
        let array_bytes = 4 + num_restarts as usize * 4;
        if array_bytes > data.len() {
            return Err(Error::corruption("bad restart array in block"));
        }
        let restart_offset = data.len() - array_bytes;
        Ok(Self { data, restart_offset, num_restarts })
    }

    /// Number of restart points.
    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    fn restart_point(&self, index: u32) -> usize {
        let offset = self.restart_offset + index as usize * 4;
        u32::from_le_bytes(self.data[offset..offset + 4].try_into().unwrap()) as usize
    }

    /// Full key stored at restart point `index` (shared prefix is empty
    /// there by construction).
    fn restart_key(&self, index: u32) -> Result<&[u8]> {
        let offset = self.restart_point(index);
        if offset + ENTRY_HEADER_SIZE > self.restart_offset {
            return Err(Error::corruption("restart point out of range"));
        }
        let data = &self.data[offset..];
        let shared = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let unshared = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        if shared != 0 || ENTRY_HEADER_SIZE + unshared > data.len() {
            return Err(Error::corruption("bad restart entry in block"));
        }
        Ok(&data[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + unshared])
    }

    /// An iterator positioned before the first entry.
    pub fn iter(&self) -> BlockIterator {
        BlockIterator::new(self.clone())
    }

    /// Raw block contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Builds a block from keys added in sorted order.
pub struct BlockBuilder {
    buffer: BytesMut,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
    restart_interval: usize,
}

impl BlockBuilder {
    /// Creates a builder with the given restart interval.
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
            restart_interval,
        }
    }

    /// Appends an entry. Keys must arrive in strictly increasing order;
    /// the table builder enforces that with its comparator.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let mut shared = 0;
        if self.counter >= self.restart_interval {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        } else {
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        }
        let unshared = key.len() - shared;

        self.buffer.put_u32_le(shared as u32);
        self.buffer.put_u32_le(unshared as u32);
        self.buffer.put_u32_le(value.len() as u32);
        self.buffer.put_slice(&key[shared..]);
        self.buffer.put_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Appends the restart array and returns the block contents.
    pub fn finish(mut self) -> Bytes {
        for restart in &self.restarts {
            self.buffer.put_u32_le(*restart);
        }
        self.buffer.put_u32_le(self.restarts.len() as u32);
        self.buffer.freeze()
    }

    /// Size of the block if finished now.
    pub fn current_size(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// True if no entries were added.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Iterator over block entries with comparator-aware seek.
pub struct BlockIterator {
    block: Block,
    /// Offset of the next entry to parse.
    current: usize,
    key: Vec<u8>,
    value_range: std::ops::Range<usize>,
    valid: bool,
}

impl BlockIterator {
    fn new(block: Block) -> Self {
        Self { block, current: 0, key: Vec::new(), value_range: 0..0, valid: false }
    }

    /// Positions at the first entry.
    pub fn seek_to_first(&mut self) {
        self.key.clear();
        self.current = 0;
        self.parse_next_entry();
    }

    /// Positions at the first entry with key >= `target` under `cmp`.
    pub fn seek(&mut self, target: &[u8], cmp: &InternalKeyComparator) {
        // Binary search over restart points: greatest restart whose key
        // is < target.
        let mut left = 0u32;
        let mut right = self.block.num_restarts.saturating_sub(1);
        while left < right {
            let mid = (left + right + 1) / 2;
            match self.block.restart_key(mid) {
                Ok(key) if cmp.compare(key, target) == Ordering::Less => left = mid,
                Ok(_) => right = mid - 1,
                Err(_) => {
                    self.valid = false;
                    return;
                }
            }
        }

        self.key.clear();
        self.current = self.block.restart_point(left);
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if cmp.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    /// Advances to the next entry; returns validity.
    pub fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }
        self.parse_next_entry()
    }

    fn parse_next_entry(&mut self) -> bool {
        if self.current >= self.block.restart_offset {
            self.valid = false;
            return false;
        }
        let data = &self.block.data[self.current..self.block.restart_offset];
        if data.len() < ENTRY_HEADER_SIZE {
            self.valid = false;
            return false;
        }

        let shared = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        let unshared = u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize;
        let value_len = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;

        if shared > self.key.len() || ENTRY_HEADER_SIZE + unshared + value_len > data.len() {
            self.valid = false;
            return false;
        }

        self.key.truncate(shared);
        self.key
            .extend_from_slice(&data[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + unshared]);

        let value_start = self.current + ENTRY_HEADER_SIZE + unshared;
        self.value_range = value_start..value_start + value_len;
        self.current = value_start + value_len;
        self.valid = true;
        true
    }

    /// True if positioned at an entry.
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Current key. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    /// Current value. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.block.data[self.value_range.clone()]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::memtable::{InternalKey, ValueType, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK};

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn ikey(user_key: &[u8], seq: u64) -> Vec<u8> {
        InternalKey::new(user_key, seq, ValueType::Value).encoded().to_vec()
    }

    fn build_block(entries: &[(&[u8], &[u8])]) -> Block {
        let mut builder = BlockBuilder::new(3);
        for (key, value) in entries {
            builder.add(key, value);
        }
        Block::new(builder.finish()).unwrap()
    }

    #[test]
    fn test_iterate_in_order() {
        let keys: Vec<Vec<u8>> = (0..20).map(|i| ikey(format!("key{:02}", i).as_bytes(), 1)).collect();
        let entries: Vec<(&[u8], &[u8])> =
            keys.iter().map(|k| (k.as_slice(), b"v".as_slice())).collect();
        let block = build_block(&entries);

        let mut iter = block.iter();
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            assert_eq!(iter.key(), keys[count].as_slice());
            assert_eq!(iter.value(), b"v");
            count += 1;
            iter.next();
        }
        assert_eq!(count, 20);
    }

    #[test]
    fn test_prefix_compression_shrinks() {
        let long_keys: Vec<Vec<u8>> =
            (0..10).map(|i| ikey(format!("commonprefix/{:04}", i).as_bytes(), 1)).collect();
        let mut with_compression = BlockBuilder::new(16);
        for key in &long_keys {
            with_compression.add(key, b"v");
        }
        let mut without_compression = BlockBuilder::new(1);
        for key in &long_keys {
            without_compression.add(key, b"v");
        }
        assert!(with_compression.current_size() < without_compression.current_size());
    }

    #[test]
    fn test_seek() {
        let keys: Vec<Vec<u8>> =
            [b"apple".as_slice(), b"banana", b"cherry", b"grape", b"melon"]
                .iter()
                .map(|k| ikey(k, 5))
                .collect();
        let entries: Vec<(&[u8], &[u8])> =
            keys.iter().map(|k| (k.as_slice(), b"v".as_slice())).collect();
        let block = build_block(&entries);
        let cmp = icmp();

        // Exact hit.
        let mut iter = block.iter();
        iter.seek(&keys[2], &cmp);
        assert!(iter.valid());
        assert_eq!(iter.key(), keys[2].as_slice());

        // Between keys: lands on the next one.
        let target = InternalKey::new(b"blueberry", MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let mut iter = block.iter();
        iter.seek(target.encoded(), &cmp);
        assert!(iter.valid());
        assert_eq!(iter.key(), keys[2].as_slice());

        // Before everything.
        let target = InternalKey::new(b"aaa", MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let mut iter = block.iter();
        iter.seek(target.encoded(), &cmp);
        assert!(iter.valid());
        assert_eq!(iter.key(), keys[0].as_slice());

        // Past everything.
        let target = InternalKey::new(b"zzz", MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let mut iter = block.iter();
        iter.seek(target.encoded(), &cmp);
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_across_restarts() {
        // Restart interval 3 with 20 keys gives several restart points.
        let keys: Vec<Vec<u8>> = (0..20).map(|i| ikey(format!("k{:03}", i).as_bytes(), 9)).collect();
        let entries: Vec<(&[u8], &[u8])> =
            keys.iter().map(|k| (k.as_slice(), b"v".as_slice())).collect();
        let block = build_block(&entries);
        let cmp = icmp();

        for (i, key) in keys.iter().enumerate() {
            let mut iter = block.iter();
            iter.seek(key, &cmp);
            assert!(iter.valid(), "seek to entry {}", i);
            assert_eq!(iter.key(), key.as_slice());
        }
    }

    #[test]
    fn test_corrupt_restart_array_rejected() {
        let block = build_block(&[(ikey(b"a", 1).as_slice(), b"v")]);
        let mut data = block.data().to_vec();
        let len = data.len();
        // Claim an absurd restart count.
        data[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(Block::new(Bytes::from(data)).is_err());
    }
}
