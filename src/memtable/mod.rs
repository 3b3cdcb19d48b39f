//! In-memory write buffer.
//!
//! The memtable serializes each write into a single arena-resident
//! entry and inserts a pointer to it into the skiplist:
//!
//! ```text
//! varint32(klen + 8) || user_key || fixed64(tag) || varint32(vlen) || value
//! ```
//!
//! Mutation follows the single-writer contract of the skiplist; readers
//! take an `Arc` handle and read lock-free. During a flush two handles
//! exist at once: the write path has moved on to a fresh memtable while
//! the compactor drains the frozen one.

pub mod internal_key;
pub mod skiplist;

pub use internal_key::{
    InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey, SequenceNumber, ValueType,
    MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK,
};

use std::cmp::Ordering;
use std::ptr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::util::arena::Arena;
use crate::util::coding::{put_varint32, varint_length};
use skiplist::{KeyComparator, SkipList, SkipListIterator};

/// Outcome of a memtable lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    /// The newest visible entry is a value.
    Found(Vec<u8>),
    /// The newest visible entry is a tombstone.
    Deleted,
    /// No entry for the key is visible at the lookup sequence.
    Absent,
}

/// Decodes the length-prefixed slice starting at `ptr`.
///
/// # Safety
///
/// `ptr` must point at a fully encoded length-prefixed slice in arena
/// memory.
unsafe fn get_length_prefixed_raw<'a>(ptr: *const u8) -> &'a [u8] {
    // Decode the varint byte by byte so we never touch memory past the
    // prefix of a short entry.
    let mut len: u32 = 0;
    let mut consumed = 0usize;
    loop {
        let byte = *ptr.add(consumed);
        len |= ((byte & 0x7f) as u32) << (consumed * 7);
        consumed += 1;
        if byte & 0x80 == 0 {
            break;
        }
        debug_assert!(consumed < 5, "malformed length prefix in arena entry");
    }
    std::slice::from_raw_parts(ptr.add(consumed), len as usize)
}

/// Orders raw memtable entries by their embedded internal keys.
pub struct MemTableKeyComparator {
    icmp: InternalKeyComparator,
}

impl KeyComparator for MemTableKeyComparator {
    unsafe fn compare_raw(&self, a: *const u8, b: *const u8) -> Ordering {
        self.icmp.compare(get_length_prefixed_raw(a), get_length_prefixed_raw(b))
    }
}

/// An in-memory sorted buffer of unflushed writes.
pub struct MemTable {
    comparator: InternalKeyComparator,
    table: SkipList<MemTableKeyComparator>,
    arena: Arc<Arena>,
}

impl MemTable {
    /// Creates an empty memtable.
    pub fn new(comparator: InternalKeyComparator) -> Self {
        let arena = Arc::new(Arena::new());
        let table = SkipList::new(
            MemTableKeyComparator { icmp: comparator.clone() },
            Arc::clone(&arena),
        );
        Self { comparator, table, arena }
    }

    /// Bytes of arena memory held; drives the flush trigger.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// Inserts one entry. Single-writer only.
    pub fn add(
        &self,
        sequence: SequenceNumber,
        value_type: ValueType,
        user_key: &[u8],
        value: &[u8],
    ) {
        let internal_key_len = user_key.len() + 8;
        let encoded_len = varint_length(internal_key_len as u64)
            + internal_key_len
            + varint_length(value.len() as u64)
            + value.len();

        let mut buf = BytesMut::with_capacity(encoded_len);
        put_varint32(&mut buf, internal_key_len as u32);
        buf.put_slice(user_key);
        buf.put_u64_le(internal_key::pack_sequence_and_type(sequence, value_type));
        put_varint32(&mut buf, value.len() as u32);
        buf.put_slice(value);
        debug_assert_eq!(buf.len(), encoded_len);

        let dst = self.arena.allocate(encoded_len);
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), dst, encoded_len);
        }
        self.table.insert(dst);
    }

    /// Looks up the newest entry for `key.user_key()` with sequence at
    /// or below the lookup bound.
    pub fn get(&self, key: &LookupKey) -> LookupResult {
        let mut iter = self.table.iter();
        iter.seek(key.memtable_key().as_ptr());
        if !iter.valid() {
            return LookupResult::Absent;
        }

        // The seek landed at the first entry >= the target. It may be
        // for a different user key entirely; check before trusting it.
        let entry_key = unsafe { get_length_prefixed_raw(iter.key()) };
        let parsed = match ParsedInternalKey::decode(entry_key) {
            Ok(parsed) => parsed,
            Err(_) => return LookupResult::Absent,
        };
        if self
            .comparator
            .user_comparator()
            .compare(parsed.user_key, key.user_key())
            != Ordering::Equal
        {
            return LookupResult::Absent;
        }

        match parsed.value_type {
            ValueType::Value => {
                let value = unsafe {
                    let value_ptr = entry_key.as_ptr().add(entry_key.len());
                    get_length_prefixed_raw(value_ptr)
                };
                LookupResult::Found(value.to_vec())
            }
            ValueType::Deletion => LookupResult::Deleted,
        }
    }

    /// An iterator over all entries in internal-key order.
    pub fn iter(&self) -> MemTableIterator<'_> {
        MemTableIterator { iter: self.table.iter(), scratch: BytesMut::new() }
    }
}

/// Iterator over memtable entries, yielding decoded key/value slices.
pub struct MemTableIterator<'a> {
    iter: SkipListIterator<'a, MemTableKeyComparator>,
    scratch: BytesMut,
}

impl MemTableIterator<'_> {
    /// True if positioned at an entry.
    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    /// Positions at the first entry.
    pub fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    /// Positions at the last entry.
    pub fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    /// Positions at the first entry with internal key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.scratch.clear();
        put_varint32(&mut self.scratch, target.len() as u32);
        self.scratch.put_slice(target);
        self.iter.seek(self.scratch.as_ptr());
    }

    /// Advances forward. Requires `valid()`.
    pub fn next(&mut self) {
        self.iter.next();
    }

    /// Retreats backward. Requires `valid()`.
    pub fn prev(&mut self) {
        self.iter.prev();
    }

    /// The current encoded internal key. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe { get_length_prefixed_raw(self.iter.key()) }
    }

    /// The current value. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe {
            let key = get_length_prefixed_raw(self.iter.key());
            get_length_prefixed_raw(key.as_ptr().add(key.len()))
        }
    }
}
