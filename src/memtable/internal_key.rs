//! Internal key format.
//!
//! Every entry the engine stores is keyed by an *internal key*:
//!
//! ```text
//! user_key || fixed64((sequence << 8) | type)
//! ```
//!
//! Internal keys order by:
//! 1. user key ascending (under the user comparator),
//! 2. sequence descending (newer first),
//! 3. type descending.
//!
//! Sorting newer entries first means a forward scan positioned at
//! `(key, snapshot_seq)` lands on the newest entry visible to that
//! snapshot.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};

use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::util::coding::decode_fixed64;

/// Monotonically increasing per-database write counter.
pub type SequenceNumber = u64;

/// Largest representable sequence number (56 bits; the low byte of the
/// tag holds the value type).
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// The kind of entry an internal key denotes.
///
/// The numeric values are embedded in on-disk data and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    /// A tombstone marking the key deleted.
    Deletion = 0,
    /// A live value.
    Value = 1,
}

/// The type to use when constructing a seek target: the numerically
/// greatest type, so the seek lands on the first entry at the target
/// sequence or older.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    /// Converts a raw tag byte to a ValueType.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

/// Packs a sequence and type into the 64-bit trailer tag.
pub fn pack_sequence_and_type(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type as u64
}

/// Appends the encoded internal key for `(user_key, sequence, type)`.
pub fn append_internal_key(
    dst: &mut BytesMut,
    user_key: &[u8],
    sequence: SequenceNumber,
    value_type: ValueType,
) {
    dst.put_slice(user_key);
    dst.put_u64_le(pack_sequence_and_type(sequence, value_type));
}

/// Returns the user-key prefix of an encoded internal key.
///
/// # Panics
///
/// Panics if `internal_key` is shorter than the 8-byte trailer.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len() - 8]
}

/// A decoded view of an internal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    /// The user-supplied key bytes.
    pub user_key: &'a [u8],
    /// Write sequence.
    pub sequence: SequenceNumber,
    /// Entry kind.
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    /// Splits an encoded internal key into its components.
    pub fn decode(internal_key: &'a [u8]) -> Result<Self> {
        if internal_key.len() < 8 {
            return Err(Error::corruption("internal key too short"));
        }
        let tag = decode_fixed64(&internal_key[internal_key.len() - 8..]);
        let value_type = ValueType::from_u8((tag & 0xff) as u8)
            .ok_or_else(|| Error::corruption(format!("bad value type {}", tag & 0xff)))?;
        Ok(Self {
            user_key: &internal_key[..internal_key.len() - 8],
            sequence: tag >> 8,
            value_type,
        })
    }
}

impl fmt::Display for ParsedInternalKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} @ {} : {:?}", self.user_key, self.sequence, self.value_type)
    }
}

/// An owned encoded internal key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    /// Builds an internal key from its parts.
    pub fn new(user_key: &[u8], sequence: SequenceNumber, value_type: ValueType) -> Self {
        let mut rep = BytesMut::with_capacity(user_key.len() + 8);
        append_internal_key(&mut rep, user_key, sequence, value_type);
        Self { rep: rep.to_vec() }
    }

    /// Wraps already-encoded bytes, validating the trailer.
    pub fn decode_from(encoded: &[u8]) -> Result<Self> {
        ParsedInternalKey::decode(encoded)?;
        Ok(Self { rep: encoded.to_vec() })
    }

    /// The encoded bytes.
    pub fn encoded(&self) -> &[u8] {
        debug_assert!(!self.rep.is_empty());
        &self.rep
    }

    /// The user-key prefix.
    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }

    /// True if no key has been stored.
    pub fn is_empty(&self) -> bool {
        self.rep.is_empty()
    }
}

/// Orders encoded internal keys: user key ascending, then tag
/// descending so newer entries sort first.
pub struct InternalKeyComparator {
    user_comparator: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    /// Wraps a user comparator.
    pub fn new(user_comparator: Arc<dyn Comparator>) -> Self {
        Self { user_comparator }
    }

    /// The wrapped user comparator.
    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user_comparator
    }

    /// Three-way comparison of encoded internal keys.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self
            .user_comparator
            .compare(extract_user_key(a), extract_user_key(b))
        {
            Ordering::Equal => {
                let a_tag = decode_fixed64(&a[a.len() - 8..]);
                let b_tag = decode_fixed64(&b[b.len() - 8..]);
                // Descending by tag: larger (newer) sorts first.
                b_tag.cmp(&a_tag)
            }
            ord => ord,
        }
    }

    /// Comparison of owned internal keys.
    pub fn compare_keys(&self, a: &InternalKey, b: &InternalKey) -> Ordering {
        self.compare(a.encoded(), b.encoded())
    }

    /// Shortest internal key in `[start, limit)`, used for index-block
    /// separators. Falls back to `start` when the user comparator cannot
    /// shorten.
    pub fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let tmp = self.user_comparator.find_shortest_separator(user_start, user_limit);
        if tmp.len() < user_start.len()
            && self.user_comparator.compare(user_start, &tmp) == Ordering::Less
        {
            // A physically shorter user key sorts just after user_start;
            // give it the maximal tag so it stays below limit.
            let mut out = BytesMut::from(&tmp[..]);
            out.put_u64_le(pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK));
            debug_assert_eq!(self.compare(start, &out), Ordering::Less);
            debug_assert_eq!(self.compare(&out, limit), Ordering::Less);
            return out.to_vec();
        }
        start.to_vec()
    }

    /// Short internal key `>= key`, used for the final index entry.
    pub fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        let user_key = extract_user_key(key);
        let tmp = self.user_comparator.find_short_successor(user_key);
        if tmp.len() < user_key.len()
            && self.user_comparator.compare(user_key, &tmp) == Ordering::Less
        {
            let mut out = BytesMut::from(&tmp[..]);
            out.put_u64_le(pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK));
            debug_assert_eq!(self.compare(key, &out), Ordering::Less);
            return out.to_vec();
        }
        key.to_vec()
    }
}

impl Clone for InternalKeyComparator {
    fn clone(&self) -> Self {
        Self { user_comparator: Arc::clone(&self.user_comparator) }
    }
}

/// A memtable lookup target for `(user_key, snapshot_sequence)`.
///
/// Holds a single buffer from which the three key flavors are sliced:
///
/// ```text
/// varint32(klen + 8) || user_key || fixed64(tag)
/// ^ memtable_key        ^ user_key
///                       ^........ internal_key .........^
/// ```
pub struct LookupKey {
    data: Vec<u8>,
    key_start: usize,
}

impl LookupKey {
    /// Builds a lookup key that sees entries with sequence <= `sequence`.
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let mut buf = BytesMut::with_capacity(user_key.len() + 13);
        crate::util::coding::put_varint32(&mut buf, (user_key.len() + 8) as u32);
        let key_start = buf.len();
        buf.put_slice(user_key);
        buf.put_u64_le(pack_sequence_and_type(sequence, VALUE_TYPE_FOR_SEEK));
        Self { data: buf.to_vec(), key_start }
    }

    /// The length-prefixed key as stored in the memtable.
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// The encoded internal key.
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.key_start..]
    }

    /// The bare user key.
    pub fn user_key(&self) -> &[u8] {
        &self.data[self.key_start..self.data.len() - 8]
    }
}
