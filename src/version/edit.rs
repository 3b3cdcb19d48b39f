//! Version edits: deltas between on-disk layouts.
//!
//! An edit is serialized as a stream of tagged fields and framed into
//! the manifest as one log record. Tag numbers are embedded on disk and
//! must not change.

use bytes::BytesMut;

use crate::config::NUM_LEVELS;
use crate::error::{Error, Result};
use crate::memtable::{InternalKey, SequenceNumber};
use crate::util::coding::{
    get_length_prefixed_slice, get_varint32, get_varint64, put_length_prefixed_slice,
    put_varint32, put_varint64,
};

const TAG_COMPARATOR: u32 = 1;
const TAG_LOG_NUMBER: u32 = 2;
const TAG_NEXT_FILE_NUMBER: u32 = 3;
const TAG_LAST_SEQUENCE: u32 = 4;
const TAG_COMPACT_POINTER: u32 = 5;
const TAG_DELETED_FILE: u32 = 6;
const TAG_NEW_FILE: u32 = 7;
// 8 was used by an old large-value-ref field and stays reserved.
const TAG_PREV_LOG_NUMBER: u32 = 9;

/// A file added by an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFile {
    /// File number of the table.
    pub number: u64,
    /// Size in bytes.
    pub file_size: u64,
    /// Smallest internal key in the table.
    pub smallest: InternalKey,
    /// Largest internal key in the table.
    pub largest: InternalKey,
}

/// A delta over the current version: files added and removed, plus
/// metadata counter updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    /// Name of the user comparator; written once per manifest.
    pub comparator: Option<String>,
    /// Write-ahead log in effect after this edit.
    pub log_number: Option<u64>,
    /// Log of the previous memtable, kept during its flush.
    pub prev_log_number: Option<u64>,
    /// File-number counter watermark.
    pub next_file_number: Option<u64>,
    /// Sequence watermark.
    pub last_sequence: Option<SequenceNumber>,
    /// Per-level keys at which the next size compaction starts.
    pub compact_pointers: Vec<(usize, InternalKey)>,
    /// `(level, file_number)` pairs removed from the layout.
    pub deleted_files: Vec<(usize, u64)>,
    /// `(level, file)` pairs added to the layout.
    pub new_files: Vec<(usize, NewFile)>,
}

impl VersionEdit {
    /// An empty edit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets every field.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Sets the comparator name.
    pub fn set_comparator_name(&mut self, name: impl Into<String>) {
        self.comparator = Some(name.into());
    }

    /// Sets the log number.
    pub fn set_log_number(&mut self, number: u64) {
        self.log_number = Some(number);
    }

    /// Sets the previous log number.
    pub fn set_prev_log_number(&mut self, number: u64) {
        self.prev_log_number = Some(number);
    }

    /// Sets the next-file-number watermark.
    pub fn set_next_file_number(&mut self, number: u64) {
        self.next_file_number = Some(number);
    }

    /// Sets the last-sequence watermark.
    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        self.last_sequence = Some(sequence);
    }

    /// Records the key at which level `level`'s next compaction starts.
    pub fn set_compact_pointer(&mut self, level: usize, key: InternalKey) {
        self.compact_pointers.push((level, key));
    }

    /// Records a file addition.
    pub fn add_file(
        &mut self,
        level: usize,
        number: u64,
        file_size: u64,
        smallest: InternalKey,
        largest: InternalKey,
    ) {
        self.new_files.push((level, NewFile { number, file_size, smallest, largest }));
    }

    /// Records a file deletion.
    pub fn remove_file(&mut self, level: usize, number: u64) {
        self.deleted_files.push((level, number));
    }

    /// Serializes the edit into `dst`.
    pub fn encode_to(&self, dst: &mut BytesMut) {
        if let Some(comparator) = &self.comparator {
            put_varint32(dst, TAG_COMPARATOR);
            put_length_prefixed_slice(dst, comparator.as_bytes());
        }
        if let Some(number) = self.log_number {
            put_varint32(dst, TAG_LOG_NUMBER);
            put_varint64(dst, number);
        }
        if let Some(number) = self.prev_log_number {
            put_varint32(dst, TAG_PREV_LOG_NUMBER);
            put_varint64(dst, number);
        }
        if let Some(number) = self.next_file_number {
            put_varint32(dst, TAG_NEXT_FILE_NUMBER);
            put_varint64(dst, number);
        }
        if let Some(sequence) = self.last_sequence {
            put_varint32(dst, TAG_LAST_SEQUENCE);
            put_varint64(dst, sequence);
        }

        for (level, key) in &self.compact_pointers {
            put_varint32(dst, TAG_COMPACT_POINTER);
            put_varint32(dst, *level as u32);
            put_length_prefixed_slice(dst, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            put_varint32(dst, TAG_DELETED_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, *number);
        }
        for (level, file) in &self.new_files {
            put_varint32(dst, TAG_NEW_FILE);
            put_varint32(dst, *level as u32);
            put_varint64(dst, file.number);
            put_varint64(dst, file.file_size);
            put_length_prefixed_slice(dst, file.smallest.encoded());
            put_length_prefixed_slice(dst, file.largest.encoded());
        }
    }

    /// Parses an edit from one manifest record.
    pub fn decode_from(src: &[u8]) -> Result<Self> {
        let mut edit = Self::default();
        let mut input = src;

        while !input.is_empty() {
            let tag = get_varint32(&mut input)
                .map_err(|_| Error::corruption2("version edit", "invalid tag"))?;
            match tag {
                TAG_COMPARATOR => {
                    let name = get_length_prefixed_slice(&mut input)
                        .map_err(|_| Error::corruption2("version edit", "comparator name"))?;
                    edit.comparator = Some(
                        String::from_utf8(name.to_vec())
                            .map_err(|_| Error::corruption2("version edit", "comparator name"))?,
                    );
                }
                TAG_LOG_NUMBER => {
                    edit.log_number = Some(
                        get_varint64(&mut input)
                            .map_err(|_| Error::corruption2("version edit", "log number"))?,
                    );
                }
                TAG_PREV_LOG_NUMBER => {
                    edit.prev_log_number = Some(
                        get_varint64(&mut input).map_err(|_| {
                            Error::corruption2("version edit", "previous log number")
                        })?,
                    );
                }
                TAG_NEXT_FILE_NUMBER => {
                    edit.next_file_number = Some(
                        get_varint64(&mut input)
                            .map_err(|_| Error::corruption2("version edit", "next file number"))?,
                    );
                }
                TAG_LAST_SEQUENCE => {
                    edit.last_sequence = Some(
                        get_varint64(&mut input)
                            .map_err(|_| Error::corruption2("version edit", "last sequence"))?,
                    );
                }
                TAG_COMPACT_POINTER => {
                    let level = get_level(&mut input)
                        .map_err(|_| Error::corruption2("version edit", "compaction pointer"))?;
                    let key = get_internal_key(&mut input)
                        .map_err(|_| Error::corruption2("version edit", "compaction pointer"))?;
                    edit.compact_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let level = get_level(&mut input)
                        .map_err(|_| Error::corruption2("version edit", "deleted file"))?;
                    let number = get_varint64(&mut input)
                        .map_err(|_| Error::corruption2("version edit", "deleted file"))?;
                    edit.deleted_files.push((level, number));
                }
                TAG_NEW_FILE => {
                    let level = get_level(&mut input)
                        .map_err(|_| Error::corruption2("version edit", "new-file entry"))?;
                    let result = (|| -> Result<NewFile> {
                        Ok(NewFile {
                            number: get_varint64(&mut input)?,
                            file_size: get_varint64(&mut input)?,
                            smallest: get_internal_key(&mut input)?,
                            largest: get_internal_key(&mut input)?,
                        })
                    })();
                    let file = result
                        .map_err(|_| Error::corruption2("version edit", "new-file entry"))?;
                    edit.new_files.push((level, file));
                }
                _ => return Err(Error::corruption2("version edit", "unknown tag")),
            }
        }
        Ok(edit)
    }
}

fn get_level(input: &mut &[u8]) -> Result<usize> {
    let level = get_varint32(input)? as usize;
    if level >= NUM_LEVELS {
        return Err(Error::corruption("level out of range"));
    }
    Ok(level)
}

fn get_internal_key(input: &mut &[u8]) -> Result<InternalKey> {
    let raw = get_length_prefixed_slice(input)?;
    InternalKey::decode_from(raw)
}
