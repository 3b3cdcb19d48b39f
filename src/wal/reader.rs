//! Log reader.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::util::coding::decode_fixed32;
use crate::util::crc;
use crate::wal::record::{RecordType, BLOCK_SIZE, HEADER_SIZE};

/// Receives notice of bytes dropped due to corruption or read errors.
pub trait Reporter {
    /// `bytes` is the approximate size of the region being skipped.
    fn corruption(&mut self, bytes: u64, reason: &str);
}

/// Outcome of reading one physical record.
enum Physical {
    /// A well-formed fragment: its type and payload extent in `backing`.
    Record(RecordType, std::ops::Range<usize>),
    /// Clean end of file.
    Eof,
    /// A damaged or skippable region; continue with the next one.
    Bad,
}

/// Reassembles logical records from a log file.
///
/// Damaged regions are reported through the [`Reporter`] and skipped;
/// reading continues at the next block. With a non-zero
/// `initial_offset` the reader starts at the enclosing block boundary
/// and drops fragments until the first FULL or FIRST record.
pub struct LogReader<'a> {
    file: File,
    reporter: Option<&'a mut dyn Reporter>,
    checksum: bool,
    backing: Vec<u8>,
    /// Unconsumed bytes of the current block: `backing[buf_start..buf_end]`.
    buf_start: usize,
    buf_end: usize,
    eof: bool,
    /// Offset of the start of the last record returned.
    last_record_offset: u64,
    /// File offset one past the buffered data.
    end_of_buffer_offset: u64,
    initial_offset: u64,
    resyncing: bool,
}

impl<'a> LogReader<'a> {
    /// Creates a reader over `file`, starting at `initial_offset`.
    pub fn new(
        file: File,
        reporter: Option<&'a mut dyn Reporter>,
        checksum: bool,
        initial_offset: u64,
    ) -> Self {
        Self {
            file,
            reporter,
            checksum,
            backing: vec![0u8; BLOCK_SIZE],
            buf_start: 0,
            buf_end: 0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        }
    }

    /// Reads the next logical record, or `None` at end of log.
    pub fn read_record(&mut self) -> Option<Vec<u8>> {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return None;
        }

        let mut scratch: Vec<u8> = Vec::new();
        let mut in_fragmented_record = false;
        // Offset of the first fragment of the record being assembled.
        let mut prospective_record_offset = 0u64;

        loop {
            let physical = self.read_physical_record();
            let (record_type, range) = match physical {
                Physical::Record(ty, range) => (ty, range),
                Physical::Eof => {
                    // A partial record at the tail means the writer died
                    // mid-append; drop it silently.
                    return None;
                }
                Physical::Bad => {
                    if in_fragmented_record {
                        self.report_corruption(scratch.len() as u64, "error in middle of record");
                        in_fragmented_record = false;
                        scratch.clear();
                    }
                    continue;
                }
            };

            let fragment_size = range.len() as u64;
            let physical_record_offset = self.end_of_buffer_offset
                - (self.buf_end - self.buf_start) as u64
                - HEADER_SIZE as u64
                - fragment_size;

            if self.resyncing {
                match record_type {
                    RecordType::Middle => continue,
                    RecordType::Last => {
                        self.resyncing = false;
                        continue;
                    }
                    _ => self.resyncing = false,
                }
            }

            match record_type {
                RecordType::Full => {
                    if in_fragmented_record && !scratch.is_empty() {
                        self.report_corruption(scratch.len() as u64, "partial record without end");
                    }
                    self.last_record_offset = physical_record_offset;
                    return Some(self.backing[range].to_vec());
                }
                RecordType::First => {
                    if in_fragmented_record && !scratch.is_empty() {
                        self.report_corruption(scratch.len() as u64, "partial record without end");
                    }
                    prospective_record_offset = physical_record_offset;
                    scratch.clear();
                    scratch.extend_from_slice(&self.backing[range]);
                    in_fragmented_record = true;
                }
                RecordType::Middle => {
                    if !in_fragmented_record {
                        self.report_corruption(fragment_size, "missing start of fragmented record");
                    } else {
                        scratch.extend_from_slice(&self.backing[range]);
                    }
                }
                RecordType::Last => {
                    if !in_fragmented_record {
                        self.report_corruption(fragment_size, "missing start of fragmented record");
                    } else {
                        scratch.extend_from_slice(&self.backing[range]);
                        self.last_record_offset = prospective_record_offset;
                        return Some(scratch);
                    }
                }
            }
        }
    }

    /// Offset of the start of the last record returned.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    fn read_physical_record(&mut self) -> Physical {
        loop {
            if self.buf_end - self.buf_start < HEADER_SIZE {
                if !self.eof {
                    // A truncated header at a block boundary is just the
                    // trailer padding; refill from the file.
                    self.buf_start = 0;
                    self.buf_end = 0;
                    match self.read_block() {
                        Ok(n) => {
                            self.end_of_buffer_offset += n as u64;
                            self.buf_end = n;
                            if n < BLOCK_SIZE {
                                self.eof = true;
                            }
                        }
                        Err(e) => {
                            self.report_drop(BLOCK_SIZE as u64, &format!("read error: {}", e));
                            self.eof = true;
                            return Physical::Eof;
                        }
                    }
                    continue;
                }
                self.buf_start = self.buf_end;
                return Physical::Eof;
            }

            let header = &self.backing[self.buf_start..self.buf_start + HEADER_SIZE];
            let length = header[4] as usize | ((header[5] as usize) << 8);
            let type_byte = header[6];

            if HEADER_SIZE + length > self.buf_end - self.buf_start {
                let drop_size = (self.buf_end - self.buf_start) as u64;
                self.buf_start = self.buf_end;
                if !self.eof {
                    self.report_corruption(drop_size, "bad record length");
                    return Physical::Bad;
                }
                // Truncated record at eof: the writer died mid-write.
                return Physical::Eof;
            }

            if type_byte == 0 && length == 0 {
                // Trailer padding of a pre-allocated block. Skip the
                // whole block without reporting.
                self.buf_start = self.buf_end;
                return Physical::Bad;
            }

            if self.checksum {
                let expected = crc::unmask(decode_fixed32(header));
                let payload_start = self.buf_start + HEADER_SIZE;
                let actual =
                    crc::value(&self.backing[self.buf_start + 6..payload_start + length]);
                if actual != expected {
                    let drop_size = (self.buf_end - self.buf_start) as u64;
                    self.buf_start = self.buf_end;
                    self.report_corruption(drop_size, "checksum mismatch");
                    return Physical::Bad;
                }
            }

            let record_type = match RecordType::from_u8(type_byte) {
                Some(ty) => ty,
                None => {
                    let drop_size = (HEADER_SIZE + length) as u64;
                    self.buf_start += HEADER_SIZE + length;
                    self.report_corruption(drop_size, &format!("unknown record type {}", type_byte));
                    return Physical::Bad;
                }
            };

            let payload_start = self.buf_start + HEADER_SIZE;
            self.buf_start += HEADER_SIZE + length;

            // Skip physical records that started before the initial offset.
            if (self.end_of_buffer_offset
                - (self.buf_end - self.buf_start) as u64
                - HEADER_SIZE as u64
                - length as u64)
                < self.initial_offset
            {
                return Physical::Bad;
            }

            return Physical::Record(record_type, payload_start..payload_start + length);
        }
    }

    fn read_block(&mut self) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read(&mut self.backing[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start = self.initial_offset - offset_in_block;

        // Offsets inside the trailer belong to the next block.
        if offset_in_block > (BLOCK_SIZE - 6) as u64 {
            block_start += BLOCK_SIZE as u64;
        }

        self.end_of_buffer_offset = block_start;

        if block_start > 0 {
            if let Err(e) = self.file.seek(SeekFrom::Start(block_start)) {
                self.report_drop(block_start, &format!("seek error: {}", e));
                return false;
            }
        }
        true
    }

    fn report_corruption(&mut self, bytes: u64, reason: &str) {
        self.report_drop(bytes, reason);
    }

    fn report_drop(&mut self, bytes: u64, reason: &str) {
        let buffered = (self.buf_end - self.buf_start) as u64;
        if let Some(reporter) = self.reporter.as_deref_mut() {
            if self.end_of_buffer_offset >= buffered + bytes
                && self.end_of_buffer_offset - buffered - bytes >= self.initial_offset
            {
                reporter.corruption(bytes, reason);
            }
        }
    }
}
