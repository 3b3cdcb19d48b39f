//! Log writer.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::error::Result;
use crate::util::crc;
use crate::wal::record::{RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};

/// Appends length-framed records to a log file.
///
/// Also used for the manifest, which shares the framing.
pub struct LogWriter {
    dest: BufWriter<File>,
    /// Write offset within the current block.
    block_offset: usize,
    /// crc of the type byte for each record type, pre-computed to save
    /// re-hashing the byte on every record.
    type_crc: [u32; MAX_RECORD_TYPE + 1],
}

fn init_type_crc() -> [u32; MAX_RECORD_TYPE + 1] {
    let mut table = [0u32; MAX_RECORD_TYPE + 1];
    for (ty, slot) in table.iter_mut().enumerate() {
        *slot = crc::value(&[ty as u8]);
    }
    table
}

impl LogWriter {
    /// Creates a writer positioned at the start of `dest`.
    pub fn new(dest: File) -> Self {
        Self { dest: BufWriter::new(dest), block_offset: 0, type_crc: init_type_crc() }
    }

    /// Creates a writer for a file that already holds `dest_length`
    /// bytes of well-formed records (log reuse, manifest append).
    pub fn with_dest_length(dest: File, dest_length: u64) -> Self {
        Self {
            dest: BufWriter::new(dest),
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
            type_crc: init_type_crc(),
        }
    }

    /// Appends one logical record, fragmenting across blocks as needed.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<()> {
        let mut left = payload;
        let mut begin = true;

        // Emit at least one fragment even for an empty payload.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Too little room for a header; pad out the block.
                if leftover > 0 {
                    self.dest.write_all(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = left.len().min(avail);
            let end = fragment_length == left.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &left[..fragment_length])?;
            left = &left[fragment_length..];
            begin = false;
            if left.is_empty() {
                return Ok(());
            }
        }
    }

    /// Flushes buffered records and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.dest.flush()?;
        self.dest.get_ref().sync_all()?;
        Ok(())
    }

    fn emit_physical_record(&mut self, record_type: RecordType, data: &[u8]) -> Result<()> {
        debug_assert!(data.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + data.len() <= BLOCK_SIZE);

        let crc = crc::mask(crc::extend(self.type_crc[record_type as usize], data));

        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&crc.to_le_bytes());
        header[4] = (data.len() & 0xff) as u8;
        header[5] = (data.len() >> 8) as u8;
        header[6] = record_type as u8;

        self.dest.write_all(&header)?;
        self.dest.write_all(data)?;
        // Push each physical record down to the OS; durability is only
        // promised after an explicit sync.
        self.dest.flush()?;

        self.block_offset += HEADER_SIZE + data.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::reader::LogReader;

    #[test]
    fn test_empty_record_is_readable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("wal");
        let mut writer = LogWriter::new(File::create(&path).unwrap());
        writer.add_record(b"").unwrap();
        writer.sync().unwrap();

        let mut reader = LogReader::new(File::open(&path).unwrap(), None, true, 0);
        assert_eq!(reader.read_record(), Some(Vec::new()));
        assert_eq!(reader.read_record(), None);
    }

    #[test]
    fn test_fragment_types_on_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("wal");
        let mut writer = LogWriter::new(File::create(&path).unwrap());
        writer.add_record(&vec![7u8; BLOCK_SIZE + 100]).unwrap();
        writer.sync().unwrap();

        let data = std::fs::read(&path).unwrap();
        // First physical record starts at 0 with type FIRST.
        assert_eq!(data[6], RecordType::First as u8);
        // Second fragment begins at the next block boundary with LAST.
        assert_eq!(data[BLOCK_SIZE + 6], RecordType::Last as u8);
    }

    #[test]
    fn test_exact_block_fit_uses_full() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("wal");
        let mut writer = LogWriter::new(File::create(&path).unwrap());
        writer.add_record(&vec![9u8; BLOCK_SIZE - HEADER_SIZE]).unwrap();
        writer.sync().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), BLOCK_SIZE);
        assert_eq!(data[6], RecordType::Full as u8);
    }
}
