//! Write-ahead log framing.
//!
//! The log (and the manifest, which reuses the same framing) is a
//! sequence of 32 KiB blocks. Each block holds physical records with a
//! 7-byte header:
//!
//! ```text
//! checksum: u32 (masked, over type byte + payload)
//! length:   u16 little-endian
//! type:     u8  (FULL=1, FIRST=2, MIDDLE=3, LAST=4; 0 reserved padding)
//! ```
//!
//! A logical record that does not fit in the remainder of a block is
//! fragmented into FIRST/MIDDLE*/LAST physical records; fewer than 7
//! trailing bytes in a block are zero-filled and skipped.

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::{LogReader, Reporter};
pub use record::{RecordType, BLOCK_SIZE, HEADER_SIZE};
pub use writer::LogWriter;

#[cfg(test)]
mod tests {
    use std::io::{Seek, SeekFrom, Write};

    use super::*;

    fn temp_log() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("000001.log");
        (dir, path)
    }

    struct CountingReporter {
        dropped: u64,
    }

    impl Reporter for CountingReporter {
        fn corruption(&mut self, bytes: u64, _reason: &str) {
            self.dropped += bytes;
        }
    }

    fn write_records(path: &std::path::Path, records: &[Vec<u8>]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = LogWriter::new(file);
        for record in records {
            writer.add_record(record).unwrap();
        }
        writer.sync().unwrap();
    }

    fn read_all(path: &std::path::Path) -> Vec<Vec<u8>> {
        let file = std::fs::File::open(path).unwrap();
        let mut reader = LogReader::new(file, None, true, 0);
        let mut records = Vec::new();
        while let Some(record) = reader.read_record() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_roundtrip_small_records() {
        let (_dir, path) = temp_log();
        let records: Vec<Vec<u8>> =
            vec![b"first".to_vec(), b"second".to_vec(), Vec::new(), b"fourth".to_vec()];
        write_records(&path, &records);
        assert_eq!(read_all(&path), records);
    }

    #[test]
    fn test_record_spanning_three_blocks() {
        let (_dir, path) = temp_log();
        // FIRST + MIDDLE + LAST
        let big = vec![0xabu8; BLOCK_SIZE * 2 + 1000];
        let records = vec![b"before".to_vec(), big.clone(), b"after".to_vec()];
        write_records(&path, &records);

        let got = read_all(&path);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], b"before");
        assert_eq!(got[1], big);
        assert_eq!(got[2], b"after");
    }

    #[test]
    fn test_block_trailer_padding() {
        let (_dir, path) = temp_log();
        // Leave exactly 6 bytes at the end of the first block; the
        // writer must pad and start the next record on a block boundary.
        let first_len = BLOCK_SIZE - HEADER_SIZE - 6;
        let records = vec![vec![1u8; first_len], vec![2u8; 100]];
        write_records(&path, &records);
        assert_eq!(read_all(&path), records);

        let size = std::fs::metadata(&path).unwrap().len();
        assert!(size > BLOCK_SIZE as u64, "second record must be in block two");
    }

    #[test]
    fn test_corrupt_record_reported_and_skipped() {
        let (_dir, path) = temp_log();
        let records = vec![vec![1u8; 100], vec![2u8; 200], vec![3u8; 50]];
        write_records(&path, &records);

        // Flip a payload byte of the second record.
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let offset = (HEADER_SIZE + 100 + HEADER_SIZE + 50) as u64;
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&[0xff]).unwrap();
        drop(file);

        let file = std::fs::File::open(&path).unwrap();
        let mut reporter = CountingReporter { dropped: 0 };
        let mut got = Vec::new();
        {
            let mut reader = LogReader::new(file, Some(&mut reporter), true, 0);
            while let Some(record) = reader.read_record() {
                got.push(record);
            }
        }

        // First record survives; the damaged one is dropped. The rest of
        // the block is discarded with it, which also claims record 3.
        assert_eq!(got, vec![vec![1u8; 100]]);
        assert!(reporter.dropped >= 200, "dropped {} bytes", reporter.dropped);
    }

    #[test]
    fn test_initial_offset_resync_past_middle() {
        let (_dir, path) = temp_log();
        let big = vec![0x42u8; BLOCK_SIZE * 3];
        let records = vec![big, b"tail".to_vec()];
        write_records(&path, &records);

        // Start inside the spanned record's MIDDLE fragment: the reader
        // must resync and deliver only the record after it.
        let file = std::fs::File::open(&path).unwrap();
        let mut reader = LogReader::new(file, None, true, (BLOCK_SIZE + 100) as u64);
        let mut got = Vec::new();
        while let Some(record) = reader.read_record() {
            got.push(record);
        }
        assert_eq!(got, vec![b"tail".to_vec()]);
    }

    #[test]
    fn test_reopened_writer_continues_block_offset() {
        let (_dir, path) = temp_log();
        write_records(&path, &[b"one".to_vec()]);

        let size = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        let mut writer = LogWriter::with_dest_length(file, size);
        writer.add_record(b"two").unwrap();
        writer.sync().unwrap();

        assert_eq!(read_all(&path), vec![b"one".to_vec(), b"two".to_vec()]);
    }
}
