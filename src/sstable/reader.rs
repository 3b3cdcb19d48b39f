//! Table reader.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cache::LruCache;
use crate::error::{Error, Result};
use crate::filter::FilterPolicy;
use crate::memtable::internal_key::extract_user_key;
use crate::memtable::InternalKeyComparator;
use crate::sstable::block::{Block, BlockIterator};
use crate::sstable::footer::{BlockHandle, Footer};
use crate::sstable::index::IndexBlock;
use crate::sstable::{CompressionType, BLOCK_TRAILER_SIZE, FOOTER_SIZE};
use crate::util::crc;

/// Cache of decoded blocks shared by all tables, keyed by
/// `(file_number, block_offset)`.
pub type BlockCache = LruCache<(u64, u64), Bytes>;

/// Read access to one immutable table file.
pub struct Table {
    /// Positional reads are serialized through this lock.
    file: Mutex<File>,
    file_number: u64,
    file_size: u64,
    comparator: InternalKeyComparator,
    filter_policy: Option<Arc<dyn FilterPolicy>>,
    filter: Option<Vec<u8>>,
    index_block: IndexBlock,
    block_cache: Option<Arc<BlockCache>>,
}

impl Table {
    /// Opens the table in `file`, reading its footer, index, and filter.
    pub fn open(
        mut file: File,
        file_number: u64,
        file_size: u64,
        comparator: InternalKeyComparator,
        filter_policy: Option<Arc<dyn FilterPolicy>>,
        block_cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::corruption("file is too short to be an sstable"));
        }

        file.seek(SeekFrom::Start(file_size - FOOTER_SIZE as u64))?;
        let footer = Footer::read_from(&mut file)?;

        let index_data = read_block_contents(&mut file, &footer.index_handle)?;
        let index_block = IndexBlock::new(index_data)?;

        let filter = if footer.filter_handle.size > 0 && filter_policy.is_some() {
            Some(read_block_contents(&mut file, &footer.filter_handle)?.to_vec())
        } else {
            None
        };

        Ok(Self {
            file: Mutex::new(file),
            file_number,
            file_size,
            comparator,
            filter_policy,
            filter,
            index_block,
            block_cache,
        })
    }

    /// Finds the first entry with internal key >= `target`.
    ///
    /// Returns the entry's encoded internal key and value; the caller
    /// decides whether the user key actually matches.
    pub fn internal_get(&self, target: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if let (Some(policy), Some(filter)) = (&self.filter_policy, &self.filter) {
            if !policy.key_may_match(extract_user_key(target), filter) {
                return Ok(None);
            }
        }

        let handle = match self.index_block.find_block(target, &self.comparator)? {
            Some(handle) => handle,
            None => return Ok(None),
        };

        let block = self.read_block(&handle)?;
        let mut iter = block.iter();
        iter.seek(target, &self.comparator);
        if !iter.valid() {
            return Ok(None);
        }
        Ok(Some((iter.key().to_vec(), iter.value().to_vec())))
    }

    /// Total size of the file on disk.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// An iterator over every entry, in internal-key order. Clone the
    /// `Arc` to keep using the table afterwards.
    pub fn iter(self: Arc<Self>) -> TableIterator {
        // Snapshot the index entries; the table is immutable.
        let mut entries = Vec::new();
        let mut index_iter = self.index_block.iter();
        index_iter.seek_to_first();
        while index_iter.valid() {
            if let Ok(handle) = BlockHandle::decode(index_iter.value()) {
                entries.push((index_iter.key().to_vec(), handle));
            }
            index_iter.next();
        }

        TableIterator { table: self, index_entries: entries, block_index: 0, block_iter: None }
    }

    fn read_block(&self, handle: &BlockHandle) -> Result<Block> {
        if let Some(cache) = &self.block_cache {
            let cache_key = (self.file_number, handle.offset);
            if let Some(data) = cache.get(&cache_key) {
                return Block::new(data);
            }
            let data = read_block_contents(&mut self.file.lock(), handle)?;
            cache.insert(cache_key, data.clone(), data.len());
            return Block::new(data);
        }
        let data = read_block_contents(&mut self.file.lock(), handle)?;
        Block::new(data)
    }
}

/// Reads and verifies one block: `[contents][tag: 1][masked crc: 4]`.
fn read_block_contents(file: &mut File, handle: &BlockHandle) -> Result<Bytes> {
    let total = handle.size as usize + BLOCK_TRAILER_SIZE;
    let mut buffer = vec![0u8; total];
    file.seek(SeekFrom::Start(handle.offset))?;
    file.read_exact(&mut buffer)?;

    let contents_len = handle.size as usize;
    let tag = buffer[contents_len];
    let stored = u32::from_le_bytes(buffer[contents_len + 1..].try_into().unwrap());
    let actual = crc::mask(crc::extend(crc::value(&buffer[..contents_len]), &[tag]));
    if stored != actual {
        return Err(Error::corruption("block checksum mismatch"));
    }

    match CompressionType::from_u8(tag) {
        Some(CompressionType::None) => {}
        None => return Err(Error::corruption(format!("unknown block compression {}", tag))),
    }

    buffer.truncate(contents_len);
    Ok(Bytes::from(buffer))
}

/// Iterator over all entries of a table.
pub struct TableIterator {
    table: Arc<Table>,
    index_entries: Vec<(Vec<u8>, BlockHandle)>,
    /// Index of the block the current iterator is over.
    block_index: usize,
    block_iter: Option<BlockIterator>,
}

impl TableIterator {
    /// Positions at the first entry of the table.
    pub fn seek_to_first(&mut self) -> Result<()> {
        self.block_index = 0;
        self.load_block()?;
        Ok(())
    }

    /// Positions at the first entry with internal key >= `target`.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        // Binary search the in-memory index for the first block whose
        // separator is >= target.
        let cmp = &self.table.comparator;
        let mut left = 0usize;
        let mut right = self.index_entries.len();
        while left < right {
            let mid = (left + right) / 2;
            if cmp.compare(&self.index_entries[mid].0, target) == std::cmp::Ordering::Less {
                left = mid + 1;
            } else {
                right = mid;
            }
        }

        self.block_index = left;
        self.load_block()?;
        if let Some(iter) = &mut self.block_iter {
            iter.seek(target, &self.table.comparator);
            if !iter.valid() {
                // Separator rounding may point one block early; the
                // target then lives at the start of the next block.
                self.block_index += 1;
                self.load_block()?;
            }
        }
        Ok(())
    }

    /// Advances to the next entry.
    pub fn next(&mut self) -> Result<()> {
        if let Some(iter) = &mut self.block_iter {
            if iter.next() {
                return Ok(());
            }
            self.block_index += 1;
            self.load_block()?;
        }
        Ok(())
    }

    /// True if positioned at an entry.
    pub fn valid(&self) -> bool {
        self.block_iter.as_ref().map(|i| i.valid()).unwrap_or(false)
    }

    /// Current encoded internal key. Requires `valid()`.
    pub fn key(&self) -> &[u8] {
        self.block_iter.as_ref().unwrap().key()
    }

    /// Current value. Requires `valid()`.
    pub fn value(&self) -> &[u8] {
        self.block_iter.as_ref().unwrap().value()
    }

    fn load_block(&mut self) -> Result<()> {
        if self.block_index >= self.index_entries.len() {
            self.block_iter = None;
            return Ok(());
        }
        let handle = self.index_entries[self.block_index].1;
        let block = self.table.read_block(&handle)?;
        let mut iter = block.iter();
        iter.seek_to_first();
        self.block_iter = Some(iter);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::filter::BloomFilterPolicy;
    use crate::memtable::{InternalKey, ValueType, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK};
    use crate::sstable::builder::TableBuilder;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn ikey(user_key: &[u8], seq: u64) -> Vec<u8> {
        InternalKey::new(user_key, seq, ValueType::Value).encoded().to_vec()
    }

    fn seek_key(user_key: &[u8]) -> Vec<u8> {
        InternalKey::new(user_key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK)
            .encoded()
            .to_vec()
    }

    fn build_table(
        path: &std::path::Path,
        entries: &[(&[u8], u64, &[u8])],
        block_size: usize,
        with_filter: bool,
    ) -> Arc<Table> {
        let policy: Option<Arc<dyn FilterPolicy>> =
            with_filter.then(|| Arc::new(BloomFilterPolicy::new(10)) as Arc<dyn FilterPolicy>);
        let mut builder =
            TableBuilder::new(File::create(path).unwrap(), icmp(), policy.clone(), block_size);
        for (key, seq, value) in entries {
            builder.add(&ikey(key, *seq), value).unwrap();
        }
        let size = builder.finish().unwrap();
        Arc::new(
            Table::open(File::open(path).unwrap(), 1, size, icmp(), policy, None).unwrap(),
        )
    }

    #[test]
    fn test_get_existing_and_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.ldb");
        let table = build_table(
            &path,
            &[(b"apple", 3, b"red"), (b"banana", 2, b"yellow"), (b"cherry", 1, b"dark")],
            4096,
            false,
        );

        let (key, value) = table.internal_get(&seek_key(b"banana")).unwrap().unwrap();
        assert_eq!(extract_user_key(&key), b"banana");
        assert_eq!(value, b"yellow");

        // A missing key seeks to the next user key; the caller notices
        // the mismatch.
        let hit = table.internal_get(&seek_key(b"blueberry")).unwrap().unwrap();
        assert_eq!(extract_user_key(&hit.0), b"cherry");

        // Past the last key: no entry at all.
        assert!(table.internal_get(&seek_key(b"zzz")).unwrap().is_none());
    }

    #[test]
    fn test_filter_skips_absent_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.ldb");
        let table = build_table(&path, &[(b"only", 1, b"v")], 4096, true);

        assert!(table.internal_get(&seek_key(b"only")).unwrap().is_some());
        // Bloom filter rejects nearly all absent keys outright.
        let mut rejected = 0;
        for i in 0..100 {
            let probe = format!("absent{:03}", i);
            if table.internal_get(&seek_key(probe.as_bytes())).unwrap().is_none() {
                rejected += 1;
            }
        }
        assert!(rejected >= 95);
    }

    #[test]
    fn test_multi_block_iteration() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.ldb");
        let owned: Vec<(Vec<u8>, u64, Vec<u8>)> = (0..300)
            .map(|i| {
                (
                    format!("key{:04}", i).into_bytes(),
                    1,
                    format!("value{:04}", i).into_bytes(),
                )
            })
            .collect();
        let entries: Vec<(&[u8], u64, &[u8])> =
            owned.iter().map(|(k, s, v)| (k.as_slice(), *s, v.as_slice())).collect();
        let table = build_table(&path, &entries, 512, false);

        let mut iter = table.iter();
        iter.seek_to_first().unwrap();
        let mut count = 0;
        while iter.valid() {
            assert_eq!(
                extract_user_key(iter.key()),
                format!("key{:04}", count).as_bytes()
            );
            count += 1;
            iter.next().unwrap();
        }
        assert_eq!(count, 300);
    }

    #[test]
    fn test_iterator_seek() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.ldb");
        let owned: Vec<(Vec<u8>, u64, Vec<u8>)> = (0..200)
            .map(|i| (format!("key{:04}", i * 2).into_bytes(), 1, b"v".to_vec()))
            .collect();
        let entries: Vec<(&[u8], u64, &[u8])> =
            owned.iter().map(|(k, s, v)| (k.as_slice(), *s, v.as_slice())).collect();
        let table = build_table(&path, &entries, 256, false);

        // Seek to a present key.
        let mut iter = Arc::clone(&table).iter();
        iter.seek(&seek_key(b"key0100")).unwrap();
        assert!(iter.valid());
        assert_eq!(extract_user_key(iter.key()), b"key0100");

        // Seek between keys lands on the next one.
        let mut iter = Arc::clone(&table).iter();
        iter.seek(&seek_key(b"key0101")).unwrap();
        assert!(iter.valid());
        assert_eq!(extract_user_key(iter.key()), b"key0102");

        // Seek past the end.
        let mut iter = table.iter();
        iter.seek(&seek_key(b"zzz")).unwrap();
        assert!(!iter.valid());
    }

    #[test]
    fn test_block_cache_hit() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.ldb");
        let cache: Arc<BlockCache> = Arc::new(LruCache::new(1 << 20));

        let mut builder = TableBuilder::new(File::create(&path).unwrap(), icmp(), None, 4096);
        builder.add(&ikey(b"k", 1), b"v").unwrap();
        let size = builder.finish().unwrap();
        let table = Table::open(
            File::open(&path).unwrap(),
            7,
            size,
            icmp(),
            None,
            Some(Arc::clone(&cache)),
        )
        .unwrap();

        assert!(table.internal_get(&seek_key(b"k")).unwrap().is_some());
        assert!(!cache.is_empty());
        // Second read served from cache.
        assert!(table.internal_get(&seek_key(b"k")).unwrap().is_some());
    }

    #[test]
    fn test_corrupt_block_detected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.ldb");
        build_table(&path, &[(b"key", 1, b"value")], 4096, false);

        // Flip a byte inside the first (data) block.
        let mut data = std::fs::read(&path).unwrap();
        data[3] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        let size = std::fs::metadata(&path).unwrap().len();
        let table =
            Table::open(File::open(&path).unwrap(), 1, size, icmp(), None, None).unwrap();
        assert!(table.internal_get(&seek_key(b"key")).is_err());
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.ldb");
        std::fs::write(&path, b"not a table").unwrap();
        let size = std::fs::metadata(&path).unwrap().len();
        assert!(Table::open(File::open(&path).unwrap(), 1, size, icmp(), None, None).is_err());
    }
}
