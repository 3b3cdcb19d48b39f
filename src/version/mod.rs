//! Immutable snapshots of the on-disk level layout.
//!
//! A [`Version`] maps each of the seven levels to its table files.
//! Level 0 files may overlap and are read newest-first; levels 1 and
//! deeper hold disjoint, sorted ranges. Readers hold an `Arc` to the
//! version they snapshotted, which keeps every referenced file's
//! metadata (and hence the file itself, via the live-file scan) alive
//! until the read finishes.

pub mod edit;
pub mod set;

pub use edit::{NewFile, VersionEdit};
pub use set::VersionSet;

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{MAX_MEM_COMPACT_LEVEL, NUM_LEVELS};
use crate::error::Result;
use crate::memtable::{
    InternalKey, InternalKeyComparator, LookupKey, ParsedInternalKey, ValueType,
    MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK,
};
use crate::table_cache::TableCache;

/// Metadata for one table file.
#[derive(Debug)]
pub struct FileMetaData {
    /// File number; names the `.ldb` file.
    pub number: u64,
    /// Size in bytes.
    pub file_size: u64,
    /// Smallest internal key in the table.
    pub smallest: InternalKey,
    /// Largest internal key in the table.
    pub largest: InternalKey,
    /// Seeks this file may absorb before it is nominated for
    /// compaction. One disk seek costs about as much as compacting
    /// 16 KiB, so the budget scales with file size.
    allowed_seeks: AtomicI64,
}

impl FileMetaData {
    /// Creates metadata with the seek budget derived from file size.
    pub fn new(number: u64, file_size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        let allowed_seeks = (file_size / 16384).max(100) as i64;
        Self { number, file_size, smallest, largest, allowed_seeks: AtomicI64::new(allowed_seeks) }
    }

    /// Burns one seek from the budget; returns the remaining count.
    fn consume_seek(&self) -> i64 {
        self.allowed_seeks.fetch_sub(1, AtomicOrdering::Relaxed) - 1
    }
}

/// Read statistics from one lookup, fed back to nominate files for
/// seek-driven compaction.
#[derive(Default)]
pub struct GetStats {
    /// The first file read when the lookup had to touch more than one.
    pub seek_file: Option<(Arc<FileMetaData>, usize)>,
}

/// One immutable level layout.
pub struct Version {
    icmp: InternalKeyComparator,
    files: Vec<Vec<Arc<FileMetaData>>>,
    /// Level whose score [`set::VersionSet`] computed as highest, with
    /// that score. A score >= 1 means the level should compact.
    pub(crate) compaction_level: Option<usize>,
    pub(crate) compaction_score: f64,
    /// File nominated by exhausted seek budget, if any.
    pub(crate) file_to_compact: Mutex<Option<(Arc<FileMetaData>, usize)>>,
}

impl Version {
    pub(crate) fn new(icmp: InternalKeyComparator) -> Self {
        Self {
            icmp,
            files: vec![Vec::new(); NUM_LEVELS],
            compaction_level: None,
            compaction_score: -1.0,
            file_to_compact: Mutex::new(None),
        }
    }

    /// Files at `level`, ordered by smallest key (level >= 1) or
    /// unordered (level 0).
    pub fn files(&self, level: usize) -> &[Arc<FileMetaData>] {
        &self.files[level]
    }

    /// Number of files at `level`.
    pub fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    pub(crate) fn files_mut(&mut self) -> &mut Vec<Vec<Arc<FileMetaData>>> {
        &mut self.files
    }

    /// Looks up `key`, searching level 0 newest-first and then each
    /// deeper level. Returns the value, or `None` for absent or
    /// tombstoned keys, plus the seek statistics.
    pub fn get(
        &self,
        key: &LookupKey,
        table_cache: &TableCache,
    ) -> Result<(Option<Vec<u8>>, GetStats)> {
        let internal_key = key.internal_key();
        let user_key = key.user_key();
        let ucmp = self.icmp.user_comparator();
        let mut stats = GetStats::default();
        let mut files_read: Vec<(Arc<FileMetaData>, usize)> = Vec::new();

        let mut search =
            |file: &Arc<FileMetaData>, level: usize| -> Result<Option<Option<Vec<u8>>>> {
                files_read.push((Arc::clone(file), level));
                let entry = table_cache.get(file.number, file.file_size, internal_key)?;
                if let Some((entry_key, value)) = entry {
                    if let Ok(parsed) = ParsedInternalKey::decode(&entry_key) {
                        if ucmp.compare(parsed.user_key, user_key) == Ordering::Equal {
                            return match parsed.value_type {
                                ValueType::Value => Ok(Some(Some(value))),
                                ValueType::Deletion => Ok(Some(None)),
                            };
                        }
                    }
                }
                Ok(None)
            };

        let mut outcome = None;

        // Level 0: every overlapping file, newest first.
        let mut level0: Vec<&Arc<FileMetaData>> = self.files[0]
            .iter()
            .filter(|f| {
                ucmp.compare(user_key, f.smallest.user_key()) != Ordering::Less
                    && ucmp.compare(user_key, f.largest.user_key()) != Ordering::Greater
            })
            .collect();
        level0.sort_by(|a, b| b.number.cmp(&a.number));
        for file in level0 {
            if let Some(result) = search(file, 0)? {
                outcome = Some(result);
                break;
            }
        }

        // Deeper levels: at most one candidate per level.
        if outcome.is_none() {
            for level in 1..NUM_LEVELS {
                let files = &self.files[level];
                if files.is_empty() {
                    continue;
                }
                let index = find_file(&self.icmp, files, internal_key);
                if index >= files.len() {
                    continue;
                }
                let file = &files[index];
                if ucmp.compare(user_key, file.smallest.user_key()) == Ordering::Less {
                    continue;
                }
                if let Some(result) = search(file, level)? {
                    outcome = Some(result);
                    break;
                }
            }
        }

        // Touching a second file means the first absorbed a wasted
        // seek; charge it.
        if files_read.len() >= 2 {
            stats.seek_file = Some(files_read.swap_remove(0));
        }

        Ok((outcome.unwrap_or(None), stats))
    }

    /// Applies seek statistics; returns true if a file's budget ran out
    /// and compaction should be scheduled.
    pub fn update_stats(&self, stats: GetStats) -> bool {
        if let Some((file, level)) = stats.seek_file {
            if file.consume_seek() <= 0 {
                let mut nominated = self.file_to_compact.lock();
                if nominated.is_none() {
                    *nominated = Some((file, level));
                    return true;
                }
            }
        }
        false
    }

    /// True if a size score or an exhausted seek budget calls for
    /// compaction.
    pub fn needs_compaction(&self) -> bool {
        self.compaction_score >= 1.0 || self.file_to_compact.lock().is_some()
    }

    /// True if any file at `level` overlaps `[smallest_user_key,
    /// largest_user_key]` (either bound may be open).
    pub fn overlap_in_level(
        &self,
        level: usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key: Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    /// Level at which a new memtable flush covering the given range
    /// should land. The output goes as deep as it can without
    /// overlapping existing data, so short-lived overwrites avoid
    /// churning through level 0.
    pub fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key: &[u8],
        max_grandparent_overlap_bytes: u64,
    ) -> usize {
        if self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            return 0;
        }
        let start = InternalKey::new(smallest_user_key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let limit = InternalKey::new(largest_user_key, 0, ValueType::Value);
        let mut level = 0;
        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest_user_key), Some(largest_user_key)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let overlaps = self.get_overlapping_inputs(level + 2, Some(&start), Some(&limit));
                let overlap_bytes: u64 = overlaps.iter().map(|f| f.file_size).sum();
                if overlap_bytes > max_grandparent_overlap_bytes {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// All files at `level` whose key range intersects `[begin, end]`
    /// (either bound may be open). At level 0 the range is grown to the
    /// union of every overlapping file's bounds, transitively, because
    /// level-0 files overlap each other.
    pub fn get_overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Vec<Arc<FileMetaData>> {
        let ucmp = self.icmp.user_comparator();
        let mut user_begin = begin.map(|k| k.user_key().to_vec());
        let mut user_end = end.map(|k| k.user_key().to_vec());

        let mut inputs: Vec<Arc<FileMetaData>> = Vec::new();
        let mut i = 0;
        while i < self.files[level].len() {
            let file = &self.files[level][i];
            i += 1;
            let file_start = file.smallest.user_key();
            let file_limit = file.largest.user_key();

            if let Some(begin) = &user_begin {
                if ucmp.compare(file_limit, begin) == Ordering::Less {
                    continue;
                }
            }
            if let Some(end) = &user_end {
                if ucmp.compare(file_start, end) == Ordering::Greater {
                    continue;
                }
            }

            inputs.push(Arc::clone(file));
            if level == 0 {
                // An overlapping level-0 file may widen the range; restart
                // with the widened bounds so every transitive overlap is
                // caught.
                let mut widened = false;
                if let Some(begin) = &user_begin {
                    if ucmp.compare(file_start, begin) == Ordering::Less {
                        user_begin = Some(file_start.to_vec());
                        widened = true;
                    }
                }
                if let Some(end) = &user_end {
                    if ucmp.compare(file_limit, end) == Ordering::Greater {
                        user_end = Some(file_limit.to_vec());
                        widened = true;
                    }
                }
                if widened {
                    inputs.clear();
                    i = 0;
                }
            }
        }
        inputs
    }

    /// Total bytes at `level`.
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.files[level].iter().map(|f| f.file_size).sum()
    }
}

/// Index of the first file whose largest key is >= `internal_key`
/// (files must be sorted and disjoint; levels 1+).
pub(crate) fn find_file(
    icmp: &InternalKeyComparator,
    files: &[Arc<FileMetaData>],
    internal_key: &[u8],
) -> usize {
    let mut left = 0usize;
    let mut right = files.len();
    while left < right {
        let mid = (left + right) / 2;
        if icmp.compare(files[mid].largest.encoded(), internal_key) == Ordering::Less {
            left = mid + 1;
        } else {
            right = mid;
        }
    }
    left
}

/// True if some file in `files` overlaps `[smallest, largest]`.
/// `disjoint` promises sorted, non-overlapping files and enables the
/// binary-search fast path.
pub(crate) fn some_file_overlaps_range(
    icmp: &InternalKeyComparator,
    disjoint: bool,
    files: &[Arc<FileMetaData>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key: Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator();
    if !disjoint {
        for file in files {
            let after = smallest_user_key
                .map(|k| ucmp.compare(k, file.largest.user_key()) == Ordering::Greater)
                .unwrap_or(false);
            let before = largest_user_key
                .map(|k| ucmp.compare(k, file.smallest.user_key()) == Ordering::Less)
                .unwrap_or(false);
            if !after && !before {
                return true;
            }
        }
        return false;
    }

    let index = match smallest_user_key {
        Some(key) => {
            let small = InternalKey::new(key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            find_file(icmp, files, small.encoded())
        }
        None => 0,
    };
    if index >= files.len() {
        return false;
    }
    // Not past the end; overlap unless the range ends before the file
    // starts.
    !largest_user_key
        .map(|k| ucmp.compare(k, files[index].smallest.user_key()) == Ordering::Less)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn meta(number: u64, smallest: &[u8], largest: &[u8]) -> Arc<FileMetaData> {
        Arc::new(FileMetaData::new(
            number,
            10_000,
            InternalKey::new(smallest, 100, ValueType::Value),
            InternalKey::new(largest, 100, ValueType::Value),
        ))
    }

    fn version_with(files: Vec<(usize, Arc<FileMetaData>)>) -> Version {
        let mut version = Version::new(icmp());
        for (level, file) in files {
            version.files_mut()[level].push(file);
        }
        for level in 1..NUM_LEVELS {
            version.files_mut()[level]
                .sort_by(|a, b| a.smallest.encoded().cmp(b.smallest.encoded()));
        }
        version
    }

    #[test]
    fn test_find_file() {
        let cmp = icmp();
        let files = vec![meta(1, b"c", b"e"), meta(2, b"g", b"i"), meta(3, b"k", b"m")];
        let probe = |key: &[u8]| {
            let ik = InternalKey::new(key, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
            find_file(&cmp, &files, ik.encoded())
        };
        assert_eq!(probe(b"a"), 0);
        assert_eq!(probe(b"d"), 0);
        assert_eq!(probe(b"f"), 1);
        assert_eq!(probe(b"i"), 1);
        assert_eq!(probe(b"j"), 2);
        assert_eq!(probe(b"z"), 3);
    }

    #[test]
    fn test_overlap_in_level_disjoint() {
        let version = version_with(vec![
            (1, meta(1, b"c", b"e")),
            (1, meta(2, b"g", b"i")),
        ]);
        assert!(version.overlap_in_level(1, Some(b"d"), Some(b"f")));
        assert!(version.overlap_in_level(1, Some(b"a"), Some(b"c")));
        assert!(!version.overlap_in_level(1, Some(b"ea"), Some(b"f")));
        assert!(!version.overlap_in_level(1, Some(b"j"), Some(b"z")));
        assert!(version.overlap_in_level(1, None, Some(b"d")));
        assert!(version.overlap_in_level(1, Some(b"h"), None));
        assert!(!version.overlap_in_level(2, Some(b"a"), Some(b"z")));
    }

    #[test]
    fn test_overlap_in_level_zero() {
        let version = version_with(vec![
            (0, meta(1, b"a", b"m")),
            (0, meta(2, b"k", b"z")),
        ]);
        assert!(version.overlap_in_level(0, Some(b"l"), Some(b"l")));
        assert!(version.overlap_in_level(0, Some(b"x"), Some(b"y")));
        assert!(!version.overlap_in_level(0, Some(b"zz"), None));
    }

    #[test]
    fn test_get_overlapping_inputs_level0_transitive() {
        // File 2 overlaps file 1; file 3 overlaps file 2 but not the
        // original range. All three must be selected.
        let version = version_with(vec![
            (0, meta(1, b"a", b"f")),
            (0, meta(2, b"e", b"m")),
            (0, meta(3, b"l", b"t")),
            (0, meta(4, b"x", b"z")),
        ]);
        let begin = InternalKey::new(b"b", MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let end = InternalKey::new(b"c", 0, ValueType::Value);
        let inputs = version.get_overlapping_inputs(0, Some(&begin), Some(&end));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn test_get_overlapping_inputs_disjoint_level() {
        let version = version_with(vec![
            (1, meta(1, b"a", b"c")),
            (1, meta(2, b"e", b"g")),
            (1, meta(3, b"i", b"k")),
        ]);
        let begin = InternalKey::new(b"f", MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK);
        let end = InternalKey::new(b"j", 0, ValueType::Value);
        let inputs = version.get_overlapping_inputs(1, Some(&begin), Some(&end));
        let numbers: Vec<u64> = inputs.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[test]
    fn test_pick_level_for_memtable_output() {
        // No overlap anywhere: goes down to the cap.
        let version = version_with(vec![]);
        assert_eq!(
            version.pick_level_for_memtable_output(b"a", b"b", 20 * 1024 * 1024),
            MAX_MEM_COMPACT_LEVEL
        );

        // Overlap at level 0 pins the output at 0.
        let version = version_with(vec![(0, meta(1, b"a", b"z"))]);
        assert_eq!(version.pick_level_for_memtable_output(b"b", b"c", 20 * 1024 * 1024), 0);

        // Overlap at level 1 stops the descent at 0.
        let version = version_with(vec![(1, meta(1, b"a", b"z"))]);
        assert_eq!(version.pick_level_for_memtable_output(b"b", b"c", 20 * 1024 * 1024), 0);

        // Overlap at level 2 stops the descent at 1.
        let version = version_with(vec![(2, meta(1, b"a", b"z"))]);
        assert_eq!(version.pick_level_for_memtable_output(b"b", b"c", 20 * 1024 * 1024), 1);
    }

    #[test]
    fn test_seek_budget_nominates_file() {
        let file = meta(9, b"a", b"z");
        let version = version_with(vec![(1, Arc::clone(&file))]);
        // Exhaust the budget (100 for small files).
        for _ in 0..99 {
            let triggered = version.update_stats(GetStats {
                seek_file: Some((Arc::clone(&file), 1)),
            });
            assert!(!triggered);
        }
        let triggered = version.update_stats(GetStats {
            seek_file: Some((Arc::clone(&file), 1)),
        });
        assert!(triggered);
        assert!(version.needs_compaction());
    }
}
