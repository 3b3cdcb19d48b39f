//! The set of live versions and the manifest that persists them.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use log::{info, warn};

use crate::compaction::{
    expanded_compaction_byte_size_limit, max_bytes_for_level, Compaction,
};
use crate::config::{L0_COMPACTION_TRIGGER, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::filename::{
    current_file_name, descriptor_file_name, parse_file_name, set_current_file, FileType,
};
use crate::memtable::{InternalKey, InternalKeyComparator, SequenceNumber};
use crate::table_cache::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::{FileMetaData, Version};
use crate::wal::{LogReader, LogWriter, Reporter};

/// Owns the live versions, the metadata counters, and the manifest.
pub struct VersionSet {
    dbname: PathBuf,
    icmp: InternalKeyComparator,
    #[allow(dead_code)]
    table_cache: Arc<TableCache>,
    max_file_size: usize,
    reuse_logs: bool,

    next_file_number: u64,
    manifest_file_number: u64,
    last_sequence: SequenceNumber,
    log_number: u64,
    prev_log_number: u64,

    descriptor_log: Option<LogWriter>,
    /// Live versions; the last entry is always `current`. Entries whose
    /// only reference is this list are pruned as new versions land.
    versions: Vec<Arc<Version>>,
    current: Arc<Version>,
    /// Per level, the encoded internal key where the next size
    /// compaction should start (empty = start of level).
    compact_pointer: Vec<Vec<u8>>,
}

/// A prepared manifest commit.
///
/// Built under the mutex, written to disk with the mutex released, then
/// installed (or discarded) with the mutex re-held.
pub struct ManifestWork {
    version: Version,
    record: Vec<u8>,
    snapshot_record: Option<Vec<u8>>,
    /// Set when this commit must create a fresh manifest and repoint
    /// CURRENT at it.
    new_manifest_path: Option<PathBuf>,
    manifest_number: u64,
    log_number: u64,
    prev_log_number: u64,
}

impl ManifestWork {
    /// Performs the file I/O of the commit. Call without the mutex.
    pub fn perform_io(&self, descriptor_log: &mut Option<LogWriter>, dbname: &Path) -> Result<()> {
        if descriptor_log.is_none() {
            let path = self.new_manifest_path.as_ref().expect("fresh manifest path");
            let file = File::create(path)?;
            let mut writer = LogWriter::new(file);
            // The first record of a manifest is a snapshot of the state
            // it was branched from; later records are deltas.
            writer.add_record(self.snapshot_record.as_ref().expect("snapshot record"))?;
            *descriptor_log = Some(writer);
        }

        let writer = descriptor_log.as_mut().unwrap();
        writer.add_record(&self.record)?;
        writer.sync()?;

        if self.new_manifest_path.is_some() {
            set_current_file(dbname, self.manifest_number)?;
        }
        Ok(())
    }
}

impl VersionSet {
    /// Creates a set with a single empty version.
    pub fn new(
        dbname: PathBuf,
        icmp: InternalKeyComparator,
        table_cache: Arc<TableCache>,
        max_file_size: usize,
        reuse_logs: bool,
    ) -> Self {
        let current = Arc::new(Version::new(icmp.clone()));
        Self {
            dbname,
            icmp,
            table_cache,
            max_file_size,
            reuse_logs,
            next_file_number: 2,
            manifest_file_number: 0,
            last_sequence: 0,
            log_number: 0,
            prev_log_number: 0,
            descriptor_log: None,
            versions: vec![Arc::clone(&current)],
            current,
            compact_pointer: vec![Vec::new(); NUM_LEVELS],
        }
    }

    /// The most recently installed version.
    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    /// The internal-key comparator.
    pub fn icmp(&self) -> &InternalKeyComparator {
        &self.icmp
    }

    /// Allocates a fresh file number.
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Returns `number` to the counter if it was the last one handed
    /// out and was never used.
    pub fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    /// Bumps the counter past an externally observed file number.
    pub fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// The file number the next manifest will use.
    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    /// The newest sequence number ever applied.
    pub fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    /// Advances the sequence watermark.
    pub fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    /// Log file in effect for the active memtable.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// Log file of the immutable memtable still being flushed (0 when
    /// none).
    pub fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    /// True if a size score or seek budget calls for compaction.
    pub fn needs_compaction(&self) -> bool {
        self.current.needs_compaction()
    }

    /// File count at `level` in the current version.
    pub fn num_level_files(&self, level: usize) -> usize {
        self.current.num_files(level)
    }

    /// Unions the file numbers referenced by every live version.
    pub fn add_live_files(&mut self, live: &mut HashSet<u64>) {
        self.prune_versions();
        for version in &self.versions {
            for level in 0..NUM_LEVELS {
                for file in version.files(level) {
                    live.insert(file.number);
                }
            }
        }
    }

    fn prune_versions(&mut self) {
        let current = Arc::clone(&self.current);
        // One reference is the list's own; more means a reader still
        // holds the version and its files must stay live.
        self.versions
            .retain(|v| Arc::strong_count(v) > 1 || Arc::ptr_eq(v, &current));
    }

    /// Builds the commit for `edit`: fills in missing counters, applies
    /// it to the current version, and computes the new version's
    /// compaction score. The caller performs the I/O (ideally with the
    /// mutex released) and then installs with
    /// [`VersionSet::finish_apply`].
    pub fn prepare_apply(&mut self, edit: &mut VersionEdit) -> ManifestWork {
        match edit.log_number {
            Some(number) => {
                debug_assert!(number >= self.log_number);
                debug_assert!(number < self.next_file_number);
            }
            None => edit.set_log_number(self.log_number),
        }
        if edit.prev_log_number.is_none() {
            edit.set_prev_log_number(self.prev_log_number);
        }
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);

        let mut version = Version::new(self.icmp.clone());
        {
            let mut builder = VersionBuilder::new(self.icmp.clone(), self.current());
            builder.apply(edit, &mut self.compact_pointer);
            builder.save_to(&mut version);
        }
        finalize(&mut version);

        let mut record = BytesMut::new();
        edit.encode_to(&mut record);

        // First commit through this set: a manifest file must be
        // created and CURRENT pointed at it.
        let (snapshot_record, new_manifest_path) = if self.descriptor_log.is_none() {
            let snapshot = self.snapshot_edit();
            let mut buf = BytesMut::new();
            snapshot.encode_to(&mut buf);
            (
                Some(buf.to_vec()),
                Some(descriptor_file_name(&self.dbname, self.manifest_file_number)),
            )
        } else {
            (None, None)
        };

        ManifestWork {
            version,
            record: record.to_vec(),
            snapshot_record,
            new_manifest_path,
            manifest_number: self.manifest_file_number,
            log_number: edit.log_number.unwrap(),
            prev_log_number: edit.prev_log_number.unwrap(),
        }
    }

    /// Takes the manifest writer for the I/O phase.
    pub fn take_descriptor_log(&mut self) -> Option<LogWriter> {
        self.descriptor_log.take()
    }

    /// Installs the outcome of a prepared commit. On success the new
    /// version becomes current; on failure a freshly created manifest
    /// is deleted and the previous version stays current.
    pub fn finish_apply(
        &mut self,
        work: ManifestWork,
        descriptor_log: Option<LogWriter>,
        io_result: Result<()>,
    ) -> Result<()> {
        match io_result {
            Ok(()) => {
                self.descriptor_log = descriptor_log;
                self.log_number = work.log_number;
                self.prev_log_number = work.prev_log_number;
                self.append_version(work.version);
                Ok(())
            }
            Err(e) => {
                if let Some(path) = &work.new_manifest_path {
                    warn!("MANIFEST write failed: {}", e);
                    drop(descriptor_log);
                    let _ = std::fs::remove_file(path);
                } else {
                    self.descriptor_log = descriptor_log;
                }
                Err(e)
            }
        }
    }

    /// Convenience single-threaded commit (open and tests): prepare,
    /// write, install.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        let work = self.prepare_apply(edit);
        let mut descriptor_log = self.take_descriptor_log();
        let dbname = self.dbname.clone();
        let io_result = work.perform_io(&mut descriptor_log, &dbname);
        self.finish_apply(work, descriptor_log, io_result)
    }

    fn append_version(&mut self, version: Version) {
        let version = Arc::new(version);
        self.current = Arc::clone(&version);
        self.versions.push(version);
        self.prune_versions();
    }

    /// An edit reproducing the entire current state; the first record
    /// of every manifest.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.icmp.user_comparator().name());

        for (level, pointer) in self.compact_pointer.iter().enumerate() {
            if !pointer.is_empty() {
                if let Ok(key) = InternalKey::decode_from(pointer) {
                    edit.set_compact_pointer(level, key);
                }
            }
        }
        for level in 0..NUM_LEVELS {
            for file in self.current.files(level) {
                edit.add_file(
                    level,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
            }
        }
        edit
    }

    /// Restores state from CURRENT and the manifest it names. Returns
    /// true if a new manifest should be written (i.e. the old one is
    /// not being reused).
    pub fn recover(&mut self) -> Result<bool> {
        let current_contents = std::fs::read_to_string(current_file_name(&self.dbname))?;
        if current_contents.is_empty() || !current_contents.ends_with('\n') {
            return Err(Error::corruption("CURRENT file does not end with newline"));
        }
        let manifest_name = current_contents.trim_end_matches('\n').to_string();
        let manifest_path = self.dbname.join(&manifest_name);

        let manifest_file = File::open(&manifest_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::corruption2("CURRENT points to a non-existent file", manifest_name.clone())
            } else {
                Error::Io(e)
            }
        })?;

        struct FirstError {
            error: Option<Error>,
        }
        impl Reporter for FirstError {
            fn corruption(&mut self, _bytes: u64, reason: &str) {
                if self.error.is_none() {
                    self.error = Some(Error::corruption(reason.to_string()));
                }
            }
        }

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file = None;
        let mut last_sequence = None;
        let mut builder = VersionBuilder::new(self.icmp.clone(), self.current());
        let mut read_records = 0;

        let mut reporter = FirstError { error: None };
        {
            let mut reader =
                LogReader::new(manifest_file, Some(&mut reporter), true, 0);
            while let Some(record) = reader.read_record() {
                read_records += 1;
                let edit = VersionEdit::decode_from(&record)?;
                if let Some(name) = &edit.comparator {
                    if name != self.icmp.user_comparator().name() {
                        return Err(Error::InvalidArgument(format!(
                            "{} does not match existing comparator {}",
                            name,
                            self.icmp.user_comparator().name()
                        )));
                    }
                }
                builder.apply(&edit, &mut self.compact_pointer);

                if let Some(n) = edit.log_number {
                    log_number = Some(n);
                }
                if let Some(n) = edit.prev_log_number {
                    prev_log_number = Some(n);
                }
                if let Some(n) = edit.next_file_number {
                    next_file = Some(n);
                }
                if let Some(n) = edit.last_sequence {
                    last_sequence = Some(n);
                }
            }
        }
        if let Some(error) = reporter.error {
            return Err(error);
        }

        let next_file = next_file
            .ok_or_else(|| Error::corruption("no meta-nextfile entry in descriptor"))?;
        let log_number = log_number
            .ok_or_else(|| Error::corruption("no meta-lognumber entry in descriptor"))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::corruption("no last-sequence-number entry in descriptor"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.mark_file_number_used(prev_log_number);
        self.mark_file_number_used(log_number);

        let mut version = Version::new(self.icmp.clone());
        builder.save_to(&mut version);
        finalize(&mut version);
        self.append_version(version);
        self.manifest_file_number = next_file;
        self.next_file_number = next_file + 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        info!(
            "recovered manifest {} ({} records, last sequence {})",
            manifest_name, read_records, last_sequence
        );

        Ok(!self.reuse_manifest(&manifest_path, &manifest_name))
    }

    fn reuse_manifest(&mut self, manifest_path: &Path, manifest_name: &str) -> bool {
        if !self.reuse_logs {
            return false;
        }
        let (manifest_number, file_type) = match parse_file_name(manifest_name) {
            Some(parsed) => parsed,
            None => return false,
        };
        if file_type != FileType::Descriptor {
            return false;
        }
        let manifest_size = match std::fs::metadata(manifest_path) {
            Ok(meta) => meta.len(),
            Err(_) => return false,
        };
        if manifest_size >= self.max_file_size as u64 {
            return false;
        }

        let file = match OpenOptions::new().append(true).open(manifest_path) {
            Ok(file) => file,
            Err(e) => {
                warn!("reuse MANIFEST: {}", e);
                return false;
            }
        };

        info!("reusing MANIFEST {}", manifest_path.display());
        self.descriptor_log = Some(LogWriter::with_dest_length(file, manifest_size));
        self.manifest_file_number = manifest_number;
        true
    }

    /// Picks the next compaction: the highest-scoring level when the
    /// score reaches 1, else a file nominated by its seek budget.
    pub fn pick_compaction(&mut self) -> Option<Compaction> {
        let current = self.current();
        let size_compaction = current.compaction_score >= 1.0;
        let seek_compaction = current.file_to_compact.lock().clone();

        let mut compaction = if size_compaction {
            let level = current.compaction_level.expect("score implies level");
            debug_assert!(level + 1 < NUM_LEVELS);
            let mut c = Compaction::new(level, self.max_file_size, self.icmp.clone());

            // Resume after the last compacted key on this level; wrap
            // to the start once past the end.
            for file in current.files(level) {
                if self.compact_pointer[level].is_empty()
                    || self
                        .icmp
                        .compare(file.largest.encoded(), &self.compact_pointer[level])
                        == Ordering::Greater
                {
                    c.inputs[0].push(Arc::clone(file));
                    break;
                }
            }
            if c.inputs[0].is_empty() {
                match current.files(level).first() {
                    Some(file) => c.inputs[0].push(Arc::clone(file)),
                    None => return None,
                }
            }

            if level == 0 {
                // Level-0 files overlap each other; widen to the full
                // transitive overlap set.
                let (smallest, largest) = Compaction::range_of(&self.icmp, &[&c.inputs[0]]);
                c.inputs[0] =
                    current.get_overlapping_inputs(0, Some(&smallest), Some(&largest));
                debug_assert!(!c.inputs[0].is_empty());
            }
            c
        } else if let Some((file, level)) = seek_compaction {
            let mut c = Compaction::new(level, self.max_file_size, self.icmp.clone());
            c.inputs[0].push(file);
            c
        } else {
            return None;
        };

        compaction.set_input_version(Arc::clone(&current));
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// Builds a compaction covering `[begin, end]` at `level` for
    /// manual compaction; `None` when the range is empty there.
    pub fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end: Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.get_overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Avoid one enormous manual compaction at sorted levels; stop
        // adding inputs past one target file size worth of data.
        if level > 0 {
            let limit = self.max_file_size as u64;
            let mut total = 0u64;
            for (i, file) in inputs.iter().enumerate() {
                total += file.file_size;
                if total >= limit {
                    inputs.truncate(i + 1);
                    break;
                }
            }
        }

        let mut compaction = Compaction::new(level, self.max_file_size, self.icmp.clone());
        compaction.inputs[0] = inputs;
        compaction.set_input_version(current);
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    fn setup_other_inputs(&mut self, c: &mut Compaction) {
        let current = self.current();
        let level = c.level();

        let (smallest, largest) = Compaction::range_of(&self.icmp, &[&c.inputs[0]]);
        c.inputs[1] = current.get_overlapping_inputs(level + 1, Some(&smallest), Some(&largest));

        let (mut all_start, mut all_limit) =
            Compaction::range_of(&self.icmp, &[&c.inputs[0], &c.inputs[1]]);

        // Grow the level-L set when that pulls in no extra level-L+1
        // data: more input for the same merge cost.
        if !c.inputs[1].is_empty() {
            let expanded0 =
                current.get_overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            let inputs1_size: u64 = c.inputs[1].iter().map(|f| f.file_size).sum();
            let expanded0_size: u64 = expanded0.iter().map(|f| f.file_size).sum();
            if expanded0.len() > c.inputs[0].len()
                && inputs1_size + expanded0_size
                    < expanded_compaction_byte_size_limit(self.max_file_size)
            {
                let (new_start, new_limit) = Compaction::range_of(&self.icmp, &[&expanded0]);
                let expanded1 = current.get_overlapping_inputs(
                    level + 1,
                    Some(&new_start),
                    Some(&new_limit),
                );
                if expanded1.len() == c.inputs[1].len() {
                    info!(
                        "expanding level-{} compaction: {}+{} to {}+{} files",
                        level,
                        c.inputs[0].len(),
                        c.inputs[1].len(),
                        expanded0.len(),
                        expanded1.len()
                    );
                    c.inputs[0] = expanded0;
                    c.inputs[1] = expanded1;
                    let range =
                        Compaction::range_of(&self.icmp, &[&c.inputs[0], &c.inputs[1]]);
                    all_start = range.0;
                    all_limit = range.1;
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            c.grandparents =
                current.get_overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Future compactions of this level resume past this range even
        // if this one later fails; re-trying the same range is safe.
        let (_, largest) =
            Compaction::range_of(&self.icmp, &[&c.inputs[0]]);
        self.compact_pointer[level] = largest.encoded().to_vec();
        c.edit.set_compact_pointer(level, largest);
    }
}

/// Computes the level most in need of compaction and its score.
fn finalize(version: &mut Version) {
    let mut best_level = None;
    let mut best_score = -1.0f64;

    for level in 0..NUM_LEVELS - 1 {
        let score = if level == 0 {
            // File count, not bytes: with a small write buffer too many
            // tiny level-0 files would otherwise accumulate, and every
            // read merges across all of them.
            version.num_files(0) as f64 / L0_COMPACTION_TRIGGER as f64
        } else {
            version.level_bytes(level) as f64 / max_bytes_for_level(level)
        };
        if score > best_score {
            best_level = Some(level);
            best_score = score;
        }
    }

    version.compaction_level = best_level;
    version.compaction_score = best_score;
}

/// Accumulates edits over a base version.
struct VersionBuilder {
    icmp: InternalKeyComparator,
    base: Arc<Version>,
    deleted: Vec<HashSet<u64>>,
    added: Vec<Vec<Arc<FileMetaData>>>,
}

impl VersionBuilder {
    fn new(icmp: InternalKeyComparator, base: Arc<Version>) -> Self {
        Self {
            icmp,
            base,
            deleted: vec![HashSet::new(); NUM_LEVELS],
            added: vec![Vec::new(); NUM_LEVELS],
        }
    }

    fn apply(&mut self, edit: &VersionEdit, compact_pointer: &mut [Vec<u8>]) {
        for (level, key) in &edit.compact_pointers {
            compact_pointer[*level] = key.encoded().to_vec();
        }
        for (level, number) in &edit.deleted_files {
            self.deleted[*level].insert(*number);
        }
        for (level, file) in &edit.new_files {
            let meta = Arc::new(FileMetaData::new(
                file.number,
                file.file_size,
                file.smallest.clone(),
                file.largest.clone(),
            ));
            self.deleted[*level].remove(&file.number);
            self.added[*level].push(meta);
        }
    }

    fn save_to(&mut self, version: &mut Version) {
        let by_smallest = |icmp: &InternalKeyComparator,
                           a: &Arc<FileMetaData>,
                           b: &Arc<FileMetaData>| {
            icmp.compare_keys(&a.smallest, &b.smallest)
                .then_with(|| a.number.cmp(&b.number))
        };

        for level in 0..NUM_LEVELS {
            let mut added = std::mem::take(&mut self.added[level]);
            added.sort_by(|a, b| by_smallest(&self.icmp, a, b));

            // Merge base and added in sorted order, dropping deleted
            // files.
            let base_files = self.base.files(level);
            let mut merged: Vec<Arc<FileMetaData>> =
                Vec::with_capacity(base_files.len() + added.len());
            let mut base_iter = base_files.iter().peekable();
            for add in added {
                while let Some(base) = base_iter.peek() {
                    if by_smallest(&self.icmp, base, &add) == Ordering::Less {
                        merged.push(Arc::clone(base_iter.next().unwrap()));
                    } else {
                        break;
                    }
                }
                merged.push(add);
            }
            merged.extend(base_iter.cloned());
            merged.retain(|f| !self.deleted[level].contains(&f.number));

            if level > 0 {
                // Sorted levels must stay disjoint.
                debug_assert!(merged.windows(2).all(|pair| {
                    self.icmp
                        .compare_keys(&pair[0].largest, &pair[1].smallest)
                        == Ordering::Less
                }));
            }
            version.files_mut()[level] = merged;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::memtable::ValueType;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn new_set(dir: &Path) -> VersionSet {
        let cache = Arc::new(TableCache::new(dir.to_path_buf(), icmp(), None, None, 100));
        VersionSet::new(dir.to_path_buf(), icmp(), cache, 2 << 20, false)
    }

    fn ikey(user_key: &[u8], seq: u64) -> InternalKey {
        InternalKey::new(user_key, seq, ValueType::Value)
    }

    #[test]
    fn test_file_number_allocation() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut set = new_set(dir.path());
        assert_eq!(set.new_file_number(), 2);
        assert_eq!(set.new_file_number(), 3);
        set.reuse_file_number(3);
        assert_eq!(set.new_file_number(), 3);
        set.mark_file_number_used(10);
        assert_eq!(set.new_file_number(), 11);
    }

    #[test]
    fn test_log_and_apply_then_recover() {
        let dir = tempfile::TempDir::new().unwrap();

        {
            let mut set = new_set(dir.path());
            // The first manifest gets number 1 by convention.
            set.manifest_file_number = 1;
            set.mark_file_number_used(1);

            set.set_last_sequence(77);
            let mut edit = VersionEdit::new();
            edit.set_comparator_name("siltdb.BytewiseComparator");
            edit.set_log_number(0);
            edit.add_file(0, 5, 1234, ikey(b"a", 10), ikey(b"m", 20));
            edit.add_file(2, 6, 5678, ikey(b"c", 1), ikey(b"d", 2));
            set.log_and_apply(&mut edit).unwrap();

            assert_eq!(set.current().num_files(0), 1);
            assert_eq!(set.current().num_files(2), 1);
        }

        {
            let mut set = new_set(dir.path());
            let save_manifest = set.recover().unwrap();
            assert!(save_manifest);
            assert_eq!(set.current().num_files(0), 1);
            assert_eq!(set.current().num_files(2), 1);
            assert_eq!(set.last_sequence(), 77);
            assert_eq!(set.current().files(0)[0].number, 5);
        }
    }

    #[test]
    fn test_recover_rejects_wrong_comparator() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let mut set = new_set(dir.path());
            set.manifest_file_number = 1;
            let mut edit = VersionEdit::new();
            edit.set_comparator_name("someone-elses-order");
            edit.set_log_number(0);
            edit.set_last_sequence(0);
            set.log_and_apply(&mut edit).unwrap();
        }
        let mut set = new_set(dir.path());
        let err = set.recover().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{}", err);
    }

    #[test]
    fn test_recover_requires_counters() {
        let dir = tempfile::TempDir::new().unwrap();
        // Hand-write a manifest whose single edit has no counters.
        let mut edit = VersionEdit::new();
        edit.set_comparator_name("siltdb.BytewiseComparator");
        let mut buf = BytesMut::new();
        edit.encode_to(&mut buf);
        let file = File::create(descriptor_file_name(dir.path(), 1)).unwrap();
        let mut writer = LogWriter::new(file);
        writer.add_record(&buf).unwrap();
        writer.sync().unwrap();
        set_current_file(dir.path(), 1).unwrap();

        let mut set = new_set(dir.path());
        let err = set.recover().unwrap_err();
        assert!(err.is_corruption(), "{}", err);
    }

    #[test]
    fn test_deleted_files_drop_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut set = new_set(dir.path());
        set.manifest_file_number = 1;

        let mut edit = VersionEdit::new();
        edit.set_log_number(0);
        edit.set_last_sequence(1);
        edit.add_file(1, 7, 100, ikey(b"a", 1), ikey(b"c", 1));
        edit.add_file(1, 8, 100, ikey(b"e", 1), ikey(b"g", 1));
        set.log_and_apply(&mut edit).unwrap();
        assert_eq!(set.current().num_files(1), 2);

        let mut edit = VersionEdit::new();
        edit.remove_file(1, 7);
        set.log_and_apply(&mut edit).unwrap();
        let files = set.current().files(1).to_vec();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].number, 8);
    }

    #[test]
    fn test_live_files_spans_held_versions() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut set = new_set(dir.path());
        set.manifest_file_number = 1;

        let mut edit = VersionEdit::new();
        edit.set_log_number(0);
        edit.set_last_sequence(1);
        edit.add_file(1, 7, 100, ikey(b"a", 1), ikey(b"c", 1));
        set.log_and_apply(&mut edit).unwrap();

        // A reader pins the version holding file 7.
        let pinned = set.current();

        let mut edit = VersionEdit::new();
        edit.remove_file(1, 7);
        edit.add_file(1, 8, 100, ikey(b"a", 1), ikey(b"c", 1));
        set.log_and_apply(&mut edit).unwrap();

        let mut live = HashSet::new();
        set.add_live_files(&mut live);
        assert!(live.contains(&7), "pinned version keeps file 7 live");
        assert!(live.contains(&8));

        drop(pinned);
        let mut live = HashSet::new();
        set.add_live_files(&mut live);
        assert!(!live.contains(&7), "released version frees file 7");
        assert!(live.contains(&8));
    }

    #[test]
    fn test_finalize_scores() {
        let mut version = Version::new(icmp());
        // 4 level-0 files reach the trigger exactly.
        for i in 0..4 {
            version.files_mut()[0].push(Arc::new(FileMetaData::new(
                i,
                1000,
                ikey(b"a", 1),
                ikey(b"b", 1),
            )));
        }
        finalize(&mut version);
        assert_eq!(version.compaction_level, Some(0));
        assert!(version.compaction_score >= 1.0);

        // A bloated level 2 outranks a quiet level 0.
        let mut version = Version::new(icmp());
        version.files_mut()[2].push(Arc::new(FileMetaData::new(
            1,
            200 * 1024 * 1024,
            ikey(b"a", 1),
            ikey(b"b", 1),
        )));
        finalize(&mut version);
        assert_eq!(version.compaction_level, Some(2));
        assert!(version.compaction_score > 1.0);
    }

    #[test]
    fn test_pick_compaction_level0_includes_overlaps() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut set = new_set(dir.path());
        set.manifest_file_number = 1;

        let mut edit = VersionEdit::new();
        edit.set_log_number(0);
        edit.set_last_sequence(10);
        // Four overlapping level-0 files trip the trigger.
        edit.add_file(0, 3, 1000, ikey(b"a", 4), ikey(b"m", 5));
        edit.add_file(0, 4, 1000, ikey(b"k", 6), ikey(b"z", 7));
        edit.add_file(0, 5, 1000, ikey(b"c", 8), ikey(b"d", 9));
        edit.add_file(0, 6, 1000, ikey(b"x", 10), ikey(b"y", 10));
        set.log_and_apply(&mut edit).unwrap();

        let compaction = set.pick_compaction().expect("level 0 at trigger");
        assert_eq!(compaction.level(), 0);
        // All four overlap transitively through their user-key ranges.
        assert_eq!(compaction.num_input_files(0), 4);
    }
}
