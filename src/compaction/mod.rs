//! Compaction selection and bookkeeping.
//!
//! A [`Compaction`] describes one merge of level-L files (and the
//! overlapping level-L+1 files) into level L+1. The picker on
//! [`crate::version::VersionSet`] builds these; the executor in the DB
//! controller drives the merge loop.

pub mod merge;

pub use merge::MergeIterator;

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::NUM_LEVELS;
use crate::memtable::{InternalKey, InternalKeyComparator};
use crate::version::edit::VersionEdit;
use crate::version::{FileMetaData, Version};

/// Target size for compaction output files at `level`.
pub fn target_file_size(max_file_size: usize) -> u64 {
    max_file_size as u64
}

/// Once an output table overlaps this many bytes of grandparent data,
/// it is closed so a future compaction of it does not cascade.
pub fn max_grandparent_overlap_bytes(max_file_size: usize) -> u64 {
    10 * target_file_size(max_file_size)
}

/// Cap on the total size of an expanded lower-level input set.
pub fn expanded_compaction_byte_size_limit(max_file_size: usize) -> u64 {
    25 * target_file_size(max_file_size)
}

/// Maximum total bytes at `level`; level 1 holds 10 MiB, each deeper
/// level ten times more.
pub fn max_bytes_for_level(level: usize) -> f64 {
    let mut result = 10.0 * 1048576.0;
    let mut level = level;
    while level > 1 {
        result *= 10.0;
        level -= 1;
    }
    result
}

/// One planned merge of `level` into `level + 1`.
pub struct Compaction {
    level: usize,
    max_output_file_size: u64,
    max_grandparent_overlap: u64,
    icmp: InternalKeyComparator,
    input_version: Option<Arc<Version>>,
    pub(crate) edit: VersionEdit,

    /// `inputs[0]` at `level`, `inputs[1]` at `level + 1`.
    pub(crate) inputs: [Vec<Arc<FileMetaData>>; 2],
    /// Level-L+2 files overlapping the output range; used to bound
    /// output file overlap.
    pub(crate) grandparents: Vec<Arc<FileMetaData>>,

    // State for should_stop_before.
    grandparent_index: usize,
    seen_key: bool,
    overlapped_bytes: u64,

    // Per-level cursors for is_base_level_for_key, valid because keys
    // arrive in increasing user-key order.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    pub(crate) fn new(level: usize, max_file_size: usize, icmp: InternalKeyComparator) -> Self {
        Self {
            level,
            max_output_file_size: target_file_size(max_file_size),
            max_grandparent_overlap: max_grandparent_overlap_bytes(max_file_size),
            icmp,
            input_version: None,
            edit: VersionEdit::new(),
            inputs: [Vec::new(), Vec::new()],
            grandparents: Vec::new(),
            grandparent_index: 0,
            seen_key: false,
            overlapped_bytes: 0,
            level_ptrs: [0; NUM_LEVELS],
        }
    }

    pub(crate) fn set_input_version(&mut self, version: Arc<Version>) {
        self.input_version = Some(version);
    }

    /// The level being compacted.
    pub fn level(&self) -> usize {
        self.level
    }

    /// Number of input files at `level()` + `which`.
    pub fn num_input_files(&self, which: usize) -> usize {
        self.inputs[which].len()
    }

    /// The `i`th input file at `level()` + `which`.
    pub fn input(&self, which: usize, i: usize) -> &Arc<FileMetaData> {
        &self.inputs[which][i]
    }

    /// Maximum size of one output table.
    pub fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    /// The edit that commits this compaction.
    pub fn edit_mut(&mut self) -> &mut VersionEdit {
        &mut self.edit
    }

    /// True if the compaction can be committed by re-tagging a single
    /// file's level in the manifest, with no reads or writes: one input
    /// file, nothing overlapping at the next level, and little enough
    /// grandparent overlap that a later compaction will not cascade.
    pub fn is_trivial_move(&self) -> bool {
        let grandparent_bytes: u64 = self.grandparents.iter().map(|f| f.file_size).sum();
        self.num_input_files(0) == 1
            && self.num_input_files(1) == 0
            && grandparent_bytes <= self.max_grandparent_overlap
    }

    /// Records the deletion of every input file in the edit.
    pub fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.remove_file(self.level + which, file.number);
            }
        }
    }

    /// True if no level deeper than the output could contain
    /// `user_key`, in which case a tombstone for it may be elided.
    ///
    /// Keys must be probed in increasing order; the per-level cursors
    /// only move forward.
    pub fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let version = self.input_version.as_ref().expect("input version set");
        let ucmp = self.icmp.user_comparator();
        for level in (self.level + 2)..NUM_LEVELS {
            let files = version.files(level);
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if ucmp.compare(user_key, file.largest.user_key()) != Ordering::Greater {
                    if ucmp.compare(user_key, file.smallest.user_key()) != Ordering::Less {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// True if the current output table should be closed before
    /// emitting `internal_key`, because it already overlaps too much
    /// grandparent data.
    pub fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        while self.grandparent_index < self.grandparents.len()
            && self.icmp.compare(
                internal_key,
                self.grandparents[self.grandparent_index].largest.encoded(),
            ) == Ordering::Greater
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].file_size;
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            self.overlapped_bytes = 0;
            return true;
        }
        false
    }

    /// Releases the pinned input version.
    pub fn release_inputs(&mut self) {
        self.input_version = None;
    }

    /// Smallest and largest internal key across the given input lists.
    pub(crate) fn range_of(
        icmp: &InternalKeyComparator,
        files: &[&[Arc<FileMetaData>]],
    ) -> (InternalKey, InternalKey) {
        let mut smallest: Option<InternalKey> = None;
        let mut largest: Option<InternalKey> = None;
        for list in files {
            for file in *list {
                match &smallest {
                    Some(s) if icmp.compare_keys(&file.smallest, s) != Ordering::Less => {}
                    _ => smallest = Some(file.smallest.clone()),
                }
                match &largest {
                    Some(l) if icmp.compare_keys(&file.largest, l) != Ordering::Greater => {}
                    _ => largest = Some(file.largest.clone()),
                }
            }
        }
        (smallest.expect("non-empty inputs"), largest.expect("non-empty inputs"))
    }
}
