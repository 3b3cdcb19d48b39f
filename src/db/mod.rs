//! The database controller: write path, background work, recovery, and
//! obsolete-file collection.
//!
//! Concurrency model: one primary mutex guards the mutable state
//! (memtables, log, version set, writer queue, pending outputs). It is
//! held while deciding what to do and released around every file write
//! and fsync. Application writers serialize through a FIFO queue whose
//! head commits a coalesced batch group; one engine-owned background
//! thread performs flushes and compactions.

use std::collections::{HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::BytesMut;
use log::{error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cache::LruCache;
use crate::compaction::{max_grandparent_overlap_bytes, Compaction, MergeIterator};
use crate::config::{
    Options, ReadOptions, WriteOptions, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER,
    NUM_LEVELS,
};
use crate::error::{Error, Result};
use crate::filename::{
    current_file_name, descriptor_file_name, info_log_file_name, lock_file_name, log_file_name,
    old_info_log_file_name, parse_file_name, set_current_file, table_file_name, FileType,
};
use crate::memtable::internal_key::extract_user_key;
use crate::memtable::{
    InternalKey, InternalKeyComparator, LookupKey, LookupResult, MemTable, ParsedInternalKey,
    SequenceNumber, ValueType, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK,
};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::sstable::TableBuilder;
use crate::table_cache::TableCache;
use crate::version::edit::VersionEdit;
use crate::version::set::VersionSet;
use crate::wal::{LogReader, LogWriter, Reporter};
use crate::write_batch::{WriteBatch, BATCH_HEADER_SIZE};
use crate::filter::{BloomFilterPolicy, FilterPolicy};

/// Group commits absorb queued batches up to this many bytes.
const MAX_BATCH_GROUP_BYTES: usize = 1 << 20;
/// Small leading batches cap the group lower so a tiny write is not
/// delayed behind a megabyte of coalescing.
const SMALL_BATCH_BYTES: usize = 128 << 10;

/// Holds the advisory lock on the database directory.
struct DbLock {
    _file: File,
}

impl DbLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        file.try_lock().map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("lock {} already held", path.display()),
            ))
        })?;
        Ok(Self { _file: file })
    }
}

/// A queued application write.
struct Writer {
    /// Taken by the group leader; `None` marks a flush-only request.
    batch: Option<WriteBatch>,
    sync: bool,
    done: Option<Result<()>>,
}

type WriterHandle = Arc<Mutex<Writer>>;

/// A pending manual compaction request.
struct ManualCompaction {
    level: usize,
    done: bool,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

/// State guarded by the primary mutex.
struct DbState {
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    log: Option<LogWriter>,
    log_file_number: u64,
    versions: VersionSet,
    writers: VecDeque<WriterHandle>,
    /// File numbers reserved by in-flight flushes/compactions; the GC
    /// treats them as live.
    pending_outputs: HashSet<u64>,
    bg_error: Option<Error>,
    background_compaction_scheduled: bool,
    manual_compaction: Option<ManualCompaction>,
}

struct DbInner {
    dbname: PathBuf,
    options: Options,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    snapshots: SnapshotList,
    shutting_down: AtomicBool,
    /// Mirror of `state.imm.is_some()`, readable without the mutex so
    /// the compaction loop can yield to a pending flush.
    has_imm: AtomicBool,
    state: Mutex<DbState>,
    /// Signaled when a flush or compaction completes.
    background_work_finished: Condvar,
    /// Wakes the background thread when work is scheduled.
    work_available: Condvar,
    /// Wakes queued writers on head change or completion.
    writers_cv: Condvar,
    _db_lock: DbLock,
}

/// An embedded, single-writer, ordered key-value store.
///
/// # Example
///
/// ```rust,no_run
/// use siltdb::{DB, Options};
///
/// # fn main() -> Result<(), siltdb::Error> {
/// let db = DB::open("./data", Options::default().create_if_missing(true))?;
/// db.put(b"key", b"value")?;
/// assert_eq!(db.get(b"key")?, Some(b"value".to_vec()));
/// db.delete(b"key")?;
/// # Ok(())
/// # }
/// ```
///
/// `DB` is `Send + Sync`; share it with `Arc<DB>`. Writes from many
/// threads serialize through an internal queue; reads never block on
/// writes.
pub struct DB {
    inner: Arc<DbInner>,
    background_thread: Option<JoinHandle<()>>,
}

impl DB {
    /// Opens the database at `path`, recovering any existing state.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<DB> {
        options.validate()?;
        let dbname = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&dbname)?;

        let db_lock = DbLock::acquire(&lock_file_name(&dbname))?;
        rotate_info_log(&dbname);

        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let filter_policy: Option<Arc<dyn FilterPolicy>> = if options.bloom_bits_per_key > 0 {
            Some(Arc::new(BloomFilterPolicy::new(options.bloom_bits_per_key)))
        } else {
            None
        };
        let block_cache = if options.block_cache_size > 0 {
            Some(Arc::new(LruCache::new(options.block_cache_size)))
        } else {
            None
        };
        let table_cache = Arc::new(TableCache::new(
            dbname.clone(),
            icmp.clone(),
            filter_policy,
            block_cache,
            options.max_open_files,
        ));

        // Create-or-reject based on the CURRENT pointer.
        let current_exists = current_file_name(&dbname).exists();
        let just_created = if !current_exists {
            if !options.create_if_missing {
                return Err(Error::invalid_argument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    dbname.display()
                )));
            }
            info!("creating database {}", dbname.display());
            create_new_db(&dbname, &icmp)?;
            true
        } else {
            if options.error_if_exists {
                return Err(Error::invalid_argument(format!(
                    "{}: exists (error_if_exists is true)",
                    dbname.display()
                )));
            }
            false
        };

        let mut versions = VersionSet::new(
            dbname.clone(),
            icmp.clone(),
            Arc::clone(&table_cache),
            options.max_file_size,
            // A freshly created manifest is already a snapshot; keep
            // appending to it instead of rewriting it at once.
            options.reuse_logs || just_created,
        );
        let mut save_manifest = versions.recover()?;

        let mut state = DbState {
            mem: Arc::new(MemTable::new(icmp.clone())),
            imm: None,
            log: None,
            log_file_number: 0,
            versions,
            writers: VecDeque::new(),
            pending_outputs: HashSet::new(),
            bg_error: None,
            background_compaction_scheduled: false,
            manual_compaction: None,
        };

        // Replay any surviving write-ahead logs into the state.
        let recovery = RecoveryContext { dbname: &dbname, options: &options, icmp: &icmp };
        let mut edit = VersionEdit::new();
        recovery.replay_logs(&mut state, &mut edit, &mut save_manifest)?;

        // Start a fresh log unless replay reused the old one.
        if state.log.is_none() {
            let new_log_number = state.versions.new_file_number();
            let file = File::create(log_file_name(&dbname, new_log_number))?;
            state.log = Some(LogWriter::new(file));
            state.log_file_number = new_log_number;
        }

        if save_manifest {
            edit.set_prev_log_number(0);
            edit.set_log_number(state.log_file_number);
            state.versions.log_and_apply(&mut edit)?;
        }

        let inner = Arc::new(DbInner {
            dbname: dbname.clone(),
            options: options.clone(),
            icmp: icmp.clone(),
            table_cache,
            snapshots: SnapshotList::new(),
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            state: Mutex::new(state),
            background_work_finished: Condvar::new(),
            work_available: Condvar::new(),
            writers_cv: Condvar::new(),
            _db_lock: db_lock,
        });

        {
            let mut guard = inner.state.lock();
            inner.remove_obsolete_files(&mut guard);
            inner.maybe_schedule_compaction(&mut guard);
        }

        let bg_inner = Arc::clone(&inner);
        let background_thread = std::thread::Builder::new()
            .name("siltdb-bg".to_string())
            .spawn(move || bg_inner.background_loop())?;

        Ok(DB { inner, background_thread: Some(background_thread) })
    }

    /// Inserts `key -> value`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_opt(&WriteOptions::default(), key, value)
    }

    /// Inserts `key -> value` with explicit write options.
    pub fn put_opt(&self, options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(options, batch)
    }

    /// Removes `key` (writes a tombstone).
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_opt(&WriteOptions::default(), key)
    }

    /// Removes `key` with explicit write options.
    pub fn delete_opt(&self, options: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(options, batch)
    }

    /// Applies `batch` atomically.
    pub fn write(&self, options: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write_internal(options.sync, Some(batch))
    }

    /// Reads the newest value for `key`, or `None` if absent or
    /// deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_opt(&ReadOptions::new(), key)
    }

    /// Reads as of the snapshot in `options`, or the latest state.
    pub fn get_opt(&self, options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = &self.inner;
        let (mem, imm, version, sequence) = {
            let state = inner.state.lock();
            let sequence = options
                .snapshot
                .as_ref()
                .map(|s| s.sequence())
                .unwrap_or_else(|| state.versions.last_sequence());
            (
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
                sequence,
            )
        };

        let lookup = LookupKey::new(key, sequence);
        match mem.get(&lookup) {
            LookupResult::Found(value) => return Ok(Some(value)),
            LookupResult::Deleted => return Ok(None),
            LookupResult::Absent => {}
        }
        if let Some(imm) = imm {
            match imm.get(&lookup) {
                LookupResult::Found(value) => return Ok(Some(value)),
                LookupResult::Deleted => return Ok(None),
                LookupResult::Absent => {}
            }
        }

        let (value, stats) = version.get(&lookup, &inner.table_cache)?;
        if version.update_stats(stats) {
            let mut state = inner.state.lock();
            inner.maybe_schedule_compaction(&mut state);
        }
        Ok(value)
    }

    /// Pins the current state for repeatable reads.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let state = self.inner.state.lock();
        self.inner.snapshots.acquire(state.versions.last_sequence())
    }

    /// Compacts the key range `[begin, end]` (either bound may be
    /// open) all the way down, flushing the memtable first. Mostly
    /// useful for tests and space reclamation after bulk deletes.
    ///
    /// The deepest populated level is rewritten too, so tombstones in
    /// the range are fully eliminated rather than parked at the bottom.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.flush_memtable()?;

        let max_level = {
            let state = self.inner.state.lock();
            let version = state.versions.current();
            let mut max_level = 0;
            for level in 0..NUM_LEVELS - 1 {
                if version.overlap_in_level(level, begin, end) {
                    max_level = level;
                }
            }
            max_level
        };

        for level in 0..=max_level {
            self.inner.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Forces the active memtable to disk and waits for the flush.
    pub fn flush_memtable(&self) -> Result<()> {
        // An empty write with force=true freezes the memtable.
        self.inner.write_internal(false, None)?;
        let mut state = self.inner.state.lock();
        while state.imm.is_some() && state.bg_error.is_none() {
            self.inner.background_work_finished.wait(&mut state);
        }
        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Number of table files at `level`; test and introspection hook.
    pub fn num_files_at_level(&self, level: usize) -> usize {
        self.inner.state.lock().versions.num_level_files(level)
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        self.inner.shutting_down.store(true, AtomicOrdering::Release);
        self.inner.work_available.notify_all();
        if let Some(handle) = self.background_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Initializes an empty database: a one-record manifest and CURRENT.
fn create_new_db(dbname: &Path, icmp: &InternalKeyComparator) -> Result<()> {
    let mut edit = VersionEdit::new();
    edit.set_comparator_name(icmp.user_comparator().name());
    edit.set_log_number(0);
    edit.set_next_file_number(2);
    edit.set_last_sequence(0);

    let manifest = descriptor_file_name(dbname, 1);
    let result = (|| -> Result<()> {
        let file = File::create(&manifest)?;
        let mut writer = LogWriter::new(file);
        let mut record = BytesMut::new();
        edit.encode_to(&mut record);
        writer.add_record(&record)?;
        writer.sync()?;
        Ok(())
    })();

    match result {
        Ok(()) => set_current_file(dbname, 1),
        Err(e) => {
            let _ = std::fs::remove_file(&manifest);
            Err(e)
        }
    }
}

fn rotate_info_log(dbname: &Path) {
    let info_log = info_log_file_name(dbname);
    if info_log.exists() {
        let _ = std::fs::rename(&info_log, old_info_log_file_name(dbname));
    }
    let _ = std::fs::write(&info_log, format!("siltdb {}\n", env!("CARGO_PKG_VERSION")));
}

impl DbInner {
    // ----- write path -----

    fn write_internal(&self, sync: bool, batch: Option<WriteBatch>) -> Result<()> {
        let me: WriterHandle = Arc::new(Mutex::new(Writer { batch, sync, done: None }));
        let mut state = self.state.lock();
        state.writers.push_back(Arc::clone(&me));

        // Wait until a leader finished our write or we reached the
        // head of the queue.
        loop {
            if me.lock().done.is_some() {
                break;
            }
            if state
                .writers
                .front()
                .map(|w| Arc::ptr_eq(w, &me))
                .unwrap_or(false)
            {
                break;
            }
            self.writers_cv.wait(&mut state);
        }
        if let Some(result) = me.lock().done.take() {
            return result;
        }

        // We are the head: make room, then commit a batch group.
        let force = me.lock().batch.is_none();
        let mut result = self.make_room_for_write(&mut state, force);

        if result.is_ok() && !force {
            let (mut group, group_sync, members) = build_batch_group(&mut state);
            let sequence = state.versions.last_sequence() + 1;
            group.set_sequence(sequence);
            let count = group.count() as u64;

            // The queue head owns the log and memtable until it
            // finishes; both can be written without the mutex.
            let mut log = state.log.take().expect("log writer present");
            let mem = Arc::clone(&state.mem);
            let mut sync_error = false;
            MutexGuard::unlocked(&mut state, || {
                result = log.add_record(group.contents());
                if result.is_ok() && group_sync {
                    result = log.sync();
                    if result.is_err() {
                        sync_error = true;
                    }
                }
                if result.is_ok() {
                    result = group.insert_into(&mem);
                }
            });
            state.log = Some(log);
            if sync_error {
                // The log tail is in an unknown state; no future write
                // may succeed until the DB is reopened.
                self.record_background_error(
                    &mut state,
                    result.as_ref().err().cloned().unwrap_or_else(|| {
                        Error::corruption("log sync failed")
                    }),
                );
            }
            if result.is_ok() {
                state.versions.set_last_sequence(sequence + count - 1);
            }

            // Retire every member of the group.
            for member in members {
                let is_me = Arc::ptr_eq(&member, &me);
                let front = state.writers.pop_front().expect("group member queued");
                debug_assert!(Arc::ptr_eq(&front, &member));
                if !is_me {
                    member.lock().done = Some(result.clone());
                }
            }
        } else {
            // Flush-only request or failed make_room: retire self.
            let front = state.writers.pop_front().expect("self queued");
            debug_assert!(Arc::ptr_eq(&front, &me));
        }

        self.writers_cv.notify_all();
        result
    }

    /// Ensures the active memtable has room for a write. May pace or
    /// stall the writer, rotate the log, and freeze the memtable.
    fn make_room_for_write(&self, state: &mut MutexGuard<'_, DbState>, force: bool) -> Result<()> {
        let mut allow_delay = !force;
        let mut force = force;
        loop {
            if let Some(e) = &state.bg_error {
                return Err(e.clone());
            }

            if allow_delay
                && state.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // Hand the compactor one millisecond of CPU and disk
                // rather than stalling this writer for seconds once the
                // hard limit is hit. Only once per write.
                MutexGuard::unlocked(state, || {
                    std::thread::sleep(Duration::from_millis(1));
                });
                allow_delay = false;
                continue;
            }

            if !force
                && state.mem.approximate_memory_usage() <= self.options.write_buffer_size
            {
                return Ok(());
            }

            if state.imm.is_some() {
                // The previous memtable is still flushing; wait for it.
                info!("current memtable full; waiting for flush");
                self.background_work_finished.wait(state);
                continue;
            }

            if state.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                info!("too many level-0 files; waiting for compaction");
                self.background_work_finished.wait(state);
                continue;
            }

            // Rotate: new log, freeze the memtable, wake the flusher.
            let new_log_number = state.versions.new_file_number();
            let file = match File::create(log_file_name(&self.dbname, new_log_number)) {
                Ok(file) => file,
                Err(e) => {
                    state.versions.reuse_file_number(new_log_number);
                    return Err(Error::Io(e));
                }
            };
            state.log = Some(LogWriter::new(file));
            state.log_file_number = new_log_number;
            let fresh = Arc::new(MemTable::new(self.icmp.clone()));
            let full = std::mem::replace(&mut state.mem, fresh);
            state.imm = Some(full);
            self.has_imm.store(true, AtomicOrdering::Release);
            force = false;
            self.maybe_schedule_compaction(state);
        }
    }

    // ----- background work -----

    fn maybe_schedule_compaction(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.background_compaction_scheduled {
            return;
        }
        if self.shutting_down.load(AtomicOrdering::Acquire) || state.bg_error.is_some() {
            return;
        }
        if state.imm.is_none()
            && state.manual_compaction.is_none()
            && !state.versions.needs_compaction()
        {
            return;
        }
        state.background_compaction_scheduled = true;
        self.work_available.notify_one();
    }

    fn background_loop(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            while !self.shutting_down.load(AtomicOrdering::Acquire)
                && !state.background_compaction_scheduled
            {
                self.work_available.wait(&mut state);
            }
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                break;
            }

            if state.bg_error.is_none() {
                self.background_compaction(&mut state);
            }
            state.background_compaction_scheduled = false;

            // The last round may have produced enough level-0 files to
            // warrant another.
            self.maybe_schedule_compaction(&mut state);
            self.background_work_finished.notify_all();
        }
    }

    fn background_compaction(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.imm.is_some() {
            self.compact_memtable(state);
            return;
        }

        let is_manual = state.manual_compaction.is_some();
        let compaction = if is_manual {
            let manual = state.manual_compaction.as_ref().unwrap();
            let (level, begin, end) =
                (manual.level, manual.begin.clone(), manual.end.clone());
            let compaction = state.versions.compact_range(level, begin.as_ref(), end.as_ref());
            if compaction.is_none() {
                state.manual_compaction.as_mut().unwrap().done = true;
            }
            compaction
        } else {
            state.versions.pick_compaction()
        };

        let mut manual_end = None;
        match compaction {
            None => {}
            Some(mut c) if !is_manual && c.is_trivial_move() => {
                // Move the file down a level in the manifest only.
                let file = Arc::clone(c.input(0, 0));
                let level = c.level();
                c.edit_mut().remove_file(level, file.number);
                c.edit_mut().add_file(
                    level + 1,
                    file.number,
                    file.file_size,
                    file.smallest.clone(),
                    file.largest.clone(),
                );
                let mut edit = std::mem::take(&mut c.edit);
                let result = self.apply_version_edit(state, &mut edit);
                if let Err(e) = result {
                    self.record_background_error(state, e);
                } else {
                    info!(
                        "moved #{} ({} bytes) to level-{}",
                        file.number,
                        file.file_size,
                        level + 1
                    );
                }
                c.release_inputs();
            }
            Some(mut c) => {
                manual_end = Some(Compaction::range_of(
                    state.versions.icmp(),
                    &[&c.inputs[0]],
                ).1);
                let result = self.do_compaction_work(state, &mut c);
                if let Err(e) = result {
                    if !self.shutting_down.load(AtomicOrdering::Acquire) {
                        error!("compaction error: {}", e);
                    }
                    self.record_background_error(state, e);
                }
                c.release_inputs();
                self.remove_obsolete_files(state);
            }
        }

        if is_manual {
            let failed = state.bg_error.is_some();
            // The requester may have abandoned the request on shutdown.
            if let Some(manual) = state.manual_compaction.as_mut() {
                if failed {
                    manual.done = true;
                }
                if !manual.done {
                    // One round covered a prefix of the range; resume
                    // after the largest key it consumed.
                    manual.begin = manual_end;
                }
            }
        }
    }

    fn compact_memtable(&self, state: &mut MutexGuard<'_, DbState>) {
        let imm = state.imm.clone().expect("immutable memtable present");
        let mut edit = VersionEdit::new();
        let base = state.versions.current();

        let mut result = self.write_level0_table(state, &imm, &mut edit, Some(&base));

        if result.is_ok() && self.shutting_down.load(AtomicOrdering::Acquire) {
            result = Err(Error::Io(std::io::Error::other(
                "deleting DB during memtable flush",
            )));
        }

        if result.is_ok() {
            // The frozen memtable's log is no longer needed once this
            // edit commits.
            edit.set_prev_log_number(0);
            edit.set_log_number(state.log_file_number);
            result = self.apply_version_edit(state, &mut edit);
        }

        match result {
            Ok(()) => {
                state.imm = None;
                self.has_imm.store(false, AtomicOrdering::Release);
                self.remove_obsolete_files(state);
            }
            Err(e) => {
                self.record_background_error(state, e);
            }
        }
    }

    /// Builds one level-0 table from a memtable. With a base version
    /// the output may be placed deeper if nothing overlaps.
    fn write_level0_table(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Arc<crate::version::Version>>,
    ) -> Result<()> {
        let file_number = state.versions.new_file_number();
        state.pending_outputs.insert(file_number);
        info!("level-0 table #{}: started", file_number);

        let dbname = self.dbname.clone();
        let options = self.options.clone();
        let icmp = self.icmp.clone();
        let mem = Arc::clone(mem);
        let mut build_result: Result<Option<(u64, InternalKey, InternalKey)>> = Ok(None);
        MutexGuard::unlocked(state, || {
            build_result = build_table(&dbname, &options, icmp, file_number, &mem);
        });
        state.pending_outputs.remove(&file_number);

        match build_result {
            Ok(Some((file_size, smallest, largest))) => {
                info!("level-0 table #{}: {} bytes", file_number, file_size);
                let level = match base {
                    Some(base) => base.pick_level_for_memtable_output(
                        smallest.user_key(),
                        largest.user_key(),
                        max_grandparent_overlap_bytes(self.options.max_file_size),
                    ),
                    None => 0,
                };
                edit.add_file(level, file_number, file_size, smallest, largest);
                Ok(())
            }
            Ok(None) => {
                // Nothing to write (empty memtable); drop the number.
                state.versions.reuse_file_number(file_number);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn do_compaction_work(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        c: &mut Compaction,
    ) -> Result<()> {
        info!(
            "compacting {}@{} + {}@{} files",
            c.num_input_files(0),
            c.level(),
            c.num_input_files(1),
            c.level() + 1
        );

        let smallest_snapshot = self
            .snapshots
            .oldest_or(state.versions.last_sequence());

        let mut outputs: Vec<CompactionOutput> = Vec::new();
        let mut result = Ok(());
        let level = c.level();

        MutexGuard::unlocked(state, || {
            result = self.compaction_merge_loop(c, smallest_snapshot, &mut outputs);
        });

        if result.is_ok() && self.shutting_down.load(AtomicOrdering::Acquire) {
            result = Err(Error::Io(std::io::Error::other(
                "deleting DB during compaction",
            )));
        }

        if result.is_ok() {
            let output_bytes: u64 = outputs.iter().map(|o| o.file_size).sum();
            info!(
                "compacted {}@{} + {}@{} files => {} bytes",
                c.num_input_files(0),
                level,
                c.num_input_files(1),
                level + 1,
                output_bytes
            );
            c.add_input_deletions();
            for output in &outputs {
                c.edit_mut().add_file(
                    level + 1,
                    output.number,
                    output.file_size,
                    output.smallest.clone(),
                    output.largest.clone(),
                );
            }
            let mut edit = std::mem::take(&mut c.edit);
            result = self.apply_version_edit(state, &mut edit);
        }

        for output in &outputs {
            state.pending_outputs.remove(&output.number);
        }
        result
    }

    /// The merge loop proper; runs without the primary mutex, taking it
    /// briefly to allocate output files and to yield to memtable
    /// flushes.
    fn compaction_merge_loop(
        &self,
        c: &mut Compaction,
        smallest_snapshot: SequenceNumber,
        outputs: &mut Vec<CompactionOutput>,
    ) -> Result<()> {
        // Open one iterator per input table.
        let mut children = Vec::new();
        for which in 0..2 {
            for i in 0..c.num_input_files(which) {
                let file = c.input(which, i);
                let table = self.table_cache.get_table(file.number, file.file_size)?;
                children.push(table.iter());
            }
        }
        let mut iter = MergeIterator::new(self.icmp.clone(), children)?;

        let mut builder: Option<(TableBuilder, u64)> = None;
        let mut current_output: Option<CompactionOutput> = None;
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;

        while iter.next()? {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                return Err(Error::Io(std::io::Error::other(
                    "deleting DB during compaction",
                )));
            }

            // A waiting flush takes priority over compaction progress.
            if self.has_imm.load(AtomicOrdering::Acquire) {
                let mut state = self.state.lock();
                if state.imm.is_some() {
                    self.compact_memtable(&mut state);
                    self.background_work_finished.notify_all();
                }
            }

            let key = iter.key().to_vec();

            // should_stop_before tracks grandparent overlap across every
            // key and must run even with no output open.
            let stop_for_grandparents = c.should_stop_before(&key);
            if let (Some((table_builder, _)), Some(output)) = (&builder, &current_output) {
                // Close the output on grandparent overlap, or once full
                // and at a user-key boundary. Never splitting a user
                // key's versions across outputs keeps every version of
                // a key visible to any later compaction of one file.
                let at_boundary = !output.largest.is_empty()
                    && self
                        .icmp
                        .user_comparator()
                        .compare(extract_user_key(&key), output.largest.user_key())
                        != std::cmp::Ordering::Equal;
                let size_full = table_builder.file_size() >= c.max_output_file_size();
                if stop_for_grandparents || (size_full && at_boundary) {
                    self.finish_compaction_output(&mut builder, &mut current_output, outputs)?;
                }
            }

            let mut drop_entry = false;
            match ParsedInternalKey::decode(&key) {
                Err(_) => {
                    // Keep undecodable entries so corruption stays
                    // visible instead of silently vanishing.
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                }
                Ok(parsed) => {
                    let first_occurrence = current_user_key
                        .as_deref()
                        .map(|k| {
                            self.icmp.user_comparator().compare(parsed.user_key, k)
                                != std::cmp::Ordering::Equal
                        })
                        .unwrap_or(true);
                    if first_occurrence {
                        current_user_key = Some(parsed.user_key.to_vec());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }

                    if last_sequence_for_key <= smallest_snapshot {
                        // Shadowed by a newer entry for the same user
                        // key that every live snapshot already sees.
                        drop_entry = true;
                    } else if parsed.value_type == ValueType::Deletion
                        && parsed.sequence <= smallest_snapshot
                        && c.is_base_level_for_key(parsed.user_key)
                    {
                        // The tombstone has nothing left to delete in
                        // deeper levels and no snapshot can resurrect
                        // older data.
                        drop_entry = true;
                    }
                    last_sequence_for_key = parsed.sequence;
                }
            }

            if !drop_entry {
                if builder.is_none() {
                    let number = {
                        let mut state = self.state.lock();
                        let number = state.versions.new_file_number();
                        state.pending_outputs.insert(number);
                        number
                    };
                    let file =
                        File::create(table_file_name(&self.dbname, number))?;
                    let filter_policy: Option<Arc<dyn FilterPolicy>> =
                        if self.options.bloom_bits_per_key > 0 {
                            Some(Arc::new(BloomFilterPolicy::new(
                                self.options.bloom_bits_per_key,
                            )))
                        } else {
                            None
                        };
                    builder = Some((
                        TableBuilder::new(
                            file,
                            self.icmp.clone(),
                            filter_policy,
                            self.options.block_size,
                        ),
                        number,
                    ));
                    current_output = Some(CompactionOutput {
                        number,
                        file_size: 0,
                        smallest: InternalKey::default(),
                        largest: InternalKey::default(),
                    });
                }

                let (table_builder, _) = builder.as_mut().unwrap();
                let output = current_output.as_mut().unwrap();
                if output.smallest.is_empty() {
                    output.smallest = InternalKey::decode_from(&key)?;
                }
                output.largest = InternalKey::decode_from(&key)?;
                table_builder.add(&key, iter.value())?;
            }
        }

        if builder.is_some() {
            self.finish_compaction_output(&mut builder, &mut current_output, outputs)?;
        }
        Ok(())
    }

    fn finish_compaction_output(
        &self,
        builder: &mut Option<(TableBuilder, u64)>,
        current_output: &mut Option<CompactionOutput>,
        outputs: &mut Vec<CompactionOutput>,
    ) -> Result<()> {
        let (mut table_builder, number) = builder.take().expect("open output");
        let mut output = current_output.take().expect("open output");
        let file_size = table_builder.finish()?;
        output.file_size = file_size;

        // Open the fresh table once so corruption surfaces now rather
        // than on a future read, and the handle is warm in the cache.
        self.table_cache.get_table(number, file_size)?;
        outputs.push(output);
        Ok(())
    }

    // ----- manifest + error plumbing -----

    /// Commits an edit through the three-phase manifest protocol,
    /// releasing the mutex during the file I/O.
    fn apply_version_edit(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        edit: &mut VersionEdit,
    ) -> Result<()> {
        let work = state.versions.prepare_apply(edit);
        let mut descriptor_log = state.versions.take_descriptor_log();
        let dbname = self.dbname.clone();
        let mut io_result = Ok(());
        MutexGuard::unlocked(state, || {
            io_result = work.perform_io(&mut descriptor_log, &dbname);
        });
        state.versions.finish_apply(work, descriptor_log, io_result)
    }

    fn record_background_error(&self, state: &mut MutexGuard<'_, DbState>, e: Error) {
        if state.bg_error.is_none() {
            error!("background error (sticky): {}", e);
            state.bg_error = Some(e);
            self.background_work_finished.notify_all();
            self.writers_cv.notify_all();
        }
    }

    // ----- obsolete file GC -----

    fn remove_obsolete_files(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.bg_error.is_some() {
            // After a background error the version state may not match
            // the manifest; deleting anything would be guesswork.
            return;
        }

        let mut live: HashSet<u64> = state.pending_outputs.clone();
        state.versions.add_live_files(&mut live);

        let entries = match std::fs::read_dir(&self.dbname) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_number = state.versions.manifest_file_number();

        let mut files_to_delete = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((number, file_type)) = parse_file_name(name) else {
                continue;
            };
            let keep = match file_type {
                FileType::Log => number >= log_number || number == prev_log_number,
                FileType::Descriptor => number >= manifest_number,
                FileType::Table => live.contains(&number),
                // An in-flight CURRENT swap owns its temp file.
                FileType::Temp => live.contains(&number),
                FileType::Current | FileType::DbLock | FileType::InfoLog => true,
            };
            if !keep {
                if file_type == FileType::Table {
                    self.table_cache.evict(number);
                }
                info!("deleting {} (type {:?})", name, file_type);
                files_to_delete.push(name.to_string());
            }
        }

        let dbname = self.dbname.clone();
        MutexGuard::unlocked(state, || {
            for name in files_to_delete {
                let _ = std::fs::remove_file(dbname.join(name));
            }
        });
    }

    // ----- manual compaction -----

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        let begin_key =
            begin.map(|b| InternalKey::new(b, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK));
        // Sequence 0 + deletion tag sorts after every real entry for
        // the end user key, making the bound inclusive.
        let end_key = end.map(|e| InternalKey::new(e, 0, ValueType::Deletion));

        let mut state = self.state.lock();
        state.manual_compaction =
            Some(ManualCompaction { level, done: false, begin: begin_key, end: end_key });
        self.maybe_schedule_compaction(&mut state);

        loop {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                break;
            }
            if let Some(e) = state.bg_error.clone() {
                state.manual_compaction = None;
                return Err(e);
            }
            match &state.manual_compaction {
                Some(manual) if manual.done => break,
                Some(_) => {
                    self.maybe_schedule_compaction(&mut state);
                    self.background_work_finished.wait(&mut state);
                }
                None => break,
            }
        }
        state.manual_compaction = None;
        Ok(())
    }

}

/// Borrowed pieces of the open path used by log replay, which runs
/// before the `DbInner` exists.
struct RecoveryContext<'a> {
    dbname: &'a Path,
    options: &'a Options,
    icmp: &'a InternalKeyComparator,
}

impl RecoveryContext<'_> {
    /// Replays every surviving write-ahead log in file-number order.
    fn replay_logs(
        &self,
        state: &mut DbState,
        edit: &mut VersionEdit,
        save_manifest: &mut bool,
    ) -> Result<()> {
        let min_log = state.versions.log_number();
        let prev_log = state.versions.prev_log_number();

        let mut expected: HashSet<u64> = HashSet::new();
        state.versions.add_live_files(&mut expected);

        let mut logs = Vec::new();
        for entry in std::fs::read_dir(&self.dbname)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((number, file_type)) = parse_file_name(name) {
                expected.remove(&number);
                if file_type == FileType::Log && (number >= min_log || number == prev_log) {
                    logs.push(number);
                }
            }
        }
        if !expected.is_empty() {
            let example = expected.iter().next().unwrap();
            return Err(Error::corruption2(
                format!("{} missing files; e.g.", expected.len()),
                table_file_name(self.dbname, *example).display().to_string(),
            ));
        }

        logs.sort_unstable();
        for (i, log_number) in logs.iter().enumerate() {
            let last_log = i == logs.len() - 1;
            let max_sequence =
                self.replay_one_log(state, *log_number, last_log, edit, save_manifest)?;
            state.versions.mark_file_number_used(*log_number);
            if state.versions.last_sequence() < max_sequence {
                state.versions.set_last_sequence(max_sequence);
            }
        }
        Ok(())
    }

    fn replay_one_log(
        &self,
        state: &mut DbState,
        log_number: u64,
        last_log: bool,
        edit: &mut VersionEdit,
        save_manifest: &mut bool,
    ) -> Result<SequenceNumber> {
        struct RecoveryReporter {
            paranoid: bool,
            error: Option<Error>,
        }
        impl Reporter for RecoveryReporter {
            fn corruption(&mut self, bytes: u64, reason: &str) {
                warn!("log record dropped: {} bytes, {}", bytes, reason);
                if self.paranoid && self.error.is_none() {
                    self.error = Some(Error::corruption(reason.to_string()));
                }
            }
        }

        let path = log_file_name(self.dbname, log_number);
        info!("recovering log #{}", log_number);
        let file = File::open(&path)?;
        let mut reporter =
            RecoveryReporter { paranoid: self.options.paranoid_checks, error: None };

        let mut mem: Option<Arc<MemTable>> = None;
        let mut max_sequence = 0;
        let mut compactions = 0;

        {
            let mut reader = LogReader::new(file, Some(&mut reporter), true, 0);
            while let Some(record) = reader.read_record() {
                if record.len() < BATCH_HEADER_SIZE {
                    // A batch record is at least a header; report
                    // through the same channel as framing damage.
                    warn!("log record too small: {} bytes", record.len());
                    continue;
                }
                let batch = WriteBatch::from_contents(&record)?;
                let mem_ref = mem.get_or_insert_with(|| {
                    Arc::new(MemTable::new(self.icmp.clone()))
                });
                batch.insert_into(mem_ref)?;

                let last_seq = batch.sequence() + batch.count() as u64 - 1;
                if last_seq > max_sequence {
                    max_sequence = last_seq;
                }

                if mem_ref.approximate_memory_usage() > self.options.write_buffer_size {
                    compactions += 1;
                    *save_manifest = true;
                    let full = mem.take().unwrap();
                    self.write_level0_table_unlocked(state, &full, edit)?;
                }
            }
        }
        if let Some(error) = reporter.error {
            return Err(error);
        }

        // Keep appending to the final log if it never overflowed; the
        // memtable it fed stays active too.
        if self.options.reuse_logs && last_log && compactions == 0 {
            let size = std::fs::metadata(&path)?.len();
            let append = OpenOptions::new().append(true).open(&path)?;
            info!("reusing old log {}", path.display());
            state.log = Some(LogWriter::with_dest_length(append, size));
            state.log_file_number = log_number;
            if let Some(mem) = mem.take() {
                state.mem = mem;
            }
            return Ok(max_sequence);
        }

        if let Some(mem) = mem.take() {
            *save_manifest = true;
            self.write_level0_table_unlocked(state, &mem, edit)?;
        }
        Ok(max_sequence)
    }

    /// Flush used during recovery, before any concurrency exists.
    fn write_level0_table_unlocked(
        &self,
        state: &mut DbState,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
    ) -> Result<()> {
        let file_number = state.versions.new_file_number();
        match build_table(self.dbname, self.options, self.icmp.clone(), file_number, mem)? {
            Some((file_size, smallest, largest)) => {
                info!("recovered level-0 table #{}: {} bytes", file_number, file_size);
                edit.add_file(0, file_number, file_size, smallest, largest);
            }
            None => state.versions.reuse_file_number(file_number),
        }
        Ok(())
    }
}

struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: InternalKey,
    largest: InternalKey,
}

/// Writes `mem`'s contents as table `file_number`. Returns `None` (and
/// removes the file) when the memtable is empty.
fn build_table(
    dbname: &Path,
    options: &Options,
    icmp: InternalKeyComparator,
    file_number: u64,
    mem: &Arc<MemTable>,
) -> Result<Option<(u64, InternalKey, InternalKey)>> {
    let path = table_file_name(dbname, file_number);
    let mut iter = mem.iter();
    iter.seek_to_first();
    if !iter.valid() {
        return Ok(None);
    }

    let result = (|| -> Result<(u64, InternalKey, InternalKey)> {
        let file = File::create(&path)?;
        let filter_policy: Option<Arc<dyn FilterPolicy>> = if options.bloom_bits_per_key > 0 {
            Some(Arc::new(BloomFilterPolicy::new(options.bloom_bits_per_key)))
        } else {
            None
        };
        let mut builder = TableBuilder::new(file, icmp, filter_policy, options.block_size);

        let smallest = InternalKey::decode_from(iter.key())?;
        let mut largest = smallest.clone();
        while iter.valid() {
            largest = InternalKey::decode_from(iter.key())?;
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }

        let file_size = builder.finish()?;
        Ok((file_size, smallest, largest))
    })();

    match result {
        Ok(ok) => Ok(Some(ok)),
        Err(e) => {
            let _ = std::fs::remove_file(&path);
            Err(e)
        }
    }
}

/// Coalesces the head writer's batch with queued followers.
///
/// The group is capped at one megabyte (less when the leading batch is
/// small) and never crosses from non-sync into sync writes, so a
/// no-sync caller is never charged for another writer's fsync.
fn build_batch_group(
    state: &mut MutexGuard<'_, DbState>,
) -> (WriteBatch, bool, Vec<WriterHandle>) {
    let head = Arc::clone(state.writers.front().expect("head writer"));
    let mut head_guard = head.lock();
    let head_batch = head_guard.batch.take().expect("head has a batch");
    let head_sync = head_guard.sync;
    drop(head_guard);

    let head_size = head_batch.approximate_size();
    let max_size = if head_size <= SMALL_BATCH_BYTES {
        head_size + SMALL_BATCH_BYTES
    } else {
        MAX_BATCH_GROUP_BYTES
    };

    let mut group = head_batch;
    let mut size = head_size;
    let mut members = vec![Arc::clone(&head)];

    for follower in state.writers.iter().skip(1) {
        let mut follower_guard = follower.lock();
        if follower_guard.sync && !head_sync {
            // A sync write must not be downgraded by a non-sync leader.
            break;
        }
        let Some(batch) = follower_guard.batch.as_ref() else {
            // Flush-only requests act as barriers.
            break;
        };
        if size + batch.approximate_size() > max_size {
            break;
        }
        let batch = follower_guard.batch.take().unwrap();
        size += batch.approximate_size();
        group.append(&batch);
        drop(follower_guard);
        members.push(Arc::clone(follower));
    }

    (group, head_sync, members)
}


impl std::fmt::Debug for DB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DB").finish_non_exhaustive()
    }
}
