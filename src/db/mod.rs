//! The database facade: coordination of readers, writers, and
//! background work.
//!
//! ## Write path
//!
//! Writers enqueue themselves on a FIFO guarded by the DB mutex. The
//! writer at the front performs the work for itself and for as many
//! queued successors as fit in a merge budget: it assigns a contiguous
//! range of sequence numbers, appends one coalesced record to the WAL
//! (fsyncing when asked), applies every entry to the active memtable,
//! publishes the new last sequence, and wakes the writers it absorbed.
//! The mutex is **released** during the WAL and memtable work; the
//! queue discipline keeps writers serialized.
//!
//! When the active memtable is full it becomes immutable and a fresh
//! one (with a fresh log) takes its place; a background task flushes
//! the immutable memtable to a level-0 table. Level-0 crowding pushes
//! back on writers: 8 files adds a 1 ms delay per write, 12 stalls
//! writes until compaction catches up.
//!
//! ## Read path
//!
//! `get` pins the current version and both memtables under the mutex,
//! then probes them newest-first without it. Reads that touch multiple
//! table files charge the first file's seek allowance; exhausting the
//! allowance marks the file for a seek-driven compaction.
//!
//! ## Background work
//!
//! At most one background task is scheduled at a time. It flushes the
//! immutable memtable first, then runs one compaction (manual,
//! size-driven, or seek-driven), then reschedules itself if more work
//! remains. Any background IO failure parks the database in an error
//! state: subsequent writes fail fast, reads keep serving the last
//! installed version.

mod db_iter;


use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};

use tracing::{debug, error, info, warn};

use crate::batch::WriteBatch;
use crate::dbformat::{
    InternalKey, InternalKeyComparator, L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER,
    LookupKey, MAX_SEQUENCE_NUMBER, NUM_LEVELS, ParsedInternalKey, SequenceNumber,
    VALUE_TYPE_FOR_SEEK, ValueType,
};
use crate::env::{Env, FileLock};
use crate::filename::{
    FileType, current_file_name, descriptor_file_name, lock_file_name, log_file_name,
    parse_file_name, table_file_name,
};
use crate::iterator::{Iter, MergingIter};
use crate::memtable::{MemTable, MemTableGet};
use crate::options::{Options, ReadOptions, WriteOptions};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::sstable::builder::TableBuilder;
use crate::sstable::table_cache::TableCache;
use crate::status::{Result, Status};
use crate::version::{
    Compaction, FileMetaData, ManifestJob, VersionEdit, VersionGet, VersionSet, set_current_file,
};
use crate::wal::{LogReader, LogWriter, Reporter};

pub use db_iter::DbIterator;
use db_iter::IterPins;

/// Writers grouped into one commit may not exceed this many bytes...
const MAX_BATCH_GROUP_BYTES: usize = 1 << 20;
/// ...unless the leading batch is small, in which case the group is
/// capped lower to bound the latency added to a small write.
const SMALL_BATCH_BYTES: usize = 128 << 10;

// ------------------------------------------------------------------------------------------------
// Public handle
// ------------------------------------------------------------------------------------------------

/// An open database. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbImpl>,
}

impl Db {
    /// Open (or create, per `options`) the database at `path`.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Db> {
        let inner = DbImpl::open(path.as_ref(), options)?;
        Ok(Db { inner })
    }

    /// Store `key` → `value`.
    pub fn put(&self, opts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(opts, batch)
    }

    /// Remove `key`, if present.
    pub fn delete(&self, opts: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(opts, batch)
    }

    /// Apply `batch` atomically.
    pub fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(opts, Some(batch))
    }

    /// Fetch the newest visible value for `key`.
    pub fn get(&self, ro: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(ro, key)
    }

    /// An iterator over the database as of `ro.snapshot` (or now).
    pub fn new_iterator(&self, ro: &ReadOptions) -> DbIterator {
        self.inner.new_iterator(ro)
    }

    /// Pin the current state for repeatable reads.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot()
    }

    /// Compact every level overlapping `[begin, end]` (whole database
    /// when unbounded). Blocks until the compactions finish.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        self.inner.compact_range(begin, end)
    }

    /// Table files at `level` right now.
    pub fn num_level_files(&self, level: usize) -> usize {
        self.inner.state.lock().unwrap().versions.num_level_files(level)
    }

    /// Finish background work and release the database lock.
    ///
    /// Idempotent; also runs on drop of the last handle.
    pub fn close(&self) -> Result<()> {
        self.inner.close();
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Implementation
// ------------------------------------------------------------------------------------------------

/// One queued writer; completed writers learn their result here.
struct WriterState {
    batch: Option<WriteBatch>,
    sync: bool,
    result: Mutex<Option<Result<()>>>,
}

/// A caller-requested compaction being fed to the background thread.
struct ManualCompaction {
    level: usize,
    done: bool,
    begin: Option<InternalKey>,
    end: Option<InternalKey>,
}

struct DbState {
    db_lock: Option<Box<dyn FileLock>>,
    mem: Arc<MemTable>,
    imm: Option<Arc<MemTable>>,
    log: Option<LogWriter>,
    log_file_number: u64,
    versions: VersionSet,
    writers: VecDeque<Arc<WriterState>>,
    /// Files being written by flush/compaction; exempt from GC.
    pending_outputs: HashSet<u64>,
    bg_compaction_scheduled: bool,
    manual_compaction: Option<Arc<Mutex<ManualCompaction>>>,
    /// First background failure; writes fail until reopen.
    bg_error: Option<Status>,
}

struct DbImpl {
    dbname: PathBuf,
    options: Options,
    env: Arc<dyn Env>,
    icmp: InternalKeyComparator,
    table_cache: Arc<TableCache>,
    state: Mutex<DbState>,
    /// Signaled when background work completes.
    bg_cv: Condvar,
    /// Signaled when the writer queue advances.
    writers_cv: Condvar,
    snapshots: SnapshotList,
    shutting_down: AtomicBool,
    /// Mirror of `state.imm.is_some()`, readable without the mutex so
    /// the compaction loop can yield to a pending flush cheaply.
    has_imm: AtomicBool,
    /// Back-reference for handing the background scheduler an owning
    /// handle; set once right after construction.
    me: OnceLock<Weak<DbImpl>>,
}

impl Drop for Db {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.inner.close();
        }
    }
}

impl DbImpl {
    // --------------------------------------------------------------------------------------------
    // Open and recovery
    // --------------------------------------------------------------------------------------------

    fn open(dbname: &Path, options: Options) -> Result<Arc<DbImpl>> {
        let options = options.sanitized();
        let env = options.env.clone();
        let icmp = InternalKeyComparator::new(options.comparator.clone());

        let _ = env.create_dir(dbname);
        let db_lock = env.lock_file(&lock_file_name(dbname))?;

        let table_cache = Arc::new(TableCache::new(
            dbname.to_path_buf(),
            options.clone(),
            options.max_open_files - 10,
        ));
        let versions = VersionSet::new(
            dbname.to_path_buf(),
            options.clone(),
            Arc::clone(&table_cache),
            icmp.clone(),
        );

        let db = Arc::new(DbImpl {
            dbname: dbname.to_path_buf(),
            env: env.clone(),
            icmp: icmp.clone(),
            table_cache,
            state: Mutex::new(DbState {
                db_lock: Some(db_lock),
                mem: Arc::new(MemTable::new(icmp.clone())),
                imm: None,
                log: None,
                log_file_number: 0,
                versions,
                writers: VecDeque::new(),
                pending_outputs: HashSet::new(),
                bg_compaction_scheduled: false,
                manual_compaction: None,
                bg_error: None,
            }),
            bg_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            snapshots: SnapshotList::new(),
            shutting_down: AtomicBool::new(false),
            has_imm: AtomicBool::new(false),
            me: OnceLock::new(),
            options,
        });
        let _ = db.me.set(Arc::downgrade(&db));

        let mut state = db.state.lock().unwrap();
        let mut edit = VersionEdit::new();
        db.recover(&mut state, &mut edit)?;

        if state.log.is_none() {
            // Recovery did not hand back a reusable log: start a new
            // one, with an empty memtable.
            let new_log_number = state.versions.new_file_number();
            let file = env.new_writable_file(&log_file_name(&db.dbname, new_log_number))?;
            state.log = Some(LogWriter::new(file));
            state.log_file_number = new_log_number;
        }

        edit.set_prev_log_number(0);
        edit.set_log_number(state.log_file_number);
        let (mut state, status) = db.log_and_apply(state, &mut edit);
        status?;

        db.delete_obsolete_files(&mut state);
        db.maybe_schedule_compaction(&mut state);
        drop(state);

        info!(dbname = %db.dbname.display(), "database opened");
        Ok(db)
    }

    /// Load the persistent state: manifest, then every log newer than
    /// it. Leaves `state.log`/`state.mem` populated only when an
    /// existing log is being reused.
    fn recover(&self, state: &mut DbState, edit: &mut VersionEdit) -> Result<()> {
        let env = &self.env;

        if !env.file_exists(&current_file_name(&self.dbname)) {
            if !self.options.create_if_missing {
                return Err(Status::InvalidArgument(format!(
                    "{}: does not exist (create_if_missing is false)",
                    self.dbname.display()
                )));
            }
            self.new_db()?;
        } else if self.options.error_if_exists {
            return Err(Status::InvalidArgument(format!(
                "{}: exists (error_if_exists is true)",
                self.dbname.display()
            )));
        }

        state.versions.recover()?;

        // Every table file any live version references must exist.
        let mut expected = state.versions.live_files();
        let children = env.get_children(&self.dbname)?;
        let mut logs: Vec<u64> = Vec::new();
        let min_log = state.versions.log_number();
        let prev_log = state.versions.prev_log_number();
        for name in &children {
            match parse_file_name(name) {
                Some(FileType::Table(number)) => {
                    expected.remove(&number);
                }
                Some(FileType::Log(number)) => {
                    expected.remove(&number);
                    if number >= min_log || number == prev_log {
                        logs.push(number);
                    }
                }
                _ => {}
            }
        }
        if !expected.is_empty() {
            return Err(Status::corruption(format!(
                "{} missing files; e.g. {}",
                expected.len(),
                table_file_name(&self.dbname, *expected.iter().next().unwrap()).display()
            )));
        }

        // Replay logs in order; they hold writes newer than the tables.
        logs.sort_unstable();
        let mut max_sequence: SequenceNumber = 0;
        let n_logs = logs.len();
        for (i, &log_number) in logs.iter().enumerate() {
            self.recover_log_file(
                state,
                log_number,
                i == n_logs - 1,
                edit,
                &mut max_sequence,
            )?;
            state.versions.mark_file_number_used(log_number);
        }

        if state.versions.last_sequence() < max_sequence {
            state.versions.set_last_sequence(max_sequence);
        }
        Ok(())
    }

    fn recover_log_file(
        &self,
        state: &mut DbState,
        log_number: u64,
        last_log: bool,
        edit: &mut VersionEdit,
        max_sequence: &mut SequenceNumber,
    ) -> Result<()> {
        struct LogReporter {
            paranoid: bool,
            status: Arc<Mutex<Option<Status>>>,
        }
        impl Reporter for LogReporter {
            fn corruption(&mut self, bytes: usize, reason: &str) {
                warn!(bytes, reason, "log file corruption during recovery");
                if self.paranoid {
                    let mut status = self.status.lock().unwrap();
                    if status.is_none() {
                        *status = Some(Status::corruption(format!(
                            "log corruption: {reason} ({bytes} bytes)"
                        )));
                    }
                }
            }
        }

        let path = log_file_name(&self.dbname, log_number);
        let file = self.env.new_sequential_file(&path)?;
        let reporter_status: Arc<Mutex<Option<Status>>> = Arc::new(Mutex::new(None));
        let mut reader = LogReader::new(
            file,
            Some(Box::new(LogReporter {
                paranoid: self.options.paranoid_checks,
                status: Arc::clone(&reporter_status),
            })),
            true,
        );
        info!(log = log_number, "replaying log file");

        let mut record = Vec::new();
        let mut batch = WriteBatch::new();
        let mut mem: Option<Arc<MemTable>> = None;
        let mut compactions = 0;

        while reader.read_record(&mut record) {
            if let Some(status) = reporter_status.lock().unwrap().take() {
                return Err(status);
            }
            if record.len() < 12 {
                warn!(len = record.len(), "log record too small");
                continue;
            }

            let mem_ref = mem.get_or_insert_with(|| Arc::new(MemTable::new(self.icmp.clone())));
            let applied = batch
                .set_contents(&record)
                .and_then(|_| batch.insert_into(mem_ref));
            if let Err(e) = applied {
                if self.options.paranoid_checks {
                    return Err(e);
                }
                warn!(error = %e, "ignoring bad log record");
                continue;
            }

            if batch.count() > 0 {
                let last_seq = batch.sequence() + batch.count() as u64 - 1;
                if last_seq > *max_sequence {
                    *max_sequence = last_seq;
                }
            }

            if mem_ref.approximate_memory_usage() > self.options.write_buffer_size {
                compactions += 1;
                let full = mem.take().unwrap();
                let status = self.write_level0_table_locked(state, &full, edit, None);
                status?;
            }
        }
        if let Some(status) = reporter_status.lock().unwrap().take() {
            return Err(status);
        }

        if self.options.reuse_logs && last_log && compactions == 0 {
            // Keep appending to this log; keep its memtable live.
            let size = self.env.get_file_size(&path)?;
            let dest = self.env.new_appendable_file(&path)?;
            info!(log = log_number, size, "reusing log file");
            state.log = Some(LogWriter::new_with_dest_length(dest, size));
            state.log_file_number = log_number;
            state.mem = mem.unwrap_or_else(|| Arc::new(MemTable::new(self.icmp.clone())));
            return Ok(());
        }

        if let Some(full) = mem {
            self.write_level0_table_locked(state, &full, edit, None)?;
        }
        Ok(())
    }

    /// Create a fresh database: manifest 1 plus `CURRENT`.
    fn new_db(&self) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.set_comparator_name(self.options.comparator.name());
        edit.set_log_number(0);
        edit.set_next_file_number(2);
        edit.set_last_sequence(0);

        let manifest = descriptor_file_name(&self.dbname, 1);
        let file = self.env.new_writable_file(&manifest)?;
        let mut log = LogWriter::new(file);
        let mut record = Vec::new();
        edit.encode_to(&mut record);
        let result = log.add_record(&record).and_then(|_| log.sync());
        match result {
            Ok(()) => set_current_file(self.env.as_ref(), &self.dbname, 1),
            Err(e) => {
                let _ = self.env.delete_file(&manifest);
                Err(e)
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    fn get(&self, ro: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (snapshot_seq, mem, imm, current) = {
            let state = self.state.lock().unwrap();
            let seq = match &ro.snapshot {
                Some(snapshot) => snapshot.sequence(),
                None => state.versions.last_sequence(),
            };
            (
                seq,
                Arc::clone(&state.mem),
                state.imm.clone(),
                state.versions.current(),
            )
        };

        let lookup = LookupKey::new(key, snapshot_seq);
        let mut charge = None;
        let result = loop {
            // Probe newest to oldest; a tombstone anywhere stops the
            // search.
            match mem.get(&lookup) {
                MemTableGet::Found(value) => break Ok(Some(value)),
                MemTableGet::Deleted => break Ok(None),
                MemTableGet::NotFound => {}
            }
            if let Some(imm) = &imm {
                match imm.get(&lookup) {
                    MemTableGet::Found(value) => break Ok(Some(value)),
                    MemTableGet::Deleted => break Ok(None),
                    MemTableGet::NotFound => {}
                }
            }
            let (from_files, seek_charge) = current.get(ro, &lookup, &self.table_cache)?;
            charge = seek_charge;
            break match from_files {
                VersionGet::Found(value) => Ok(Some(value)),
                VersionGet::Deleted | VersionGet::NotFound => Ok(None),
            };
        };

        if current.update_stats(charge) {
            let mut state = self.state.lock().unwrap();
            self.maybe_schedule_compaction(&mut state);
        }
        result
    }

    fn new_iterator(&self, ro: &ReadOptions) -> DbIterator {
        let state = self.state.lock().unwrap();
        let sequence = match &ro.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => state.versions.last_sequence(),
        };
        let mem = Arc::clone(&state.mem);
        let imm = state.imm.clone();
        let current = state.versions.current();
        drop(state);

        let mut children: Vec<Box<dyn Iter>> = Vec::new();
        children.push(Box::new(mem.iter()));
        if let Some(imm) = &imm {
            children.push(Box::new(imm.iter()));
        }
        current.add_iterators(ro, &self.table_cache, &mut children);
        let merged = Box::new(MergingIter::new(self.icmp.clone(), children));

        DbIterator::new(
            self.options.comparator.clone(),
            merged,
            sequence,
            IterPins {
                mem,
                imm,
                version: current,
            },
        )
    }

    fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().unwrap();
        self.snapshots.acquire(state.versions.last_sequence())
    }

    // --------------------------------------------------------------------------------------------
    // Write path
    // --------------------------------------------------------------------------------------------

    /// Commit `batch`; `None` forces a memtable rotation instead.
    fn write(&self, opts: &WriteOptions, batch: Option<WriteBatch>) -> Result<()> {
        let me = Arc::new(WriterState {
            batch,
            sync: opts.sync,
            result: Mutex::new(None),
        });

        let mut state = self.state.lock().unwrap();
        state.writers.push_back(Arc::clone(&me));
        loop {
            if let Some(result) = me.result.lock().unwrap().take() {
                // A preceding group leader already committed this batch.
                return result;
            }
            if state
                .writers
                .front()
                .is_some_and(|front| Arc::ptr_eq(front, &me))
            {
                break;
            }
            state = self.writers_cv.wait(state).unwrap();
        }

        // This writer leads; it commits for itself and absorbed peers.
        let force_rotation = me.batch.is_none();
        let (returned, room_status) = self.make_room_for_write(state, force_rotation);
        state = returned;

        let mut status = room_status;
        let mut last_writer_index = 0;
        if status.is_ok() && me.batch.is_some() {
            let (mut group, last_index) = build_batch_group(&state);
            last_writer_index = last_index;

            let last_sequence = state.versions.last_sequence();
            group.set_sequence(last_sequence + 1);
            let count = group.count() as u64;

            // The queue discipline makes this writer the only one
            // touching the log and memtable: safe without the mutex.
            let mut log = state.log.take().expect("log writer present");
            let mem = Arc::clone(&state.mem);
            drop(state);

            let mut sync_error = false;
            let mut write_status = log.add_record(group.contents());
            if write_status.is_ok() && opts.sync {
                write_status = log.sync();
                if write_status.is_err() {
                    sync_error = true;
                }
            }
            if write_status.is_ok() {
                write_status = group.insert_into(&mem);
            }

            state = self.state.lock().unwrap();
            state.log = Some(log);
            if sync_error {
                // The log tail state is unknown; stop accepting writes.
                self.record_background_error(
                    &mut state,
                    write_status
                        .as_ref()
                        .err()
                        .cloned()
                        .unwrap_or_else(|| Status::corruption("log sync failed")),
                );
            }
            if write_status.is_ok() {
                state.versions.set_last_sequence(last_sequence + count);
            }
            status = write_status;
        }

        // Complete every absorbed writer (front is this one).
        for i in 0..=last_writer_index {
            let writer = state.writers.pop_front().expect("grouped writer present");
            if i > 0 {
                *writer.result.lock().unwrap() = Some(status.clone());
            }
        }
        if !state.writers.is_empty() {
            self.writers_cv.notify_all();
        }
        drop(state);
        status
    }

    /// Ensure the active memtable can take a write, rotating or
    /// stalling per the level-0 back-pressure rules.
    fn make_room_for_write<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
        mut force: bool,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let mut allow_delay = !force;
        loop {
            if let Some(e) = &state.bg_error {
                let e = e.clone();
                return (state, Err(e));
            }

            if allow_delay
                && state.versions.num_level_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // Gentle back-pressure: give the compactor one
                // millisecond, once, instead of stalling this writer.
                drop(state);
                self.env.sleep_for_micros(1000);
                allow_delay = false;
                state = self.state.lock().unwrap();
                continue;
            }

            if !force
                && state.mem.approximate_memory_usage() <= self.options.write_buffer_size
            {
                return (state, Ok(()));
            }

            if state.imm.is_some() {
                debug!("write waits: previous memtable still flushing");
                state = self.bg_cv.wait(state).unwrap();
                continue;
            }

            if state.versions.num_level_files(0) >= L0_STOP_WRITES_TRIGGER {
                warn!("write stalls: too many level-0 files");
                state = self.bg_cv.wait(state).unwrap();
                continue;
            }

            // Rotate: new log, new memtable; the old one flushes in the
            // background.
            let new_log_number = state.versions.new_file_number();
            let file = match self
                .env
                .new_writable_file(&log_file_name(&self.dbname, new_log_number))
            {
                Ok(file) => file,
                Err(e) => {
                    state.versions.reuse_file_number(new_log_number);
                    return (state, Err(e));
                }
            };
            state.log = Some(LogWriter::new(file));
            state.log_file_number = new_log_number;
            let old_mem = std::mem::replace(
                &mut state.mem,
                Arc::new(MemTable::new(self.icmp.clone())),
            );
            state.imm = Some(old_mem);
            self.has_imm.store(true, AtomicOrdering::Release);
            debug!(log = new_log_number, "memtable rotated");
            force = false;
            self.maybe_schedule_compaction(&mut state);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Background work
    // --------------------------------------------------------------------------------------------

    fn record_background_error(&self, state: &mut DbState, e: Status) {
        if state.bg_error.is_none() {
            error!(error = %e, "background error; writes disabled until reopen");
            state.bg_error = Some(e);
            self.bg_cv.notify_all();
        }
    }

    fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.bg_compaction_scheduled {
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
        let Some(db) = self.me.get().and_then(Weak::upgrade) else {
            return;
        };
        state.bg_compaction_scheduled = true;
        self.env.schedule(Box::new(move || db.background_call()));
    }

    fn background_call(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.bg_compaction_scheduled);

        if !self.shutting_down.load(AtomicOrdering::Acquire) && state.bg_error.is_none() {
            state = self.background_compaction(state);
        }

        state.bg_compaction_scheduled = false;
        // The just-finished round may have unlocked more work.
        self.maybe_schedule_compaction(&mut state);
        self.bg_cv.notify_all();
        self.writers_cv.notify_all();
    }

    fn background_compaction<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
    ) -> MutexGuard<'a, DbState> {
        if state.imm.is_some() {
            return self.compact_memtable(state);
        }

        let manual = state.manual_compaction.clone();
        let compaction: Option<Compaction> = match &manual {
            Some(manual_arc) => {
                let m = manual_arc.lock().unwrap();
                let c = state
                    .versions
                    .compact_range(m.level, m.begin.as_ref(), m.end.as_ref());
                debug!(
                    level = m.level,
                    some = c.is_some(),
                    "manual compaction round"
                );
                c
            }
            None => state.versions.pick_compaction(),
        };

        let mut manual_end = InternalKey::default();

        match compaction {
            None => {
                if let Some(manual_arc) = &manual {
                    manual_arc.lock().unwrap().done = true;
                }
            }
            Some(mut c) if manual.is_none() && c.is_trivial_move() => {
                // Re-home the file by metadata alone.
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
                let mut edit = c.take_edit();
                let (returned, status) = self.log_and_apply(state, &mut edit);
                state = returned;
                if let Err(e) = status {
                    self.record_background_error(&mut state, e);
                } else {
                    info!(
                        file = file.number,
                        from = level,
                        to = level + 1,
                        bytes = file.file_size,
                        "trivial move"
                    );
                }
                c.release_inputs();
            }
            Some(mut c) => {
                if c.num_input_files(0) > 0 {
                    let last = c.input(0, c.num_input_files(0) - 1);
                    manual_end = last.largest.clone();
                }
                let (returned, status) = self.do_compaction_work(state, &mut c);
                state = returned;
                if let Err(e) = status {
                    if !self.shutting_down.load(AtomicOrdering::Acquire) {
                        self.record_background_error(&mut state, e);
                    }
                }
                c.release_inputs();
                self.delete_obsolete_files(&mut state);
            }
        }

        if let Some(manual_arc) = &manual {
            let mut m = manual_arc.lock().unwrap();
            if state.bg_error.is_some() {
                m.done = true;
            }
            if !m.done {
                // Only part of the range was compacted; resume after
                // the last key this round covered.
                m.begin = Some(manual_end);
            }
            state.manual_compaction = None;
        }
        state
    }

    fn compact_memtable<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
    ) -> MutexGuard<'a, DbState> {
        let imm = state.imm.clone().expect("immutable memtable present");
        let mut edit = VersionEdit::new();
        let base = state.versions.current();

        let (returned, mut status) =
            self.write_level0_table(state, &imm, &mut edit, Some(&base));
        state = returned;

        if status.is_ok() && self.shutting_down.load(AtomicOrdering::Acquire) {
            status = Err(Status::Io(std::io::Error::other(
                "database shut down during memtable flush",
            )));
        }

        if status.is_ok() {
            // The flushed log (and any predecessor) is now disposable.
            edit.set_prev_log_number(0);
            edit.set_log_number(state.log_file_number);
            let (returned, apply_status) = self.log_and_apply(state, &mut edit);
            state = returned;
            status = apply_status;
        }

        match status {
            Ok(()) => {
                state.imm = None;
                self.has_imm.store(false, AtomicOrdering::Release);
                self.delete_obsolete_files(&mut state);
            }
            Err(e) => {
                self.record_background_error(&mut state, e);
            }
        }
        state
    }

    /// Build a table from `mem` and register it in `edit`, placed at
    /// the lowest level it can safely occupy.
    fn write_level0_table<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Arc<crate::version::Version>>,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        info!(file = number, "level-0 table build started");

        drop(state);
        let result = self.build_table(number, mem);
        let mut state = self.state.lock().unwrap();
        state.pending_outputs.remove(&number);

        match result {
            Err(e) => {
                let _ = self.env.delete_file(&table_file_name(&self.dbname, number));
                (state, Err(e))
            }
            Ok(None) => {
                // Empty memtable; nothing to register.
                (state, Ok(()))
            }
            Ok(Some(meta)) => {
                let mut level = 0;
                if let Some(base) = base {
                    level = base.pick_level_for_memtable_output(
                        &self.options,
                        meta.smallest.user_key(),
                        meta.largest.user_key(),
                    );
                }
                info!(
                    file = meta.number,
                    bytes = meta.file_size,
                    level,
                    "level-0 table build finished"
                );
                edit.add_file(
                    level,
                    meta.number,
                    meta.file_size,
                    meta.smallest.clone(),
                    meta.largest.clone(),
                );
                (state, Ok(()))
            }
        }
    }

    /// Variant of [`write_level0_table`] for recovery, where the state
    /// lock is already held exclusively by open.
    fn write_level0_table_locked(
        &self,
        state: &mut DbState,
        mem: &Arc<MemTable>,
        edit: &mut VersionEdit,
        base: Option<&Arc<crate::version::Version>>,
    ) -> Result<()> {
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);
        let result = self.build_table(number, mem);
        state.pending_outputs.remove(&number);

        match result {
            Err(e) => {
                let _ = self.env.delete_file(&table_file_name(&self.dbname, number));
                Err(e)
            }
            Ok(None) => Ok(()),
            Ok(Some(meta)) => {
                let mut level = 0;
                if let Some(base) = base {
                    level = base.pick_level_for_memtable_output(
                        &self.options,
                        meta.smallest.user_key(),
                        meta.largest.user_key(),
                    );
                }
                edit.add_file(
                    level,
                    meta.number,
                    meta.file_size,
                    meta.smallest.clone(),
                    meta.largest.clone(),
                );
                Ok(())
            }
        }
    }

    /// Stream `mem` into table file `number`; `None` when empty.
    fn build_table(&self, number: u64, mem: &Arc<MemTable>) -> Result<Option<FileMetaData>> {
        let path = table_file_name(&self.dbname, number);
        let mut iter = mem.iter();
        iter.seek_to_first();
        if !iter.valid() {
            return Ok(None);
        }

        let file = self.env.new_writable_file(&path)?;
        let mut builder = TableBuilder::new(self.options.clone(), file);
        let smallest = InternalKey::decode_from(iter.key());
        let mut largest = InternalKey::default();
        while iter.valid() {
            largest.clone_from_encoded(iter.key());
            builder.add(iter.key(), iter.value())?;
            iter.next();
        }
        let (_, file_size) = builder.finish()?;
        iter.status()?;

        // The freshly written table must open cleanly before the
        // manifest may reference it.
        let meta = FileMetaData::new(number, file_size, smallest, largest);
        let mut check = self.table_cache.iter(&ReadOptions::new(), number, file_size);
        check.seek_to_first();
        check.status()?;
        Ok(Some(meta))
    }

    /// The three-step manifest apply around the state lock.
    fn log_and_apply<'a>(
        &'a self,
        mut state: MutexGuard<'a, DbState>,
        edit: &mut VersionEdit,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        // Serialization argument: version edits originate only from the
        // single background task and from open/recovery, never from
        // concurrent threads.
        let mut job: ManifestJob = state.versions.prepare_apply(edit);
        drop(state);
        let io_result = job.write();
        let mut state = self.state.lock().unwrap();
        let result = state.versions.finish_apply(job, io_result);
        (state, result)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction runner
    // --------------------------------------------------------------------------------------------

    fn do_compaction_work<'a>(
        &'a self,
        state: MutexGuard<'a, DbState>,
        compaction: &mut Compaction,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        let start_micros = self.env.now_micros();
        info!(
            level = compaction.level(),
            inputs_low = compaction.num_input_files(0),
            inputs_high = compaction.num_input_files(1),
            "compaction started"
        );

        // Entries older than every live snapshot and shadowed by a
        // newer entry can be dropped.
        let smallest_snapshot = self
            .snapshots
            .oldest(state.versions.last_sequence());

        let mut input = state.versions.make_input_iterator(compaction);
        drop(state);

        let mut outputs = CompactionOutputs::default();
        let mut status: Result<()> = Ok(());
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut last_sequence_for_key = MAX_SEQUENCE_NUMBER;

        input.seek_to_first();
        while input.valid() {
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                status = Err(Status::Io(std::io::Error::other(
                    "database shut down during compaction",
                )));
                break;
            }

            // A pending memtable flush outranks compaction progress.
            if self.has_imm.load(AtomicOrdering::Acquire) {
                let state = self.state.lock().unwrap();
                if state.imm.is_some() {
                    let state = self.compact_memtable(state);
                    drop(state);
                    self.bg_cv.notify_all();
                }
            }

            let key = input.key().to_vec();
            if outputs.builder.is_some() && compaction.should_stop_before(&key) {
                status = self.finish_compaction_output(&mut outputs);
                if status.is_err() {
                    break;
                }
            }

            // Key drop rules, per run of equal user keys (newest first).
            let mut drop_entry = false;
            match ParsedInternalKey::parse(&key) {
                Err(_) => {
                    // Undecodable: keep it and reset the run so nothing
                    // hides behind it.
                    current_user_key = None;
                    last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                }
                Ok(parsed) => {
                    let first_occurrence = current_user_key
                        .as_deref()
                        .is_none_or(|prev| {
                            self.options.comparator.compare(&parsed.user_key, prev)
                                != std::cmp::Ordering::Equal
                        });
                    if first_occurrence {
                        current_user_key = Some(parsed.user_key.clone());
                        last_sequence_for_key = MAX_SEQUENCE_NUMBER;
                    }

                    if last_sequence_for_key <= smallest_snapshot {
                        // Shadowed by a newer entry that every live
                        // snapshot already sees.
                        drop_entry = true;
                    } else if parsed.value_type == ValueType::Deletion
                        && parsed.sequence <= smallest_snapshot
                        && compaction.is_base_level_for_key(&parsed.user_key)
                    {
                        // A tombstone with nothing underneath it to hide.
                        drop_entry = true;
                    }
                    last_sequence_for_key = parsed.sequence;
                }
            }

            if !drop_entry {
                if outputs.builder.is_none() {
                    status = self.open_compaction_output(&mut outputs);
                    if status.is_err() {
                        break;
                    }
                }
                let out = outputs.current.as_mut().expect("open output");
                if out.smallest.is_empty() {
                    out.smallest = InternalKey::decode_from(&key);
                }
                out.largest.clone_from_encoded(&key);

                let builder = outputs.builder.as_mut().expect("open builder");
                status = builder.add(&key, input.value());
                if status.is_err() {
                    break;
                }
                if builder.file_size() >= compaction.max_output_file_size() {
                    status = self.finish_compaction_output(&mut outputs);
                    if status.is_err() {
                        break;
                    }
                }
            }

            input.next();
        }

        if status.is_ok() && outputs.builder.is_some() {
            status = self.finish_compaction_output(&mut outputs);
        }
        if status.is_ok() {
            status = input.status();
        }
        drop(input);

        let output_numbers = outputs_files(&outputs);
        let mut state = self.state.lock().unwrap();
        for number in &output_numbers {
            // Outputs stay deletion-exempt until the manifest lands;
            // once here, either the manifest install or the error path
            // below settles their fate.
            state.pending_outputs.remove(number);
        }

        if status.is_ok() {
            let (returned, install) = self.install_compaction_results(state, compaction, outputs);
            state = returned;
            status = install;
        } else {
            for number in &output_numbers {
                let _ = self.env.delete_file(&table_file_name(&self.dbname, *number));
            }
        }

        info!(
            level = compaction.level(),
            micros = self.env.now_micros() - start_micros,
            ok = status.is_ok(),
            "compaction finished"
        );
        (state, status)
    }

    fn open_compaction_output(&self, outputs: &mut CompactionOutputs) -> Result<()> {
        let number = {
            let mut state = self.state.lock().unwrap();
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };
        let path = table_file_name(&self.dbname, number);
        let file = self.env.new_writable_file(&path)?;
        outputs.builder = Some(TableBuilder::new(self.options.clone(), file));
        outputs.current = Some(CompactionOutput {
            number,
            file_size: 0,
            smallest: InternalKey::default(),
            largest: InternalKey::default(),
        });
        Ok(())
    }

    fn finish_compaction_output(&self, outputs: &mut CompactionOutputs) -> Result<()> {
        let builder = outputs.builder.take().expect("open builder");
        let mut out = outputs.current.take().expect("open output");
        let (entries, file_size) = builder.finish()?;
        out.file_size = file_size;
        debug_assert!(entries > 0);

        // Verify the output is readable before relying on it.
        let mut check = self
            .table_cache
            .iter(&ReadOptions::new(), out.number, out.file_size);
        check.seek_to_first();
        check.status()?;

        debug!(file = out.number, bytes = out.file_size, entries, "compaction output");
        outputs.finished.push(out);
        Ok(())
    }

    fn install_compaction_results<'a>(
        &'a self,
        state: MutexGuard<'a, DbState>,
        compaction: &mut Compaction,
        outputs: CompactionOutputs,
    ) -> (MutexGuard<'a, DbState>, Result<()>) {
        compaction.add_input_deletions();
        let level = compaction.level();
        for out in &outputs.finished {
            compaction.edit_mut().add_file(
                level + 1,
                out.number,
                out.file_size,
                out.smallest.clone(),
                out.largest.clone(),
            );
        }
        let mut edit = compaction.take_edit();
        self.log_and_apply(state, &mut edit)
    }

    // --------------------------------------------------------------------------------------------
    // Manual compaction
    // --------------------------------------------------------------------------------------------

    fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        // Find the highest level with overlap; level-0 and level-1 are
        // always visited because flushes land there.
        let mut max_level_with_files = 1;
        {
            let state = self.state.lock().unwrap();
            let current = state.versions.current();
            for level in 1..NUM_LEVELS {
                if current.overlap_in_level(level, begin, end) {
                    max_level_with_files = level;
                }
            }
        }

        self.force_memtable_flush()?;

        for level in 0..max_level_with_files {
            self.compact_range_at_level(level, begin, end)?;
        }
        Ok(())
    }

    /// Rotate the active memtable and wait for its flush to finish.
    fn force_memtable_flush(&self) -> Result<()> {
        // An empty write with no batch forces rotation.
        self.write(&WriteOptions::default(), None)?;
        let mut state = self.state.lock().unwrap();
        while state.imm.is_some() && state.bg_error.is_none() {
            state = self.bg_cv.wait(state).unwrap();
        }
        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn compact_range_at_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<()> {
        debug_assert!(level + 1 < NUM_LEVELS);

        let manual = Arc::new(Mutex::new(ManualCompaction {
            level,
            done: false,
            begin: begin
                .map(|k| InternalKey::new(k, MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK)),
            end: end.map(|k| InternalKey::new(k, 0, ValueType::Deletion)),
        }));

        loop {
            let mut state = self.state.lock().unwrap();
            if self.shutting_down.load(AtomicOrdering::Acquire) {
                return Err(Status::Io(std::io::Error::other(
                    "database shutting down",
                )));
            }
            if let Some(e) = &state.bg_error {
                return Err(e.clone());
            }
            if manual.lock().unwrap().done {
                return Ok(());
            }
            if state.manual_compaction.is_none() {
                state.manual_compaction = Some(Arc::clone(&manual));
                self.maybe_schedule_compaction(&mut state);
            }
            drop(self.bg_cv.wait(state).unwrap());
        }
    }

    // --------------------------------------------------------------------------------------------
    // File GC and shutdown
    // --------------------------------------------------------------------------------------------

    /// Delete every file not referenced by a live version, a pending
    /// output, or the current logs/manifest.
    fn delete_obsolete_files(&self, state: &mut DbState) {
        if state.bg_error.is_some() {
            // The version state may not reflect disk; do not guess.
            return;
        }

        let mut live = state.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());
        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_number = state.versions.manifest_file_number();

        let Ok(children) = self.env.get_children(&self.dbname) else {
            return;
        };
        for name in children {
            let Some(file_type) = parse_file_name(&name) else {
                continue;
            };
            let keep = match file_type {
                FileType::Log(number) => number >= log_number || number == prev_log_number,
                FileType::Descriptor(number) => number >= manifest_number,
                FileType::Table(number) => live.contains(&number),
                FileType::Temp(number) => live.contains(&number),
                FileType::Current | FileType::DbLock | FileType::InfoLog => true,
            };
            if keep {
                continue;
            }
            if let FileType::Table(number) = file_type {
                self.table_cache.evict(number);
            }
            debug!(file = %name, "deleting obsolete file");
            if let Err(e) = self.env.delete_file(&self.dbname.join(&name)) {
                warn!(file = %name, error = %e, "failed to delete obsolete file");
            }
        }
    }

    /// Stop background work and release the database lock.
    fn close(&self) {
        self.shutting_down.store(true, AtomicOrdering::Release);
        let mut state = self.state.lock().unwrap();
        while state.bg_compaction_scheduled {
            state = self.bg_cv.wait(state).unwrap();
        }
        if let Some(mut log) = state.log.take() {
            let _ = log.flush();
        }
        state.db_lock = None;
        info!(dbname = %self.dbname.display(), "database closed");
    }
}

// ------------------------------------------------------------------------------------------------
// Compaction output bookkeeping
// ------------------------------------------------------------------------------------------------

struct CompactionOutput {
    number: u64,
    file_size: u64,
    smallest: InternalKey,
    largest: InternalKey,
}

#[derive(Default)]
struct CompactionOutputs {
    builder: Option<TableBuilder>,
    current: Option<CompactionOutput>,
    finished: Vec<CompactionOutput>,
}

fn outputs_files(outputs: &CompactionOutputs) -> Vec<u64> {
    let mut numbers: Vec<u64> = outputs.finished.iter().map(|o| o.number).collect();
    if let Some(current) = &outputs.current {
        numbers.push(current.number);
    }
    numbers
}

/// Merge the front writer's batch with as many successors as fit the
/// group budget. Returns the combined batch and the index of the last
/// absorbed writer.
fn build_batch_group(state: &DbState) -> (WriteBatch, usize) {
    let first = state.writers.front().expect("leader present");
    let first_batch = first.batch.as_ref().expect("leader carries a batch");

    let mut size = first_batch.approximate_size();
    let max_size = if size <= SMALL_BATCH_BYTES {
        size + SMALL_BATCH_BYTES
    } else {
        MAX_BATCH_GROUP_BYTES
    };

    let mut group = first_batch.clone();
    let mut last_index = 0;
    for (i, writer) in state.writers.iter().enumerate().skip(1) {
        if writer.sync && !first.sync {
            // A sync write must not piggyback on a non-sync commit.
            break;
        }
        let Some(batch) = &writer.batch else {
            // Rotation requests do their own work.
            break;
        };
        size += batch.approximate_size();
        if size > max_size {
            break;
        }
        group.append(batch);
        last_index = i;
    }
    (group, last_index)
}
