//! Filesystem and scheduling abstraction.
//!
//! The engine never touches `std::fs` directly; every file operation
//! goes through an [`Env`] so tests and embedders can interpose. The
//! contract mirrors what the storage layers need and nothing more:
//! sequential reads (log replay), positioned reads (tables), buffered
//! appends (logs, table builds), directory listing (obsolete-file GC),
//! an advisory lock (single-process ownership), a one-shot background
//! scheduler, and a clock.
//!
//! [`StdEnv`] is the shipped implementation: plain `std::fs` handles,
//! `memmap2` for positioned reads, and a single lazily-spawned worker
//! thread fed by a `crossbeam` channel for scheduling.
//!
//! All operations return a [`Status`] on failure; none panic.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Sender, unbounded};
use memmap2::Mmap;
use tracing::{debug, error};

use crate::status::{Result, Status};

// ------------------------------------------------------------------------------------------------
// File capabilities
// ------------------------------------------------------------------------------------------------

/// A file read from front to back (log replay).
pub trait SequentialFile: Send {
    /// Read up to `buf.len()` bytes, returning the count; 0 means EOF.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Skip `n` bytes forward.
    fn skip(&mut self, n: u64) -> Result<()>;
}

/// A file read at arbitrary offsets (tables). Shareable across threads.
pub trait RandomAccessFile: Send + Sync {
    /// Read exactly `n` bytes at `offset`.
    ///
    /// Returns `Corruption` when the file is shorter than `offset + n`.
    fn read(&self, offset: u64, n: usize) -> Result<Vec<u8>>;
}

/// An append-only file (logs, table builds).
pub trait WritableFile: Send {
    /// Append `data`, possibly buffering.
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Push buffered bytes to the OS.
    fn flush(&mut self) -> Result<()>;

    /// Flush and fsync.
    fn sync(&mut self) -> Result<()>;

    /// Flush and close the handle.
    fn close(&mut self) -> Result<()>;
}

/// An advisory file lock; released on drop.
pub trait FileLock: Send {}

// ------------------------------------------------------------------------------------------------
// Env
// ------------------------------------------------------------------------------------------------

/// Operating-system services required by the engine.
pub trait Env: Send + Sync {
    /// Open `path` for sequential reading.
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>>;

    /// Open `path` for positioned reading.
    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;

    /// Create (truncate) `path` for appending.
    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;

    /// Open `path` for appending, preserving existing content.
    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>>;

    /// Whether `path` exists.
    fn file_exists(&self, path: &Path) -> bool;

    /// File names (not paths) directly under `dir`.
    fn get_children(&self, dir: &Path) -> Result<Vec<String>>;

    /// Remove `path`.
    fn delete_file(&self, path: &Path) -> Result<()>;

    /// Create `dir`; succeeding when it already exists.
    fn create_dir(&self, dir: &Path) -> Result<()>;

    /// Size of `path` in bytes.
    fn get_file_size(&self, path: &Path) -> Result<u64>;

    /// Atomically rename `from` to `to`, replacing `to`.
    fn rename_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Take the advisory lock on `path`, creating the file if needed.
    ///
    /// Fails when another holder (process or handle) has it.
    fn lock_file(&self, path: &Path) -> Result<Box<dyn FileLock>>;

    /// Run `task` once on the background worker, FIFO with other tasks.
    fn schedule(&self, task: Box<dyn FnOnce() + Send>);

    /// Microseconds from some fixed point; monotonic enough for pacing.
    fn now_micros(&self) -> u64;

    /// Block the calling thread for `micros` microseconds.
    fn sleep_for_micros(&self, micros: u64);
}

/// The process-wide default [`Env`], created on first use.
pub fn default_env() -> Arc<dyn Env> {
    static DEFAULT: OnceLock<Arc<StdEnv>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(StdEnv::new())).clone()
}

// ------------------------------------------------------------------------------------------------
// StdEnv
// ------------------------------------------------------------------------------------------------

/// [`Env`] backed by the standard library, `memmap2`, and `crossbeam`.
pub struct StdEnv {
    /// Sender to the background worker; the thread spawns on first use.
    worker: OnceLock<Sender<Box<dyn FnOnce() + Send>>>,
}

impl StdEnv {
    /// A fresh environment with no worker thread yet.
    pub fn new() -> StdEnv {
        StdEnv {
            worker: OnceLock::new(),
        }
    }

    fn worker_sender(&self) -> &Sender<Box<dyn FnOnce() + Send>> {
        self.worker.get_or_init(|| {
            let (tx, rx) = unbounded::<Box<dyn FnOnce() + Send>>();
            std::thread::Builder::new()
                .name("stratadb-bg".into())
                .spawn(move || {
                    debug!("background worker started");
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                    debug!("background worker exiting");
                })
                .expect("failed to spawn background worker");
            tx
        })
    }
}

impl Default for StdEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Env for StdEnv {
    fn new_sequential_file(&self, path: &Path) -> Result<Box<dyn SequentialFile>> {
        let file = File::open(path)?;
        Ok(Box::new(StdSequentialFile {
            reader: BufReader::new(file),
        }))
    }

    fn new_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        // A zero-length file cannot be mapped; model it as "no bytes".
        let map = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Box::new(StdRandomAccessFile {
            path: path.to_path_buf(),
            map,
        }))
    }

    fn new_writable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(StdWritableFile {
            writer: Some(BufWriter::new(file)),
        }))
    }

    fn new_appendable_file(&self, path: &Path) -> Result<Box<dyn WritableFile>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(StdWritableFile {
            writer: Some(BufWriter::new(file)),
        }))
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn get_children(&self, dir: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn create_dir(&self, dir: &Path) -> Result<()> {
        match fs::create_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) => Err(Status::Io(e)),
        }
    }

    fn get_file_size(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn lock_file(&self, path: &Path) -> Result<Box<dyn FileLock>> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        match file.try_lock() {
            Ok(()) => Ok(Box::new(StdFileLock { _file: file })),
            Err(e) => Err(Status::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("lock {} held elsewhere: {e}", path.display()),
            ))),
        }
    }

    fn schedule(&self, task: Box<dyn FnOnce() + Send>) {
        if self.worker_sender().send(task).is_err() {
            error!("background worker channel closed; task dropped");
        }
    }

    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    fn sleep_for_micros(&self, micros: u64) {
        std::thread::sleep(std::time::Duration::from_micros(micros));
    }
}

// ------------------------------------------------------------------------------------------------
// StdEnv file handles
// ------------------------------------------------------------------------------------------------

struct StdSequentialFile {
    reader: BufReader<File>,
}

impl SequentialFile for StdSequentialFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.reader.read(buf)?)
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }
}

struct StdRandomAccessFile {
    path: PathBuf,
    map: Option<Mmap>,
}

impl RandomAccessFile for StdRandomAccessFile {
    fn read(&self, offset: u64, n: usize) -> Result<Vec<u8>> {
        let data: &[u8] = self.map.as_deref().unwrap_or(&[]);
        let offset = offset as usize;
        let end = offset.checked_add(n).ok_or_else(|| {
            Status::corruption(format!("read overflow in {}", self.path.display()))
        })?;
        if end > data.len() {
            return Err(Status::corruption(format!(
                "short read at {offset}+{n} in {} (len {})",
                self.path.display(),
                data.len()
            )));
        }
        Ok(data[offset..end].to_vec())
    }
}

struct StdWritableFile {
    writer: Option<BufWriter<File>>,
}

impl StdWritableFile {
    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| Status::Io(std::io::Error::other("file already closed")))
    }
}

impl WritableFile for StdWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.writer()?.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer()?.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        let writer = self.writer()?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

struct StdFileLock {
    // Dropping the handle releases the OS lock.
    _file: File,
}

impl FileLock for StdFileLock {}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
