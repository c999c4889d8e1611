//! # StrataDB
//!
//! An embeddable, persistent, ordered key-value store built on a
//! **leveled Log-Structured Merge Tree (LSM-tree)**. Designed for
//! fast writes, cheap ordered scans, and crash-safe operation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                           Db                              │
//! │  ┌────────────┐   ┌─────────────┐   ┌─────────────────┐  │
//! │  │  Active     │   │  Immutable  │   │ SSTables        │  │
//! │  │  MemTable   │   │  MemTable   │   │ level 0 … 6     │  │
//! │  │  + WAL      │   │  + WAL      │   │ (on disk)       │  │
//! │  └─────┬───────┘   └──────┬──────┘   └────────┬────────┘  │
//! │        │   rotate         │   flush           │           │
//! │        └──────────►       └─────────►         │           │
//! │                                               │           │
//! │  ┌────────────────────────────────────────────┘           │
//! │  │   Compaction (size-, seek-, and manually driven)      │
//! │  └────────────────────────────────────────────────────────│
//! │                                                           │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │   VersionSet + manifest (log of version edits)      │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Database facade — open, read, write, scan, snapshots, compaction scheduling |
//! | [`memtable`] | Arena-backed skiplist write buffer |
//! | [`wal`] | Blocked, CRC-protected write-ahead log |
//! | [`sstable`] | Immutable sorted tables: blocks, filters, builder, reader, caches |
//! | [`version`] | Immutable per-level file sets, manifest, compaction picker |
//! | [`batch`] | Atomic multi-update batches with group commit support |
//! | [`snapshot`] | Pinned-sequence read views |
//! | [`env`] | Pluggable filesystem / scheduling / clock services |
//!
//! ## Key properties
//!
//! - **Write-ahead logging** — every committed batch is in the WAL
//!   before it is acknowledged; `sync: true` writes survive process
//!   and machine crashes.
//! - **Atomic batches** — a [`WriteBatch`] commits entirely or not at
//!   all, under one contiguous range of sequence numbers.
//! - **Snapshot isolation** — a [`Snapshot`] pins a sequence number;
//!   reads through it are repeatable regardless of later writes and
//!   compactions.
//! - **Ordered iteration** — forward and backward scans over the merged
//!   view of memtables and every level.
//! - **Crash recovery** — the manifest replays version edits, then log
//!   files replay writes newer than the tables.
//! - **Bloom filters** — optional per-table filters short-circuit point
//!   lookups for absent keys.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use stratadb::{Db, Options, ReadOptions, WriteOptions};
//!
//! let options = Options {
//!     create_if_missing: true,
//!     ..Options::default()
//! };
//! let db = Db::open("/tmp/my_db", options).unwrap();
//!
//! // Write
//! db.put(&WriteOptions::default(), b"hello", b"world").unwrap();
//!
//! // Read
//! let value = db.get(&ReadOptions::new(), b"hello").unwrap();
//! assert_eq!(value.as_deref(), Some(b"world".as_slice()));
//!
//! // Snapshot, then overwrite
//! let snap = db.snapshot();
//! db.put(&WriteOptions::default(), b"hello", b"moon").unwrap();
//! let ro = ReadOptions { snapshot: Some(snap), ..ReadOptions::new() };
//! assert_eq!(db.get(&ro, b"hello").unwrap().as_deref(), Some(b"world".as_slice()));
//!
//! // Delete
//! db.delete(&WriteOptions::default(), b"hello").unwrap();
//! assert_eq!(db.get(&ReadOptions::new(), b"hello").unwrap(), None);
//!
//! db.close().unwrap();
//! ```

pub mod batch;
pub mod cache;
pub mod comparator;
pub mod crc;
pub mod db;
pub mod dbformat;
pub mod encoding;
pub mod env;
pub mod filename;
pub mod filter;
pub mod iterator;
pub mod memtable;
pub mod options;
pub mod snapshot;
pub mod sstable;
pub mod status;
pub mod version;
pub mod wal;

pub use batch::{BatchHandler, WriteBatch};
pub use comparator::{BytewiseComparator, Comparator};
pub use db::{Db, DbIterator};
pub use env::{Env, StdEnv};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use iterator::Iter;
pub use options::{CompressionType, Options, ReadOptions, WriteOptions};
pub use snapshot::Snapshot;
pub use status::{Result, Status};
