//! Bounded cache of open table files.
//!
//! Opening a table costs a file handle plus footer/index/filter reads,
//! so open tables are kept in an LRU keyed by file number. Capacity is
//! `max_open_files - 10`, leaving headroom for the log, manifest, and
//! lock handles. Evicting an entry drops the cache's reference; the
//! file actually closes when the last iterator over it finishes.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::cache::ShardedCache;
use crate::filename::{sst_table_file_name, table_file_name};
use crate::iterator::{EmptyIter, Iter};
use crate::options::{Options, ReadOptions};
use crate::status::Result;

use super::Table;

/// Shared handle cache over a database's table files.
pub struct TableCache {
    dbname: PathBuf,
    options: Options,
    cache: ShardedCache<u64, Table>,
}

impl TableCache {
    /// A cache of at most `entries` open tables for `dbname`.
    pub fn new(dbname: PathBuf, options: Options, entries: usize) -> TableCache {
        TableCache {
            dbname,
            options,
            cache: ShardedCache::new(entries),
        }
    }

    /// The open table for `file_number`, opening it on miss.
    pub fn find_table(&self, file_number: u64, file_size: u64) -> Result<Arc<Table>> {
        if let Some(table) = self.cache.lookup(&file_number) {
            return Ok(table);
        }

        let env = &self.options.env;
        let path = table_file_name(&self.dbname, file_number);
        let file = match env.new_random_access_file(&path) {
            Ok(file) => file,
            Err(primary_err) => {
                // Tables written under the legacy extension stay readable.
                let old_path = sst_table_file_name(&self.dbname, file_number);
                match env.new_random_access_file(&old_path) {
                    Ok(file) => file,
                    Err(_) => return Err(primary_err),
                }
            }
        };

        let table = Arc::new(Table::open(self.options.clone(), file, file_size)?);
        self.cache.insert(file_number, Arc::clone(&table), 1);
        debug!(file_number, file_size, "table added to cache");
        Ok(table)
    }

    /// Iterator over table `file_number`; errors surface via `status()`.
    pub fn iter(&self, ro: &ReadOptions, file_number: u64, file_size: u64) -> Box<dyn Iter> {
        match self.find_table(file_number, file_size) {
            Ok(table) => Table::iter(&table, ro),
            Err(e) => Box::new(EmptyIter::with_status(e)),
        }
    }

    /// Point probe into table `file_number`; see [`Table::internal_get`].
    pub fn get(
        &self,
        ro: &ReadOptions,
        file_number: u64,
        file_size: u64,
        ikey: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.find_table(file_number, file_size)?;
        table.internal_get(ro, ikey)
    }

    /// Drop the cached handle for a deleted table file.
    pub fn evict(&self, file_number: u64) {
        self.cache.erase(&file_number);
    }
}
