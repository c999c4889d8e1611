//! Database file naming.
//!
//! Every file under a database directory has a name the engine can
//! parse back into a type and number:
//!
//! | Pattern | Contents |
//! |---------|----------|
//! | `CURRENT` | name of the live manifest |
//! | `LOCK` | advisory lock file |
//! | `MANIFEST-<n>` | version-edit log |
//! | `<n>.log` | write-ahead log |
//! | `<n>.ldb` / `<n>.sst` | table file (`.sst` read for compatibility) |
//! | `<n>.dbtmp` | scratch for atomic renames |
//! | `LOG` / `LOG.old` | informational logs from older tooling |
//!
//! `parse_file_name` must recognize every name the engine (or its
//! ancestors) ever wrote, since obsolete-file collection deletes
//! whatever it does not recognize as live.

use std::path::{Path, PathBuf};

/// Parsed identity of a database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// `<n>.log`
    Log(u64),
    /// `LOCK`
    DbLock,
    /// `<n>.ldb` or `<n>.sst`
    Table(u64),
    /// `MANIFEST-<n>`
    Descriptor(u64),
    /// `CURRENT`
    Current,
    /// `<n>.dbtmp`
    Temp(u64),
    /// `LOG` or `LOG.old`
    InfoLog,
}

/// `dbname/<number>.log`
pub fn log_file_name(dbname: &Path, number: u64) -> PathBuf {
    make_file_name(dbname, number, "log")
}

/// `dbname/<number>.ldb`
pub fn table_file_name(dbname: &Path, number: u64) -> PathBuf {
    make_file_name(dbname, number, "ldb")
}

/// `dbname/<number>.sst` — legacy table extension, read-only.
pub fn sst_table_file_name(dbname: &Path, number: u64) -> PathBuf {
    make_file_name(dbname, number, "sst")
}

/// `dbname/MANIFEST-<number>`
pub fn descriptor_file_name(dbname: &Path, number: u64) -> PathBuf {
    dbname.join(format!("MANIFEST-{number:06}"))
}

/// `dbname/CURRENT`
pub fn current_file_name(dbname: &Path) -> PathBuf {
    dbname.join("CURRENT")
}

/// `dbname/LOCK`
pub fn lock_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOCK")
}

/// `dbname/<number>.dbtmp`
pub fn temp_file_name(dbname: &Path, number: u64) -> PathBuf {
    make_file_name(dbname, number, "dbtmp")
}

fn make_file_name(dbname: &Path, number: u64, suffix: &str) -> PathBuf {
    dbname.join(format!("{number:06}.{suffix}"))
}

/// Recognize a bare file name (no directory).
pub fn parse_file_name(name: &str) -> Option<FileType> {
    match name {
        "CURRENT" => return Some(FileType::Current),
        "LOCK" => return Some(FileType::DbLock),
        "LOG" | "LOG.old" => return Some(FileType::InfoLog),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = parse_decimal(rest)?;
        return Some(FileType::Descriptor(number));
    }

    let (digits, suffix) = name.split_once('.')?;
    let number = parse_decimal(digits)?;
    match suffix {
        "log" => Some(FileType::Log(number)),
        "ldb" | "sst" => Some(FileType::Table(number)),
        "dbtmp" => Some(FileType::Temp(number)),
        _ => None,
    }
}

fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructed_names_parse_back() {
        let db = Path::new("/tmp/db");
        let cases = [
            (log_file_name(db, 100), FileType::Log(100)),
            (table_file_name(db, 5), FileType::Table(5)),
            (sst_table_file_name(db, 5), FileType::Table(5)),
            (descriptor_file_name(db, 3), FileType::Descriptor(3)),
            (current_file_name(db), FileType::Current),
            (lock_file_name(db), FileType::DbLock),
            (temp_file_name(db, 9), FileType::Temp(9)),
        ];
        for (path, expected) in cases {
            let name = path.file_name().unwrap().to_str().unwrap();
            assert_eq!(parse_file_name(name), Some(expected), "{name}");
        }
    }

    #[test]
    fn info_logs_are_recognized() {
        assert_eq!(parse_file_name("LOG"), Some(FileType::InfoLog));
        assert_eq!(parse_file_name("LOG.old"), Some(FileType::InfoLog));
    }

    #[test]
    fn large_numbers() {
        let name = format!("{}.log", u64::MAX);
        assert_eq!(parse_file_name(&name), Some(FileType::Log(u64::MAX)));
    }

    #[test]
    fn garbage_is_rejected() {
        for name in [
            "", "foo", "foo-dx-100.log", ".log", "100", "100.", "100.abc",
            "MANIFEST", "MANIFEST-", "MANIFEST-abc", "CURRENT.bak", "184467440737095516160.log",
        ] {
            assert_eq!(parse_file_name(name), None, "{name}");
        }
    }
}
