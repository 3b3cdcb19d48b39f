//! Database-directory file naming.
//!
//! Every file the engine creates lives directly in the database
//! directory and follows one of seven forms:
//!
//! | Name | Contents |
//! |---|---|
//! | `LOCK` | advisory lock file |
//! | `CURRENT` | name of the live manifest, newline-terminated |
//! | `MANIFEST-<N>` | log-framed version edits |
//! | `<N>.log` | write-ahead log |
//! | `<N>.ldb` | sorted table |
//! | `<N>.dbtmp` | staging file for atomic CURRENT swaps |
//! | `LOG` / `LOG.old` | human-readable info logs |

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// The kind of a database file, as parsed from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// `<N>.log`
    Log,
    /// `LOCK`
    DbLock,
    /// `<N>.ldb`
    Table,
    /// `MANIFEST-<N>`
    Descriptor,
    /// `CURRENT`
    Current,
    /// `<N>.dbtmp`
    Temp,
    /// `LOG` or `LOG.old`
    InfoLog,
}

/// Path of write-ahead log `number`.
pub fn log_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    dbname.join(format!("{:06}.log", number))
}

/// Path of table file `number`.
pub fn table_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    dbname.join(format!("{:06}.ldb", number))
}

/// Path of manifest `number`.
pub fn descriptor_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    dbname.join(format!("MANIFEST-{:06}", number))
}

/// Path of the CURRENT pointer file.
pub fn current_file_name(dbname: &Path) -> PathBuf {
    dbname.join("CURRENT")
}

/// Path of the advisory lock file.
pub fn lock_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOCK")
}

/// Path of temp file `number`.
pub fn temp_file_name(dbname: &Path, number: u64) -> PathBuf {
    debug_assert!(number > 0);
    dbname.join(format!("{:06}.dbtmp", number))
}

/// Path of the info log.
pub fn info_log_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOG")
}

/// Path of the rotated info log.
pub fn old_info_log_file_name(dbname: &Path) -> PathBuf {
    dbname.join("LOG.old")
}

/// Parses a bare file name (no directory) into its type and number.
///
/// Names without a number (CURRENT, LOCK, LOG, LOG.old) parse with
/// number 0. Unknown names return `None`; directory scans skip them.
pub fn parse_file_name(filename: &str) -> Option<(u64, FileType)> {
    match filename {
        "CURRENT" => return Some((0, FileType::Current)),
        "LOCK" => return Some((0, FileType::DbLock)),
        "LOG" | "LOG.old" => return Some((0, FileType::InfoLog)),
        _ => {}
    }

    if let Some(rest) = filename.strip_prefix("MANIFEST-") {
        let number = parse_decimal(rest)?;
        return Some((number, FileType::Descriptor));
    }

    let dot = filename.find('.')?;
    let number = parse_decimal(&filename[..dot])?;
    let file_type = match &filename[dot..] {
        ".log" => FileType::Log,
        ".ldb" => FileType::Table,
        ".dbtmp" => FileType::Temp,
        _ => return None,
    };
    Some((number, file_type))
}

fn parse_decimal(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Atomically points CURRENT at `MANIFEST-<descriptor_number>`.
///
/// The contents are staged in a `.dbtmp` file, synced, and renamed over
/// CURRENT so a crash leaves either the old or the new pointer, never a
/// torn one.
pub fn set_current_file(dbname: &Path, descriptor_number: u64) -> Result<()> {
    let contents = format!("MANIFEST-{:06}\n", descriptor_number);
    let tmp = temp_file_name(dbname, descriptor_number);

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, current_file_name(dbname))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
