//! # SiltDB - An Embedded LSM-Tree Key-Value Store
//!
//! SiltDB is a persistent, ordered key-value storage engine built on a
//! log-structured merge tree. Writes land in a write-ahead log and an
//! in-memory skiplist; background work flushes frozen memtables to
//! sorted table files and compacts them across seven levels.
//!
//! ## Architecture
//!
//! - **WAL**: block-framed, checksummed log that makes writes durable
//! - **MemTable**: arena-backed skiplist holding unflushed writes
//! - **SSTable**: immutable sorted table files with block index and
//!   bloom filter
//! - **Manifest**: log of version edits describing the level layout
//! - **Compaction**: background merging that keeps reads cheap and
//!   reclaims deleted space
//!
//! ## Example
//!
//! ```rust,no_run
//! use siltdb::{DB, Options, WriteBatch, WriteOptions};
//!
//! # fn main() -> Result<(), siltdb::Error> {
//! let db = DB::open("./data", Options::default().create_if_missing(true))?;
//!
//! db.put(b"key1", b"value1")?;
//! if let Some(value) = db.get(b"key1")? {
//!     println!("found: {:?}", value);
//! }
//!
//! // Atomic multi-key writes:
//! let mut batch = WriteBatch::new();
//! batch.put(b"key2", b"value2");
//! batch.delete(b"key1");
//! db.write(&WriteOptions::sync(), batch)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! A `DB` handle is `Send + Sync`. Writers from any number of threads
//! serialize through an internal FIFO queue with group commit; readers
//! run lock-free against memtables and immutable table files and never
//! wait for writers.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod comparator;
pub mod compaction;
pub mod config;
pub mod db;
pub mod error;
pub mod filename;
pub mod filter;
pub mod memtable;
pub mod snapshot;
pub mod sstable;
pub mod table_cache;
pub mod util;
pub mod version;
pub mod wal;
pub mod write_batch;

pub use config::{Options, ReadOptions, WriteOptions};
pub use db::DB;
pub use error::{Error, Result};
pub use snapshot::Snapshot;
pub use write_batch::WriteBatch;
