//! In-memory caches for table blocks and open table handles.

pub mod lru;

pub use lru::LruCache;
