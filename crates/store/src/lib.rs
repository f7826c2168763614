//! Durable key-value store for filecache
//!
//! This crate provides the persistence primitive behind filecache:
//! - A single append-only file per store, one JSON record per line
//! - Point lookup, upsert, delete and key iteration from an in-memory index
//! - An explicit [`LogStore::flush`] that syncs buffered records to disk,
//!   distinct from [`LogStore::close`]
//! - Compaction into a fresh file via write-to-temp-and-rename
//!
//! # Durability
//!
//! Records reach the disk only on `flush`, `compact`, `close`, or drop. A
//! record that was flushed is visible to every handle opened afterwards.
//!
//! # Concurrency
//!
//! A `LogStore` is a plain owned value; callers serialize access to it.
//! Writes to the file take an advisory lock on a `.lock` sibling so that two
//! processes never interleave partial records. Handles in different
//! processes do not see each other's writes until they reopen.

mod error;
pub mod log;
pub mod record;

pub use error::{Error, Result};
pub use log::LogStore;
pub use record::{FORMAT_NAME, FORMAT_VERSION};
