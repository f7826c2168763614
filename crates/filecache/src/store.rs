//! Shared handle to one location's store

use crate::entry::CacheEntry;
use crate::key::CacheKey;
use crate::Result;
use filecache_store::LogStore;
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A shared, thread-safe handle to a persistent store
///
/// Clones refer to the same underlying file. Every operation takes the
/// store's mutex for its duration.
#[derive(Clone)]
pub struct CacheStore {
    path: Arc<PathBuf>,
    inner: Arc<Mutex<LogStore<CacheEntry>>>,
}

impl CacheStore {
    /// Open the store file at `path`
    ///
    /// # Errors
    ///
    /// Fails when the underlying log cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = LogStore::open(&path)?;
        Ok(Self {
            path: Arc::new(path),
            inner: Arc::new(Mutex::new(store)),
        })
    }

    /// Path of the store file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up an entry
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`](crate::Error::Store) once the store is closed.
    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.inner.lock().get(key)?.cloned())
    }

    /// Whether an entry exists for `key`
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`](crate::Error::Store) once the store is closed.
    pub fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().contains_key(key)?)
    }

    /// Insert or overwrite an entry without flushing
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`](crate::Error::Store) once the store is
    /// closed or when the entry cannot be encoded.
    pub fn insert(&self, key: impl Into<String>, entry: CacheEntry) -> Result<()> {
        Ok(self.inner.lock().insert(key, entry)?)
    }

    /// Insert or overwrite an entry, flushing under the same lock when
    /// `sync` is set
    pub(crate) fn write(&self, key: CacheKey, entry: CacheEntry, sync: bool) -> Result<()> {
        let mut store = self.inner.lock();
        store.insert(key.into_string(), entry)?;
        if sync {
            store.flush()?;
        }
        Ok(())
    }

    /// Remove an entry, returning whether it existed
    ///
    /// The deletion is buffered like any write; call [`flush`](Self::flush)
    /// to make it durable.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`](crate::Error::Store) once the store is closed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().remove(key)?)
    }

    /// Remove every entry for which `keep` returns false
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`](crate::Error::Store) once the store is closed.
    pub fn retain(&self, keep: impl FnMut(&str, &CacheEntry) -> bool) -> Result<usize> {
        Ok(self.inner.lock().retain(keep)?)
    }

    /// Snapshot of the live keys
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`](crate::Error::Store) once the store is closed.
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().keys()?.map(str::to_string).collect())
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the store has no live entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Write buffered records to disk
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`](crate::Error::Store) when the store is
    /// closed or the write fails.
    pub fn flush(&self) -> Result<()> {
        Ok(self.inner.lock().flush()?)
    }

    /// Rewrite the file with only the live entries
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Store`](crate::Error::Store) when the store is
    /// closed or the log cannot be rewritten.
    pub fn compact(&self) -> Result<()> {
        Ok(self.inner.lock().compact()?)
    }

    /// Flush and close; every later operation on any clone fails
    ///
    /// # Errors
    ///
    /// Returns the error of the final flush.
    pub fn close(&self) -> Result<()> {
        Ok(self.inner.lock().close()?)
    }

    /// Whether the store was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_closed()
    }

    /// Whether two handles share the same underlying store
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
