//! Append-only log store

use crate::record::{self, Header};
use crate::{Error, Result};
use fs4::fs_std::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A durable string-keyed map backed by a single append-only file
///
/// Every mutation is appended to an in-memory buffer and reaches the file
/// on [`flush`](Self::flush). Reads are served from an in-memory index
/// rebuilt by replaying the file on [`open`](Self::open).
///
/// The handle is not internally synchronized; share it behind a mutex.
#[derive(Debug)]
pub struct LogStore<V> {
    path: PathBuf,
    lock_path: PathBuf,
    file: Option<File>,
    entries: BTreeMap<String, V>,
    pending: Vec<u8>,
    records: usize,
}

impl<V> LogStore<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Open (or create) the store at `path`
    ///
    /// A missing file is created together with its parent directories. A
    /// torn final record left by an interrupted append is truncated away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the file or its directory cannot be
    /// created, read, locked or written, and [`Error::Corrupt`] when the
    /// contents do not replay as a store of `V`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lock_path = sibling(&path, "lock");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }

        let mut file = open_append(&path)?;
        let guard = lock(&lock_path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| Error::io(e, &path, "read"))?;
        let contents = String::from_utf8(bytes)
            .map_err(|e| Error::corrupt(&path, 0, format!("store is not UTF-8: {e}")))?;

        let replay = record::replay::<V>(&path, &contents)?;

        if replay.torn_tail {
            warn!(
                target: "filecache::store",
                path = %path.display(),
                dropped_bytes = contents.len() - replay.valid_len,
                "Discarding torn record at end of store"
            );
            file.set_len(replay.valid_len as u64)
                .map_err(|e| Error::io(e, &path, "truncate"))?;
        }

        if replay.valid_len == 0 {
            append_all(&mut file, Header::current().to_line()?.as_bytes())
                .map_err(|e| Error::io(e, &path, "write"))?;
            file.sync_data()
                .map_err(|e| Error::io(e, &path, "sync_data"))?;
        }
        drop(guard);

        info!(
            target: "filecache::store",
            path = %path.display(),
            entries = replay.entries.len(),
            records = replay.records,
            "Opened store"
        );

        Ok(Self {
            path,
            lock_path,
            file: Some(file),
            entries: replay.entries,
            pending: Vec::new(),
            records: replay.records,
        })
    }

    /// Look up a key
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close).
    pub fn get(&self, key: &str) -> Result<Option<&V>> {
        self.ensure_open()?;
        Ok(self.entries.get(key))
    }

    /// Check whether a key is present
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close).
    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.entries.contains_key(key))
    }

    /// Insert or overwrite a key
    ///
    /// The record is buffered until the next [`flush`](Self::flush).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close) and
    /// [`Error::Serialization`] when the value cannot be encoded.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Result<()> {
        self.ensure_open()?;
        let key = key.into();
        let line = record::put_line(&key, &value)?;
        self.pending.extend_from_slice(line.as_bytes());
        self.records += 1;
        self.entries.insert(key, value);
        Ok(())
    }

    /// Remove a key, returning whether it was present
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close).
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        if self.entries.remove(key).is_none() {
            return Ok(false);
        }
        let line = record::delete_line(key)?;
        self.pending.extend_from_slice(line.as_bytes());
        self.records += 1;
        Ok(true)
    }

    /// Remove every entry for which `keep` returns false
    ///
    /// Returns the number of removed entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close).
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &V) -> bool) -> Result<usize> {
        self.ensure_open()?;
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|&(k, v)| !keep(k.as_str(), v))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.remove(key)?;
        }
        Ok(doomed.len())
    }

    /// Iterate over the live keys in order
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close).
    pub fn keys(&self) -> Result<impl Iterator<Item = &str>> {
        self.ensure_open()?;
        Ok(self.entries.keys().map(String::as_str))
    }

    /// Iterate over the live entries in key order
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close).
    pub fn iter(&self) -> Result<impl Iterator<Item = (&str, &V)>> {
        self.ensure_open()?;
        Ok(self.entries.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store has no live entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of records in the log, including overwritten and deleted ones
    #[must_use]
    pub fn log_records(&self) -> usize {
        self.records
    }

    /// Path of the log file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Write buffered records to the file and sync them to disk
    ///
    /// A failed write leaves the file as it was and keeps the records
    /// buffered, so a later flush appends them once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close) and
    /// [`Error::Io`] when locking, writing or syncing fails.
    pub fn flush(&mut self) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(Error::closed(&self.path));
        };
        if self.pending.is_empty() {
            return Ok(());
        }

        let _guard = lock(&self.lock_path)?;
        append_all(file, &self.pending).map_err(|e| Error::io(e, &self.path, "write"))?;
        // The records are in the file now even if the sync fails.
        let synced = file.sync_data();
        let bytes = self.pending.len();
        self.pending.clear();
        synced.map_err(|e| Error::io(e, &self.path, "sync_data"))?;

        debug!(
            target: "filecache::store",
            path = %self.path.display(),
            bytes,
            "Flushed store"
        );
        Ok(())
    }

    /// Rewrite the log so it holds only the live entries
    ///
    /// The new log is written to a temporary sibling, synced, and renamed
    /// over the old one. Buffered records are folded in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close) and
    /// [`Error::Io`] when the replacement log cannot be written or renamed.
    pub fn compact(&mut self) -> Result<()> {
        self.ensure_open()?;
        let _guard = lock(&self.lock_path)?;

        let tmp_path = sibling(&self.path, "tmp");
        let mut contents = Header::current().to_line()?;
        for (key, value) in &self.entries {
            contents.push_str(&record::put_line(key, value)?);
        }

        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| Error::io(e, &tmp_path, "open"))?;
        tmp.write_all(contents.as_bytes())
            .map_err(|e| Error::io(e, &tmp_path, "write_all"))?;
        tmp.sync_all()
            .map_err(|e| Error::io(e, &tmp_path, "sync_all"))?;
        drop(tmp);

        // Release our handle before the rename so the old inode is not kept alive.
        self.file = None;
        let renamed = fs::rename(&tmp_path, &self.path)
            .map_err(|e| Error::io(e, &self.path, "rename"));
        self.file = Some(open_append(&self.path)?);
        renamed?;

        let before = self.records;
        self.records = self.entries.len();
        self.pending.clear();

        info!(
            target: "filecache::store",
            path = %self.path.display(),
            records_before = before,
            records_after = self.records,
            "Compacted store"
        );
        Ok(())
    }

    /// Flush and release the file
    ///
    /// Closing an already closed store is a no-op. Every other operation on
    /// a closed store fails with [`Error::Closed`].
    ///
    /// # Errors
    ///
    /// Returns the error of the final flush; the store is closed either way.
    pub fn close(&mut self) -> Result<()> {
        if self.file.is_none() {
            return Ok(());
        }
        let flushed = self.flush();
        self.file = None;
        self.entries.clear();
        self.pending.clear();
        info!(target: "filecache::store", path = %self.path.display(), "Closed store");
        flushed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::closed(&self.path));
        }
        Ok(())
    }
}

impl<V> Drop for LogStore<V> {
    fn drop(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if self.pending.is_empty() {
            return;
        }
        let written = lock(&self.lock_path).and_then(|_guard| {
            append_all(file, &self.pending)
                .and_then(|()| file.sync_data())
                .map_err(|e| Error::io(e, &self.path, "write"))
        });
        if let Err(e) = written {
            warn!(
                target: "filecache::store",
                path = %self.path.display(),
                "Failed to flush store on drop: {e}"
            );
        }
    }
}

/// A writer whose end can be cut back to an earlier length
trait Truncate: Write {
    fn end(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl Truncate for File {
    fn end(&self) -> io::Result<u64> {
        self.metadata().map(|meta| meta.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Append `bytes` entirely or not at all
///
/// A short write is cut back off so the log still ends on a line boundary.
fn append_all<W: Truncate>(target: &mut W, bytes: &[u8]) -> io::Result<()> {
    let start = target.end()?;
    let Err(e) = target.write_all(bytes) else {
        return Ok(());
    };
    if let Err(undo) = target.truncate(start) {
        warn!(
            target: "filecache::store",
            "Failed to roll back partial append: {undo}"
        );
    }
    Err(e)
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| Error::io(e, path, "open"))
}

/// Take the cross-process advisory lock; released when the file drops
fn lock(lock_path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|e| Error::io(e, lock_path, "open"))?;
    FileExt::lock_exclusive(&file).map_err(|e| Error::io(e, lock_path, "lock_exclusive"))?;
    Ok(file)
}

/// `<path>.<ext>`, keeping the original extension
fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}
