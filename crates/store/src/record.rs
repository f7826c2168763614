//! On-disk record format
//!
//! A store file is line-delimited JSON. The first line is a [`Header`];
//! every following line is one record:
//!
//! ```text
//! {"format":"filecache-store","version":1}
//! {"op":"put","key":"square:[3]","value":{...}}
//! {"op":"delete","key":"square:[3]"}
//! ```
//!
//! Replaying the records in order yields the current contents: the last
//! record for a key wins.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Format identifier written into every header
pub const FORMAT_NAME: &str = "filecache-store";

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// First line of every store file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Always [`FORMAT_NAME`]
    pub format: String,
    /// Always [`FORMAT_VERSION`]
    pub version: u32,
}

impl Header {
    /// Header for the current format
    #[must_use]
    pub fn current() -> Self {
        Self {
            format: FORMAT_NAME.to_string(),
            version: FORMAT_VERSION,
        }
    }

    /// Encode as a newline-terminated line
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if JSON encoding fails.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| Error::serialization(format!("Failed to encode header: {e}")))?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum RecordRef<'a, V> {
    Put { key: &'a str, value: &'a V },
    Delete { key: &'a str },
}

/// A put always carries its value, so a `null` value is still a value
#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record<V> {
    Put { key: String, value: V },
    Delete { key: String },
}

/// Encode a put record as a newline-terminated line
///
/// # Errors
///
/// Returns [`Error::Serialization`] when `value` cannot be encoded as JSON.
pub fn put_line<V: Serialize>(key: &str, value: &V) -> Result<String> {
    encode(key, &RecordRef::Put { key, value })
}

/// Encode a delete record as a newline-terminated line
///
/// # Errors
///
/// Returns [`Error::Serialization`] if JSON encoding fails.
pub fn delete_line(key: &str) -> Result<String> {
    encode::<()>(key, &RecordRef::Delete { key })
}

fn encode<V: Serialize>(key: &str, record: &RecordRef<'_, V>) -> Result<String> {
    let mut line = serde_json::to_string(record)
        .map_err(|e| Error::serialization(format!("Failed to encode record for {key}: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Result of replaying a log
#[derive(Debug)]
pub struct Replay<V> {
    /// Live entries after applying every record
    pub entries: BTreeMap<String, V>,
    /// Number of records (excluding the header) in the log
    pub records: usize,
    /// Byte length of the complete, newline-terminated prefix
    pub valid_len: usize,
    /// Whether an unterminated final line was skipped
    pub torn_tail: bool,
}

/// Replay the contents of a store file
///
/// An empty file replays to an empty store. A final line without a
/// trailing newline is a torn append and is skipped, but only once a
/// complete header has been seen; a file with no complete header and
/// trailing bytes is corrupt.
///
/// # Errors
///
/// Returns [`Error::Corrupt`] for a missing or foreign header and for
/// any complete line that is not a valid record.
pub fn replay<V: DeserializeOwned>(path: &Path, contents: &str) -> Result<Replay<V>> {
    let valid_len = contents.rfind('\n').map_or(0, |i| i + 1);
    let (complete, tail) = contents.split_at(valid_len);

    let mut lines = complete.split('\n').enumerate();
    let mut entries = BTreeMap::new();
    let mut records = 0usize;

    if valid_len == 0 {
        if !tail.is_empty() {
            return Err(Error::corrupt(path, 1, "missing store header"));
        }
        return Ok(Replay {
            entries,
            records,
            valid_len,
            torn_tail: false,
        });
    }

    if let Some((_, first)) = lines.next() {
        let header: Header = serde_json::from_str(first.trim_end_matches('\r'))
            .map_err(|e| Error::corrupt(path, 1, format!("invalid header: {e}")))?;
        if header != Header::current() {
            return Err(Error::corrupt(
                path,
                1,
                format!(
                    "unsupported format {} version {}",
                    header.format, header.version
                ),
            ));
        }
    }

    for (idx, raw) in lines {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let record: Record<V> = serde_json::from_str(line)
            .map_err(|e| Error::corrupt(path, idx + 1, e.to_string()))?;
        match record {
            Record::Put { key, value } => {
                entries.insert(key, value);
            }
            Record::Delete { key } => {
                entries.remove(&key);
            }
        }
        records += 1;
    }

    Ok(Replay {
        entries,
        records,
        valid_len,
        torn_tail: !tail.is_empty(),
    })
}
