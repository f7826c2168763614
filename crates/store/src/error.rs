//! Error types for the store crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for store operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error while opening, reading, writing or syncing the log
    #[error("I/O {operation} failed: {}", path.display())]
    #[diagnostic(
        code(filecache::store::io),
        help("Check file permissions and free disk space for the store directory")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error
        path: Box<Path>,
        /// Operation that failed (e.g., "open", "write", "sync_data")
        operation: String,
    },

    /// The log file exists but its contents cannot be replayed
    #[error("Store {} is corrupt at line {line}: {message}", path.display())]
    #[diagnostic(
        code(filecache::store::corrupt),
        help("Delete or repair the store file; it will be recreated on the next open")
    )]
    Corrupt {
        /// Path of the corrupt log file
        path: Box<Path>,
        /// 1-based line number of the offending record (0 for whole-file problems)
        line: usize,
        /// Description of what could not be parsed
        message: String,
    },

    /// The handle was closed and can no longer be used
    #[error("Store {} is closed", path.display())]
    #[diagnostic(code(filecache::store::closed))]
    Closed {
        /// Path of the closed log file
        path: Box<Path>,
    },

    /// A record could not be encoded
    #[error("Serialization error: {message}")]
    #[diagnostic(code(filecache::store::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: path.as_ref().into(),
            operation: operation.into(),
        }
    }

    /// Create a corruption error for a given line
    #[must_use]
    pub fn corrupt(path: impl AsRef<Path>, line: usize, message: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.as_ref().into(),
            line,
            message: message.into(),
        }
    }

    /// Create a closed-handle error
    #[must_use]
    pub fn closed(path: impl AsRef<Path>) -> Self {
        Self::Closed {
            path: path.as_ref().into(),
        }
    }

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn io_error_mentions_operation_and_path() {
        let err = Error::io(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            PathBuf::from("/tmp/.x.cache"),
            "open",
        );
        let msg = err.to_string();
        assert!(msg.contains("open"));
        assert!(msg.contains("/tmp/.x.cache"));
    }

    #[test]
    fn corrupt_error_reports_line() {
        let err = Error::corrupt("/data/.a.cache", 7, "expected value");
        let msg = err.to_string();
        assert!(msg.contains("line 7"));
        assert!(msg.contains("expected value"));
    }
}
