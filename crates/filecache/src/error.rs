//! Error types for the filecache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Coarse classification of cache-machinery failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Arguments or a result could not be turned into a key or stored value
    Unserializable,
    /// The persistent store could not be opened, read or written
    StoreUnavailable,
}

/// Error type for cache operations
///
/// Only failures of the caching machinery are represented here. Errors
/// raised by a wrapped computation are returned to the caller untouched.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Value could not be encoded by any strategy, or a stored value could
    /// not be decoded
    #[error("Cannot serialize {subject}: {message}")]
    #[diagnostic(
        code(filecache::unserializable),
        help("Arguments and results must implement serde::Serialize without failing")
    )]
    Unserializable {
        /// What was being encoded ("arguments", "result", "cached value")
        subject: String,
        /// Failure messages from every strategy that was tried
        message: String,
    },

    /// The persistent store failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] filecache_store::Error),

    /// Store location could not be resolved
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(filecache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl Error {
    /// Create an unserializable error
    #[must_use]
    pub fn unserializable(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unserializable {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Classify this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unserializable { .. } => ErrorKind::Unserializable,
            Self::Store(_) | Self::Configuration { .. } => ErrorKind::StoreUnavailable,
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
