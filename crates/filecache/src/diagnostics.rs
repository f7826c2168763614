//! Diagnostic sink for cache-machinery failures

use crate::Error;
use chrono::{DateTime, SecondsFormat, Utc};
use std::error::Error as _;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Receives every cache-machinery failure before it is returned or
/// suppressed
///
/// Implementations must not fail or panic; recording is best-effort.
pub trait DiagnosticSink: Send + Sync {
    /// Record one failure
    fn record(&self, error: &Error);
}

impl<F> DiagnosticSink for F
where
    F: Fn(&Error) + Send + Sync,
{
    fn record(&self, error: &Error) {
        self(error);
    }
}

/// Append-only text log, one timestamped line per failure
#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    /// File name used when no explicit log path is configured
    pub const DEFAULT_FILE_NAME: &'static str = "filecache.err.log";

    /// Log appending to `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Log file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())
    }
}

impl DiagnosticSink for ErrorLog {
    fn record(&self, error: &Error) {
        let line = format_line(Utc::now(), error);
        // Failures of the log itself are swallowed.
        let _ = self.append(&line);
    }
}

/// `[<RFC 3339 timestamp>] <error>: <source>: ...`, newline-terminated
#[must_use]
pub fn format_line(at: DateTime<Utc>, error: &Error) -> String {
    let description = describe(error).replace(['\r', '\n'], " ");
    format!(
        "[{}] {description}\n",
        at.to_rfc3339_opts(SecondsFormat::Micros, false)
    )
}

/// The error followed by its whole source chain
#[must_use]
pub fn describe(error: &Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
