//! Persistent, disk-backed memoization for filecache
//!
//! This crate wraps pure computations so that their results survive the
//! process:
//! - Keys derived from a computation's name and a canonical encoding of its
//!   arguments
//! - One store file per source location, shared by every computation defined
//!   there
//! - Per-wrapper validity windows, from zero (always recompute) to forever
//! - A failure policy that either returns cache errors or logs them and
//!   falls back to an uncached call
//!
//! # Overview
//!
//! A [`StoreRegistry`] owns the open stores. Wrappers are created from it,
//! either with default options through [`StoreRegistry::memoize`] or with
//! explicit [`CacheOptions`] through [`StoreRegistry::cached`]:
//!
//! ```rust,ignore
//! use filecache::{CacheOptions, StoreRegistry, HOUR};
//!
//! let registry = StoreRegistry::new();
//! let fetch = registry
//!     .cached(CacheOptions::within(HOUR).with_fail_silently(true))
//!     .wrap("fetch", |url: &str| download(url));
//! let body = fetch.call("https://example.com")?;
//! registry.close_all()?;
//! ```
//!
//! # Failures
//!
//! Only failures of the caching machinery are [`Error`]s. Each one is
//! emitted through `tracing` and recorded in the registry's
//! [`DiagnosticSink`] (by default an [`ErrorLog`] file) exactly once per
//! call. Errors returned by a wrapped computation through
//! [`Memoized::try_call`] are passed back untouched.

pub mod diagnostics;
pub mod entry;
mod error;
mod finite;
pub mod key;
pub mod location;
pub mod memo;
pub mod options;
pub mod registry;
pub mod store;

// Re-export error types at crate root
pub use error::{Error, ErrorKind, Result};

// Re-export main types
pub use diagnostics::{DiagnosticSink, ErrorLog};
pub use entry::{CacheEntry, Payload};
pub use key::{
    ArgumentEncoder, BinaryBase64, CacheKey, CanonicalJson, DefaultEncoder, EncodeError,
    Fallback, KeyDeriver, args_key, derive_key,
};
pub use location::StoreLocation;
pub use memo::{BoundMethod, FileCache, Memoized, MemoizedMethod};
pub use options::{CacheOptions, DAY, FOREVER, HOUR, MINUTE, MONTH, SECOND, Validity, WEEK, YEAR};
pub use registry::{RegistryConfig, StoreRegistry};
pub use store::CacheStore;
