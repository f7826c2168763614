//! Process-level registry of open stores

use crate::diagnostics::{DiagnosticSink, ErrorLog};
use crate::location::StoreLocation;
use crate::memo::{FileCache, Memoized};
use crate::options::CacheOptions;
use crate::store::CacheStore;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Registry-wide settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Put every store in this directory instead of next to its source
    pub root: Option<PathBuf>,
    /// Error log path; defaults to `filecache.err.log` in `root`, or in the
    /// working directory when no root is set
    pub error_log: Option<PathBuf>,
}

impl RegistryConfig {
    /// Default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store root
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Set the error log path
    #[must_use]
    pub fn with_error_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.error_log = Some(path.into());
        self
    }

    /// Error log path after applying defaults
    #[must_use]
    pub fn error_log_path(&self) -> PathBuf {
        match (&self.error_log, &self.root) {
            (Some(path), _) => path.clone(),
            (None, Some(root)) => root.join(ErrorLog::DEFAULT_FILE_NAME),
            (None, None) => PathBuf::from(ErrorLog::DEFAULT_FILE_NAME),
        }
    }
}

/// Owns at most one open [`CacheStore`] per store file
///
/// Wrappers hold an `Arc<StoreRegistry>` and open their location's store
/// through it on first use. Call [`close_all`](Self::close_all) at a
/// shutdown point; dropping the last reference does the same on a
/// best-effort basis.
pub struct StoreRegistry {
    config: RegistryConfig,
    sink: Arc<dyn DiagnosticSink>,
    stores: Mutex<HashMap<PathBuf, CacheStore>>,
}

impl StoreRegistry {
    /// Registry with default configuration
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(RegistryConfig::default())
    }

    /// Registry logging failures to the configured error log
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Arc<Self> {
        let sink = Arc::new(ErrorLog::new(config.error_log_path()));
        Self::with_sink(config, sink)
    }

    /// Registry reporting failures to a custom sink
    #[must_use]
    pub fn with_sink(config: RegistryConfig, sink: Arc<dyn DiagnosticSink>) -> Arc<Self> {
        Arc::new(Self {
            config,
            sink,
            stores: Mutex::new(HashMap::new()),
        })
    }

    /// Registry configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Sink that receives cache-machinery failures
    #[must_use]
    pub fn sink(&self) -> &Arc<dyn DiagnosticSink> {
        &self.sink
    }

    /// Resolve the store file for `location`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when no root is configured and the
    /// working directory cannot be determined.
    pub fn store_path(&self, location: &StoreLocation) -> Result<PathBuf> {
        self.resolve(location, std::env::current_dir)
    }

    /// The working directory is only consulted without a configured root
    fn resolve(
        &self,
        location: &StoreLocation,
        cwd: impl FnOnce() -> io::Result<PathBuf>,
    ) -> Result<PathBuf> {
        let path = if let Some(root) = self.config.root.as_deref() {
            location.store_path(Some(root), root)
        } else {
            let cwd = cwd().map_err(|e| {
                Error::configuration(format!("Cannot resolve working directory: {e}"))
            })?;
            location.store_path(None, &cwd)
        };
        Ok(std::path::absolute(&path).unwrap_or(path))
    }

    /// Open the store for `location`, or return the already open handle
    ///
    /// A handle that was closed directly is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// Fails when the store path cannot be resolved or the store cannot be
    /// opened.
    pub fn open(&self, location: &StoreLocation) -> Result<CacheStore> {
        let path = self.store_path(location)?;
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(&path)
            && !store.is_closed()
        {
            return Ok(store.clone());
        }
        let store = CacheStore::open(&path)?;
        info!(
            target: "filecache",
            location = %location,
            path = %path.display(),
            "Opened cache store"
        );
        stores.insert(path, store.clone());
        Ok(store)
    }

    /// Paths of the stores currently held
    #[must_use]
    pub fn open_stores(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.stores.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Whether a store for `path` is held
    #[must_use]
    pub fn is_open(&self, path: &Path) -> bool {
        self.stores
            .lock()
            .get(path)
            .is_some_and(|store| !store.is_closed())
    }

    /// Flush every open store
    ///
    /// Every store is attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first flush failure.
    pub fn flush_all(&self) -> Result<()> {
        let stores: Vec<CacheStore> = self.stores.lock().values().cloned().collect();
        let mut first_error = None;
        for store in &stores {
            match store.flush() {
                // Closed since the snapshot was taken
                Ok(()) | Err(Error::Store(filecache_store::Error::Closed { .. })) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Flush and close every store and forget the handles
    ///
    /// Every store is attempted; the first failure is returned. Wrappers
    /// reopen their store on their next call.
    ///
    /// # Errors
    ///
    /// Returns the first close failure.
    pub fn close_all(&self) -> Result<()> {
        let drained: Vec<CacheStore> = self.stores.lock().drain().map(|(_, s)| s).collect();
        let mut first_error = None;
        for store in drained {
            if let Err(e) = store.close() {
                first_error.get_or_insert(e);
            } else {
                info!(target: "filecache", path = %store.path().display(), "Closed cache store");
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Wrap `function` with infinite validity and default options
    ///
    /// The store location is the caller's source file.
    #[track_caller]
    pub fn memoize<A, T, F>(self: &Arc<Self>, name: impl Into<String>, function: F) -> Memoized<A, T, F>
    where
        A: ?Sized,
        F: Fn(&A) -> T,
    {
        FileCache::new(Arc::clone(self), CacheOptions::default()).wrap(name, function)
    }

    /// Configure a wrapper factory
    #[must_use]
    pub fn cached(self: &Arc<Self>, options: CacheOptions) -> FileCache {
        FileCache::new(Arc::clone(self), options)
    }
}

impl Drop for StoreRegistry {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            warn!(target: "filecache", "Failed to close cache stores: {e}");
        }
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("config", &self.config)
            .field("open_stores", &self.open_stores())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> Arc<StoreRegistry> {
        StoreRegistry::with_config(RegistryConfig::new().with_root(dir.path()))
    }

    #[test]
    fn error_log_defaults() {
        assert_eq!(
            RegistryConfig::new().error_log_path(),
            PathBuf::from("filecache.err.log")
        );
        assert_eq!(
            RegistryConfig::new().with_root("/r").error_log_path(),
            PathBuf::from("/r/filecache.err.log")
        );
        assert_eq!(
            RegistryConfig::new()
                .with_root("/r")
                .with_error_log("/l/e.log")
                .error_log_path(),
            PathBuf::from("/l/e.log")
        );
    }

    #[test]
    fn same_location_shares_one_handle() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let location = StoreLocation::synthetic("<string>");
        let a = registry.open(&location).unwrap();
        let b = registry.open(&location).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(registry.open_stores().len(), 1);
    }

    #[test]
    fn different_locations_get_different_stores() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let a = registry.open(&StoreLocation::source("a.rs")).unwrap();
        let b = registry.open(&StoreLocation::source("b.rs")).unwrap();
        assert!(!a.ptr_eq(&b));
        assert_ne!(a.path(), b.path());
        assert_eq!(registry.open_stores().len(), 2);
    }

    #[test]
    fn close_all_drains_and_closes() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let store = registry.open(&StoreLocation::source("a.rs")).unwrap();
        registry.close_all().unwrap();
        assert!(store.is_closed());
        assert!(registry.open_stores().is_empty());

        // Reopening yields a fresh handle.
        let again = registry.open(&StoreLocation::source("a.rs")).unwrap();
        assert!(!again.is_closed());
        assert!(!again.ptr_eq(&store));
    }

    #[test]
    fn directly_closed_handle_is_replaced() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let location = StoreLocation::source("a.rs");
        let store = registry.open(&location).unwrap();
        store.close().unwrap();
        assert!(!registry.is_open(store.path()));
        let fresh = registry.open(&location).unwrap();
        assert!(!fresh.is_closed());
    }

    #[test]
    fn drop_closes_stores() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let store = registry.open(&StoreLocation::source("a.rs")).unwrap();
        drop(registry);
        assert!(store.is_closed());
    }

    #[test]
    fn flush_all_persists_buffered_writes() {
        use crate::entry::{CacheEntry, Payload};

        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let store = registry.open(&StoreLocation::source("a.rs")).unwrap();
        store
            .insert("k", CacheEntry::new(Payload::encode(&1).unwrap()))
            .unwrap();
        registry.flush_all().unwrap();

        let contents = std::fs::read_to_string(store.path()).unwrap();
        assert!(contents.contains("\"k\""));
    }

    #[test]
    fn configured_root_does_not_need_working_directory() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let gone = || Err(io::Error::new(io::ErrorKind::NotFound, "cwd removed"));
        let location = StoreLocation::source("src/lib.rs");

        let path = registry.resolve(&location, gone).unwrap();
        assert_eq!(path, registry.store_path(&location).unwrap());
        assert!(path.starts_with(dir.path()));

        let rootless = StoreRegistry::with_config(RegistryConfig::new());
        let err = rootless.resolve(&location, gone).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn config_deserializes() {
        let config: RegistryConfig = serde_json::from_str(r#"{"root": "/var/cache/app"}"#).unwrap();
        assert_eq!(config.root, Some(PathBuf::from("/var/cache/app")));
        assert_eq!(config.error_log, None);
    }
}
