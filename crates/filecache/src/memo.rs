//! Memoizing wrappers
//!
//! A wrapper derives a key from its arguments, consults the store of its
//! location and only runs the wrapped computation on a miss or a stale
//! entry. Failures of the caching machinery are recorded in the registry's
//! [`DiagnosticSink`] and then either returned or, with
//! [`CacheOptions::fail_silently`], swallowed in favour of an uncached call.
//!
//! ```rust,ignore
//! let registry = StoreRegistry::new();
//! let square = registry.memoize("square", |n: &i64| n * n);
//! assert_eq!(square.call(&3)?, 9);
//! ```

use crate::diagnostics::{DiagnosticSink, describe};
use crate::entry::{CacheEntry, Payload};
use crate::key::{CacheKey, derive_key};
use crate::location::StoreLocation;
use crate::options::CacheOptions;
use crate::registry::StoreRegistry;
use crate::store::CacheStore;
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, error};

/// Factory for wrappers sharing one set of options
///
/// Obtained from [`StoreRegistry::cached`].
#[derive(Clone)]
pub struct FileCache {
    registry: Arc<StoreRegistry>,
    options: CacheOptions,
    location: Option<StoreLocation>,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl FileCache {
    pub(crate) fn new(registry: Arc<StoreRegistry>, options: CacheOptions) -> Self {
        Self {
            registry,
            options,
            location: None,
            sink: None,
        }
    }

    /// Store wrapped computations at `location` instead of the caller's
    /// source file
    #[must_use]
    pub fn at(mut self, location: StoreLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Report failures to `sink` instead of the registry's sink
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Options applied to wrapped computations
    #[must_use]
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Wrap a computation of one argument
    ///
    /// Several arguments are passed as a tuple; the key covers all of them.
    #[track_caller]
    pub fn wrap<A, T, F>(&self, name: impl Into<String>, function: F) -> Memoized<A, T, F>
    where
        A: ?Sized,
        F: Fn(&A) -> T,
    {
        Memoized {
            core: self.core(name.into()),
            function,
            _marker: PhantomData,
        }
    }

    /// Wrap a computation that also reads an instance
    ///
    /// The instance is part of the key, so it must be serializable too.
    #[track_caller]
    pub fn wrap_method<I, A, T, F>(
        &self,
        name: impl Into<String>,
        function: F,
    ) -> MemoizedMethod<I, A, T, F>
    where
        I: ?Sized,
        A: ?Sized,
        F: Fn(&I, &A) -> T,
    {
        MemoizedMethod {
            core: self.core(name.into()),
            function,
            _marker: PhantomData,
        }
    }

    #[track_caller]
    fn core(&self, name: String) -> CacheCore {
        let location = match &self.location {
            Some(location) => location.clone(),
            None => StoreLocation::caller(),
        };
        let sink = match &self.sink {
            Some(sink) => Arc::clone(sink),
            None => Arc::clone(self.registry.sink()),
        };
        CacheCore {
            name,
            location,
            options: self.options,
            registry: Arc::clone(&self.registry),
            sink,
        }
    }
}

impl fmt::Debug for FileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCache")
            .field("options", &self.options)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Outcome of the lookup phase
enum Lookup<T> {
    Hit(T),
    Miss { store: CacheStore, key: CacheKey },
}

/// State shared by every wrapper kind
struct CacheCore {
    name: String,
    location: StoreLocation,
    options: CacheOptions,
    registry: Arc<StoreRegistry>,
    sink: Arc<dyn DiagnosticSink>,
}

impl CacheCore {
    /// One cached invocation
    ///
    /// Errors produced by `compute` are returned as they are; only cache
    /// machinery errors are reported and subject to `fail_silently`.
    fn run<K, T, E, C>(&self, args: &K, compute: C) -> std::result::Result<T, E>
    where
        K: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        E: From<Error>,
        C: FnOnce() -> std::result::Result<T, E>,
    {
        let (store, key) = match self.lookup(args) {
            Ok(Lookup::Hit(value)) => return Ok(value),
            Ok(Lookup::Miss { store, key }) => (store, key),
            Err(e) => {
                self.report(&e);
                if self.options.fail_silently {
                    return compute();
                }
                return Err(e.into());
            }
        };

        let value = compute()?;

        if let Err(e) = self.write(&store, key, &value) {
            self.report(&e);
            if !self.options.fail_silently {
                return Err(e.into());
            }
        }
        Ok(value)
    }

    fn lookup<K, T>(&self, args: &K) -> Result<Lookup<T>>
    where
        K: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let key = derive_key(&self.name, args)?;
        let store = self.registry.open(&self.location)?;
        let Some(entry) = store.get(key.as_str())? else {
            debug!(target: "filecache", name = %self.name, key = %key, "Cache miss");
            return Ok(Lookup::Miss { store, key });
        };

        if !entry.is_fresh(&self.options.validity, Utc::now()) {
            debug!(
                target: "filecache",
                name = %self.name,
                key = %key,
                written_at = %entry.timestamp,
                "Cache entry stale"
            );
            return Ok(Lookup::Miss { store, key });
        }

        // Only a fresh entry is decoded; a stale one is overwritten unread.
        let value = entry.value.decode()?;
        debug!(target: "filecache", name = %self.name, key = %key, "Cache hit");
        Ok(Lookup::Hit(value))
    }

    fn write<T>(&self, store: &CacheStore, key: CacheKey, value: &T) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let entry = CacheEntry::new(Payload::encode(value)?);
        debug!(target: "filecache", name = %self.name, key = %key, "Caching result");
        store.write(key, entry, self.options.force_sync)
    }

    fn report(&self, e: &Error) {
        error!(
            target: "filecache",
            name = %self.name,
            location = %self.location,
            fail_silently = self.options.fail_silently,
            "{}",
            describe(e)
        );
        self.sink.record(e);
    }

    fn key<K: Serialize + ?Sized>(&self, args: &K) -> Result<CacheKey> {
        derive_key(&self.name, args)
    }

    fn invalidate<K: Serialize + ?Sized>(&self, args: &K) -> Result<bool> {
        let key = self.key(args)?;
        let store = self.registry.open(&self.location)?;
        let existed = store.remove(key.as_str())?;
        store.flush()?;
        debug!(target: "filecache", name = %self.name, key = %key, existed, "Invalidated entry");
        Ok(existed)
    }
}

/// A memoized computation of `Fn(&A) -> T`
pub struct Memoized<A: ?Sized, T, F> {
    core: CacheCore,
    function: F,
    _marker: PhantomData<fn(&A) -> T>,
}

impl<A: ?Sized, T, F> Memoized<A, T, F> {
    /// Identity used in every key
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Location whose store holds the results
    #[must_use]
    pub fn location(&self) -> &StoreLocation {
        &self.core.location
    }

    /// Options in effect
    #[must_use]
    pub fn options(&self) -> &CacheOptions {
        &self.core.options
    }

    /// The store holding this computation's results
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be opened.
    pub fn store(&self) -> Result<CacheStore> {
        self.core.registry.open(&self.core.location)
    }
}

impl<A, T, F> Memoized<A, T, F>
where
    A: Serialize + ?Sized,
{
    /// Key under which the result for `args` is stored
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unserializable`] when the arguments cannot be
    /// encoded.
    pub fn key_for(&self, args: &A) -> Result<CacheKey> {
        self.core.key(args)
    }

    /// Remove the stored result for `args`, returning whether one existed
    ///
    /// # Errors
    ///
    /// Fails when the key cannot be derived or the store cannot be
    /// opened or flushed.
    pub fn invalidate(&self, args: &A) -> Result<bool> {
        self.core.invalidate(args)
    }
}

impl<A, T, F> Memoized<A, T, F>
where
    A: Serialize + ?Sized,
    T: Serialize + DeserializeOwned,
    F: Fn(&A) -> T,
{
    /// Return the cached result for `args`, computing and storing it when
    /// missing or stale
    ///
    /// # Errors
    ///
    /// Returns cache machinery failures unless `fail_silently` is set.
    pub fn call(&self, args: &A) -> Result<T> {
        self.core.run(args, || Ok((self.function)(args)))
    }
}

impl<A, U, E, F> Memoized<A, std::result::Result<U, E>, F>
where
    A: Serialize + ?Sized,
    U: Serialize + DeserializeOwned,
    E: From<Error>,
    F: Fn(&A) -> std::result::Result<U, E>,
{
    /// Like [`call`](Self::call) for a fallible computation
    ///
    /// Only `Ok` results are stored. The computation's `Err` is returned
    /// unchanged and is never cached or reported.
    ///
    /// # Errors
    ///
    /// Returns the computation's own error, or a cache machinery failure
    /// converted into `E` unless `fail_silently` is set.
    pub fn try_call(&self, args: &A) -> std::result::Result<U, E> {
        self.core.run(args, || (self.function)(args))
    }
}

impl<A: ?Sized, T, F> fmt::Debug for Memoized<A, T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("name", &self.core.name)
            .field("location", &self.core.location)
            .field("options", &self.core.options)
            .finish_non_exhaustive()
    }
}

/// A memoized computation of `Fn(&I, &A) -> T`, keyed on instance and
/// arguments
pub struct MemoizedMethod<I: ?Sized, A: ?Sized, T, F> {
    core: CacheCore,
    function: F,
    _marker: PhantomData<fn(&I, &A) -> T>,
}

impl<I: ?Sized, A: ?Sized, T, F> MemoizedMethod<I, A, T, F> {
    /// Bind to an instance
    pub const fn bind<'a>(&'a self, instance: &'a I) -> BoundMethod<'a, I, A, T, F> {
        BoundMethod {
            method: self,
            instance,
        }
    }

    /// Identity used in every key
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Location whose store holds the results
    #[must_use]
    pub fn location(&self) -> &StoreLocation {
        &self.core.location
    }

    /// Options in effect
    #[must_use]
    pub fn options(&self) -> &CacheOptions {
        &self.core.options
    }

    /// The store holding this computation's results
    ///
    /// # Errors
    ///
    /// Fails when the store cannot be opened.
    pub fn store(&self) -> Result<CacheStore> {
        self.core.registry.open(&self.core.location)
    }
}

impl<I, A, T, F> MemoizedMethod<I, A, T, F>
where
    I: Serialize + ?Sized,
    A: Serialize + ?Sized,
{
    /// Key under which the result for `instance` and `args` is stored
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unserializable`] when the arguments cannot be
    /// encoded.
    pub fn key_for(&self, instance: &I, args: &A) -> Result<CacheKey> {
        self.core.key(&(instance, args))
    }

    /// Remove the stored result for `instance` and `args`
    ///
    /// # Errors
    ///
    /// Fails when the key cannot be derived or the store cannot be
    /// opened or flushed.
    pub fn invalidate(&self, instance: &I, args: &A) -> Result<bool> {
        self.core.invalidate(&(instance, args))
    }
}

impl<I, A, T, F> MemoizedMethod<I, A, T, F>
where
    I: Serialize + ?Sized,
    A: Serialize + ?Sized,
    T: Serialize + DeserializeOwned,
    F: Fn(&I, &A) -> T,
{
    /// Cached call on `instance`
    ///
    /// # Errors
    ///
    /// Returns cache machinery failures unless `fail_silently` is set.
    pub fn call(&self, instance: &I, args: &A) -> Result<T> {
        self.core
            .run(&(instance, args), || Ok((self.function)(instance, args)))
    }
}

impl<I, A, U, E, F> MemoizedMethod<I, A, std::result::Result<U, E>, F>
where
    I: Serialize + ?Sized,
    A: Serialize + ?Sized,
    U: Serialize + DeserializeOwned,
    E: From<Error>,
    F: Fn(&I, &A) -> std::result::Result<U, E>,
{
    /// Cached fallible call on `instance`
    ///
    /// # Errors
    ///
    /// Returns the computation's own error, or a cache machinery failure
    /// converted into `E` unless `fail_silently` is set.
    pub fn try_call(&self, instance: &I, args: &A) -> std::result::Result<U, E> {
        self.core
            .run(&(instance, args), || (self.function)(instance, args))
    }
}

impl<I: ?Sized, A: ?Sized, T, F> fmt::Debug for MemoizedMethod<I, A, T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizedMethod")
            .field("name", &self.core.name)
            .field("location", &self.core.location)
            .field("options", &self.core.options)
            .finish_non_exhaustive()
    }
}

/// A [`MemoizedMethod`] bound to one instance
pub struct BoundMethod<'a, I: ?Sized, A: ?Sized, T, F> {
    method: &'a MemoizedMethod<I, A, T, F>,
    instance: &'a I,
}

impl<I: ?Sized, A: ?Sized, T, F> Clone for BoundMethod<'_, I, A, T, F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I: ?Sized, A: ?Sized, T, F> Copy for BoundMethod<'_, I, A, T, F> {}

impl<'a, I: ?Sized, A: ?Sized, T, F> BoundMethod<'a, I, A, T, F> {
    /// The bound instance
    #[must_use]
    pub const fn instance(&self) -> &'a I {
        self.instance
    }

    /// The unbound wrapper
    #[must_use]
    pub const fn method(&self) -> &'a MemoizedMethod<I, A, T, F> {
        self.method
    }
}

impl<I, A, T, F> BoundMethod<'_, I, A, T, F>
where
    I: Serialize + ?Sized,
    A: Serialize + ?Sized,
{
    /// Key under which the result for `args` is stored
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unserializable`] when the arguments cannot be
    /// encoded.
    pub fn key_for(&self, args: &A) -> Result<CacheKey> {
        self.method.key_for(self.instance, args)
    }

    /// Remove the stored result for `args`
    ///
    /// # Errors
    ///
    /// Fails when the key cannot be derived or the store cannot be
    /// opened or flushed.
    pub fn invalidate(&self, args: &A) -> Result<bool> {
        self.method.invalidate(self.instance, args)
    }
}

impl<I, A, T, F> BoundMethod<'_, I, A, T, F>
where
    I: Serialize + ?Sized,
    A: Serialize + ?Sized,
    T: Serialize + DeserializeOwned,
    F: Fn(&I, &A) -> T,
{
    /// Cached call on the bound instance
    ///
    /// # Errors
    ///
    /// Returns cache machinery failures unless `fail_silently` is set.
    pub fn call(&self, args: &A) -> Result<T> {
        self.method.call(self.instance, args)
    }
}

impl<I, A, U, E, F> BoundMethod<'_, I, A, std::result::Result<U, E>, F>
where
    I: Serialize + ?Sized,
    A: Serialize + ?Sized,
    U: Serialize + DeserializeOwned,
    E: From<Error>,
    F: Fn(&I, &A) -> std::result::Result<U, E>,
{
    /// Cached fallible call on the bound instance
    ///
    /// # Errors
    ///
    /// Returns the computation's own error, or a cache machinery failure
    /// converted into `E` unless `fail_silently` is set.
    pub fn try_call(&self, args: &A) -> std::result::Result<U, E> {
        self.method.try_call(self.instance, args)
    }
}

impl<I: ?Sized, A: ?Sized, T, F> fmt::Debug for BoundMethod<'_, I, A, T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundMethod")
            .field("method", self.method)
            .finish_non_exhaustive()
    }
}
