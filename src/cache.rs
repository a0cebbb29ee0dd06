//! The user-facing cache object.
//!
//! `AnyCache` owns the configuration (directory, size budget, age
//! budget) and the directory lifecycle, and wraps computations with the
//! fingerprint/lock/read/write/evict machinery. It is cheap to clone and
//! safe to share across threads; instances bound to the same explicit
//! directory share entries, which is the persistence mechanism across
//! process runs.
//!
//! Bookkeeping failures inside the cache (unreadable entries, failed
//! writes, eviction races) are logged and recovered by recomputing;
//! they never surface to the caller. Failures of the wrapped computation
//! itself are never intercepted.

use std::convert::Infallible;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::TempDir;

use crate::entry::CacheEntry;
use crate::error::CacheResult;
use crate::fingerprint::fingerprint;
use crate::store;

/// Disk-backed memoization cache.
///
/// ```
/// use anycache::AnyCache;
///
/// let cache = AnyCache::new();
/// let mut calls = 0;
/// for _ in 0..3 {
///     let sum: i32 = cache.get_or_compute("demo::add", &(4, 5), || {
///         calls += 1;
///         4 + 5
///     });
///     assert_eq!(sum, 9);
/// }
/// assert_eq!(calls, 1);
/// ```
#[derive(Clone)]
pub struct AnyCache {
    inner: Arc<Inner>,
}

struct Inner {
    dir: DirState,
    maxsize: Option<u64>,
    maxage: Option<Duration>,
}

enum DirState {
    /// Caller-supplied directory. Never auto-deleted; shared by every
    /// instance that references it.
    Explicit(PathBuf),
    /// Lazily created temporary directory, removed on `clear` or when
    /// the last clone drops.
    Auto(Mutex<Option<TempDir>>),
}

/// Configuration builder for [`AnyCache`].
#[derive(Debug, Default)]
pub struct AnyCacheBuilder {
    cache_dir: Option<PathBuf>,
    maxsize: Option<u64>,
    maxage: Option<Duration>,
}

impl AnyCacheBuilder {
    /// Use an explicit cache directory instead of a managed temporary
    /// one. The directory is created lazily and never auto-deleted.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Soft upper bound on total cache size in bytes, enforced after
    /// every write. `0` disables caching entirely (pass-through).
    /// Without this the cache is unbounded.
    pub fn max_size(mut self, bytes: u64) -> Self {
        self.maxsize = Some(bytes);
        self
    }

    /// Maximum entry age. An entry last touched longer ago than this is
    /// stale regardless of its dependencies. Without this entries never
    /// expire by age.
    pub fn max_age(mut self, age: Duration) -> Self {
        self.maxage = Some(age);
        self
    }

    /// Build the cache.
    pub fn build(self) -> AnyCache {
        let dir = match self.cache_dir {
            Some(path) => DirState::Explicit(path),
            None => DirState::Auto(Mutex::new(None)),
        };
        AnyCache {
            inner: Arc::new(Inner {
                dir,
                maxsize: self.maxsize,
                maxage: self.maxage,
            }),
        }
    }
}

impl AnyCache {
    /// Unbounded cache backed by a lazily created temporary directory.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a cache.
    pub fn builder() -> AnyCacheBuilder {
        AnyCacheBuilder::default()
    }

    /// Resolve the cache directory, creating it if necessary.
    pub fn cache_dir(&self) -> CacheResult<PathBuf> {
        match &self.inner.dir {
            DirState::Explicit(path) => {
                fs::create_dir_all(path)?;
                Ok(path.clone())
            }
            DirState::Auto(slot) => {
                let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(temp) = guard.as_ref() {
                    return Ok(temp.path().to_path_buf());
                }
                let temp = tempfile::Builder::new().suffix(".anycache").tempdir()?;
                let path = temp.path().to_path_buf();
                *guard = Some(temp);
                Ok(path)
            }
        }
    }

    /// Total size in bytes of all files in the cache directory.
    ///
    /// Does not force creation of an unresolved temporary directory.
    pub fn size(&self) -> u64 {
        let Some(dir) = self.peek_cache_dir() else {
            return 0;
        };
        let Ok(read) = fs::read_dir(dir) else {
            return 0;
        };
        read.flatten()
            .filter_map(|dir_entry| dir_entry.metadata().ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum()
    }

    /// Remove the cache directory and everything in it. Idempotent.
    ///
    /// The next access regenerates the directory: a fresh temporary one
    /// for managed caches, the same path for explicit ones.
    pub fn clear(&self) {
        match &self.inner.dir {
            DirState::Explicit(path) => {
                if path.exists() {
                    tracing::debug!(dir = %path.display(), "clearing cache");
                    if let Err(e) = fs::remove_dir_all(path) {
                        tracing::warn!(dir = %path.display(), "failed to clear cache: {e}");
                    }
                }
            }
            DirState::Auto(slot) => {
                let taken = slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(temp) = taken {
                    tracing::debug!(dir = %temp.path().display(), "clearing cache");
                    if let Err(e) = temp.close() {
                        tracing::warn!("failed to clear cache: {e}");
                    }
                }
            }
        }
    }

    /// Fingerprint for `qualname` called with `args`. Diagnostics only.
    pub fn ident<A: fmt::Debug>(&self, qualname: &str, args: &A) -> String {
        fingerprint(qualname, args)
    }

    /// Whether the entry for `qualname`/`args` is stale or absent.
    ///
    /// Runs only the staleness check under the entry lock; no other
    /// side effects.
    pub fn is_outdated<A: fmt::Debug>(&self, qualname: &str, args: &A) -> bool {
        let ident = fingerprint(qualname, args);
        let dir = match self.cache_dir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!("cache directory unavailable: {e}");
                return true;
            }
        };
        let entry = CacheEntry::new(&dir, &ident);
        match entry.acquire_lock() {
            Ok(_lock) => store::is_outdated(&entry, self.inner.maxage),
            Err(e) => {
                tracing::warn!(ident = %entry.ident, "failed to lock cache entry: {e}");
                true
            }
        }
    }

    /// Remove the entry for `qualname`/`args` if present. Idempotent.
    pub fn remove<A: fmt::Debug>(&self, qualname: &str, args: &A) {
        let ident = fingerprint(qualname, args);
        let dir = match self.cache_dir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!("cache directory unavailable: {e}");
                return;
            }
        };
        store::remove(&CacheEntry::new(&dir, &ident));
    }

    /// Return the cached result for `qualname`/`args`, or run `compute`
    /// and cache its result.
    ///
    /// With a size budget of `0` the computation runs directly with no
    /// cache I/O at all.
    pub fn get_or_compute<A, R, F>(&self, qualname: &str, args: &A, compute: F) -> R
    where
        A: fmt::Debug,
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> R,
    {
        let result = self.call_cached::<_, _, Infallible, _, _>(
            qualname,
            args,
            || Ok(compute()),
            |_| Vec::new(),
        );
        match result {
            Ok(result) => result,
            Err(never) => match never {},
        }
    }

    /// Like [`get_or_compute`](Self::get_or_compute) for fallible
    /// computations. A computation error propagates verbatim and nothing
    /// is written to the cache.
    pub fn try_get_or_compute<A, R, E, F>(
        &self,
        qualname: &str,
        args: &A,
        compute: F,
    ) -> Result<R, E>
    where
        A: fmt::Debug,
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<R, E>,
    {
        self.call_cached(qualname, args, compute, |_| Vec::new())
    }

    /// Wrap a computation for repeated cached calls, optionally with a
    /// dependency resolver attached via
    /// [`with_dep_resolver`](CachedFn::with_dep_resolver).
    pub fn wrap<A, R, F>(&self, qualname: &str, func: F) -> CachedFn<A, R, F>
    where
        A: fmt::Debug,
        R: Serialize + DeserializeOwned,
        F: Fn(&A) -> R,
    {
        CachedFn {
            cache: self.clone(),
            qualname: qualname.to_string(),
            func,
            dep_resolver: None,
        }
    }

    /// The per-call decision automaton shared by every entry point.
    fn call_cached<A, R, E, F, D>(
        &self,
        qualname: &str,
        args: &A,
        compute: F,
        resolve_deps: D,
    ) -> Result<R, E>
    where
        A: fmt::Debug,
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<R, E>,
        D: FnOnce(&R) -> Vec<PathBuf>,
    {
        if self.inner.maxsize == Some(0) {
            return compute();
        }

        let ident = fingerprint(qualname, args);
        let dir = match self.cache_dir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!("cache directory unavailable: {e}");
                return compute();
            }
        };
        let entry = CacheEntry::new(&dir, &ident);

        if let Some(hit) = store::read(&entry, self.inner.maxage) {
            return Ok(hit);
        }

        let result = compute()?;
        let deps = resolve_deps(&result);
        if let Err(e) = store::write(&entry, &result, &deps) {
            // The computed value still goes back to the caller; the
            // next call simply recomputes.
            tracing::warn!(ident = %entry.ident, "cache write failed: {e}");
        }
        if let Some(maxsize) = self.inner.maxsize {
            store::tidy_up(&dir, maxsize);
        }
        Ok(result)
    }

    fn peek_cache_dir(&self) -> Option<PathBuf> {
        match &self.inner.dir {
            DirState::Explicit(path) => Some(path.clone()),
            DirState::Auto(slot) => slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map(|temp| temp.path().to_path_buf()),
        }
    }
}

impl Default for AnyCache {
    fn default() -> Self {
        Self::new()
    }
}

type DepResolver<A, R> = Box<dyn Fn(&R, &A) -> Vec<PathBuf> + Send + Sync>;

/// A computation wrapped for cached calls.
///
/// Created by [`AnyCache::wrap`]. Besides [`call`](Self::call) it
/// exposes the auxiliary operations of the underlying cache bound to
/// this computation's name.
pub struct CachedFn<A, R, F> {
    cache: AnyCache,
    qualname: String,
    func: F,
    dep_resolver: Option<DepResolver<A, R>>,
}

impl<A, R, F> CachedFn<A, R, F>
where
    A: fmt::Debug,
    R: Serialize + DeserializeOwned,
    F: Fn(&A) -> R,
{
    /// Attach a dependency resolver.
    ///
    /// Called once per cache miss with the fresh result and the
    /// arguments, after the computation succeeds and before the entry is
    /// published. The returned paths gate the entry's validity: whenever
    /// one of them is modified after the entry, or can no longer be
    /// stat'd, the entry is recomputed.
    pub fn with_dep_resolver<D>(mut self, resolver: D) -> Self
    where
        D: Fn(&R, &A) -> Vec<PathBuf> + Send + Sync + 'static,
    {
        self.dep_resolver = Some(Box::new(resolver));
        self
    }

    /// Call the computation through the cache.
    pub fn call(&self, args: A) -> R {
        let result = self.cache.call_cached::<_, _, Infallible, _, _>(
            &self.qualname,
            &args,
            || Ok((self.func)(&args)),
            |fresh| match &self.dep_resolver {
                Some(resolver) => resolver(fresh, &args),
                None => Vec::new(),
            },
        );
        match result {
            Ok(result) => result,
            Err(never) => match never {},
        }
    }

    /// Whether the entry for `args` is stale or absent.
    pub fn is_outdated(&self, args: &A) -> bool {
        self.cache.is_outdated(&self.qualname, args)
    }

    /// Remove the entry for `args` if present. Idempotent.
    pub fn remove(&self, args: &A) {
        self.cache.remove(&self.qualname, args)
    }

    /// Fingerprint for `args`.
    pub fn ident(&self, args: &A) -> String {
        self.cache.ident(&self.qualname, args)
    }
}

static DEFAULT_CACHE: Mutex<Option<AnyCache>> = Mutex::new(None);

/// Process-wide unbounded default cache.
///
/// Created on first use and kept for the process lifetime. Wrapped
/// computations on the default cache have distinct fingerprints per
/// qualified name and do not influence each other.
pub fn default_cache() -> AnyCache {
    DEFAULT_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_or_insert_with(AnyCache::new)
        .clone()
}

/// Drop the process-wide default cache, deleting its temporary
/// directory once every outstanding clone is gone. Primarily for tests.
pub fn reset_default_cache() {
    DEFAULT_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
}
