//! anycache - disk-backed memoization of computation results
//!
//! Wraps an arbitrary computation and persists its result to a file so
//! that later calls with identical arguments skip recomputation. Entries
//! are invalidated when caller-declared dependency files change, or by
//! absolute age, and a soft size budget evicts the oldest-touched
//! entries after every write.
//!
//! The cache is safe for arbitrary concurrent callers: threads within
//! one process and independent processes sharing the same cache
//! directory serialize per-entry via advisory file locks. There is one
//! lock per fingerprint, so unrelated computations never contend.
//!
//! ```
//! use anycache::AnyCache;
//!
//! let cache = AnyCache::new();
//! let myfunc = cache.wrap("demo::myfunc", |args: &(i32, i32)| args.0 + args.1);
//!
//! assert_eq!(myfunc.call((4, 5)), 9); // computed
//! assert_eq!(myfunc.call((4, 5)), 9); // cached
//! ```

pub mod cache;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod store;

pub use cache::{default_cache, reset_default_cache, AnyCache, AnyCacheBuilder, CachedFn};
pub use entry::{scan_entries, CacheEntry, EntryInfo};
pub use error::{CacheError, CacheResult};
pub use fingerprint::fingerprint;
pub use lock::EntryLock;
