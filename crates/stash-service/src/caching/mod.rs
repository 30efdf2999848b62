//! # Cache-aside caching
//!
//! Every expensive lookup goes through a [`Cacher`], which stores its results in the shared
//! key-value store (see [`kv`](crate::kv)) and serves repeated lookups from there.
//!
//! A lookup goes through the following steps:
//!
//! - Concurrent lookups of the same key within this process are coalesced. Only the first one
//!   starts a computation, all later ones wait for its result.
//! - The computation reads the key from the store. On a hit, the stored entry is the result.
//! - On a miss, the loader supplied by the caller runs. Its result is serialized to JSON,
//!   written to the store with the cacher's TTL and handed to the optional side effect.
//! - Every waiter decodes the shared entry into its own value.
//!
//! ## Availability over consistency
//!
//! The store is an optimization, not a source of truth. Failing to read from it is treated like
//! a miss, failing to write to it still returns the loaded value. These failures are never
//! returned to the caller; they are reported to the [`CacheObserver`] instead, which by default
//! logs them. Explicit operations like [`Cacher::invalidate`] do return store errors.
//!
//! ## Cancellation
//!
//! The computation runs in its own task. Each caller waits for it with its own
//! [`CancellationToken`](tokio_util::sync::CancellationToken), and cancelling one caller only
//! ends that caller's wait. Once the last caller is gone, the computation itself is cancelled
//! through the token handed to the loader, and the next lookup of the key starts afresh.
//!
//! ### Metrics
//!
//! All metrics are tagged with the `cache` name:
//!
//! - `caches.access`: All accesses.
//! - `caches.channel.hit`: Accesses that attached to a running computation.
//! - `caches.channel.miss`: Accesses that started a new computation.
//! - `caches.hit`, `caches.miss`: Outcomes of the store lookup.
//! - `caches.computation`: Loader invocations.
//! - `caches.read_failed`, `caches.write_failed`, `caches.side_effect_failed`: Tolerated failures.

mod cache_error;
mod cacher;
mod observer;


pub use cache_error::CacheError;
pub use cacher::{Cacher, SideEffect};
pub use observer::{CacheEvent, CacheEventKind, CacheObserver, TracingObserver};
