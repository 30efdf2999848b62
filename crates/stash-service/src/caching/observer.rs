use std::fmt;

use crate::kv::KvError;

/// Something noteworthy that happened during a leader pass.
#[derive(Debug)]
pub struct CacheEvent<'a> {
    /// The name of the [`Cacher`](super::Cacher).
    pub cache: &'static str,
    /// The key the pass is computing.
    pub key: &'a str,
    pub kind: CacheEventKind<'a>,
}

/// The kinds of [`CacheEvent`]s.
///
/// The `*Failed` kinds are failures the engine tolerates without surfacing them to callers.
#[derive(Debug)]
pub enum CacheEventKind<'a> {
    /// The entry was found in the store.
    Hit,
    /// The entry was not found in the store, the loader runs next.
    Miss,
    /// Reading the store failed, the pass continues as if it were a miss.
    ReadFailed(&'a KvError),
    /// Writing the freshly loaded entry failed, the value is returned regardless.
    WriteFailed(&'a KvError),
    /// The side effect failed, the value is returned regardless.
    SideEffectFailed(&'a anyhow::Error),
}

impl CacheEventKind<'_> {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::ReadFailed(_) => "read_failed",
            Self::WriteFailed(_) => "write_failed",
            Self::SideEffectFailed(_) => "side_effect_failed",
        }
    }
}

/// Receives the [`CacheEvent`]s of a [`Cacher`](super::Cacher).
pub trait CacheObserver: fmt::Debug + Send + Sync {
    fn observe(&self, event: CacheEvent<'_>);
}

/// Reports [`CacheEvent`]s as log messages and metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CacheObserver for TracingObserver {
    fn observe(&self, event: CacheEvent<'_>) {
        let CacheEvent { cache, key, kind } = event;
        match kind {
            CacheEventKind::Hit => {
                tracing::trace!(cache, key, "Cache hit");
                metric!(counter("caches.hit") += 1, "cache" => cache);
            }
            CacheEventKind::Miss => {
                tracing::trace!(cache, key, "Cache miss");
                metric!(counter("caches.miss") += 1, "cache" => cache);
            }
            CacheEventKind::ReadFailed(error) => {
                tracing::error!(
                    error = error as &dyn std::error::Error,
                    cache,
                    key,
                    "Error reading from cache store"
                );
                metric!(counter("caches.miss") += 1, "cache" => cache);
                metric!(counter("caches.read_failed") += 1, "cache" => cache);
            }
            CacheEventKind::WriteFailed(error) => {
                tracing::error!(
                    error = error as &dyn std::error::Error,
                    cache,
                    key,
                    "Error writing to cache store"
                );
                metric!(counter("caches.write_failed") += 1, "cache" => cache);
            }
            CacheEventKind::SideEffectFailed(error) => {
                let error: &(dyn std::error::Error + 'static) = error.as_ref();
                tracing::error!(error, cache, key, "Cache side effect failed");
                metric!(counter("caches.side_effect_failed") += 1, "cache" => cache);
            }
        }
    }
}
