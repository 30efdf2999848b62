//! The key-value store that backs all caches.
//!
//! The caching engine only ever talks to the store through the narrow [`KvClient`] trait:
//! byte-oriented `get`/`set`/`delete`, their batched `multi_get`/`multi_set` counterparts
//! and `flush_all`. A single client (and with it a single connection pool) is meant to be
//! shared by any number of [`Cacher`](crate::caching::Cacher)s as a [`SharedKvClient`].
//!
//! There are two backends:
//!
//! - [`RedisClient`], a pooled client for a Redis server.
//! - [`MemoryClient`], a process-local map which honors TTLs on the tokio clock. It exists for
//!   testing and local development.
//!
//! ## Cancellation
//!
//! All operations are `async` and may be cancelled by dropping their future. The Redis backend
//! additionally bounds every operation by the configured
//! [`operation_timeout`](RedisConfig::operation_timeout).
//!
//! ## Errors
//!
//! Every failure is reported as a [`KvError`] which carries the failed [`KvOperation`] and a
//! [`KvErrorKind`]. Callers are expected to match on the kind, not on the message. A missing key
//! is never an error.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

mod config;
mod memory;
mod redis;

pub use config::{KvConfig, RedisConfig};
pub use memory::MemoryClient;
pub use redis::RedisClient;

/// A [`KvClient`] shared between multiple users.
pub type SharedKvClient = Arc<dyn KvClient>;

/// The operations of a [`KvClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOperation {
    Get,
    Set,
    Delete,
    MultiGet,
    MultiSet,
    FlushAll,
}

impl AsRef<str> for KvOperation {
    fn as_ref(&self) -> &str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::MultiGet => "mget",
            Self::MultiSet => "mset",
            Self::FlushAll => "flushall",
        }
    }
}

impl fmt::Display for KvOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// The broad category of a [`KvError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvErrorKind {
    /// The store could not be reached, or the connection broke down.
    Unavailable,
    /// The operation did not complete within its deadline.
    Timeout,
    /// The store answered with something that could not be understood.
    Malformed,
    /// Any other error reported by the store.
    Other,
}

impl fmt::Display for KvErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unavailable => "store unavailable",
            Self::Timeout => "operation timed out",
            Self::Malformed => "malformed response",
            Self::Other => "store error",
        })
    }
}

type BoxedSource = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// An error talking to the key-value store.
///
/// The error is cheap to clone, so it can be handed out to every waiter of a computation.
#[derive(Debug, Clone, Error)]
#[error("failed to {operation} in cache store: {kind}")]
pub struct KvError {
    operation: KvOperation,
    kind: KvErrorKind,
    #[source]
    source: Option<BoxedSource>,
}

impl KvError {
    /// Creates a new error without an underlying cause.
    pub fn new(operation: KvOperation, kind: KvErrorKind) -> Self {
        Self {
            operation,
            kind,
            source: None,
        }
    }

    /// Creates a new error wrapping its underlying cause.
    pub fn with_source<E>(operation: KvOperation, kind: KvErrorKind, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            operation,
            kind,
            source: Some(Arc::new(source)),
        }
    }

    /// The operation that failed.
    pub fn operation(&self) -> KvOperation {
        self.operation
    }

    /// The category of this error.
    pub fn kind(&self) -> KvErrorKind {
        self.kind
    }

    /// Returns `true` if the store could not be reached in time.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.kind, KvErrorKind::Unavailable | KvErrorKind::Timeout)
    }
}

/// A byte-oriented client of a remote key-value store.
#[async_trait]
pub trait KvClient: fmt::Debug + Send + Sync {
    /// The name of the backend, used for logging and metrics.
    fn name(&self) -> &'static str;

    /// Reads the value stored under `key`.
    ///
    /// Returns `Ok(None)` if no such key exists.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError>;

    /// Unconditionally stores `value` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), KvError>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Reads all `keys` at once.
    ///
    /// The result is positionally aligned with `keys`, missing entries are `None`.
    /// An `Err` means that the store as a whole could not be queried.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, KvError>;

    /// Stores all `entries` at once, without expiration.
    async fn multi_set(&self, entries: &BTreeMap<String, Bytes>) -> Result<(), KvError>;

    /// Removes every key of the store namespace.
    ///
    /// This is meant for tests and resets only.
    async fn flush_all(&self) -> Result<(), KvError>;
}

/// Creates the [`SharedKvClient`] described by `config`.
///
/// For Redis, this establishes the connection pool and verifies that the server is reachable.
pub async fn connect(config: &KvConfig) -> Result<SharedKvClient, KvError> {
    let client: SharedKvClient = match config {
        KvConfig::Redis(redis) => Arc::new(RedisClient::connect(redis.clone()).await?),
        KvConfig::Memory => Arc::new(MemoryClient::new()),
    };
    tracing::info!(backend = client.name(), "Connected to cache store");
    Ok(client)
}

/// Records the outcome of a single store operation.
pub(crate) fn record_operation<T>(
    backend: &'static str,
    operation: KvOperation,
    result: &Result<T, KvError>,
) {
    let status = match result {
        Ok(_) => "ok",
        Err(err) => match err.kind() {
            KvErrorKind::Unavailable => "unavailable",
            KvErrorKind::Timeout => "timeout",
            KvErrorKind::Malformed => "malformed",
            KvErrorKind::Other => "error",
        },
    };
    metric!(
        counter("kv.operation") += 1,
        "backend" => backend,
        "operation" => operation.as_ref(),
        "status" => status,
    );
}
