use std::sync::Arc;

use thiserror::Error;

use crate::kv::KvError;
use crate::utils::futures::Cancelled;

/// An error returned from a [`Cacher`](super::Cacher).
///
/// The same outcome is handed to every waiter of a computation, which is why all
/// variants are cheaply clonable.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The loader failed.
    ///
    /// The loader's error is passed on verbatim, use [`CacheError::loader_error`]
    /// to get at it.
    #[error("{0}")]
    Loader(Arc<anyhow::Error>),
    /// The loaded value could not be serialized. Nothing has been written to the store.
    #[error("failed to serialize cache entry")]
    Serialize(#[source] Arc<serde_json::Error>),
    /// A stored entry could not be deserialized into the requested type.
    #[error("failed to deserialize cache entry")]
    Deserialize(#[source] Arc<serde_json::Error>),
    /// An explicit store operation failed.
    ///
    /// Reads and writes on the `get_or_set` path never produce this.
    #[error(transparent)]
    Backend(#[from] KvError),
    /// The waiting caller was cancelled.
    #[error("cache access was cancelled")]
    Cancelled,
    /// The computation went away without producing a result.
    ///
    /// This happens when the loader panics or the runtime shuts down.
    #[error("cache computation was dropped")]
    ComputationDropped,
}

impl From<Cancelled> for CacheError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl CacheError {
    pub(super) fn serialize(err: serde_json::Error) -> Self {
        Self::Serialize(Arc::new(err))
    }

    pub(super) fn deserialize(err: serde_json::Error) -> Self {
        Self::Deserialize(Arc::new(err))
    }

    /// Returns the loader's error if this is a [`CacheError::Loader`].
    pub fn loader_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Loader(err) => Some(err),
            _ => None,
        }
    }

    /// Returns `true` if the waiting caller was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
