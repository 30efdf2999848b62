use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::kv::SharedKvClient;
use crate::utils::futures::{CallOnDrop, cancellable};

use super::{CacheError, CacheEvent, CacheEventKind, CacheObserver, TracingObserver};

/// The outcome of a leader pass: the serialized entry every waiter decodes on its own.
type ComputationResult = Result<Bytes, CacheError>;
type ComputationChannel = Shared<oneshot::Receiver<ComputationResult>>;
type ComputationMap = Arc<Mutex<HashMap<String, Computation>>>;

static NEXT_COMPUTATION_ID: AtomicU64 = AtomicU64::new(0);

/// A leader pass in flight.
struct Computation {
    /// Tells this pass apart from later passes for the same key.
    id: u64,
    channel: ComputationChannel,
    /// Cancels the pass once its last waiter is gone.
    cancel: CancellationToken,
    waiters: usize,
}

/// A hook invoked with the serialized entry after it was loaded.
pub type SideEffect = Box<dyn FnOnce(&[u8]) -> anyhow::Result<()> + Send + 'static>;

/// A coalescing cache-aside engine for values of type `T`.
///
/// Values are cached as JSON in the shared key-value store. Concurrent
/// [`get_or_set`](Self::get_or_set) calls for the same key are served by a single
/// leader pass, so the loader runs at most once per outstanding miss in this process.
///
/// Cloning a `Cacher` is cheap, clones share their in-flight computations.
pub struct Cacher<T> {
    name: &'static str,

    /// The store entries are read from and written to.
    store: SharedKvClient,

    /// Expiration of every entry this cacher writes.
    ttl: Duration,

    /// Receives hits, misses and all tolerated failures.
    observer: Arc<dyn CacheObserver>,

    /// Used for deduplicating cache lookups.
    current_computations: ComputationMap,

    _item: PhantomData<fn() -> T>,
}

impl<T> Clone for Cacher<T> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        Cacher {
            name: self.name,
            store: Arc::clone(&self.store),
            ttl: self.ttl,
            observer: Arc::clone(&self.observer),
            current_computations: Arc::clone(&self.current_computations),
            _item: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Cacher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cacher")
            .field("name", &self.name)
            .field("store", &self.store)
            .field("ttl", &self.ttl)
            .field("observer", &self.observer)
            .finish_non_exhaustive()
    }
}

impl<T> Cacher<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    /// Creates a new cacher writing entries with the given `ttl`.
    ///
    /// The `ttl` must be positive. Events are reported through the [`TracingObserver`].
    pub fn new(name: &'static str, store: SharedKvClient, ttl: Duration) -> Self {
        debug_assert!(!ttl.is_zero(), "cache `{name}` needs a positive TTL");
        Cacher {
            name,
            store,
            ttl,
            observer: Arc::new(TracingObserver),
            current_computations: Arc::new(Mutex::new(HashMap::new())),
            _item: PhantomData,
        }
    }

    /// Replaces the observer that receives this cacher's events.
    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &SharedKvClient {
        &self.store
    }

    /// Returns the value cached under `key`, or loads, caches and returns it.
    ///
    /// Concurrent calls for the same `key` share one execution of the lookup and the
    /// `loader`, and all of them observe the same outcome. The `loader` of a call that
    /// attaches to an ongoing computation is dropped without being invoked.
    ///
    /// The `loader` receives the cancellation token of the shared computation. It fires once
    /// every caller waiting for the computation has gone away, at which point the
    /// computation is aborted and the next caller starts a fresh one.
    ///
    /// Failures of the store are logged and otherwise ignored: a failed read is treated
    /// as a miss, and a failed write still returns the loaded value.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Loader`] with the loader's error, passed verbatim to every waiter.
    /// - [`CacheError::Serialize`] if the loaded value could not be encoded.
    /// - [`CacheError::Deserialize`] if the entry could not be decoded by this caller.
    /// - [`CacheError::Cancelled`] once `cancel` fires. The computation itself keeps going
    ///   as long as other callers wait for it.
    pub async fn get_or_set<F, Fut>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        loader: F,
    ) -> Result<T, CacheError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.get_or_set_inner(cancel, key, loader, None).await
    }

    /// Like [`get_or_set`](Self::get_or_set), additionally running `side_effect` on the
    /// serialized entry after it has been loaded.
    ///
    /// The side effect runs once per leader pass, after the write to the store was
    /// attempted. It does not run on cache hits. Its failure is logged and does not
    /// affect the returned value.
    pub async fn get_or_set_with_side_effect<F, Fut, S>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        loader: F,
        side_effect: S,
    ) -> Result<T, CacheError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        S: FnOnce(&[u8]) -> anyhow::Result<()> + Send + 'static,
    {
        self.get_or_set_inner(cancel, key, loader, Some(Box::new(side_effect)))
            .await
    }

    async fn get_or_set_inner<F, Fut>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        loader: F,
        side_effect: Option<SideEffect>,
    ) -> Result<T, CacheError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        metric!(counter("caches.access") += 1, "cache" => self.name);

        // Dropping `_waiter` on any path, including cancellation, deregisters this caller.
        let (channel, _waiter) = self.spawn_computation(key, loader, side_effect);
        let bytes = match cancellable(cancel, channel).await? {
            Ok(result) => result?,
            Err(_cancelled_error) => {
                tracing::error!(cache = self.name, key, "Cache computation channel dropped");
                return Err(CacheError::ComputationDropped);
            }
        };

        serde_json::from_slice(&bytes).map_err(CacheError::deserialize)
    }

    /// Attaches to the computation for `key`, starting a new one if none is running.
    ///
    /// The returned guard deregisters the caller from the computation when dropped.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the computation
    /// on an executor, even if you don't explicitly `await` its results.
    fn spawn_computation<F, Fut>(
        &self,
        key: &str,
        loader: F,
        side_effect: Option<SideEffect>,
    ) -> (ComputationChannel, CallOnDrop)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut current_computations = self
            .current_computations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(computation) = current_computations.get_mut(key) {
            // A concurrent cache lookup was deduplicated.
            metric!(counter("caches.channel.hit") += 1, "cache" => self.name);
            computation.waiters += 1;
            let waiter = self.waiter_token(key.to_owned(), computation.id);
            return (computation.channel.clone(), waiter);
        }

        // A concurrent cache lookup is considered new. This does not imply a cache miss.
        metric!(counter("caches.channel.miss") += 1, "cache" => self.name);

        let id = NEXT_COMPUTATION_ID.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let computation = self
            .clone()
            .compute(key.to_owned(), cancel.clone(), loader, side_effect);
        let channel = self.create_channel(key.to_owned(), id, cancel.clone(), computation);

        let computation = Computation {
            id,
            channel: channel.clone(),
            cancel,
            waiters: 1,
        };
        let evicted = current_computations.insert(key.to_owned(), computation);
        debug_assert!(evicted.is_none());
        (channel, self.waiter_token(key.to_owned(), id))
    }

    /// Creates the guard of one caller waiting for computation `id` of `key`.
    ///
    /// Dropping the last guard of a computation that is still in flight cancels it and
    /// releases its slot.
    fn waiter_token(&self, key: String, id: u64) -> CallOnDrop {
        let current_computations = Arc::clone(&self.current_computations);
        let name = self.name;
        CallOnDrop::new(move || {
            let abandoned = {
                let mut current_computations = current_computations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let remaining = match current_computations.get_mut(&key) {
                    Some(computation) if computation.id == id => {
                        computation.waiters = computation.waiters.saturating_sub(1);
                        Some(computation.waiters)
                    }
                    // finished already, or superseded by a later computation
                    _ => None,
                };
                match remaining {
                    Some(0) => current_computations.remove(&key),
                    _ => None,
                }
            };

            if let Some(computation) = abandoned {
                tracing::debug!(
                    cache = name,
                    key = %key,
                    "Cancelling abandoned cache computation"
                );
                computation.cancel.cancel();
            }
        })
    }

    /// Spawns `computation` and returns a shareable channel to its result.
    ///
    /// The computation is aborted once `cancel` fires. The in-flight slot for `key` is
    /// released before the result is sent.
    fn create_channel<F>(
        &self,
        key: String,
        id: u64,
        cancel: CancellationToken,
        computation: F,
    ) -> ComputationChannel
    where
        F: Future<Output = ComputationResult> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        let current_computations = Arc::clone(&self.current_computations);
        let remove_computation_token = CallOnDrop::new(move || {
            let mut current_computations = current_computations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if current_computations
                .get(&key)
                .is_some_and(|computation| computation.id == id)
            {
                current_computations.remove(&key);
            }
        });

        let channel = async move {
            let result = match cancellable(&cancel, computation).await {
                Ok(result) => result,
                Err(cancelled) => Err(cancelled.into()),
            };
            // Drop the token first to evict from the map.  This ensures that callers either
            // get a channel that will receive data, or they create a new channel.
            drop(remove_computation_token);
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(channel);

        receiver.shared()
    }

    /// The leader pass: lookup, and on a miss load, store and run the side effect.
    ///
    /// `cancel` belongs to the pass, [`create_channel`](Self::create_channel) aborts the
    /// whole pass once it fires.
    async fn compute<F, Fut>(
        self,
        key: String,
        cancel: CancellationToken,
        loader: F,
        side_effect: Option<SideEffect>,
    ) -> ComputationResult
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        match self.store.get(&key).await {
            Ok(Some(bytes)) => {
                self.observe(&key, CacheEventKind::Hit);
                return Ok(bytes);
            }
            Ok(None) => self.observe(&key, CacheEventKind::Miss),
            Err(err) => self.observe(&key, CacheEventKind::ReadFailed(&err)),
        }

        metric!(counter("caches.computation") += 1, "cache" => self.name);
        let value = loader(cancel)
            .await
            .map_err(|err| CacheError::Loader(Arc::new(err)))?;
        let bytes = Bytes::from(serde_json::to_vec(&value).map_err(CacheError::serialize)?);
        drop(value);

        if let Err(err) = self.store.set(&key, bytes.clone(), self.ttl).await {
            self.observe(&key, CacheEventKind::WriteFailed(&err));
        }

        if let Some(side_effect) = side_effect {
            if let Err(err) = side_effect(&bytes[..]) {
                self.observe(&key, CacheEventKind::SideEffectFailed(&err));
            }
        }

        Ok(bytes)
    }

    fn observe(&self, key: &str, kind: CacheEventKind<'_>) {
        self.observer.observe(CacheEvent {
            cache: self.name,
            key,
            kind,
        });
    }

    /// Removes the entry for `key` from the store.
    ///
    /// A computation already in flight for `key` is not affected.
    pub async fn invalidate(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> Result<(), CacheError> {
        cancellable(cancel, self.store.delete(key)).await??;
        Ok(())
    }

    /// Removes every entry from the store, including those of other cachers sharing it.
    pub async fn clear(&self, cancel: &CancellationToken) -> Result<(), CacheError> {
        cancellable(cancel, self.store.flush_all()).await??;
        Ok(())
    }

    /// Reads the entries for all `keys` without loading missing ones.
    ///
    /// The result is aligned with `keys`.
    pub async fn peek_many(
        &self,
        cancel: &CancellationToken,
        keys: &[String],
    ) -> Result<Vec<Option<T>>, CacheError> {
        let entries = cancellable(cancel, self.store.multi_get(keys)).await??;
        entries
            .into_iter()
            .map(|entry| {
                entry
                    .map(|bytes| serde_json::from_slice(&bytes).map_err(CacheError::deserialize))
                    .transpose()
            })
            .collect()
    }
}
