//! Cached data-access helpers for a relational database.
//!
//! A [`Repository`] builds a [`Query`] and a cache key for every lookup and delegates the actual
//! work to [`Cacher::get_or_set`], so the database is only queried on cache misses. Executing the
//! query is up to the [`Database`] implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheError, CacheObserver, Cacher};
use crate::config::CacheConfigs;
use crate::kv::SharedKvClient;

mod cache_key;
mod query;

pub use cache_key::CacheKeyBuilder;
pub use query::{Query, Select};

/// Executes [`Query`]s against a relational database.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Fetches exactly one row. Not finding a row is an error.
    ///
    /// Implementations should abort the query once `cancel` fires.
    async fn fetch_one<R>(&self, cancel: &CancellationToken, query: &Query) -> anyhow::Result<R>
    where
        R: DeserializeOwned + Send + 'static;

    /// Fetches all matching rows.
    async fn fetch_all<R>(
        &self,
        cancel: &CancellationToken,
        query: &Query,
    ) -> anyhow::Result<Vec<R>>
    where
        R: DeserializeOwned + Send + 'static;
}

/// The result of [`Repository::count_by_column`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Count {
    pub count: u64,
}

/// Cached lookups of rows of type `R`.
///
/// Single rows, lists of rows and counts are cached by separate [`Cacher`]s, which share
/// the key-value store and the TTL.
pub struct Repository<R, D> {
    db: Arc<D>,
    rows: Cacher<R>,
    lists: Cacher<Vec<R>>,
    counts: Cacher<Count>,
}

impl<R, D> Clone for Repository<R, D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            rows: self.rows.clone(),
            lists: self.lists.clone(),
            counts: self.counts.clone(),
        }
    }
}

impl<R, D> std::fmt::Debug for Repository<R, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("rows", &self.rows)
            .field("lists", &self.lists)
            .field("counts", &self.counts)
            .finish_non_exhaustive()
    }
}

impl<R, D> Repository<R, D>
where
    R: Serialize + DeserializeOwned + Send + 'static,
    D: Database,
{
    pub fn new(db: Arc<D>, store: SharedKvClient, ttl: Duration) -> Self {
        Self {
            db,
            rows: Cacher::new("rows", Arc::clone(&store), ttl),
            lists: Cacher::new("lists", Arc::clone(&store), ttl),
            counts: Cacher::new("counts", store, ttl),
        }
    }

    /// Creates a repository with the TTL from the `caches` config section.
    pub fn from_config(db: Arc<D>, store: SharedKvClient, config: &CacheConfigs) -> Self {
        Self::new(db, store, config.default_ttl)
    }

    /// Reports the events of all caches of this repository to `observer`.
    pub fn with_observer(self, observer: Arc<dyn CacheObserver>) -> Self {
        Self {
            db: self.db,
            rows: self.rows.with_observer(Arc::clone(&observer)),
            lists: self.lists.with_observer(Arc::clone(&observer)),
            counts: self.counts.with_observer(observer),
        }
    }

    /// The cache of single rows.
    pub fn rows(&self) -> &Cacher<R> {
        &self.rows
    }

    /// The cache of row lists.
    pub fn lists(&self) -> &Cacher<Vec<R>> {
        &self.lists
    }

    /// Fetches the row of `table` where `column` equals `value`.
    ///
    /// Cached under `table:column:value`. An empty `columns` selects all columns.
    pub async fn get_by_column(
        &self,
        cancel: &CancellationToken,
        table: &str,
        column: &str,
        value: &str,
        columns: &[&str],
    ) -> Result<R, CacheError> {
        let key = cache_key::row_key(table, column, value);
        let query = Query::select(table)
            .columns(columns)
            .filter(column, value)
            .build();

        let db = Arc::clone(&self.db);
        self.rows
            .get_or_set(cancel, &key, move |pass| async move {
                db.fetch_one::<R>(&pass, &query).await
            })
            .await
    }

    /// Fetches the row of `table` with the given `id`.
    pub async fn get_by_id(
        &self,
        cancel: &CancellationToken,
        table: &str,
        id: &str,
        columns: &[&str],
    ) -> Result<R, CacheError> {
        self.get_by_column(cancel, table, "id", id, columns).await
    }

    /// Fetches the row of `table` with the given `name`.
    pub async fn get_by_name(
        &self,
        cancel: &CancellationToken,
        table: &str,
        name: &str,
        columns: &[&str],
    ) -> Result<R, CacheError> {
        self.get_by_column(cancel, table, "name", name, columns).await
    }

    /// Fetches the row of `table` with the given `user_id`.
    pub async fn get_by_user_id(
        &self,
        cancel: &CancellationToken,
        table: &str,
        user_id: &str,
        columns: &[&str],
    ) -> Result<R, CacheError> {
        self.get_by_column(cancel, table, "user_id", user_id, columns)
            .await
    }

    /// Counts the rows of `table` where `column` equals `value`.
    ///
    /// Cached under `table:count:column:value`.
    pub async fn count_by_column(
        &self,
        cancel: &CancellationToken,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Count, CacheError> {
        let key = cache_key::count_key(table, column, value);
        let query = Query::count(table).filter(column, value).build();

        let db = Arc::clone(&self.db);
        self.counts
            .get_or_set(cancel, &key, move |pass| async move {
                db.fetch_one::<Count>(&pass, &query).await
            })
            .await
    }

    /// Fetches all rows of `table`.
    ///
    /// Cached under `table:all`, regardless of `columns`.
    pub async fn select_all(
        &self,
        cancel: &CancellationToken,
        table: &str,
        columns: &[&str],
    ) -> Result<Vec<R>, CacheError> {
        let key = cache_key::all_key(table);
        let query = Query::select(table).columns(columns).build();
        self.fetch_list(cancel, key, query).await
    }

    /// Fetches all rows of `table` where `column` equals `value`.
    ///
    /// Cached under `table:list:column:value`.
    pub async fn select_by_column(
        &self,
        cancel: &CancellationToken,
        table: &str,
        column: &str,
        value: &str,
        columns: &[&str],
    ) -> Result<Vec<R>, CacheError> {
        let key = cache_key::list_key(table, column, value, None);
        let query = Query::select(table)
            .columns(columns)
            .filter(column, value)
            .build();
        self.fetch_list(cancel, key, query).await
    }

    /// Fetches at most `limit` rows of `table` where `column` equals `value`.
    ///
    /// Cached under `table:list:column:value:limit:limit`.
    pub async fn select_by_column_with_limit(
        &self,
        cancel: &CancellationToken,
        table: &str,
        column: &str,
        value: &str,
        limit: u64,
        columns: &[&str],
    ) -> Result<Vec<R>, CacheError> {
        let key = cache_key::list_key(table, column, value, Some(limit));
        let query = Query::select(table)
            .columns(columns)
            .filter(column, value)
            .limit(limit)
            .build();
        self.fetch_list(cancel, key, query).await
    }

    async fn fetch_list(
        &self,
        cancel: &CancellationToken,
        key: String,
        query: Query,
    ) -> Result<Vec<R>, CacheError> {
        let db = Arc::clone(&self.db);
        self.lists
            .get_or_set(cancel, &key, move |pass| async move {
                db.fetch_all::<R>(&pass, &query).await
            })
            .await
    }
}
