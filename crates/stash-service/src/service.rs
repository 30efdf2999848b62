//! Wiring of the cache layer from a [`Config`].

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::{CacheConfigs, Config};
use crate::kv::{self, SharedKvClient};
use crate::metrics;
use crate::repository::{Database, Repository};

/// The store and settings shared by all caches of a process.
#[derive(Debug, Clone)]
pub struct CacheServices {
    store: SharedKvClient,
    caches: CacheConfigs,
}

impl CacheServices {
    /// Configures metrics and connects to the configured cache store.
    ///
    /// Logging is expected to be initialized already, see
    /// [`init_logging`](crate::logging::init_logging).
    pub async fn create(config: &Config) -> Result<Self> {
        metrics::init(&config.metrics).context("failed to configure metrics")?;

        let store = kv::connect(&config.cache_store)
            .await
            .context("failed to connect to the cache store")?;

        Ok(Self {
            store,
            caches: config.caches,
        })
    }

    pub fn store(&self) -> &SharedKvClient {
        &self.store
    }

    /// Creates the cached data-access helpers for `db`.
    pub fn repository<R, D>(&self, db: Arc<D>) -> Repository<R, D>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
        D: Database,
    {
        Repository::from_config(db, Arc::clone(&self.store), &self.caches)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use crate::kv::KvClient;
    use crate::test::{self, FakeDatabase};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    #[tokio::test]
    async fn test_create_from_config_file() {
        test::setup();
        let dir = test::tempdir();
        let path = dir.path().join("config.yml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            br#"
            metrics:
              statsd: null
            cache_store:
              backend: memory
            caches:
              default_ttl: 30s
            "#,
        )
        .unwrap();

        let config = Config::get(Some(&path)).unwrap();
        let services = CacheServices::create(&config).await.unwrap();
        assert_eq!(services.store().name(), "memory");

        let db = FakeDatabase::new();
        db.respond(
            "SELECT * FROM `users` WHERE `id` = ?",
            &["3"],
            json!({"id": 3, "name": "ada"}),
        );
        let repository = services.repository::<User, _>(Arc::new(db));
        assert_eq!(repository.rows().ttl(), Duration::from_secs(30));

        let user = repository
            .get_by_id(&CancellationToken::new(), "users", "3", &[])
            .await
            .unwrap();
        assert_eq!(user.name, "ada");
        assert!(services.store().get("users:id:3").await.unwrap().is_some());
    }
}
