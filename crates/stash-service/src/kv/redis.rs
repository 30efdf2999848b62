use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bb8::{Pool, RunError};
use bb8_redis::RedisConnectionManager;
use bb8_redis::redis::{self, ErrorKind, RedisError};
use bytes::Bytes;

use super::{KvClient, KvError, KvErrorKind, KvOperation, RedisConfig, record_operation};

type RedisPool = Pool<RedisConnectionManager>;

/// A [`KvClient`] talking to a Redis server through a connection pool.
pub struct RedisClient {
    pool: RedisPool,
    config: RedisConfig,
}

impl fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisClient")
            .field("addr", &self.config.addr)
            .field("db", &self.config.db)
            .field("pool", &self.pool.state())
            .finish()
    }
}

impl RedisClient {
    /// Creates the connection pool and checks connectivity with a `PING`.
    pub async fn connect(config: RedisConfig) -> Result<Self, KvError> {
        let url = config
            .url()
            .map_err(|err| KvError::with_source(KvOperation::Get, KvErrorKind::Other, err))?;
        let manager = RedisConnectionManager::new(url)
            .map_err(|err| map_redis_error(KvOperation::Get, err))?;

        let pool = Pool::builder()
            .max_size(config.pool_size.max(1))
            .min_idle(Some(config.min_idle_conns.min(config.pool_size)))
            .connection_timeout(config.connect_timeout)
            .build(manager)
            .await
            .map_err(|err| map_redis_error(KvOperation::Get, err))?;

        let client = Self { pool, config };
        client.ping().await?;

        tracing::info!(
            addr = %client.config.addr,
            db = client.config.db,
            pool_size = client.config.pool_size,
            "Connected to redis"
        );
        Ok(client)
    }

    async fn ping(&self) -> Result<(), KvError> {
        self.run(KvOperation::Get, async {
            let mut conn = self.pool.get().await?;
            let pong: String = redis::cmd("PING").query_async(&mut *conn).await?;
            if pong != "PONG" {
                tracing::warn!(response = %pong, "Unexpected PING response from redis");
            }
            Ok(())
        })
        .await
    }

    /// Runs a single operation against the pool, bounded by the operation timeout.
    async fn run<T, F>(&self, operation: KvOperation, fut: F) -> Result<T, KvError>
    where
        F: Future<Output = Result<T, RunError<RedisError>>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.config.operation_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(RunError::User(err))) => Err(map_redis_error(operation, err)),
            Ok(Err(RunError::TimedOut)) => Err(KvError::new(operation, KvErrorKind::Unavailable)),
            Err(_) => Err(KvError::new(operation, KvErrorKind::Timeout)),
        };

        record_operation(self.name(), operation, &result);
        metric!(
            timer("kv.operation.duration") = start.elapsed(),
            "backend" => self.name(),
            "operation" => operation.as_ref(),
        );
        result
    }
}

fn map_redis_error(operation: KvOperation, err: RedisError) -> KvError {
    let kind = if err.is_timeout() {
        KvErrorKind::Timeout
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        KvErrorKind::Unavailable
    } else if err.kind() == ErrorKind::TypeError {
        KvErrorKind::Malformed
    } else {
        KvErrorKind::Other
    };
    KvError::with_source(operation, kind, err)
}

#[async_trait]
impl KvClient for RedisClient {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        self.run(KvOperation::Get, async {
            let mut conn = self.pool.get().await?;
            let value: Option<Vec<u8>> =
                redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
            Ok(value.map(Bytes::from))
        })
        .await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), KvError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(&value[..]);
        // a zero ttl stores the entry without expiration
        let millis = ttl.as_millis();
        if millis > 0 {
            cmd.arg("PX").arg(u64::try_from(millis).unwrap_or(u64::MAX));
        }

        self.run(KvOperation::Set, async {
            let mut conn = self.pool.get().await?;
            let _: () = cmd.query_async(&mut *conn).await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.run(KvOperation::Delete, async {
            let mut conn = self.pool.get().await?;
            let _removed: u64 = redis::cmd("DEL").arg(key).query_async(&mut *conn).await?;
            Ok(())
        })
        .await
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, KvError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values = self
            .run(KvOperation::MultiGet, async {
                let mut conn = self.pool.get().await?;
                let values: Vec<Option<Vec<u8>>> =
                    redis::cmd("MGET").arg(keys).query_async(&mut *conn).await?;
                Ok(values)
            })
            .await?;

        if values.len() != keys.len() {
            return Err(KvError::new(KvOperation::MultiGet, KvErrorKind::Malformed));
        }
        Ok(values.into_iter().map(|v| v.map(Bytes::from)).collect())
    }

    async fn multi_set(&self, entries: &BTreeMap<String, Bytes>) -> Result<(), KvError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut cmd = redis::cmd("MSET");
        for (key, value) in entries {
            cmd.arg(key).arg(&value[..]);
        }

        self.run(KvOperation::MultiSet, async {
            let mut conn = self.pool.get().await?;
            let _: () = cmd.query_async(&mut *conn).await?;
            Ok(())
        })
        .await
    }

    async fn flush_all(&self) -> Result<(), KvError> {
        self.run(KvOperation::FlushAll, async {
            let mut conn = self.pool.get().await?;
            let _: () = redis::cmd("FLUSHDB").query_async(&mut *conn).await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn test_error_mapping() {
        let err = RedisError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        let mapped = map_redis_error(KvOperation::Get, err);
        assert_eq!(mapped.kind(), KvErrorKind::Unavailable);
        assert_eq!(mapped.operation(), KvOperation::Get);

        let err = RedisError::from((ErrorKind::TypeError, "unexpected reply"));
        assert_eq!(
            map_redis_error(KvOperation::MultiGet, err).kind(),
            KvErrorKind::Malformed
        );

        let err = RedisError::from((ErrorKind::ResponseError, "WRONGTYPE"));
        assert_eq!(
            map_redis_error(KvOperation::Set, err).kind(),
            KvErrorKind::Other
        );
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let config = RedisConfig {
            // nothing listens on the discard port
            addr: "127.0.0.1:9".into(),
            connect_timeout: Duration::from_millis(100),
            operation_timeout: Duration::from_millis(200),
            min_idle_conns: 0,
            ..Default::default()
        };
        let err = RedisClient::connect(config).await.unwrap_err();
        assert!(err.is_unavailable(), "{err:?}");
    }
}
