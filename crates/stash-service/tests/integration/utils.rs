use std::sync::Arc;
use std::time::Duration;

use stash_service::kv::{KvClient, RedisClient, RedisConfig};
use stash_test as test;

pub use test::redis_addr;

/// Connects to the test Redis server and empties database `db`.
///
/// Every test uses its own database, so tests can run concurrently.
pub async fn redis_client(addr: String, db: i64) -> Arc<RedisClient> {
    test::setup();

    let config = RedisConfig {
        addr,
        db,
        pool_size: 4,
        min_idle_conns: 1,
        operation_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let client = RedisClient::connect(config).await.unwrap();
    client.flush_all().await.unwrap();
    Arc::new(client)
}
