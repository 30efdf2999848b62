use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use stash_service::kv::{self, KvClient, KvConfig, RedisConfig};

use crate::{redis_addr, redis_client};

#[tokio::test]
async fn test_get_set_delete() {
    let addr = redis_addr!();
    let client = redis_client(addr, 1).await;

    assert_eq!(client.get("missing").await.unwrap(), None);

    client
        .set("key", Bytes::from_static(b"\x00binary\xff"), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(
        client.get("key").await.unwrap(),
        Some(Bytes::from_static(b"\x00binary\xff"))
    );

    client.delete("key").await.unwrap();
    assert_eq!(client.get("key").await.unwrap(), None);
    client.delete("key").await.unwrap();
}

#[tokio::test]
async fn test_ttl() {
    let addr = redis_addr!();
    let client = redis_client(addr, 2).await;

    client
        .set("short", Bytes::from_static(b"x"), Duration::from_millis(200))
        .await
        .unwrap();
    assert!(client.get("short").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.get("short").await.unwrap(), None);
}

#[tokio::test]
async fn test_multi_get_set() {
    let addr = redis_addr!();
    let client = redis_client(addr, 3).await;

    let entries = BTreeMap::from([
        ("a".to_owned(), Bytes::from_static(b"1")),
        ("c".to_owned(), Bytes::from_static(b"3")),
    ]);
    client.multi_set(&entries).await.unwrap();
    client.multi_set(&BTreeMap::new()).await.unwrap();

    let keys = ["a", "b", "c"].map(String::from);
    let values = client.multi_get(&keys).await.unwrap();
    assert_eq!(
        values,
        [
            Some(Bytes::from_static(b"1")),
            None,
            Some(Bytes::from_static(b"3"))
        ]
    );
    assert!(client.multi_get(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_flush_all() {
    let addr = redis_addr!();
    let client = redis_client(addr, 4).await;

    client
        .set("a", Bytes::from_static(b"1"), Duration::from_secs(60))
        .await
        .unwrap();
    client.flush_all().await.unwrap();
    assert_eq!(client.get("a").await.unwrap(), None);
}

#[tokio::test]
async fn test_connect_from_config() {
    let addr = redis_addr!();
    stash_test::setup();

    let config = KvConfig::Redis(RedisConfig {
        addr,
        db: 5,
        ..Default::default()
    });
    let client = kv::connect(&config).await.unwrap();
    assert_eq!(client.name(), "redis");
    client.flush_all().await.unwrap();
}
