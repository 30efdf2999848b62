use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stash_service::caching::Cacher;
use stash_service::kv::KvClient;
use tokio_util::sync::CancellationToken;

use crate::{redis_addr, redis_client};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Session {
    token: String,
    user_id: u64,
}

#[tokio::test]
async fn test_coalescing_over_redis() {
    let addr = redis_addr!();
    let client = redis_client(addr, 6).await;
    let cacher = Cacher::<Session>::new("sessions", client.clone(), Duration::from_secs(10));
    let cancel = CancellationToken::new();
    let loads = Arc::new(AtomicUsize::new(0));

    let lookups = (0..10).map(|_| {
        let loads = loads.clone();
        cacher.get_or_set(&cancel, "sessions:token:abc", move |_| async move {
            loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Session {
                token: "abc".into(),
                user_id: 7,
            })
        })
    });
    let results = futures::future::join_all(lookups).await;

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap().user_id, 7);
    }

    let stored = client.get("sessions:token:abc").await.unwrap().unwrap();
    assert_eq!(&stored[..], br#"{"token":"abc","user_id":7}"#);
}

#[tokio::test]
async fn test_hit_and_invalidate_over_redis() {
    let addr = redis_addr!();
    let client = redis_client(addr, 7).await;
    let cacher = Cacher::<u64>::new("counts", client.clone(), Duration::from_secs(10));
    let cancel = CancellationToken::new();

    let first = cacher
        .get_or_set(&cancel, "posts:count:user_id:7", |_| async { Ok(12) })
        .await
        .unwrap();
    let second = cacher
        .get_or_set(&cancel, "posts:count:user_id:7", |_| async { Ok(13) })
        .await
        .unwrap();
    assert_eq!((first, second), (12, 12));

    cacher
        .invalidate(&cancel, "posts:count:user_id:7")
        .await
        .unwrap();
    let third = cacher
        .get_or_set(&cancel, "posts:count:user_id:7", |_| async { Ok(13) })
        .await
        .unwrap();
    assert_eq!(third, 13);

    let keys = ["posts:count:user_id:7".to_owned(), "missing".to_owned()];
    let peeked = cacher.peek_many(&cancel, &keys).await.unwrap();
    assert_eq!(peeked, [Some(13), None]);
}
