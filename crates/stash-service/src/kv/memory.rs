use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use super::{KvClient, KvError, KvOperation, record_operation};

#[derive(Debug)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// A process-local [`KvClient`].
///
/// Expiration follows the tokio clock, so tests can pause and advance time.
#[derive(Debug, Default)]
pub struct MemoryClient {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self, entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<Bytes> {
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl KvClient for MemoryClient {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, KvError> {
        let now = Instant::now();
        let value = self.read(&mut self.lock(), key, now);
        let result = Ok(value);
        record_operation(self.name(), KvOperation::Get, &result);
        result
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), KvError> {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.lock()
            .insert(key.to_owned(), Entry { value, expires_at });
        let result = Ok(());
        record_operation(self.name(), KvOperation::Set, &result);
        result
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.lock().remove(key);
        let result = Ok(());
        record_operation(self.name(), KvOperation::Delete, &result);
        result
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>, KvError> {
        let now = Instant::now();
        let mut entries = self.lock();
        let values = keys
            .iter()
            .map(|key| self.read(&mut entries, key, now))
            .collect();
        drop(entries);

        let result = Ok(values);
        record_operation(self.name(), KvOperation::MultiGet, &result);
        result
    }

    async fn multi_set(&self, entries: &BTreeMap<String, Bytes>) -> Result<(), KvError> {
        let mut stored = self.lock();
        for (key, value) in entries {
            stored.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    expires_at: None,
                },
            );
        }
        drop(stored);

        let result = Ok(());
        record_operation(self.name(), KvOperation::MultiSet, &result);
        result
    }

    async fn flush_all(&self) -> Result<(), KvError> {
        self.lock().clear();
        let result = Ok(());
        record_operation(self.name(), KvOperation::FlushAll, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_delete() {
        let client = MemoryClient::new();
        assert_eq!(client.get("a").await.unwrap(), None);

        client
            .set("a", Bytes::from_static(b"1"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(client.get("a").await.unwrap(), Some(Bytes::from_static(b"1")));

        // overwrites unconditionally
        client
            .set("a", Bytes::from_static(b"2"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(client.get("a").await.unwrap(), Some(Bytes::from_static(b"2")));

        client.delete("a").await.unwrap();
        assert_eq!(client.get("a").await.unwrap(), None);
        // deleting a missing key is fine
        client.delete("a").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl() {
        let client = MemoryClient::new();
        client
            .set("short", Bytes::from_static(b"x"), Duration::from_secs(10))
            .await
            .unwrap();
        client
            .set("forever", Bytes::from_static(b"y"), Duration::ZERO)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(client.get("short").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(client.get("short").await.unwrap(), None);
        assert!(client.get("forever").await.unwrap().is_some());
        assert_eq!(client.len(), 1);
    }

    #[tokio::test]
    async fn test_multi_get_alignment() {
        let client = MemoryClient::new();
        let entries = BTreeMap::from([
            ("a".to_owned(), Bytes::from_static(b"1")),
            ("c".to_owned(), Bytes::from_static(b"3")),
        ]);
        client.multi_set(&entries).await.unwrap();

        let keys = ["a", "b", "c"].map(String::from);
        let values = client.multi_get(&keys).await.unwrap();
        assert_eq!(
            values,
            vec![
                Some(Bytes::from_static(b"1")),
                None,
                Some(Bytes::from_static(b"3")),
            ]
        );

        assert!(client.multi_get(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flush_all() {
        let client = MemoryClient::new();
        client
            .set("a", Bytes::from_static(b"1"), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!client.is_empty());

        client.flush_all().await.unwrap();
        assert!(client.is_empty());
        assert_eq!(client.get("a").await.unwrap(), None);
    }
}
