//! KV/Stream Store Adapter (C1). Abstracts the external key-value + stream
//! store behind a narrow async contract so the rest of the crate never
//! talks to a concrete backend. Two implementations ship here: a real
//! `redis`-backed one (`redis_store`) and an in-memory stub (`fake`) that
//! satisfies the same semantics, including TTL expiry, for development
//! and tests.

pub mod fake;
pub mod redis_store;

pub use fake::FakeStore;
pub use redis_store::RedisStore;

use crate::errors::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// One message read from a consumer group: `(message_id, fields)`.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// The narrow contract every cache-coordinating component is built
/// against. All operations are fallible with the `StoreError` taxonomy:
/// `transient` (retry OK), `permanent` (do not retry), and `NotFound` for
/// reads of an absent key.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;
    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Returns every key matching `pattern` (glob, `*` trailing/infix only).
    /// Implementations scan in `batch_size`-sized pages internally; the
    /// caller sees a fully-drained, bounded-memory `Vec` because the core
    /// never needs cursor resumption across calls.
    async fn scan_pattern(&self, pattern: &str, batch_size: usize) -> Result<Vec<String>, StoreError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;
    async fn hash_delete(&self, key: &str, fields: &[String]) -> Result<u64, StoreError>;

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError>;
    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StoreError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn stream_append(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
        maxlen: Option<usize>,
    ) -> Result<String, StoreError>;

    /// Idempotent: "already exists" is swallowed, not surfaced as an error.
    async fn stream_group_create(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StoreError>;

    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// TTL expiry convenience used by key set operations whose TTL applies
    /// to the key itself (expire semantics), not only `set_with_ttl`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod contract_tests {
    //! Shared semantics tests run against `FakeStore`; a real Redis
    //! integration would run the same assertions against `RedisStore`.
    use super::*;
    use std::time::Duration as StdDuration;

    async fn exercise_basic_semantics(store: &dyn StoreAdapter) {
        assert!(matches!(store.get("missing").await, Err(StoreError::NotFound)));

        store.set_with_ttl("k1", b"v1", StdDuration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), b"v1".to_vec());
        assert!(store.exists("k1").await.unwrap());

        let deleted = store.delete_many(&["k1".to_string()]).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(matches!(store.get("k1").await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn fake_store_basic_semantics() {
        let store = FakeStore::new();
        exercise_basic_semantics(&store).await;
    }

    #[tokio::test]
    async fn fake_store_scan_pattern() {
        let store = FakeStore::new();
        store.set_with_ttl("greeks:A:latest", b"1", StdDuration::from_secs(60)).await.unwrap();
        store.set_with_ttl("greeks:A:live", b"1", StdDuration::from_secs(60)).await.unwrap();
        store.set_with_ttl("indicators:A:rsi:1m:x", b"1", StdDuration::from_secs(60)).await.unwrap();

        let mut keys = store.scan_pattern("greeks:A:*", 100).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["greeks:A:latest".to_string(), "greeks:A:live".to_string()]);
    }

    #[tokio::test]
    async fn fake_store_ttl_expiry() {
        let store = FakeStore::new();
        store.set_with_ttl("k", b"v", StdDuration::from_millis(10)).await.unwrap();
        assert!(store.exists("k").await.unwrap());
        tokio::time::sleep(StdDuration::from_millis(40)).await;
        assert!(!store.exists("k").await.unwrap());
        assert!(matches!(store.get("k").await, Err(StoreError::NotFound)));
    }
}
