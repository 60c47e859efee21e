//! In-memory stub for `StoreAdapter`. Grounded on `FakeRedis`: a plain
//! dict-backed stand-in good enough that the same tests exercise real TTL
//! expiry and pattern scanning, not a mock that merely records calls.

use super::{StoreAdapter, StreamMessage};
use crate::errors::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Default)]
struct StreamEntry {
    messages: Vec<(String, HashMap<String, String>)>,
    /// group -> next unacked index per consumer group.
    groups: HashMap<String, usize>,
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Vec<u8>>,
    expiry: HashMap<String, Instant>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    streams: HashMap<String, StreamEntry>,
}

impl Inner {
    fn is_expired(&self, key: &str) -> bool {
        self.expiry
            .get(key)
            .map(|deadline| Instant::now() >= *deadline)
            .unwrap_or(false)
    }

    fn purge_if_expired(&mut self, key: &str) {
        if self.is_expired(key) {
            self.kv.remove(key);
            self.expiry.remove(key);
        }
    }
}

/// Glob matcher supporting `*` as a trailing or infix wildcard only, per
/// the grammar constraint in the pattern registry.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == candidate;
    }
    let mut rest = candidate;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

pub struct FakeStore {
    inner: Mutex<Inner>,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

#[async_trait]
impl StoreAdapter for FakeStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.inner.lock();
        inner.purge_if_expired(key);
        inner.kv.get(key).cloned().ok_or(StoreError::NotFound)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.kv.insert(key.to_string(), value.to_vec());
        inner.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let mut count = 0;
        for key in keys {
            if inner.kv.remove(key).is_some() {
                count += 1;
            }
            inner.expiry.remove(key);
            inner.hashes.remove(key);
            inner.sets.remove(key);
        }
        Ok(count)
    }

    async fn scan_pattern(&self, pattern: &str, _batch_size: usize) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .kv
            .keys()
            .filter(|k| inner.is_expired(k))
            .cloned()
            .collect();
        for key in expired {
            inner.kv.remove(&key);
            inner.expiry.remove(&key);
        }
        Ok(inner
            .kv
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self.inner.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_delete(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        let Some(map) = inner.hashes.get_mut(key) else {
            return Ok(0);
        };
        let mut count = 0;
        for field in fields {
            if map.remove(field).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let entry = inner.sets.entry(key.to_string()).or_default();
        for member in members {
            entry.insert(member.clone());
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.sets.get_mut(key) {
            for member in members {
                entry.remove(member);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
        maxlen: Option<usize>,
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.lock();
        let entry = inner.streams.entry(stream.to_string()).or_default();
        let id = entry.messages.len().to_string();
        entry.messages.push((id.clone(), fields.clone()));
        if let Some(max) = maxlen {
            if entry.messages.len() > max {
                let overflow = entry.messages.len() - max;
                entry.messages.drain(0..overflow);
            }
        }
        Ok(id)
    }

    async fn stream_group_create(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_insert(0);
        Ok(())
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        _block: Duration,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let cursor = *entry.groups.entry(group.to_string()).or_insert(0);
        let batch: Vec<StreamMessage> = entry
            .messages
            .iter()
            .skip(cursor)
            .take(count)
            .map(|(id, fields)| StreamMessage {
                id: id.clone(),
                fields: fields.clone(),
            })
            .collect();
        Ok(batch)
    }

    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.streams.get_mut(stream) else {
            return Ok(());
        };
        if let Some(pos) = entry.messages.iter().position(|(mid, _)| mid == id) {
            let cursor = entry.groups.entry(group.to_string()).or_insert(0);
            *cursor = (*cursor).max(pos + 1);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.kv.contains_key(key) {
            inner.expiry.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        inner.purge_if_expired(key);
        Ok(inner.kv.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_match_trailing_wildcard() {
        assert!(glob_match("greeks:A:*", "greeks:A:live"));
        assert!(!glob_match("greeks:A:*", "greeks:B:live"));
    }

    #[test]
    fn glob_match_infix_wildcard() {
        assert!(glob_match("greeks:*:live", "greeks:A:live"));
        assert!(!glob_match("greeks:*:live", "greeks:A:current"));
    }

    #[tokio::test]
    async fn stream_read_group_respects_cursor_across_acks() {
        let store = FakeStore::new();
        let mut fields = HashMap::new();
        fields.insert("event_type".to_string(), "instrument.updated".to_string());
        store.stream_append("s", &fields, None).await.unwrap();
        store.stream_append("s", &fields, None).await.unwrap();
        store.stream_group_create("s", "g").await.unwrap();

        let batch = store.stream_read_group("s", "g", "c1", 1, Duration::from_millis(0)).await.unwrap();
        assert_eq!(batch.len(), 1);
        store.stream_ack("s", "g", &batch[0].id).await.unwrap();

        let next = store.stream_read_group("s", "g", "c1", 10, Duration::from_millis(0)).await.unwrap();
        assert_eq!(next.len(), 1);
    }
}
