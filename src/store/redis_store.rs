//! Production `StoreAdapter` backed by a real Redis (or Redis-compatible)
//! server via the `redis` crate's async `ConnectionManager`, which
//! transparently reconnects on dropped connections.

use super::{StoreAdapter, StreamMessage};
use crate::errors::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;
        let conn = client.get_connection_manager().await.map_err(StoreError::from)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StoreAdapter for RedisStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(StoreError::from)?;
        value.ok_or(StoreError::NotFound)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds).await.map_err(StoreError::from)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let deleted: u64 = conn.del(keys).await.map_err(StoreError::from)?;
        Ok(deleted)
    }

    async fn scan_pattern(&self, pattern: &str, batch_size: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(batch_size)
                .query_async(&mut conn)
                .await
                .map_err(StoreError::from)?;
            out.extend(keys);
            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(out)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(key).await.map_err(StoreError::from)?;
        Ok(map)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await.map_err(StoreError::from)
    }

    async fn hash_delete(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let deleted: u64 = conn.hdel(key, fields).await.map_err(StoreError::from)?;
        Ok(deleted)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, members).await.map_err(StoreError::from)
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, members).await.map_err(StoreError::from)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await.map_err(StoreError::from)?;
        Ok(members)
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &HashMap<String, String>,
        maxlen: Option<usize>,
    ) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max) = maxlen {
            cmd.arg("MAXLEN").arg("~").arg(max);
        }
        cmd.arg("*");
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let id: String = cmd.query_async(&mut conn).await.map_err(StoreError::from)?;
        Ok(id)
    }

    async fn stream_group_create(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(StoreError::from(err)),
        }
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as i64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(StoreError::from)?;

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let mut fields = HashMap::new();
                for (field, value) in entry.map {
                    if let redis::Value::BulkString(bytes) = value {
                        fields.insert(field, String::from_utf8_lossy(&bytes).into_owned());
                    }
                }
                out.push(StreamMessage { id: entry.id, fields });
            }
        }
        Ok(out)
    }

    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.xack::<_, _, _, ()>(stream, group, &[id]).await.map_err(StoreError::from)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(StoreError::from)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64).await.map_err(StoreError::from)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await.map_err(StoreError::from)?;
        Ok(exists)
    }
}
