//! Redis-backed registry reads.

use super::{KeyValueStore, Record};
use crate::Result;
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use statsync_core::RecordKind;
use std::collections::HashMap;

/// Registry reader over a multiplexed, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    conn: ConnectionManager,
}

impl RedisKeyValueStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Redis registry connection established");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        let mut conn = self.conn.clone();
        // HGETALL on a missing key yields an empty hash.
        let fields: HashMap<String, String> = conn.hgetall(kind.key(id)).await?;
        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Record::new(fields)))
        }
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", escape_glob(prefix));
        let mut keys: Vec<String> = conn.scan_match(pattern).await?.collect().await;

        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();
        tracing::debug!(prefix, count = keys.len(), "scanned registry keys");
        Ok(keys)
    }
}

/// Escape Redis glob metacharacters so the prefix matches literally.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
