//! Key-value store access (the live device registry).
//!
//! The registry keeps gateways, devices and sensors as flat string hashes
//! under `<kind>:<id>` keys. This module exposes the two reads the reconciler
//! needs, lookup by id and key scan by prefix, behind [`KeyValueStore`].
//!
//! - [`RedisKeyValueStore`] - production adapter (`HGETALL` / `SCAN MATCH`)
//! - [`MemoryKeyValueStore`] - in-process map, used by tests

mod memory;
mod redis;

pub use self::memory::MemoryKeyValueStore;
pub use self::redis::RedisKeyValueStore;

use crate::{Error, Result};
use async_trait::async_trait;
use statsync_core::RecordKind;
use std::collections::HashMap;

/// A record's string-typed fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: HashMap<String, String>,
}

impl Record {
    pub fn new(fields: HashMap<String, String>) -> Self {
        Self { fields }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Like [`Record::field`], but an absent or empty field is `NotFound`.
    pub fn require_field(&self, name: &str, kind: RecordKind, id: &str) -> Result<&str> {
        self.field(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::not_found(format!("{kind} {name}"), id))
    }
}

/// Read access to the live registry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a record, `None` if absent.
    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Record>>;

    /// List every key starting with `prefix`. Order is unspecified.
    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Fetch a record that must exist.
    async fn require(&self, kind: RecordKind, id: &str) -> Result<Record> {
        self.get(kind, id)
            .await?
            .ok_or_else(|| Error::not_found(kind.prefix(), id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_field() {
        let record = Record::from_pairs([("owner", "gw1"), ("name", "")]);
        assert_eq!(
            record
                .require_field("owner", RecordKind::Device, "d1")
                .unwrap(),
            "gw1"
        );

        let err = record
            .require_field("name", RecordKind::Device, "d1")
            .unwrap_err();
        assert_eq!(err.to_string(), "device name not found: d1");

        let err = record
            .require_field("missing", RecordKind::Device, "d1")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_require_missing_record() {
        let store = MemoryKeyValueStore::new();
        let err = store.require(RecordKind::Gateway, "gw9").await.unwrap_err();
        assert_eq!(err.to_string(), "gateway not found: gw9");
    }
}
