//! In-process registry, for tests and local experiments.

use super::{KeyValueStore, Record};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use statsync_core::{
    DEVICE_OWNER_FIELD, GATEWAY_SENSORS_FIELD, RecordKind, SENSOR_DEVICE_FIELD, SENSOR_TYPE_FIELD,
};
use std::collections::{HashMap, HashSet};

/// Map-backed [`KeyValueStore`].
///
/// Keys listed via [`MemoryKeyValueStore::fail_on`] return a Redis I/O error
/// when read, which lets tests exercise store-failure paths.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    records: RwLock<HashMap<String, HashMap<String, String>>>,
    failing: RwLock<HashSet<String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<I, K, V>(&self, kind: RecordKind, id: &str, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.records.write().insert(kind.key(id), fields);
    }

    pub fn remove(&self, kind: RecordKind, id: &str) {
        self.records.write().remove(&kind.key(id));
    }

    /// Store a gateway owning `sensors`.
    pub fn insert_gateway(&self, id: &str, sensors: &[&str]) {
        let list = serde_json::to_string(sensors).unwrap_or_default();
        self.insert(RecordKind::Gateway, id, [(GATEWAY_SENSORS_FIELD, list)]);
    }

    /// Store a device owned by gateway `owner`.
    pub fn insert_device(&self, id: &str, owner: &str) {
        self.insert(RecordKind::Device, id, [(DEVICE_OWNER_FIELD, owner)]);
    }

    /// Store a sensor of type `sensor_type` attached to `device`.
    pub fn insert_sensor(&self, id: &str, device: &str, sensor_type: &str) {
        self.insert(
            RecordKind::Sensor,
            id,
            [
                (SENSOR_DEVICE_FIELD, device),
                (SENSOR_TYPE_FIELD, sensor_type),
                ("category", "sensor"),
                ("name", id),
            ],
        );
    }

    /// Make every read of the record fail with a store error.
    pub fn fail_on(&self, kind: RecordKind, id: &str) {
        self.failing.write().insert(kind.key(id));
    }

    fn injected_failure(key: &str) -> Error {
        Error::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "injected failure",
            key.to_string(),
        )))
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Record>> {
        let key = kind.key(id);
        if self.failing.read().contains(&key) {
            return Err(Self::injected_failure(&key));
        }
        Ok(self
            .records
            .read()
            .get(&key)
            .filter(|fields| !fields.is_empty())
            .cloned()
            .map(Record::new))
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .records
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }
}
