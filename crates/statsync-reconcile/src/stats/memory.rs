//! In-process statistics tables, for tests and local experiments.

use super::{AssociationInsert, SensorRow, SeriesValue, StatsStore, validate_table_type};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use statsync_core::GroupKind;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// A stored time-series observation.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoint {
    pub table_type: String,
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: SeriesValue,
}

#[derive(Debug, Default)]
struct Tables {
    sensors: Vec<SensorRow>,
    next_id: i32,
    /// `(id_sensor, group id)` pairs.
    label_sensor: Vec<(i32, String)>,
    thing_sensor: Vec<(i32, String)>,
    series: Vec<SeriesPoint>,
}

impl Tables {
    fn associations(&mut self, kind: GroupKind) -> &mut Vec<(i32, String)> {
        match kind {
            GroupKind::Label => &mut self.label_sensor,
            GroupKind::Thing => &mut self.thing_sensor,
        }
    }

    fn internal_ids(&self, sensor_id: &str) -> HashSet<i32> {
        self.sensors
            .iter()
            .filter(|row| row.external_id == sensor_id)
            .map(|row| row.id_sensor)
            .collect()
    }
}

/// Vec-backed [`StatsStore`] that mimics the Postgres statements.
///
/// Every successful write bumps [`MemoryStatsStore::mutations`]. Sensors
/// listed via [`MemoryStatsStore::fail_on_sensor`] make any statement naming
/// them fail with a store error.
#[derive(Debug, Default)]
pub struct MemoryStatsStore {
    tables: Mutex<Tables>,
    failing: Mutex<HashSet<String>>,
    mutations: AtomicU64,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a `sensors` row directly, returning its internal key.
    pub fn seed_sensor(&self, sensor_id: &str, sensor_type: Option<&str>) -> i32 {
        let mut tables = self.tables.lock();
        tables.next_id += 1;
        let id_sensor = tables.next_id;
        tables.sensors.push(SensorRow {
            id_sensor,
            external_id: sensor_id.to_string(),
            sensor_type: sensor_type.map(str::to_string),
            is_number: None,
        });
        id_sensor
    }

    /// Insert an association row directly.
    pub fn seed_association(&self, kind: GroupKind, group_id: &str, sensor_id: &str) {
        let mut tables = self.tables.lock();
        let ids = tables.internal_ids(sensor_id);
        for id in ids {
            tables.associations(kind).push((id, group_id.to_string()));
        }
    }

    pub fn fail_on_sensor(&self, sensor_id: &str) {
        self.failing.lock().insert(sensor_id.to_string());
    }

    pub fn sensors(&self) -> Vec<SensorRow> {
        self.tables.lock().sensors.clone()
    }

    /// External sensor ids associated with a label/thing.
    pub fn group_members(&self, kind: GroupKind, group_id: &str) -> BTreeSet<String> {
        let mut tables = self.tables.lock();
        let ids: HashSet<i32> = tables
            .associations(kind)
            .iter()
            .filter(|(_, group)| group == group_id)
            .map(|(id, _)| *id)
            .collect();
        tables
            .sensors
            .iter()
            .filter(|row| ids.contains(&row.id_sensor))
            .map(|row| row.external_id.clone())
            .collect()
    }

    pub fn association_count(&self, kind: GroupKind) -> usize {
        self.tables.lock().associations(kind).len()
    }

    pub fn series(&self) -> Vec<SeriesPoint> {
        self.tables.lock().series.clone()
    }

    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::Relaxed)
    }

    fn check(&self, sensor_id: &str) -> Result<()> {
        if self.failing.lock().contains(sensor_id) {
            return Err(Error::Postgres(sqlx::Error::Protocol(format!(
                "injected failure for sensor {sensor_id}"
            ))));
        }
        Ok(())
    }

    fn record_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl StatsStore for MemoryStatsStore {
    async fn insert_series(
        &self,
        table_type: &str,
        sensor_id: &str,
        timestamp: DateTime<Utc>,
        value: &SeriesValue,
    ) -> Result<()> {
        validate_table_type(table_type)?;
        self.check(sensor_id)?;
        let mut tables = self.tables.lock();
        if tables.internal_ids(sensor_id).is_empty() {
            // The per-type insert function raises for unknown sensors.
            return Err(Error::Postgres(sqlx::Error::Protocol(format!(
                "unknown sensor {sensor_id}"
            ))));
        }
        tables.series.push(SeriesPoint {
            table_type: table_type.to_string(),
            sensor_id: sensor_id.to_string(),
            timestamp,
            value: value.clone(),
        });
        drop(tables);
        self.record_mutation();
        Ok(())
    }

    async fn delete_group(&self, kind: GroupKind, group_id: &str) -> Result<u64> {
        let mut tables = self.tables.lock();
        let rows = tables.associations(kind);
        let before = rows.len();
        rows.retain(|(_, group)| group != group_id);
        let removed = (before - rows.len()) as u64;
        drop(tables);
        self.record_mutation();
        Ok(removed)
    }

    async fn insert_group_sensor(
        &self,
        kind: GroupKind,
        group_id: &str,
        sensor_id: &str,
    ) -> Result<AssociationInsert> {
        self.check(sensor_id)?;
        let mut tables = self.tables.lock();
        let ids = tables.internal_ids(sensor_id);
        if ids.is_empty() {
            return Ok(AssociationInsert::NoSensorRow);
        }
        let rows = tables.associations(kind);
        if rows
            .iter()
            .any(|(id, group)| ids.contains(id) && group == group_id)
        {
            return Ok(AssociationInsert::AlreadyPresent);
        }
        let id_sensor = ids.into_iter().min().unwrap_or_default();
        rows.push((id_sensor, group_id.to_string()));
        drop(tables);
        self.record_mutation();
        Ok(AssociationInsert::Inserted)
    }

    async fn remove_sensor_from_groups(&self, kind: GroupKind, sensor_id: &str) -> Result<u64> {
        self.check(sensor_id)?;
        let mut tables = self.tables.lock();
        let ids = tables.internal_ids(sensor_id);
        let rows = tables.associations(kind);
        let before = rows.len();
        rows.retain(|(id, _)| !ids.contains(id));
        let removed = (before - rows.len()) as u64;
        drop(tables);
        self.record_mutation();
        Ok(removed)
    }

    async fn stored_group_ids(&self, kind: GroupKind) -> Result<Vec<String>> {
        let mut tables = self.tables.lock();
        let ids: BTreeSet<String> = tables
            .associations(kind)
            .iter()
            .map(|(_, group)| group.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn sensor_rows(&self, sensor_id: &str) -> Result<Vec<SensorRow>> {
        self.check(sensor_id)?;
        Ok(self
            .tables
            .lock()
            .sensors
            .iter()
            .filter(|row| row.external_id == sensor_id)
            .cloned()
            .collect())
    }

    async fn update_sensor_type(&self, id_sensor: i32, sensor_type: &str) -> Result<u64> {
        let mut tables = self.tables.lock();
        let mut updated = 0;
        for row in tables.sensors.iter_mut().filter(|r| r.id_sensor == id_sensor) {
            row.sensor_type = Some(sensor_type.to_string());
            updated += 1;
        }
        drop(tables);
        self.record_mutation();
        Ok(updated)
    }

    async fn create_sensor(
        &self,
        sensor_id: &str,
        is_number: Option<bool>,
        sensor_type: &str,
    ) -> Result<()> {
        self.check(sensor_id)?;
        let mut tables = self.tables.lock();
        tables.next_id += 1;
        let id_sensor = tables.next_id;
        tables.sensors.push(SensorRow {
            id_sensor,
            external_id: sensor_id.to_string(),
            sensor_type: Some(sensor_type.to_string()),
            is_number,
        });
        drop(tables);
        self.record_mutation();
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}
