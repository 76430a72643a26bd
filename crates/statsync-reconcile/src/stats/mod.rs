//! Relational statistics store access.
//!
//! The statistics database mirrors every sensor that has time-series data as
//! a row of `sensors`, and keeps label/thing membership in the association
//! tables `label_sensor` and `thing_sensor`. The reconciler only ever issues
//! a handful of literal statements against it, collected in [`StatsStore`].
//!
//! - [`PostgresStatsStore`] - production adapter (sqlx connection pool)
//! - [`MemoryStatsStore`] - in-process tables, used by tests

mod memory;
mod postgres;

pub use self::memory::MemoryStatsStore;
pub use self::postgres::{PostgresConfig, PostgresStatsStore};

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use statsync_core::GroupKind;

/// A row of the `sensors` table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SensorRow {
    /// Internal numeric key, referenced by the association tables.
    pub id_sensor: i32,
    /// External (registry) sensor identifier.
    #[sqlx(rename = "mongo_id_sensor")]
    pub external_id: String,
    #[sqlx(rename = "type")]
    pub sensor_type: Option<String>,
    pub is_number: Option<bool>,
}

/// A single time-series observation value.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl From<f64> for SeriesValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<bool> for SeriesValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for SeriesValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SeriesValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Result of inserting one sensor into a label/thing association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationInsert {
    Inserted,
    /// The association row already exists.
    AlreadyPresent,
    /// The sensor has no `sensors` row (it never produced time-series data).
    NoSensorRow,
}

/// Statements the reconciler issues against the statistics database.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Insert an observation via the `insert_value_<table_type>` function.
    async fn insert_series(
        &self,
        table_type: &str,
        sensor_id: &str,
        timestamp: DateTime<Utc>,
        value: &SeriesValue,
    ) -> Result<()>;

    /// Delete every association row of a label/thing. Returns rows removed.
    async fn delete_group(&self, kind: GroupKind, group_id: &str) -> Result<u64>;

    /// Associate a sensor with a label/thing. Existing rows are left alone.
    async fn insert_group_sensor(
        &self,
        kind: GroupKind,
        group_id: &str,
        sensor_id: &str,
    ) -> Result<AssociationInsert>;

    /// Remove a sensor from every label (or thing). Returns rows removed.
    async fn remove_sensor_from_groups(&self, kind: GroupKind, sensor_id: &str) -> Result<u64>;

    /// Distinct label (or thing) ids that currently have associations.
    async fn stored_group_ids(&self, kind: GroupKind) -> Result<Vec<String>>;

    /// Rows mirroring the external sensor id. Normally zero or one.
    async fn sensor_rows(&self, sensor_id: &str) -> Result<Vec<SensorRow>>;

    /// Overwrite the stored type of a sensor row. Returns rows updated.
    async fn update_sensor_type(&self, id_sensor: i32, sensor_type: &str) -> Result<u64>;

    /// Create the row mirroring a sensor.
    async fn create_sensor(
        &self,
        sensor_id: &str,
        is_number: Option<bool>,
        sensor_type: &str,
    ) -> Result<()>;

    /// Check that the store is reachable.
    async fn health_check(&self) -> Result<bool>;
}

/// Check that a sensor type can name a time-series function.
///
/// The type is spliced into a quoted identifier, so only ASCII
/// alphanumerics and `_` are accepted.
pub fn validate_table_type(table_type: &str) -> Result<()> {
    if !table_type.is_empty()
        && table_type.len() <= 48
        && table_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(format!(
            "sensor type {table_type:?} cannot select a time-series table"
        )))
    }
}
