//! Postgres statistics store.
//!
//! Expected schema (owned by the statistics service, not created here):
//!
//! ```sql
//! sensors      (id_sensor serial PRIMARY KEY, mongo_id_sensor text, is_number boolean, type text)
//! label_sensor (id_sensor integer NOT NULL REFERENCES sensors, mongo_id_label text)
//! thing_sensor (id_sensor integer NOT NULL REFERENCES sensors, mongo_id_thing text)
//! -- one function per sensor type
//! insert_value_<type>(mongo_id_sensor text, ts timestamp, value ...)
//! ```
//!
//! Association inserts select the internal key from `sensors` inside the
//! statement and skip pairs that already exist. When nothing is inserted a
//! follow-up lookup tells [`AssociationInsert::AlreadyPresent`] apart from
//! [`AssociationInsert::NoSensorRow`].

use super::{AssociationInsert, SensorRow, SeriesValue, StatsStore, validate_table_type};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use statsync_core::GroupKind;
use std::time::Duration;

/// Configuration for the Postgres store.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Connection URL (may carry credentials, never logged).
    pub url: String,

    /// Maximum pooled connections.
    pub max_connections: u32,

    /// How long to wait for a pooled connection before failing.
    pub acquire_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/statistics".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Table and group-id column of the association table for `kind`.
fn association_table(kind: GroupKind) -> (&'static str, &'static str) {
    match kind {
        GroupKind::Label => ("label_sensor", "mongo_id_label"),
        GroupKind::Thing => ("thing_sensor", "mongo_id_thing"),
    }
}

/// Statistics store over a sqlx Postgres pool.
#[derive(Clone)]
pub struct PostgresStatsStore {
    pool: PgPool,
}

impl PostgresStatsStore {
    /// Open a connection pool.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "Postgres statistics pool initialized"
        );

        Ok(Self { pool })
    }
}

#[async_trait]
impl StatsStore for PostgresStatsStore {
    async fn insert_series(
        &self,
        table_type: &str,
        sensor_id: &str,
        timestamp: DateTime<Utc>,
        value: &SeriesValue,
    ) -> Result<()> {
        validate_table_type(table_type)?;
        let sql = format!(
            r#"SELECT * FROM "insert_value_{table_type}"($1, to_timestamp($2)::timestamp, $3)"#
        );
        let seconds = timestamp.timestamp_millis() as f64 / 1000.0;

        let query = sqlx::query(&sql).bind(sensor_id).bind(seconds);
        let query = match value {
            SeriesValue::Number(v) => query.bind(*v),
            SeriesValue::Bool(v) => query.bind(*v),
            SeriesValue::Text(v) => query.bind(v.as_str()),
        };
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_group(&self, kind: GroupKind, group_id: &str) -> Result<u64> {
        let (table, column) = association_table(kind);
        let sql = format!("DELETE FROM {table} WHERE {column} = $1");
        let result = sqlx::query(&sql).bind(group_id).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_group_sensor(
        &self,
        kind: GroupKind,
        group_id: &str,
        sensor_id: &str,
    ) -> Result<AssociationInsert> {
        let (table, column) = association_table(kind);
        let sql = format!(
            "INSERT INTO {table} (id_sensor, {column}) \
             SELECT id_sensor, $2 FROM sensors WHERE mongo_id_sensor = $1 \
             AND NOT EXISTS \
             (SELECT 1 FROM {table} WHERE id_sensor = sensors.id_sensor AND {column} = $2) \
             ORDER BY id_sensor LIMIT 1"
        );
        let result = sqlx::query(&sql)
            .bind(sensor_id)
            .bind(group_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(AssociationInsert::Inserted);
        }

        let has_row: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM sensors WHERE mongo_id_sensor = $1)")
                .bind(sensor_id)
                .fetch_one(&self.pool)
                .await?;
        if has_row {
            Ok(AssociationInsert::AlreadyPresent)
        } else {
            Ok(AssociationInsert::NoSensorRow)
        }
    }

    async fn remove_sensor_from_groups(&self, kind: GroupKind, sensor_id: &str) -> Result<u64> {
        let (table, _) = association_table(kind);
        let sql = format!(
            "DELETE FROM {table} WHERE id_sensor IN \
             (SELECT id_sensor FROM sensors WHERE mongo_id_sensor = $1)"
        );
        let result = sqlx::query(&sql).bind(sensor_id).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn stored_group_ids(&self, kind: GroupKind) -> Result<Vec<String>> {
        let (table, column) = association_table(kind);
        let sql = format!("SELECT DISTINCT {column}::text FROM {table} WHERE {column} IS NOT NULL");
        let ids: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        Ok(ids)
    }

    async fn sensor_rows(&self, sensor_id: &str) -> Result<Vec<SensorRow>> {
        let rows = sqlx::query_as::<_, SensorRow>(
            "SELECT id_sensor, mongo_id_sensor, type, is_number \
             FROM sensors WHERE mongo_id_sensor = $1",
        )
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_sensor_type(&self, id_sensor: i32, sensor_type: &str) -> Result<u64> {
        let result = sqlx::query("UPDATE sensors SET type = $2 WHERE id_sensor = $1")
            .bind(id_sensor)
            .bind(sensor_type)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn create_sensor(
        &self,
        sensor_id: &str,
        is_number: Option<bool>,
        sensor_type: &str,
    ) -> Result<()> {
        sqlx::query("INSERT INTO sensors (mongo_id_sensor, is_number, type) VALUES ($1, $2, $3)")
            .bind(sensor_id)
            .bind(is_number)
            .bind(sensor_type)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let result: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(result == 1)
    }
}
