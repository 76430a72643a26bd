//! Translation of registry changes into statistics-store mutations.
//!
//! # Architecture
//!
//! ```text
//! change event ──► Reconciler ──► HierarchyResolver ──► KeyValueStore
//!                      │              (gateway/device scopes)
//!                      ▼
//!                  StatsStore (label_sensor, thing_sensor, sensors, insert_value_*)
//! ```
//!
//! Deletions are best-effort: each statement's result is recorded in a
//! [`BestEffort`] report and a failing statement never stops its siblings.
//! Resolution (which sensors a gateway or device covers) is all-or-nothing:
//! if it fails, nothing is mutated and the error is returned.

use crate::hierarchy::HierarchyResolver;
use crate::kv::{KeyValueStore, Record};
use crate::outcome::{BestEffort, Outcome};
use crate::stats::{AssociationInsert, SensorRow, SeriesValue, StatsStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::join_all;
use statsync_core::metrics::{increment, increment_labeled, set_gauge};
use statsync_core::{GroupKind, RecordKind, SENSOR_DEVICE_FIELD, SENSOR_TYPE_FIELD};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default number of sensors reconciled at once during a full resync.
pub const DEFAULT_RESYNC_CONCURRENCY: usize = 32;

/// Sensor attributes read from the live registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSensor {
    pub id: String,
    pub sensor_type: String,
    pub device_id: Option<String>,
}

impl LiveSensor {
    /// Extract the attributes the statistics store mirrors.
    ///
    /// A record without a `type` is `NotFound`.
    pub fn from_record(id: &str, record: &Record) -> Result<Self> {
        let sensor_type = record.require_field(SENSOR_TYPE_FIELD, RecordKind::Sensor, id)?;
        Ok(Self {
            id: id.to_string(),
            sensor_type: sensor_type.to_string(),
            device_id: record.field(SENSOR_DEVICE_FIELD).map(str::to_string),
        })
    }
}

/// What [`Reconciler::reconcile_sensor`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorAction {
    Created,
    Updated,
    Unchanged,
}

impl SensorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Result of a gateway or device deletion cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Sensors the scope resolved to.
    pub sensors: usize,
    /// One entry per association statement issued.
    pub results: BestEffort,
}

/// Totals from a full resynchronization sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    pub scanned: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl ResyncReport {
    fn record(&mut self, result: &Result<SensorAction>) {
        match result {
            Ok(SensorAction::Created) => self.created += 1,
            Ok(SensorAction::Updated) => self.updated += 1,
            Ok(SensorAction::Unchanged) => self.unchanged += 1,
            Err(_) => self.failed += 1,
        }
    }
}

impl fmt::Display for ResyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} scanned: {} created, {} updated, {} unchanged, {} failed in {:.2}s",
            self.scanned,
            self.created,
            self.updated,
            self.unchanged,
            self.failed,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Applies registry changes to the statistics store.
///
/// Cheap to clone; clones share both stores.
#[derive(Clone)]
pub struct Reconciler {
    kv: Arc<dyn KeyValueStore>,
    stats: Arc<dyn StatsStore>,
    resolver: HierarchyResolver,
    resync_concurrency: usize,
}

impl Reconciler {
    pub fn new(kv: Arc<dyn KeyValueStore>, stats: Arc<dyn StatsStore>) -> Self {
        Self {
            resolver: HierarchyResolver::new(Arc::clone(&kv)),
            kv,
            stats,
            resync_concurrency: DEFAULT_RESYNC_CONCURRENCY,
        }
    }

    /// Limit how many sensors a full resync reconciles at once (minimum 1).
    pub fn with_resync_concurrency(mut self, concurrency: usize) -> Self {
        self.resync_concurrency = concurrency.max(1);
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Deletions
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove a sensor from every label and thing.
    ///
    /// Never fails: each removal's result lands in the returned report.
    pub async fn on_sensor_deleted(&self, sensor_id: &str) -> BestEffort {
        let (labels, things) = tokio::join!(
            self.stats.remove_sensor_from_groups(GroupKind::Label, sensor_id),
            self.stats.remove_sensor_from_groups(GroupKind::Thing, sensor_id),
        );

        let mut report = BestEffort::new();
        for (kind, operation, result) in [
            (GroupKind::Label, "remove_from_labels", labels),
            (GroupKind::Thing, "remove_from_things", things),
        ] {
            if let Ok(rows) = &result {
                increment_labeled("association_rows_deleted_total", "kind", kind.as_str(), *rows);
            }
            let outcome = Outcome::from_rows(result);
            metrics::counter!(
                "association_ops_total",
                "kind" => kind.as_str(),
                "outcome" => outcome.label()
            )
            .increment(1);
            report.push(operation, sensor_id, outcome);
        }

        tracing::debug!(sensor_id, %report, "sensor associations removed");
        report
    }

    /// Remove every sensor a gateway lists from all labels and things.
    ///
    /// If the gateway cannot be resolved nothing is deleted and the error is
    /// returned. Per-sensor failures are reported, not returned.
    pub async fn on_gateway_deleted(&self, gateway_id: &str) -> Result<CascadeReport> {
        increment_labeled("cascade_runs_total", "scope", "gateway", 1);
        let sensors = self
            .resolver
            .sensors_of_gateway(gateway_id)
            .await
            .inspect_err(|e| {
                increment("cascade_resolution_errors_total", 1);
                tracing::warn!(gateway_id, error = %e, "gateway cascade aborted");
            })?;

        let report = self.cascade(&sensors).await;
        tracing::info!(
            gateway_id,
            sensors = report.sensors,
            results = %report.results,
            "gateway deletion cascaded"
        );
        Ok(report)
    }

    /// Like [`Reconciler::on_gateway_deleted`], scoped to one device.
    pub async fn on_device_deleted(&self, device_id: &str) -> Result<CascadeReport> {
        increment_labeled("cascade_runs_total", "scope", "device", 1);
        let sensors = self
            .resolver
            .sensors_of_device(device_id)
            .await
            .inspect_err(|e| {
                increment("cascade_resolution_errors_total", 1);
                tracing::warn!(device_id, error = %e, "device cascade aborted");
            })?;

        let report = self.cascade(&sensors).await;
        tracing::info!(
            device_id,
            sensors = report.sensors,
            results = %report.results,
            "device deletion cascaded"
        );
        Ok(report)
    }

    async fn cascade(&self, sensors: &BTreeSet<String>) -> CascadeReport {
        let per_sensor = join_all(sensors.iter().map(|s| self.on_sensor_deleted(s))).await;

        let mut results = BestEffort::new();
        for report in per_sensor {
            results.merge(report);
        }
        results.log("cascade");
        CascadeReport {
            sensors: sensors.len(),
            results,
        }
    }

    pub async fn on_label_deleted(&self, label_id: &str) -> Result<u64> {
        self.delete_group(GroupKind::Label, label_id).await
    }

    pub async fn on_thing_deleted(&self, thing_id: &str) -> Result<u64> {
        self.delete_group(GroupKind::Thing, thing_id).await
    }

    async fn delete_group(&self, kind: GroupKind, group_id: &str) -> Result<u64> {
        require_group_id(kind, group_id)?;
        let rows = self.stats.delete_group(kind, group_id).await?;
        increment_labeled("association_rows_deleted_total", "kind", kind.as_str(), rows);
        tracing::debug!(kind = %kind, group_id, rows, "group associations deleted");
        Ok(rows)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Label / thing membership
    // ─────────────────────────────────────────────────────────────────────────

    /// Associate each sensor with a label or thing.
    ///
    /// Repeated ids are inserted once and existing associations are kept, so
    /// a redelivered event changes nothing. A sensor without a `sensors` row
    /// is skipped. Other store errors are reported as failures; they do not
    /// stop the remaining inserts.
    pub async fn on_label_or_thing_upserted(
        &self,
        kind: GroupKind,
        group_id: &str,
        sensors: &[String],
    ) -> Result<BestEffort> {
        require_group_id(kind, group_id)?;

        let sensors: BTreeSet<&str> = sensors.iter().map(String::as_str).collect();
        let inserts = sensors
            .iter()
            .map(|sensor_id| self.stats.insert_group_sensor(kind, group_id, sensor_id));
        let results = join_all(inserts).await;

        let mut report = BestEffort::new();
        for (sensor_id, result) in sensors.iter().zip(results) {
            let outcome = match result {
                Ok(AssociationInsert::Inserted) => Outcome::applied(1),
                Ok(AssociationInsert::AlreadyPresent) => Outcome::applied(0),
                Ok(AssociationInsert::NoSensorRow) => Outcome::skipped("sensor has no stored row"),
                Err(e) => Outcome::failed(&e),
            };
            metrics::counter!(
                "association_ops_total",
                "kind" => kind.as_str(),
                "outcome" => outcome.label()
            )
            .increment(1);
            report.push("insert_association", *sensor_id, outcome);
        }

        report.log(&format!("{kind} {group_id} upsert"));
        Ok(report)
    }

    /// Replace a group's members with the flattened sensor set of
    /// `devices`, `gateways` and `sensors`.
    ///
    /// Resolution happens first; if it fails the stored associations are
    /// left untouched.
    pub async fn sync_group_members(
        &self,
        kind: GroupKind,
        group_id: &str,
        devices: &[String],
        gateways: &[String],
        sensors: &[String],
    ) -> Result<BestEffort> {
        require_group_id(kind, group_id)?;
        let members = self.resolver.flatten(devices, gateways, sensors).await?;
        let members: Vec<String> = members.into_iter().collect();

        let removed = self.delete_group(kind, group_id).await?;
        let report = self
            .on_label_or_thing_upserted(kind, group_id, &members)
            .await?;

        tracing::info!(
            kind = %kind,
            group_id,
            removed,
            members = members.len(),
            results = %report,
            "group members synchronized"
        );
        Ok(report)
    }

    /// Label (or thing) ids that currently have stored associations.
    pub async fn stored_group_ids(&self, kind: GroupKind) -> Result<Vec<String>> {
        self.stats.stored_group_ids(kind).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sensor rows
    // ─────────────────────────────────────────────────────────────────────────

    /// Bring a sensor's stored row in line with its live attributes.
    ///
    /// More than one stored row is data corruption and fails without
    /// mutating anything.
    pub async fn reconcile_sensor(
        &self,
        live: &LiveSensor,
        stored: &[SensorRow],
    ) -> Result<SensorAction> {
        match stored {
            [] => {
                self.stats
                    .create_sensor(&live.id, None, &live.sensor_type)
                    .await?;
                tracing::debug!(
                    sensor_id = %live.id,
                    sensor_type = %live.sensor_type,
                    "sensor row created"
                );
                Ok(SensorAction::Created)
            }
            [row] if row.sensor_type.as_deref() == Some(live.sensor_type.as_str()) => {
                Ok(SensorAction::Unchanged)
            }
            [row] => {
                self.stats
                    .update_sensor_type(row.id_sensor, &live.sensor_type)
                    .await?;
                tracing::debug!(
                    sensor_id = %live.id,
                    from = ?row.sensor_type,
                    to = %live.sensor_type,
                    "sensor type updated"
                );
                Ok(SensorAction::Updated)
            }
            rows => {
                tracing::error!(
                    sensor_id = %live.id,
                    rows = rows.len(),
                    "multiple stored rows for one sensor"
                );
                Err(Error::AmbiguousState {
                    sensor_id: live.id.clone(),
                    rows: rows.len(),
                })
            }
        }
    }

    /// Read one sensor from both stores and reconcile it.
    pub async fn resync_sensor(&self, sensor_id: &str) -> Result<SensorAction> {
        let record = self.kv.require(RecordKind::Sensor, sensor_id).await?;
        let live = LiveSensor::from_record(sensor_id, &record)?;
        let stored = self.stats.sensor_rows(sensor_id).await?;
        self.reconcile_sensor(&live, &stored).await
    }

    /// Reconcile every sensor in the registry.
    ///
    /// Only a failed key scan is returned as an error; individual sensor
    /// failures are logged and counted.
    pub async fn full_resync(&self) -> Result<ResyncReport> {
        let started = Instant::now();
        increment("resync_runs_total", 1);
        set_gauge("resync_in_progress", 1.0);

        let keys = match self.kv.scan_keys(&RecordKind::Sensor.key_prefix()).await {
            Ok(keys) => keys,
            Err(e) => {
                set_gauge("resync_in_progress", 0.0);
                return Err(e);
            }
        };
        let sensor_ids: Vec<String> = keys
            .iter()
            .filter_map(|key| RecordKind::Sensor.id_from_key(key))
            .map(str::to_string)
            .collect();

        tracing::info!(
            sensors = sensor_ids.len(),
            concurrency = self.resync_concurrency,
            "starting full resync"
        );

        let mut report = ResyncReport {
            scanned: sensor_ids.len(),
            ..Default::default()
        };
        let mut results = futures::stream::iter(sensor_ids)
            .map(|sensor_id| async move {
                let result = self.resync_sensor(&sensor_id).await;
                (sensor_id, result)
            })
            .buffer_unordered(self.resync_concurrency);

        while let Some((sensor_id, result)) = results.next().await {
            match &result {
                Ok(action) => {
                    increment_labeled("resync_sensors_total", "action", action.as_str(), 1)
                }
                Err(e) => {
                    increment_labeled("resync_sensors_total", "action", "failed", 1);
                    tracing::warn!(sensor_id, error = %e, "sensor resync failed");
                }
            }
            report.record(&result);
        }

        report.elapsed = started.elapsed();
        set_gauge("resync_in_progress", 0.0);
        set_gauge("resync_last_run_unix", Utc::now().timestamp() as f64);
        metrics::histogram!("resync_duration_seconds").record(report.elapsed.as_secs_f64());
        tracing::info!("full resync complete: {report}");
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Time series
    // ─────────────────────────────────────────────────────────────────────────

    /// Store one observation in the series table selected by `sensor_type`.
    pub async fn insert_time_series_value(
        &self,
        sensor_type: &str,
        sensor_id: &str,
        timestamp: DateTime<Utc>,
        value: impl Into<SeriesValue>,
    ) -> Result<()> {
        let value = value.into();
        match self
            .stats
            .insert_series(sensor_type, sensor_id, timestamp, &value)
            .await
        {
            Ok(()) => {
                increment("series_values_inserted_total", 1);
                Ok(())
            }
            Err(e) => {
                increment("series_insert_errors_total", 1);
                tracing::warn!(sensor_id, sensor_type, error = %e, "time-series insert failed");
                Err(e)
            }
        }
    }
}

fn require_group_id(kind: GroupKind, group_id: &str) -> Result<()> {
    if group_id.is_empty() {
        return Err(Error::InvalidIdentifier(format!("empty {kind} id")));
    }
    Ok(())
}
