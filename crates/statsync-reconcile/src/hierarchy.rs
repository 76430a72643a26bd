//! Gateway → device → sensor resolution.
//!
//! The registry does not index sensors by device. A device's sensors are
//! recovered from its owning gateway's sensor list, keeping the sensors
//! whose `deviceId` points back at the device.

use crate::kv::KeyValueStore;
use crate::{Error, Result};
use futures::future::try_join_all;
use statsync_core::{DEVICE_OWNER_FIELD, GATEWAY_SENSORS_FIELD, RecordKind, SENSOR_DEVICE_FIELD};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Resolves hierarchy scopes into flat sensor id sets.
#[derive(Clone)]
pub struct HierarchyResolver {
    kv: Arc<dyn KeyValueStore>,
}

impl HierarchyResolver {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Sensors listed on a gateway record.
    pub async fn sensors_of_gateway(&self, gateway_id: &str) -> Result<BTreeSet<String>> {
        let record = self.kv.require(RecordKind::Gateway, gateway_id).await?;
        let raw = record
            .field(GATEWAY_SENSORS_FIELD)
            .ok_or_else(|| Error::not_found("gateway sensors", gateway_id))?;

        let sensors: Vec<String> = serde_json::from_str(raw).map_err(|e| {
            Error::Decode(format!("gateway {gateway_id} sensor list: {e}"))
        })?;
        Ok(sensors.into_iter().collect())
    }

    /// Sensors of the owning gateway whose `deviceId` is `device_id`.
    ///
    /// Fails if any candidate sensor record cannot be read, including when
    /// the gateway lists a sensor the registry no longer holds.
    pub async fn sensors_of_device(&self, device_id: &str) -> Result<BTreeSet<String>> {
        let device = self.kv.require(RecordKind::Device, device_id).await?;
        let owner = device.require_field(DEVICE_OWNER_FIELD, RecordKind::Device, device_id)?;
        let candidates = self.sensors_of_gateway(owner).await?;

        let lookups = candidates.into_iter().map(|sensor_id| async move {
            let sensor = self.kv.require(RecordKind::Sensor, &sensor_id).await?;
            let belongs = sensor.field(SENSOR_DEVICE_FIELD) == Some(device_id);
            Ok::<_, Error>(belongs.then_some(sensor_id))
        });

        let sensors: BTreeSet<String> = try_join_all(lookups)
            .await?
            .into_iter()
            .flatten()
            .collect();

        tracing::debug!(
            device_id,
            gateway_id = owner,
            count = sensors.len(),
            "resolved device sensors"
        );
        Ok(sensors)
    }

    /// Union of every listed device's and gateway's sensors plus `sensors`.
    ///
    /// The first resolution error aborts the whole operation.
    pub async fn flatten(
        &self,
        devices: &[String],
        gateways: &[String],
        sensors: &[String],
    ) -> Result<BTreeSet<String>> {
        let from_devices = try_join_all(devices.iter().map(|d| self.sensors_of_device(d)));
        let from_gateways = try_join_all(gateways.iter().map(|g| self.sensors_of_gateway(g)));
        let (from_devices, from_gateways) = futures::try_join!(from_devices, from_gateways)?;

        let mut all: BTreeSet<String> = sensors.iter().cloned().collect();
        for set in from_devices.into_iter().chain(from_gateways) {
            all.extend(set);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKeyValueStore;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    /// gw1 → {A, B}; d1 owns A, d2 owns B. gw2 → {C}, d3 owns C.
    fn registry() -> Arc<MemoryKeyValueStore> {
        let kv = Arc::new(MemoryKeyValueStore::new());
        kv.insert_gateway("gw1", &["A", "B"]);
        kv.insert_gateway("gw2", &["C"]);
        kv.insert_device("d1", "gw1");
        kv.insert_device("d2", "gw1");
        kv.insert_device("d3", "gw2");
        kv.insert_sensor("A", "d1", "number");
        kv.insert_sensor("B", "d2", "boolean");
        kv.insert_sensor("C", "d3", "number");
        kv
    }

    fn resolver(kv: Arc<MemoryKeyValueStore>) -> HierarchyResolver {
        HierarchyResolver::new(kv)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Gateways
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_sensors_of_gateway() {
        let r = resolver(registry());
        assert_eq!(r.sensors_of_gateway("gw1").await.unwrap(), set(&["A", "B"]));
    }

    #[tokio::test]
    async fn test_sensors_of_gateway_empty_list() {
        let kv = registry();
        kv.insert_gateway("gw_empty", &[]);
        let r = resolver(kv);
        assert!(r.sensors_of_gateway("gw_empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sensors_of_gateway_not_found() {
        let r = resolver(registry());
        let err = r.sensors_of_gateway("gw9").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_sensors_of_gateway_missing_field() {
        let kv = registry();
        kv.insert(RecordKind::Gateway, "gw3", [("name", "no sensors")]);
        let err = resolver(kv).sensors_of_gateway("gw3").await.unwrap_err();
        assert_eq!(err.to_string(), "gateway sensors not found: gw3");
    }

    #[tokio::test]
    async fn test_sensors_of_gateway_bad_json() {
        let kv = registry();
        kv.insert(RecordKind::Gateway, "gw3", [(GATEWAY_SENSORS_FIELD, "A,B")]);
        let err = resolver(kv).sensors_of_gateway("gw3").await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_sensors_of_device_filters_by_device() {
        let r = resolver(registry());
        assert_eq!(r.sensors_of_device("d1").await.unwrap(), set(&["A"]));
        assert_eq!(r.sensors_of_device("d2").await.unwrap(), set(&["B"]));
    }

    #[tokio::test]
    async fn test_sensors_of_device_without_sensors() {
        let kv = registry();
        kv.insert_device("d4", "gw1");
        assert!(resolver(kv).sensors_of_device("d4").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sensors_of_device_missing_owner() {
        let kv = registry();
        kv.insert(RecordKind::Device, "d5", [("name", "orphan")]);
        let err = resolver(kv).sensors_of_device("d5").await.unwrap_err();
        assert_eq!(err.to_string(), "device owner not found: d5");
    }

    #[tokio::test]
    async fn test_sensors_of_device_absent_sensor_aborts() {
        let kv = registry();
        kv.remove(RecordKind::Sensor, "B");
        let err = resolver(kv).sensors_of_device("d1").await.unwrap_err();
        assert_eq!(err.to_string(), "sensor not found: B");
    }

    #[tokio::test]
    async fn test_sensors_of_device_store_failure_aborts() {
        let kv = registry();
        kv.fail_on(RecordKind::Sensor, "A");
        let err = resolver(kv).sensors_of_device("d2").await.unwrap_err();
        assert!(err.is_store_error());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Flatten
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_flatten_union() {
        let r = resolver(registry());
        let all = r
            .flatten(&ids(&["d1"]), &ids(&["gw2"]), &ids(&["Z", "A"]))
            .await
            .unwrap();
        assert_eq!(all, set(&["A", "C", "Z"]));
    }

    #[tokio::test]
    async fn test_flatten_order_independent() {
        let r = resolver(registry());
        let forward = r
            .flatten(&ids(&["d1", "d2"]), &ids(&["gw1", "gw2"]), &ids(&["X", "Y"]))
            .await
            .unwrap();
        let reversed = r
            .flatten(&ids(&["d2", "d1"]), &ids(&["gw2", "gw1"]), &ids(&["Y", "X"]))
            .await
            .unwrap();
        assert_eq!(forward, reversed);
        assert_eq!(forward, set(&["A", "B", "C", "X", "Y"]));
    }

    #[tokio::test]
    async fn test_flatten_single_device_matches_device_scope() {
        let r = resolver(registry());
        for device in ["d1", "d2", "d3"] {
            let flat = r.flatten(&ids(&[device]), &[], &[]).await.unwrap();
            assert_eq!(flat, r.sensors_of_device(device).await.unwrap());
        }
        assert_eq!(r.flatten(&ids(&["d1"]), &[], &[]).await.unwrap(), set(&["A"]));
    }

    #[tokio::test]
    async fn test_flatten_empty() {
        let r = resolver(registry());
        assert!(r.flatten(&[], &[], &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_flatten_first_failure_aborts() {
        let r = resolver(registry());
        let err = r
            .flatten(&ids(&["d1"]), &ids(&["gw1", "gw_missing"]), &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "gateway not found: gw_missing");
    }
}
