//! Change-feed event listener.
//!
//! Consumes decoded change events from a channel and dispatches the ones
//! that require reconciliation. Actions are fire-and-forget: each one is
//! spawned onto a task set and the listener immediately returns to the
//! channel. On shutdown the listener stops receiving and waits for every
//! in-flight action.
//!
//! | entity  | operation | action                           |
//! |---------|-----------|----------------------------------|
//! | gateway | delete    | [`Reconciler::on_gateway_deleted`] |
//! | sensor  | delete    | [`Reconciler::on_sensor_deleted`]  |
//! | other   | any       | ignored                          |

use crate::reconcile::Reconciler;
use statsync_core::metrics::{increment, increment_labeled, set_gauge};
use statsync_core::{ChangeEvent, EntityKind, Operation};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Item carried on the listener's channel: a decoded event, or the reason a
/// message could not be decoded.
pub type FeedItem = statsync_core::Result<ChangeEvent>;

/// How long `run` waits on the channel before re-checking for shutdown.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Reconciliation action selected for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    GatewayDeleted(String),
    SensorDeleted(String),
    Ignored,
}

impl Dispatch {
    /// Metric label for the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GatewayDeleted(_) => "gateway_deleted",
            Self::SensorDeleted(_) => "sensor_deleted",
            Self::Ignored => "ignored",
        }
    }
}

/// Select the action for an event.
pub fn route(event: &ChangeEvent) -> Dispatch {
    match (&event.entity_kind, event.operation) {
        (EntityKind::Gateway, Operation::Delete) => {
            Dispatch::GatewayDeleted(event.entity_id.clone())
        }
        (EntityKind::Sensor, Operation::Delete) => Dispatch::SensorDeleted(event.entity_id.clone()),
        _ => Dispatch::Ignored,
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dispatched: AtomicU64,
    ignored: AtomicU64,
    malformed: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of listener counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerStats {
    /// Channel items received, including malformed ones.
    pub received: u64,
    /// Events handed to the reconciler.
    pub dispatched: u64,
    /// Events with no action.
    pub ignored: u64,
    /// Messages that could not be decoded.
    pub malformed: u64,
    /// Dispatched actions that returned an error or had failed statements.
    pub failed: u64,
    pub is_running: bool,
}

/// Long-lived service that turns change events into reconciler calls.
pub struct EventListener {
    reconciler: Reconciler,
    running: AtomicBool,
    shutdown: AtomicBool,
    poll_interval: Duration,
    counters: Counters,
}

impl EventListener {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler,
            running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            poll_interval: DEFAULT_POLL_INTERVAL,
            counters: Counters::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Receive and dispatch events until shutdown or until every sender is
    /// dropped, then wait for in-flight actions.
    pub async fn run(&self, mut receiver: mpsc::Receiver<FeedItem>) -> ListenerStats {
        self.running.store(true, Ordering::SeqCst);
        set_gauge("listener_running", 1.0);
        tracing::info!("event listener started");

        let mut tasks: JoinSet<bool> = JoinSet::new();

        while !self.shutdown.load(Ordering::SeqCst) {
            while let Some(joined) = tasks.try_join_next() {
                self.reap(joined);
            }
            set_gauge("listener_inflight_actions", tasks.len() as f64);

            // Use timeout to periodically check the shutdown flag
            match tokio::time::timeout(self.poll_interval, receiver.recv()).await {
                Ok(Some(item)) => self.handle(item, &mut tasks),
                Ok(None) => {
                    tracing::info!("change channel closed, stopping listener");
                    break;
                }
                Err(_) => {
                    // Timeout - check shutdown flag and continue
                }
            }
        }

        if !tasks.is_empty() {
            tracing::info!(inflight = tasks.len(), "waiting for in-flight actions");
        }
        while let Some(joined) = tasks.join_next().await {
            self.reap(joined);
        }

        self.running.store(false, Ordering::SeqCst);
        set_gauge("listener_inflight_actions", 0.0);
        set_gauge("listener_running", 0.0);

        let stats = self.stats();
        tracing::info!(
            received = stats.received,
            dispatched = stats.dispatched,
            ignored = stats.ignored,
            malformed = stats.malformed,
            failed = stats.failed,
            "event listener stopped"
        );
        stats
    }

    /// Ask `run` to stop accepting events. In-flight actions still finish.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ListenerStats {
        let c = &self.counters;
        ListenerStats {
            received: c.received.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            is_running: self.is_running(),
        }
    }

    fn handle(&self, item: FeedItem, tasks: &mut JoinSet<bool>) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        increment("listener_events_received_total", 1);

        let event = match item {
            Ok(event) => event,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                increment("listener_events_malformed_total", 1);
                tracing::warn!(error = %e, "dropping malformed change message");
                return;
            }
        };

        let dispatch = route(&event);
        if dispatch == Dispatch::Ignored {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            increment("listener_events_ignored_total", 1);
            tracing::trace!(
                entity = %event.entity_kind,
                id = %event.entity_id,
                operation = event.operation.as_str(),
                "ignoring change event"
            );
            return;
        }

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        increment_labeled("listener_events_dispatched_total", "action", dispatch.as_str(), 1);
        tracing::debug!(action = dispatch.as_str(), id = %event.entity_id, "dispatching");

        let reconciler = self.reconciler.clone();
        tasks.spawn(async move { execute(&reconciler, dispatch).await });
        set_gauge("listener_inflight_actions", tasks.len() as f64);
    }

    fn reap(&self, joined: std::result::Result<bool, tokio::task::JoinError>) {
        match joined {
            Ok(true) => {}
            Ok(false) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "reconciler action panicked");
            }
        }
    }
}

/// Run one action. Returns whether it applied cleanly; failures are
/// logged here and only counted by the listener.
async fn execute(reconciler: &Reconciler, dispatch: Dispatch) -> bool {
    match dispatch {
        Dispatch::GatewayDeleted(gateway_id) => {
            match reconciler.on_gateway_deleted(&gateway_id).await {
                Ok(report) => report.results.is_clean(),
                Err(e) => {
                    tracing::error!(gateway_id, error = %e, "gateway deletion not applied");
                    false
                }
            }
        }
        Dispatch::SensorDeleted(sensor_id) => {
            let report = reconciler.on_sensor_deleted(&sensor_id).await;
            report.log(&format!("sensor {sensor_id} deletion"));
            report.is_clean()
        }
        Dispatch::Ignored => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKeyValueStore;
    use crate::stats::{AssociationInsert, MemoryStatsStore, SensorRow, SeriesValue, StatsStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use statsync_core::GroupKind;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn event(kind: EntityKind, id: &str, operation: Operation) -> ChangeEvent {
        ChangeEvent::new(kind, id, operation)
    }

    fn stores() -> (Arc<MemoryKeyValueStore>, Arc<MemoryStatsStore>) {
        let kv = Arc::new(MemoryKeyValueStore::new());
        kv.insert_gateway("gw1", &["A", "B"]);
        kv.insert_sensor("A", "d1", "number");
        kv.insert_sensor("B", "d1", "number");

        let stats = Arc::new(MemoryStatsStore::new());
        for sensor in ["A", "B", "C"] {
            stats.seed_sensor(sensor, Some("number"));
            stats.seed_association(GroupKind::Label, "L1", sensor);
        }
        (kv, stats)
    }

    fn listener(kv: Arc<MemoryKeyValueStore>, stats: Arc<MemoryStatsStore>) -> EventListener {
        EventListener::new(Reconciler::new(kv, stats))
            .with_poll_interval(Duration::from_millis(10))
    }

    /// Statistics store whose sensor removals wait until `gate` has a permit.
    struct GatedStatsStore {
        inner: Arc<MemoryStatsStore>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl StatsStore for GatedStatsStore {
        async fn insert_series(
            &self,
            table_type: &str,
            sensor_id: &str,
            timestamp: DateTime<Utc>,
            value: &SeriesValue,
        ) -> crate::Result<()> {
            self.inner.insert_series(table_type, sensor_id, timestamp, value).await
        }

        async fn delete_group(&self, kind: GroupKind, group_id: &str) -> crate::Result<u64> {
            self.inner.delete_group(kind, group_id).await
        }

        async fn insert_group_sensor(
            &self,
            kind: GroupKind,
            group_id: &str,
            sensor_id: &str,
        ) -> crate::Result<AssociationInsert> {
            self.inner.insert_group_sensor(kind, group_id, sensor_id).await
        }

        async fn remove_sensor_from_groups(
            &self,
            kind: GroupKind,
            sensor_id: &str,
        ) -> crate::Result<u64> {
            let _permit = self.gate.acquire().await.unwrap();
            self.inner.remove_sensor_from_groups(kind, sensor_id).await
        }

        async fn stored_group_ids(&self, kind: GroupKind) -> crate::Result<Vec<String>> {
            self.inner.stored_group_ids(kind).await
        }

        async fn sensor_rows(&self, sensor_id: &str) -> crate::Result<Vec<SensorRow>> {
            self.inner.sensor_rows(sensor_id).await
        }

        async fn update_sensor_type(
            &self,
            id_sensor: i32,
            sensor_type: &str,
        ) -> crate::Result<u64> {
            self.inner.update_sensor_type(id_sensor, sensor_type).await
        }

        async fn create_sensor(
            &self,
            sensor_id: &str,
            is_number: Option<bool>,
            sensor_type: &str,
        ) -> crate::Result<()> {
            self.inner.create_sensor(sensor_id, is_number, sensor_type).await
        }

        async fn health_check(&self) -> crate::Result<bool> {
            self.inner.health_check().await
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Routing
    // ─────────────────────────────────────────────────────────────────────────

    #[test]
    fn test_route_table() {
        assert_eq!(
            route(&event(EntityKind::Gateway, "gw1", Operation::Delete)),
            Dispatch::GatewayDeleted("gw1".to_string())
        );
        assert_eq!(
            route(&event(EntityKind::Sensor, "s1", Operation::Delete)),
            Dispatch::SensorDeleted("s1".to_string())
        );

        for op in [Operation::Create, Operation::Update] {
            assert_eq!(route(&event(EntityKind::Gateway, "gw1", op)), Dispatch::Ignored);
            assert_eq!(route(&event(EntityKind::Sensor, "s1", op)), Dispatch::Ignored);
        }
        for kind in [
            EntityKind::Label,
            EntityKind::Thing,
            EntityKind::Other("device".to_string()),
        ] {
            assert_eq!(route(&event(kind, "x", Operation::Delete)), Dispatch::Ignored);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Run loop
    // ─────────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_run_dispatches_and_drains() {
        let (kv, stats) = stores();
        let listener = listener(kv, stats.clone());
        let (tx, rx) = mpsc::channel(16);

        tx.send(Ok(event(EntityKind::Gateway, "gw1", Operation::Delete)))
            .await
            .unwrap();
        tx.send(Ok(event(EntityKind::Sensor, "C", Operation::Delete)))
            .await
            .unwrap();
        tx.send(Ok(event(EntityKind::Label, "L1", Operation::Update)))
            .await
            .unwrap();
        tx.send(Err(statsync_core::Error::MissingField("id")))
            .await
            .unwrap();
        drop(tx);

        let summary = listener.run(rx).await;

        assert_eq!(summary.received, 4);
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.ignored, 1);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.failed, 0);
        assert!(!summary.is_running);
        assert!(stats.group_members(GroupKind::Label, "L1").is_empty());
    }

    #[tokio::test]
    async fn test_run_counts_failed_actions() {
        let (kv, stats) = stores();
        let listener = listener(kv, stats.clone());
        let (tx, rx) = mpsc::channel(4);

        tx.send(Ok(event(EntityKind::Gateway, "gw_missing", Operation::Delete)))
            .await
            .unwrap();
        drop(tx);

        let summary = listener.run(rx).await;
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(stats.mutations(), 0);
    }

    #[tokio::test]
    async fn test_events_queued_during_resync_apply_after() {
        let (kv, stats) = stores();
        let reconciler = Reconciler::new(kv, stats.clone());
        let listener = EventListener::new(reconciler.clone())
            .with_poll_interval(Duration::from_millis(10));
        let (tx, rx) = mpsc::channel(4);

        tx.send(Ok(event(EntityKind::Sensor, "C", Operation::Delete)))
            .await
            .unwrap();
        let report = reconciler.full_resync().await.unwrap();
        assert_eq!(report.failed, 0);
        assert!(stats.group_members(GroupKind::Label, "L1").contains("C"));

        drop(tx);
        let summary = listener.run(rx).await;

        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.failed, 0);
        let members = stats.group_members(GroupKind::Label, "L1");
        assert!(!members.contains("C"));
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn test_run_keeps_receiving_while_action_blocked() {
        let (kv, stats) = stores();
        let gate = Arc::new(Semaphore::new(0));
        let gated = Arc::new(GatedStatsStore {
            inner: stats.clone(),
            gate: Arc::clone(&gate),
        });
        let listener = Arc::new(
            EventListener::new(Reconciler::new(kv, gated))
                .with_poll_interval(Duration::from_millis(10)),
        );
        let (tx, rx) = mpsc::channel(4);

        let handle = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.run(rx).await })
        };

        tx.send(Ok(event(EntityKind::Sensor, "A", Operation::Delete)))
            .await
            .unwrap();
        tx.send(Ok(event(EntityKind::Label, "L1", Operation::Update)))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while listener.stats().received < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second event not received while the first action was blocked");

        let during = listener.stats();
        assert_eq!(during.dispatched, 1);
        assert_eq!(during.ignored, 1);
        assert!(stats.group_members(GroupKind::Label, "L1").contains("A"));
        assert_eq!(stats.mutations(), 0);

        gate.add_permits(2);
        drop(tx);
        let summary = handle.await.unwrap();

        assert_eq!(summary.received, 2);
        assert_eq!(summary.failed, 0);
        assert!(!stats.group_members(GroupKind::Label, "L1").contains("A"));
        assert!(stats.group_members(GroupKind::Label, "L1").contains("B"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let (kv, stats) = stores();
        let listener = Arc::new(listener(kv, stats));
        let (tx, rx) = mpsc::channel::<FeedItem>(4);

        let handle = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.run(rx).await })
        };

        listener.shutdown();
        let summary = handle.await.unwrap();

        assert_eq!(summary.received, 0);
        assert!(!listener.is_running());
        drop(tx);
    }
}
