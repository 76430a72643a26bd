//! Statistics store reconciler.
//!
//! Keeps the relational sensor statistics store (Postgres) consistent with
//! the live device registry (Redis hashes), reacting to the registry's
//! change channel.
//!
//! # Modules
//!
//! - [`kv`] - Registry access (`KeyValueStore`, Redis and in-memory adapters)
//! - [`stats`] - Statistics store access (`StatsStore`, Postgres and in-memory adapters)
//! - [`hierarchy`] - Gateway → device → sensor resolution
//! - [`reconcile`] - Reconciliation operations
//! - [`listener`] - Change event dispatch service
//! - [`feed`] - Redis pub/sub change feed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │ RedisChangeFeed │  SUBSCRIBE main:all, decode JSON messages
//! └────────┬────────┘
//!          │ mpsc
//!          ▼
//! ┌─────────────────┐
//! │  EventListener  │  Routes gateway/sensor deletions, spawns actions
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐      ┌───────────────────┐
//! │   Reconciler    │ ───► │ HierarchyResolver │  gateway/device → sensors
//! └────────┬────────┘      └───────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   StatsStore    │  sensors, label_sensor, thing_sensor, insert_value_*
//! └─────────────────┘
//! ```
//!
//! The registry is the source of truth. Deletions are applied best-effort
//! as they arrive. The feed is subscribed before the startup resync, so
//! changes published during it wait in the channel.

pub mod config;
pub mod error;
pub mod feed;
pub mod hierarchy;
pub mod kv;
pub mod listener;
pub mod outcome;
pub mod reconcile;
pub mod stats;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use config::Config;
pub use feed::{ChangeSubscription, RedisChangeFeed};
pub use hierarchy::HierarchyResolver;
pub use kv::{KeyValueStore, MemoryKeyValueStore, Record, RedisKeyValueStore};
pub use listener::{Dispatch, EventListener, FeedItem, ListenerStats, route};
pub use outcome::{BestEffort, OpResult, Outcome};
pub use reconcile::{CascadeReport, LiveSensor, Reconciler, ResyncReport, SensorAction};
pub use stats::{
    AssociationInsert, MemoryStatsStore, PostgresConfig, PostgresStatsStore, SensorRow,
    SeriesValue, StatsStore,
};
