//! Core types and shared utilities for the statsync reconciler.
//!
//! This crate provides:
//! - Change-feed event decoding (`eventId` / `id` / `operation` messages)
//! - Key-value record kinds and sensor grouping kinds
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;
mod record;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Pub/sub channel the device registry publishes every change on.
pub const DEFAULT_CHANGE_CHANNEL: &str = "main:all";

/// Hash field holding a gateway's JSON-encoded sensor id list.
pub const GATEWAY_SENSORS_FIELD: &str = "sensors";

/// Hash field holding a device's owning gateway id.
pub const DEVICE_OWNER_FIELD: &str = "owner";

/// Hash field holding a sensor's owning device id.
pub const SENSOR_DEVICE_FIELD: &str = "deviceId";

/// Hash field holding a sensor's type (also selects its time-series table).
pub const SENSOR_TYPE_FIELD: &str = "type";

pub use error::{Error, Result};
pub use event::{ChangeEvent, EntityKind, Operation};
pub use record::{GroupKind, RecordKind};
