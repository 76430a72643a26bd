//! Change-feed events published by the upstream device registry.
//!
//! Every create/update/delete of a registry entity is published as one JSON
//! message on a pub/sub channel:
//!
//! ```json
//! {"eventId": "sensor", "id": "smokeAlarm-gw_248300000853-COALARM",
//!  "operation": "D", "updatedItem": null, "prevItem": {...}}
//! ```
//!
//! Only `eventId`, `id` and `operation` drive reconciliation; the item
//! snapshots are carried along for logging.

use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Kind of registry entity a change event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Gateway,
    Sensor,
    Label,
    Thing,
    /// Any kind this service does not know about. Kept so it can be logged.
    Other(String),
}

impl EntityKind {
    /// Parse the `eventId` value of a change message.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "gateway" => Self::Gateway,
            "sensor" => Self::Sensor,
            "label" => Self::Label,
            "thing" => Self::Thing,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Gateway => "gateway",
            Self::Sensor => "sensor",
            Self::Label => "label",
            Self::Thing => "thing",
            Self::Other(kind) => kind,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation applied to the entity upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Parse the single-letter operation code (`C`, `U`, `D`).
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "C" => Ok(Self::Create),
            "U" => Ok(Self::Update),
            "D" => Ok(Self::Delete),
            other => Err(Error::UnknownOperation(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "C",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded change-feed message.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    /// Entity snapshot after the change (absent on delete).
    pub updated_item: Option<Value>,
    /// Entity snapshot before the change (absent on create).
    pub prev_item: Option<Value>,
}

/// Wire shape of a change message, before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangeMessage {
    event_id: Option<String>,
    id: Option<Value>,
    operation: Option<String>,
    #[serde(default)]
    updated_item: Option<Value>,
    #[serde(default)]
    prev_item: Option<Value>,
}

impl ChangeEvent {
    pub fn new(
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            entity_kind,
            entity_id: entity_id.into(),
            operation,
            updated_item: None,
            prev_item: None,
        }
    }

    /// Decode and validate a JSON change message.
    ///
    /// Entity ids may be JSON strings or numbers (labels and things use
    /// numeric ids upstream); both are normalized to strings.
    pub fn from_json(payload: &str) -> Result<Self> {
        let raw: RawChangeMessage = serde_json::from_str(payload)?;

        let kind = raw.event_id.ok_or(Error::MissingField("eventId"))?;
        let operation = raw.operation.ok_or(Error::MissingField("operation"))?;
        let entity_id = match raw.id {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(Value::Number(id)) => id.to_string(),
            Some(Value::String(_)) => {
                return Err(Error::InvalidField {
                    field: "id",
                    reason: "empty identifier".to_string(),
                });
            }
            Some(other) => {
                return Err(Error::InvalidField {
                    field: "id",
                    reason: format!("expected string or number, got {other}"),
                });
            }
            None => return Err(Error::MissingField("id")),
        };

        Ok(Self {
            entity_kind: EntityKind::parse(&kind),
            entity_id,
            operation: Operation::parse(&operation)?,
            updated_item: raw.updated_item.filter(|v| !v.is_null()),
            prev_item: raw.prev_item.filter(|v| !v.is_null()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sensor_delete() {
        let payload = r#"{
            "eventId": "sensor",
            "id": "smokeAlarm-gw_248300000853-COALARM",
            "operation": "D",
            "updatedItem": null,
            "prevItem": {"name": "CO alarm"}
        }"#;
        let event = ChangeEvent::from_json(payload).unwrap();
        assert_eq!(event.entity_kind, EntityKind::Sensor);
        assert_eq!(event.entity_id, "smokeAlarm-gw_248300000853-COALARM");
        assert_eq!(event.operation, Operation::Delete);
        assert!(event.updated_item.is_none());
        assert_eq!(event.prev_item.unwrap()["name"], "CO alarm");
    }

    #[test]
    fn test_parse_numeric_id() {
        let payload = r#"{"eventId":"label","id":42,"operation":"U"}"#;
        let event = ChangeEvent::from_json(payload).unwrap();
        assert_eq!(event.entity_kind, EntityKind::Label);
        assert_eq!(event.entity_id, "42");
        assert_eq!(event.operation, Operation::Update);
    }

    #[test]
    fn test_parse_unknown_kind_is_kept() {
        let payload = r#"{"eventId":"device","id":"d1","operation":"C"}"#;
        let event = ChangeEvent::from_json(payload).unwrap();
        assert_eq!(event.entity_kind, EntityKind::Other("device".to_string()));
        assert_eq!(event.entity_kind.to_string(), "device");
    }

    #[test]
    fn test_missing_fields_rejected() {
        let err = ChangeEvent::from_json(r#"{"id":"x","operation":"D"}"#).unwrap_err();
        assert!(matches!(err, Error::MissingField("eventId")));

        let err = ChangeEvent::from_json(r#"{"eventId":"sensor","operation":"D"}"#).unwrap_err();
        assert!(matches!(err, Error::MissingField("id")));

        let err = ChangeEvent::from_json(r#"{"eventId":"sensor","id":"x"}"#).unwrap_err();
        assert!(matches!(err, Error::MissingField("operation")));
    }

    #[test]
    fn test_bad_values_rejected() {
        let err =
            ChangeEvent::from_json(r#"{"eventId":"sensor","id":"x","operation":"X"}"#).unwrap_err();
        assert!(matches!(err, Error::UnknownOperation(op) if op == "X"));

        let err =
            ChangeEvent::from_json(r#"{"eventId":"sensor","id":"","operation":"D"}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "id", .. }));

        let err = ChangeEvent::from_json(r#"{"eventId":"sensor","id":[1],"operation":"D"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "id", .. }));

        assert!(matches!(
            ChangeEvent::from_json("not json").unwrap_err(),
            Error::Json(_)
        ));
    }

    #[test]
    fn test_operation_codes() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::parse(op.as_str()).unwrap(), op);
        }
        assert!(Operation::parse("d").is_err());
    }
}
