//! Key-value record kinds and sensor groupings.

use std::fmt;

/// Hierarchical record kinds held in the key-value store.
///
/// Each record is a flat hash stored under `<prefix>:<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Gateway,
    Device,
    Sensor,
}

impl RecordKind {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::Device => "device",
            Self::Sensor => "sensor",
        }
    }

    /// Full key of the record with the given id.
    pub fn key(self, id: &str) -> String {
        format!("{}:{}", self.prefix(), id)
    }

    /// Prefix shared by every key of this kind, including the separator.
    pub fn key_prefix(self) -> String {
        format!("{}:", self.prefix())
    }

    /// Strip the kind prefix from a full key, returning the record id.
    pub fn id_from_key(self, key: &str) -> Option<&str> {
        key.strip_prefix(self.prefix())
            .and_then(|rest| rest.strip_prefix(':'))
            .filter(|id| !id.is_empty())
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// User-defined sensor groupings mirrored as many-to-many associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Label,
    Thing,
}

impl GroupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Label => "label",
            Self::Thing => "thing",
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
