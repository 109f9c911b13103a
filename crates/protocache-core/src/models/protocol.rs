use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::selector::pick_latest;

use super::timestamp;

/// The two kinds of inspection protocol attached to a rental.
///
/// A return protocol can only be written once the vehicle has been handed
/// over, so `Handover` is a prerequisite of `Return`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Handover,
    Return,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 2] = [ProtocolKind::Handover, ProtocolKind::Return];

    /// Path segment used by the back office API (`/protocols/{kind}`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Handover => "handover",
            ProtocolKind::Return => "return",
        }
    }

    /// The kind that must exist before this one can be created.
    pub fn prerequisite(&self) -> Option<ProtocolKind> {
        match self {
            ProtocolKind::Handover => None,
            ProtocolKind::Return => Some(ProtocolKind::Handover),
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProtocolKind::Handover => "Handover",
            ProtocolKind::Return => "Return",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "handover" | "a" => Ok(ProtocolKind::Handover),
            "return" | "b" => Ok(ProtocolKind::Return),
            other => Err(format!("unknown protocol kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolState {
    Draft,
    Completed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

/// A handover or return protocol document.
///
/// Only the fields the coordinator reasons about are typed; everything else
/// (vehicle condition, media, signatures, ...) is kept verbatim in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRecord {
    pub id: String,
    #[serde(rename = "rentalId", default, skip_serializing_if = "Option::is_none")]
    pub rental_id: Option<String>,
    #[serde(
        rename = "createdAt",
        default,
        deserialize_with = "timestamp::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "completedAt",
        default,
        deserialize_with = "timestamp::deserialize",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProtocolState>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ProtocolRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rental_id: None,
            created_at: None,
            completed_at: None,
            status: None,
            fields: Map::new(),
        }
    }

    /// Ordering key: `createdAt`, else `completedAt`, else the epoch.
    pub fn recency_millis(&self) -> i64 {
        self.created_at
            .or(self.completed_at)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0)
    }

    pub fn is_completed(&self) -> bool {
        self.status == Some(ProtocolState::Completed) || self.completed_at.is_some()
    }

    /// Look up an untyped field, e.g. `location` or `pdfUrl`.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Raw per-rental response of `GET /protocols/rental/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RentalProtocols {
    #[serde(rename = "handoverProtocols", default)]
    pub handover_protocols: Vec<ProtocolRecord>,
    #[serde(rename = "returnProtocols", default)]
    pub return_protocols: Vec<ProtocolRecord>,
}

impl RentalProtocols {
    pub fn records(&self, kind: ProtocolKind) -> &[ProtocolRecord] {
        match kind {
            ProtocolKind::Handover => &self.handover_protocols,
            ProtocolKind::Return => &self.return_protocols,
        }
    }
}

/// The authoritative protocol of each kind for one rental.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover: Option<ProtocolRecord>,
    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub return_protocol: Option<ProtocolRecord>,
}

impl ProtocolSet {
    /// Resolve a raw response down to the latest record of each kind.
    pub fn from_raw(raw: &RentalProtocols) -> Self {
        Self {
            handover: pick_latest(&raw.handover_protocols).cloned(),
            return_protocol: pick_latest(&raw.return_protocols).cloned(),
        }
    }

    pub fn get(&self, kind: ProtocolKind) -> Option<&ProtocolRecord> {
        match kind {
            ProtocolKind::Handover => self.handover.as_ref(),
            ProtocolKind::Return => self.return_protocol.as_ref(),
        }
    }

    pub fn set(&mut self, kind: ProtocolKind, record: ProtocolRecord) {
        match kind {
            ProtocolKind::Handover => self.handover = Some(record),
            ProtocolKind::Return => self.return_protocol = Some(record),
        }
    }

    pub fn has(&self, kind: ProtocolKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.handover.is_none() && self.return_protocol.is_none()
    }
}

/// Response of a create/update call.
///
/// Creation answers `{ success, protocol, pdfProxyUrl, ... }` while updates
/// return the bare record.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MutationResponse {
    Wrapped { protocol: ProtocolRecord },
    Bare(ProtocolRecord),
}

impl MutationResponse {
    pub fn into_record(self) -> ProtocolRecord {
        match self {
            MutationResponse::Wrapped { protocol } => protocol,
            MutationResponse::Bare(record) => record,
        }
    }
}
