use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ProtocolKind;

/// Presence flags for the protocols of one rental.
///
/// Served in bulk by `GET /protocols/bulk-status`; an unknown rental is
/// represented by the all-false default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct ProtocolStatus {
    #[serde(default)]
    pub has_handover_protocol: bool,
    #[serde(default)]
    pub has_return_protocol: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handover_protocol_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_protocol_id: Option<String>,
}

impl ProtocolStatus {
    pub fn has(&self, kind: ProtocolKind) -> bool {
        match kind {
            ProtocolKind::Handover => self.has_handover_protocol,
            ProtocolKind::Return => self.has_return_protocol,
        }
    }

    pub fn protocol_id(&self, kind: ProtocolKind) -> Option<&str> {
        match kind {
            ProtocolKind::Handover => self.handover_protocol_id.as_deref(),
            ProtocolKind::Return => self.return_protocol_id.as_deref(),
        }
    }

    pub fn has_any(&self) -> bool {
        self.has_handover_protocol || self.has_return_protocol
    }

    pub fn stage(&self) -> RentalStage {
        if self.has_return_protocol {
            RentalStage::Completed
        } else if self.has_handover_protocol {
            RentalStage::AwaitingReturn
        } else {
            RentalStage::AwaitingHandover
        }
    }

    /// Shallow-merge a patch. Presence flags only ever go from false to true
    /// here; returns `false` if the patch tried to clear a set flag.
    pub fn merge(&mut self, patch: &StatusPatch) -> bool {
        let mut accepted = true;

        if let Some(has) = patch.has_handover_protocol {
            accepted &= has || !self.has_handover_protocol;
            self.has_handover_protocol |= has;
        }
        if let Some(has) = patch.has_return_protocol {
            accepted &= has || !self.has_return_protocol;
            self.has_return_protocol |= has;
        }
        if let Some(ref id) = patch.handover_protocol_id {
            self.handover_protocol_id = Some(id.clone());
        }
        if let Some(ref id) = patch.return_protocol_id {
            self.return_protocol_id = Some(id.clone());
        }

        accepted
    }
}

/// A partial `ProtocolStatus`; `None` fields leave the entry untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusPatch {
    pub has_handover_protocol: Option<bool>,
    pub has_return_protocol: Option<bool>,
    pub handover_protocol_id: Option<String>,
    pub return_protocol_id: Option<String>,
}

impl StatusPatch {
    /// Mark one kind as present with the given protocol id.
    pub fn present(kind: ProtocolKind, id: impl Into<String>) -> Self {
        let id = Some(id.into());
        match kind {
            ProtocolKind::Handover => Self {
                has_handover_protocol: Some(true),
                handover_protocol_id: id,
                ..Default::default()
            },
            ProtocolKind::Return => Self {
                has_return_protocol: Some(true),
                return_protocol_id: id,
                ..Default::default()
            },
        }
    }
}

/// Where a rental stands in the handover/return lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum RentalStage {
    AwaitingHandover,
    AwaitingReturn,
    Completed,
}

impl RentalStage {
    pub fn display_name(&self) -> &'static str {
        match self {
            RentalStage::AwaitingHandover => "Awaiting handover",
            RentalStage::AwaitingReturn => "Awaiting return",
            RentalStage::Completed => "Completed",
        }
    }
}

/// One row of the list-shaped bulk status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkStatusEntry {
    #[serde(rename = "rentalId", alias = "entityId")]
    pub rental_id: String,
    #[serde(flatten)]
    pub status: ProtocolStatus,
}

/// Bulk status response. Older deployments answer with a list of rows,
/// newer ones with an object keyed by rental id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BulkStatusPayload {
    List(Vec<BulkStatusEntry>),
    Keyed(HashMap<String, ProtocolStatus>),
}

impl BulkStatusPayload {
    /// Normalize to the keyed form. Later list rows win over earlier ones.
    pub fn into_map(self) -> HashMap<String, ProtocolStatus> {
        match self {
            BulkStatusPayload::Keyed(map) => map,
            BulkStatusPayload::List(entries) => entries
                .into_iter()
                .map(|entry| (entry.rental_id, entry.status))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BulkStatusPayload::Keyed(map) => map.len(),
            BulkStatusPayload::List(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
