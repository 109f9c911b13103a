//! Data models for rental protocol tracking.
//!
//! This module contains the data structures exchanged with the back office
//! API and held in the coordinator caches:
//!
//! - `ProtocolKind`: handover vs. return inspection protocols
//! - `ProtocolRecord`, `ProtocolSet`: full protocol documents per rental
//! - `ProtocolStatus`, `StatusPatch`: lightweight presence flags per rental
//! - `BulkStatusPayload`, `RentalProtocols`, `MutationResponse`: API payloads

pub mod protocol;
pub mod status;
pub mod timestamp;

pub use protocol::{
    MutationResponse, ProtocolKind, ProtocolRecord, ProtocolSet, ProtocolState, RentalProtocols,
};
pub use status::{BulkStatusEntry, BulkStatusPayload, ProtocolStatus, RentalStage, StatusPatch};
