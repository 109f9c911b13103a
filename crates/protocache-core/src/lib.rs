//! protocache-core - handover/return protocol cache coordination.
//!
//! Tracks which rentals have handover and return protocols, loads full
//! protocol documents on demand with per-rental request coalescing, merges
//! saved protocols into the caches without refetching, and drives the
//! create-protocol dialog workflow.

pub mod api;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod models;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, ApiError, ProtocolSource};
pub use config::Config;
pub use coordinator::{
    BulkLoadError, BulkLoadOutcome, CoordinatorConfig, LoadError, MutationError, ProtocolCoordinator,
};
pub use models::{
    ProtocolKind, ProtocolRecord, ProtocolSet, ProtocolStatus, RentalStage, StatusPatch,
};
pub use workflow::{
    BlockReason, DialogFailure, DialogSelection, WorkflowController, WorkflowEvent, WorkflowState,
};
