use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::{BulkStatusPayload, ProtocolKind, ProtocolRecord, RentalProtocols};

/// The back office operations the coordinator depends on.
///
/// Injected into `ProtocolCoordinator` so tests can substitute an in-memory
/// source for the HTTP client.
#[async_trait]
pub trait ProtocolSource: Send + Sync {
    /// Presence flags for every rental, in either keyed or list form.
    async fn fetch_bulk_status(&self) -> Result<BulkStatusPayload>;

    /// Every protocol of both kinds recorded for one rental.
    async fn fetch_rental_protocols(&self, rental_id: &str) -> Result<RentalProtocols>;

    async fn create_protocol(&self, kind: ProtocolKind, body: &Value) -> Result<ProtocolRecord>;

    async fn update_protocol(
        &self,
        kind: ProtocolKind,
        protocol_id: &str,
        body: &Value,
    ) -> Result<ProtocolRecord>;
}
