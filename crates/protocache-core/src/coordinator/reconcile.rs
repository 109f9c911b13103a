use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::models::{ProtocolKind, ProtocolRecord, ProtocolSet, StatusPatch};

use super::{lock, MutationError, ProtocolCoordinator};

impl ProtocolCoordinator {
    /// Merge a freshly saved protocol into both caches.
    ///
    /// The record replaces whatever was cached for `kind` without going
    /// through the latest-wins selection; the other kind is left as is.
    /// Runs synchronously so the next read already sees it.
    pub fn on_mutation_success(
        &self,
        rental_id: &str,
        kind: ProtocolKind,
        record: ProtocolRecord,
    ) -> Arc<ProtocolSet> {
        let protocol_id = record.id.clone();

        let updated = {
            let mut details = lock(&self.inner.details);
            let mut set = details
                .peek(rental_id)
                .map(|existing| ProtocolSet::clone(existing))
                .unwrap_or_default();
            details.record_reconciled(rental_id, kind, record.clone());
            set.set(kind, record);

            let updated = Arc::new(set);
            details.insert(rental_id, Arc::clone(&updated));
            updated
        };

        lock(&self.inner.overlay).patch(rental_id, &StatusPatch::present(kind, protocol_id.clone()));

        debug!(rental_id, %kind, protocol_id = %protocol_id, "Reconciled saved protocol into cache");
        updated
    }

    /// Create a protocol and reconcile it on success.
    /// On failure both caches are left exactly as they were.
    pub async fn create_protocol(
        &self,
        rental_id: &str,
        kind: ProtocolKind,
        body: Value,
    ) -> Result<ProtocolRecord, MutationError> {
        let body = with_rental_id(body, rental_id);

        match self.inner.source.create_protocol(kind, &body).await {
            Ok(record) => {
                self.on_mutation_success(rental_id, kind, record.clone());
                info!(rental_id, %kind, protocol_id = %record.id, "Protocol created");
                Ok(record)
            }
            Err(cause) => {
                warn!(rental_id, %kind, error = %format!("{:#}", cause), "Failed to create protocol");
                Err(MutationError {
                    rental_id: rental_id.to_string(),
                    kind,
                    cause,
                })
            }
        }
    }

    pub async fn update_protocol(
        &self,
        rental_id: &str,
        kind: ProtocolKind,
        protocol_id: &str,
        body: Value,
    ) -> Result<ProtocolRecord, MutationError> {
        let body = with_rental_id(body, rental_id);

        match self.inner.source.update_protocol(kind, protocol_id, &body).await {
            Ok(record) => {
                self.on_mutation_success(rental_id, kind, record.clone());
                info!(rental_id, %kind, protocol_id, "Protocol updated");
                Ok(record)
            }
            Err(cause) => {
                warn!(rental_id, %kind, protocol_id, error = %format!("{:#}", cause), "Failed to update protocol");
                Err(MutationError {
                    rental_id: rental_id.to_string(),
                    kind,
                    cause,
                })
            }
        }
    }
}

/// The back office needs `rentalId` in every protocol body.
fn with_rental_id(mut body: Value, rental_id: &str) -> Value {
    if let Value::Object(ref mut map) = body {
        map.entry("rentalId")
            .or_insert_with(|| Value::String(rental_id.to_string()));
    }
    body
}
