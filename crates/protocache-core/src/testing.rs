//! In-memory `ProtocolSource` for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::api::ProtocolSource;
use crate::models::{
    timestamp, BulkStatusPayload, ProtocolKind, ProtocolRecord, ProtocolStatus, RentalProtocols,
};

/// Counts calls and answers from canned data. A gated source holds every
/// read open until the test hands out a permit with `release`.
#[derive(Default)]
pub struct FakeSource {
    bulk: Mutex<Option<BulkStatusPayload>>,
    protocols: Mutex<HashMap<String, RentalProtocols>>,
    failing: Mutex<HashSet<String>>,
    reject_mutations: bool,
    gate: Option<Semaphore>,
    bulk_calls: AtomicUsize,
    detail_calls: AtomicUsize,
    mutation_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn with_bulk(self, payload: BulkStatusPayload) -> Self {
        self.set_bulk(payload);
        self
    }

    pub fn set_bulk(&self, payload: BulkStatusPayload) {
        *self.bulk.lock().unwrap() = Some(payload);
    }

    pub fn with_protocols(self, rental_id: &str, protocols: RentalProtocols) -> Self {
        self.protocols
            .lock()
            .unwrap()
            .insert(rental_id.to_string(), protocols);
        self
    }

    pub fn fail_rental(&self, rental_id: &str) {
        self.failing.lock().unwrap().insert(rental_id.to_string());
    }

    pub fn recover_rental(&self, rental_id: &str) {
        self.failing.lock().unwrap().remove(rental_id);
    }

    pub fn reject_mutations(mut self) -> Self {
        self.reject_mutations = true;
        self
    }

    /// Let `n` gated reads through.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn mutation_calls(&self) -> usize {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    async fn pass_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    fn mutate(&self, kind: ProtocolKind, body: &Value) -> Result<ProtocolRecord> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_mutations {
            bail!("Server error (500): failed to save {} protocol", kind);
        }
        Ok(serde_json::from_value(body.clone())?)
    }
}

#[async_trait]
impl ProtocolSource for FakeSource {
    async fn fetch_bulk_status(&self) -> Result<BulkStatusPayload> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        self.bulk
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("bulk status endpoint unavailable"))
    }

    async fn fetch_rental_protocols(&self, rental_id: &str) -> Result<RentalProtocols> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        if self.failing.lock().unwrap().contains(rental_id) {
            bail!("Network error: connection reset fetching {}", rental_id);
        }
        Ok(self
            .protocols
            .lock()
            .unwrap()
            .get(rental_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_protocol(&self, kind: ProtocolKind, body: &Value) -> Result<ProtocolRecord> {
        self.mutate(kind, body)
    }

    async fn update_protocol(
        &self,
        kind: ProtocolKind,
        _protocol_id: &str,
        body: &Value,
    ) -> Result<ProtocolRecord> {
        self.mutate(kind, body)
    }
}

/// A record with only an id and a `createdAt` timestamp.
pub fn record(id: &str, created_at: &str) -> ProtocolRecord {
    let mut record = ProtocolRecord::new(id);
    record.created_at = timestamp::parse(created_at);
    record
}

/// Status of a rental that has been handed over but not returned.
pub fn handover_status(protocol_id: &str) -> ProtocolStatus {
    ProtocolStatus {
        has_handover_protocol: true,
        handover_protocol_id: Some(protocol_id.to_string()),
        ..Default::default()
    }
}
