use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::models::{ProtocolKind, ProtocolRecord, ProtocolSet};

/// Full protocol sets keyed by rental id.
///
/// Unbounded unless a capacity is given, in which case the least recently
/// used entries are evicted. Also tracks a per-(rental, kind) reconciliation
/// epoch so that a fetch started before a local write can tell it is stale.
/// The last reconciled record is kept with its epoch, independent of the
/// entry, so eviction or invalidation cannot lose it to a stale fetch.
#[derive(Debug, Default)]
pub struct DetailCache {
    entries: HashMap<String, Arc<ProtocolSet>>,
    /// Access order, oldest first
    order: Vec<String>,
    capacity: Option<usize>,
    reconciled: HashMap<(String, ProtocolKind), Reconciled>,
}

#[derive(Debug)]
struct Reconciled {
    epoch: u64,
    record: ProtocolRecord,
}

impl DetailCache {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity: capacity.filter(|&cap| cap > 0),
            ..Default::default()
        }
    }

    /// Read an entry and mark it recently used.
    pub fn get(&mut self, rental_id: &str) -> Option<Arc<ProtocolSet>> {
        let found = self.entries.get(rental_id).cloned();
        if found.is_some() {
            self.touch(rental_id);
        }
        found
    }

    /// Read an entry without touching the access order.
    pub fn peek(&self, rental_id: &str) -> Option<&Arc<ProtocolSet>> {
        self.entries.get(rental_id)
    }

    pub fn contains(&self, rental_id: &str) -> bool {
        self.entries.contains_key(rental_id)
    }

    pub fn insert(&mut self, rental_id: &str, set: Arc<ProtocolSet>) {
        self.entries.insert(rental_id.to_string(), set);
        self.touch(rental_id);
        self.evict_over_capacity();
    }

    pub fn remove(&mut self, rental_id: &str) -> Option<Arc<ProtocolSet>> {
        if let Some(pos) = self.order.iter().position(|id| id == rental_id) {
            self.order.remove(pos);
        }
        self.entries.remove(rental_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn epoch(&self, rental_id: &str, kind: ProtocolKind) -> u64 {
        self.reconciled
            .get(&(rental_id.to_string(), kind))
            .map_or(0, |r| r.epoch)
    }

    pub(crate) fn epochs(&self, rental_id: &str) -> [u64; 2] {
        ProtocolKind::ALL.map(|kind| self.epoch(rental_id, kind))
    }

    /// Remember a locally saved record and advance its epoch.
    pub(crate) fn record_reconciled(&mut self, rental_id: &str, kind: ProtocolKind, record: ProtocolRecord) {
        let key = (rental_id.to_string(), kind);
        let epoch = self.reconciled.get(&key).map_or(0, |r| r.epoch) + 1;
        self.reconciled.insert(key, Reconciled { epoch, record });
    }

    /// The last record saved locally for this rental and kind.
    pub(crate) fn reconciled(&self, rental_id: &str, kind: ProtocolKind) -> Option<&ProtocolRecord> {
        self.reconciled
            .get(&(rental_id.to_string(), kind))
            .map(|r| &r.record)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
        self.reconciled.clear();
    }

    fn touch(&mut self, rental_id: &str) {
        if let Some(pos) = self.order.iter().position(|id| id == rental_id) {
            self.order.remove(pos);
        }
        self.order.push(rental_id.to_string());
    }

    fn evict_over_capacity(&mut self) {
        let Some(capacity) = self.capacity else {
            return;
        };
        while self.entries.len() > capacity && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
            debug!(rental_id = %oldest, capacity, "Evicted protocol detail from cache");
        }
    }
}
