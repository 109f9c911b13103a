use std::collections::HashMap;

use tracing::debug;

use crate::models::{ProtocolStatus, RentalStage, StatusPatch};

/// Lightweight presence map `rental id -> ProtocolStatus`.
///
/// Filled wholesale by one bulk read, then only patched locally. Patches that
/// land while a bulk read is outstanding are replayed over its result so the
/// snapshot cannot roll them back.
#[derive(Debug, Default)]
pub struct StatusOverlay {
    entries: HashMap<String, ProtocolStatus>,
    loaded: bool,
    loading: bool,
    patched_while_loading: Vec<(String, StatusPatch)>,
}

impl StatusOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status, or the all-false default for unknown rentals.
    pub fn get(&self, rental_id: &str) -> ProtocolStatus {
        self.entries.get(rental_id).cloned().unwrap_or_default()
    }

    pub fn contains(&self, rental_id: &str) -> bool {
        self.entries.contains_key(rental_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    /// Shallow-merge into one entry, creating it if absent.
    pub fn patch(&mut self, rental_id: &str, patch: &StatusPatch) {
        let entry = self.entries.entry(rental_id.to_string()).or_default();
        if !entry.merge(patch) {
            debug!(rental_id, "Ignored attempt to clear a protocol presence flag");
        }
        if self.loading {
            self.patched_while_loading
                .push((rental_id.to_string(), patch.clone()));
        }
    }

    /// Rental ids currently in `stage`, sorted for stable output.
    pub fn rentals_in_stage(&self, stage: RentalStage) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, status)| status.stage() == stage)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn begin_load(&mut self) {
        self.loading = true;
        self.patched_while_loading.clear();
    }

    /// Replace all entries with a fresh bulk snapshot.
    pub(crate) fn finish_load(&mut self, entries: HashMap<String, ProtocolStatus>) {
        self.entries = entries;
        self.loading = false;
        self.loaded = true;

        for (rental_id, patch) in std::mem::take(&mut self.patched_while_loading) {
            self.entries.entry(rental_id).or_default().merge(&patch);
        }
    }

    /// Leave the overlay as it was and allow a later retry.
    pub(crate) fn abort_load(&mut self) {
        self.loading = false;
        self.patched_while_loading.clear();
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}
