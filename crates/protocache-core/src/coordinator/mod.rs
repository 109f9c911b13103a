//! Protocol cache coordinator.
//!
//! `ProtocolCoordinator` owns both caches (the status overlay and the detail
//! cache) for one session and is the only writer to them. UI code holds a
//! clone of the handle, reads through the accessors and mutates only through
//! the coordinator operations:
//!
//! - `load_status` / `patch_status`: bulk presence flags
//! - `load_detail`: single-flight per-rental protocol loads
//! - `on_mutation_success`: optimistic merge of created/updated protocols
//! - `warm`: fire-and-forget preloading
//!
//! Locks are held only for short synchronous sections and never across an
//! await point. Loads for different rentals are not ordered.

mod error;
mod loader;
mod preload;
mod reconcile;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::api::ProtocolSource;
use crate::cache::{DetailCache, StatusOverlay};
use crate::models::{ProtocolSet, ProtocolStatus, RentalStage, StatusPatch};

pub use error::{BulkLoadError, LoadError, MutationError};
use loader::LoadTicket;

/// Number of rentals warmed when the caller does not give a limit.
pub const DEFAULT_PRELOAD_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub preload_limit: usize,
    /// `None` keeps every loaded detail for the whole session.
    pub detail_cache_capacity: Option<usize>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            preload_limit: DEFAULT_PRELOAD_LIMIT,
            detail_cache_capacity: None,
        }
    }
}

/// Result of a `load_status` call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkLoadOutcome {
    /// The overlay was replaced with this many rentals
    Loaded(usize),
    AlreadyLoaded,
    InProgress,
    /// `reset` ran while the load was in flight; its result was dropped
    Discarded,
}

/// Session-scoped handle to the protocol caches.
/// Clone is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct ProtocolCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn ProtocolSource>,
    config: CoordinatorConfig,
    overlay: Mutex<StatusOverlay>,
    details: Mutex<DetailCache>,
    tickets: Mutex<HashMap<String, LoadTicket>>,
    next_ticket: AtomicU64,
    /// Bumped by `reset`; loads started under an older value write nothing.
    generation: AtomicU64,
}

impl Inner {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
/// Every critical section leaves the caches consistent before it can panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the overlay's loading flag if a bulk load is dropped mid-flight.
struct BulkLoadGuard<'a> {
    inner: &'a Inner,
    generation: u64,
    armed: bool,
}

impl BulkLoadGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BulkLoadGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut overlay = lock(&self.inner.overlay);
        // After a reset the loading flag belongs to the new session
        if self.inner.generation() == self.generation {
            overlay.abort_load();
        }
    }
}

impl ProtocolCoordinator {
    pub fn new(source: Arc<dyn ProtocolSource>, config: CoordinatorConfig) -> Self {
        let details = DetailCache::new(config.detail_cache_capacity);
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                overlay: Mutex::new(StatusOverlay::new()),
                details: Mutex::new(details),
                tickets: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    // =========================================================================
    // Status overlay
    // =========================================================================

    /// Load presence flags for every rental with one bulk read.
    ///
    /// A no-op while a previous load is outstanding or after one succeeded.
    /// On failure the overlay keeps its previous contents and a later call
    /// may retry.
    pub async fn load_status(&self) -> Result<BulkLoadOutcome, BulkLoadError> {
        let generation = {
            let mut overlay = lock(&self.inner.overlay);
            if overlay.is_loaded() {
                return Ok(BulkLoadOutcome::AlreadyLoaded);
            }
            if overlay.is_loading() {
                debug!("Bulk protocol status load already in progress");
                return Ok(BulkLoadOutcome::InProgress);
            }
            overlay.begin_load();
            self.inner.generation()
        };

        let guard = BulkLoadGuard {
            inner: &self.inner,
            generation,
            armed: true,
        };
        let started = Instant::now();

        match self.inner.source.fetch_bulk_status().await {
            Ok(payload) => {
                let entries = payload.into_map();
                let count = entries.len();
                {
                    let mut overlay = lock(&self.inner.overlay);
                    if self.inner.generation() != generation {
                        guard.disarm();
                        debug!(rentals = count, "Dropping bulk protocol status loaded before reset");
                        return Ok(BulkLoadOutcome::Discarded);
                    }
                    overlay.finish_load(entries);
                }
                guard.disarm();
                info!(
                    rentals = count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Protocol status loaded"
                );
                Ok(BulkLoadOutcome::Loaded(count))
            }
            Err(cause) => {
                drop(guard);
                warn!(error = %format!("{:#}", cause), "Failed to load bulk protocol status");
                Err(BulkLoadError { cause })
            }
        }
    }

    /// Presence flags for one rental; all-false when unknown.
    pub fn status(&self, rental_id: &str) -> ProtocolStatus {
        lock(&self.inner.overlay).get(rental_id)
    }

    pub fn patch_status(&self, rental_id: &str, patch: &StatusPatch) {
        lock(&self.inner.overlay).patch(rental_id, patch);
    }

    pub fn is_status_loaded(&self) -> bool {
        lock(&self.inner.overlay).is_loaded()
    }

    /// Number of rentals the overlay knows about.
    pub fn known_rentals(&self) -> usize {
        lock(&self.inner.overlay).len()
    }

    pub fn rentals_in_stage(&self, stage: RentalStage) -> Vec<String> {
        lock(&self.inner.overlay).rentals_in_stage(stage)
    }

    // =========================================================================
    // Detail cache
    // =========================================================================

    /// Whatever detail is already cached, without fetching.
    pub fn cached_detail(&self, rental_id: &str) -> Option<Arc<ProtocolSet>> {
        lock(&self.inner.details).get(rental_id)
    }

    pub fn has_cached_detail(&self, rental_id: &str) -> bool {
        lock(&self.inner.details).contains(rental_id)
    }

    /// Drop one rental's cached detail so the next read refetches.
    /// An in-flight load for it is left alone.
    pub fn invalidate(&self, rental_id: &str) -> bool {
        let removed = lock(&self.inner.details).remove(rental_id).is_some();
        if removed {
            debug!(rental_id, "Invalidated cached protocols");
        }
        removed
    }

    /// Forget everything: both caches, the loaded flag and in-flight tickets.
    /// Loads already running still deliver to their callers but no longer
    /// write into either cache.
    pub fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.tickets).clear();
        lock(&self.inner.details).clear();
        lock(&self.inner.overlay).clear();
        info!("Protocol caches reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BulkStatusPayload, ProtocolKind, RentalProtocols};
    use crate::testing::{handover_status, record, FakeSource};
    use futures::poll;
    use pretty_assertions::assert_eq;

    fn keyed(entries: &[(&str, ProtocolStatus)]) -> BulkStatusPayload {
        BulkStatusPayload::Keyed(
            entries
                .iter()
                .map(|(id, status)| (id.to_string(), status.clone()))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_bulk_load_then_get_status() {
        let source = Arc::new(FakeSource::new().with_bulk(keyed(&[("r1", handover_status("h1"))])));
        let coordinator = ProtocolCoordinator::new(source.clone(), CoordinatorConfig::default());

        assert_eq!(coordinator.load_status().await.unwrap(), BulkLoadOutcome::Loaded(1));
        assert_eq!(coordinator.status("r1"), handover_status("h1"));
        assert_eq!(coordinator.status("r2"), ProtocolStatus::default());
        assert!(coordinator.is_status_loaded());
    }

    #[tokio::test]
    async fn test_bulk_load_is_idempotent() {
        let source = Arc::new(FakeSource::new().with_bulk(keyed(&[("r1", handover_status("h1"))])));
        let coordinator = ProtocolCoordinator::new(source.clone(), CoordinatorConfig::default());

        coordinator.load_status().await.unwrap();
        assert_eq!(coordinator.load_status().await.unwrap(), BulkLoadOutcome::AlreadyLoaded);
        assert_eq!(source.bulk_calls(), 1);
    }

    #[tokio::test]
    async fn test_bulk_load_in_progress_is_noop() {
        let source = Arc::new(
            FakeSource::gated().with_bulk(keyed(&[("r1", handover_status("h1"))])),
        );
        let coordinator = ProtocolCoordinator::new(source.clone(), CoordinatorConfig::default());

        let mut first = Box::pin(coordinator.load_status());
        assert!(poll!(&mut first).is_pending());

        assert_eq!(coordinator.load_status().await.unwrap(), BulkLoadOutcome::InProgress);

        source.release(1);
        assert_eq!(first.await.unwrap(), BulkLoadOutcome::Loaded(1));
        assert_eq!(source.bulk_calls(), 1);
    }

    #[tokio::test]
    async fn test_bulk_load_failure_allows_retry() {
        let source = Arc::new(FakeSource::new());
        let coordinator = ProtocolCoordinator::new(source.clone(), CoordinatorConfig::default());
        coordinator.patch_status("r1", &StatusPatch::present(ProtocolKind::Handover, "h1"));

        let err = coordinator.load_status().await.unwrap_err();
        assert!(err.to_string().contains("bulk"));
        assert!(!coordinator.is_status_loaded());
        assert_eq!(coordinator.status("r1"), handover_status("h1"));

        source.set_bulk(keyed(&[("r2", handover_status("h2"))]));
        assert_eq!(coordinator.load_status().await.unwrap(), BulkLoadOutcome::Loaded(1));
        assert_eq!(source.bulk_calls(), 2);
    }

    #[tokio::test]
    async fn test_dropped_bulk_load_clears_loading_flag() {
        let source = Arc::new(FakeSource::gated().with_bulk(keyed(&[])));
        let coordinator = ProtocolCoordinator::new(source.clone(), CoordinatorConfig::default());

        {
            let mut pending = Box::pin(coordinator.load_status());
            assert!(poll!(&mut pending).is_pending());
        }

        source.release(1);
        assert_eq!(coordinator.load_status().await.unwrap(), BulkLoadOutcome::Loaded(0));
    }

    #[tokio::test]
    async fn test_list_payload_is_normalized() {
        let payload: BulkStatusPayload = serde_json::from_str(
            r#"[{"rentalId":"r1","hasHandoverProtocol":true,"hasReturnProtocol":false,"handoverProtocolId":"h1"}]"#,
        )
        .unwrap();
        let source = Arc::new(FakeSource::new().with_bulk(payload));
        let coordinator = ProtocolCoordinator::new(source, CoordinatorConfig::default());

        coordinator.load_status().await.unwrap();
        assert_eq!(coordinator.status("r1"), handover_status("h1"));
        assert_eq!(coordinator.known_rentals(), 1);
        assert_eq!(coordinator.rentals_in_stage(RentalStage::AwaitingReturn), vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn test_reset_forgets_everything() {
        let source = Arc::new(FakeSource::new().with_bulk(keyed(&[("r1", handover_status("h1"))])));
        let coordinator = ProtocolCoordinator::new(source.clone(), CoordinatorConfig::default());
        coordinator.load_status().await.unwrap();
        coordinator.load_detail("r1").await.unwrap();

        coordinator.reset();

        assert!(!coordinator.is_status_loaded());
        assert_eq!(coordinator.status("r1"), ProtocolStatus::default());
        assert!(coordinator.cached_detail("r1").is_none());
        assert_eq!(coordinator.load_status().await.unwrap(), BulkLoadOutcome::Loaded(1));
    }

    #[tokio::test]
    async fn test_reset_discards_in_flight_loads() {
        let source = Arc::new(
            FakeSource::gated()
                .with_bulk(keyed(&[("r1", handover_status("h1"))]))
                .with_protocols(
                    "r1",
                    RentalProtocols {
                        handover_protocols: vec![record("h1", "2024-01-01")],
                        return_protocols: vec![],
                    },
                ),
        );
        let coordinator = ProtocolCoordinator::new(source.clone(), CoordinatorConfig::default());

        let mut bulk = Box::pin(coordinator.load_status());
        let mut detail = Box::pin(coordinator.load_detail("r1"));
        assert!(poll!(&mut bulk).is_pending());
        assert!(poll!(&mut detail).is_pending());

        coordinator.reset();
        assert!(!coordinator.is_loading("r1"));

        source.release(2);
        let loaded = detail.await.unwrap();
        assert_eq!(loaded.handover.as_ref().map(|r| r.id.as_str()), Some("h1"));
        assert_eq!(bulk.await.unwrap(), BulkLoadOutcome::Discarded);

        assert!(coordinator.cached_detail("r1").is_none());
        assert_eq!(coordinator.status("r1"), ProtocolStatus::default());
        assert!(!coordinator.is_status_loaded());
        assert_eq!(coordinator.known_rentals(), 0);

        // The new session loads normally
        source.release(1);
        assert_eq!(coordinator.load_status().await.unwrap(), BulkLoadOutcome::Loaded(1));
    }

    #[tokio::test]
    async fn test_invalidate() {
        let source = Arc::new(FakeSource::new());
        let coordinator = ProtocolCoordinator::new(source.clone(), CoordinatorConfig::default());
        coordinator.load_detail("r1").await.unwrap();

        assert!(coordinator.invalidate("r1"));
        assert!(!coordinator.invalidate("r1"));
        assert!(coordinator.cached_detail("r1").is_none());
    }
}
