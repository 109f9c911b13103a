use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::{ProtocolKind, ProtocolSet, StatusPatch};

use super::{lock, LoadError, ProtocolCoordinator};

pub(super) type SharedLoad = Shared<BoxFuture<'static, Result<Arc<ProtocolSet>, LoadError>>>;

/// Marker for a protocol fetch in flight. At most one exists per rental.
pub(super) struct LoadTicket {
    id: u64,
    load: SharedLoad,
}

impl ProtocolCoordinator {
    /// Load the latest handover/return protocols of one rental.
    ///
    /// Concurrent calls for the same rental share a single fetch and all
    /// observe the same `Arc` (or the same failure). Failures are not cached:
    /// once a load settles, the next call fetches again.
    pub async fn load_detail(&self, rental_id: &str) -> Result<Arc<ProtocolSet>, LoadError> {
        self.ticket_for(rental_id).await
    }

    /// Whether a fetch for this rental is currently in flight.
    pub fn is_loading(&self, rental_id: &str) -> bool {
        lock(&self.inner.tickets).contains_key(rental_id)
    }

    pub fn loads_in_flight(&self) -> usize {
        lock(&self.inner.tickets).len()
    }

    /// Join the outstanding load for `rental_id`, or register a new one.
    ///
    /// Inside a tokio runtime the fetch runs as its own task, so it completes
    /// and fills the cache even if every caller stops waiting. Outside one the
    /// returned future is lazy and the fetch starts on first poll.
    pub(super) fn ticket_for(&self, rental_id: &str) -> SharedLoad {
        let mut tickets = lock(&self.inner.tickets);

        if let Some(ticket) = tickets.get(rental_id) {
            debug!(rental_id, ticket = ticket.id, "Joining in-flight protocol load");
            return ticket.load.clone();
        }

        let ticket_id = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let generation = self.inner.generation();
        let epochs = lock(&self.inner.details).epochs(rental_id);
        let fetch = self
            .clone()
            .fetch_detail(rental_id.to_string(), ticket_id, generation, epochs);

        let load = match Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(fetch);
                self.clone()
                    .join_fetch(rental_id.to_string(), ticket_id, task)
                    .boxed()
                    .shared()
            }
            Err(_) => fetch.boxed().shared(),
        };

        tickets.insert(
            rental_id.to_string(),
            LoadTicket {
                id: ticket_id,
                load: load.clone(),
            },
        );
        load
    }

    /// Wait for a spawned fetch. A task that panicked or was cancelled with
    /// its runtime becomes an ordinary load failure.
    async fn join_fetch(
        self,
        rental_id: String,
        ticket_id: u64,
        task: JoinHandle<Result<Arc<ProtocolSet>, LoadError>>,
    ) -> Result<Arc<ProtocolSet>, LoadError> {
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(rental_id = %rental_id, error = %e, "Protocol load task did not finish");
                self.clear_ticket(&rental_id, ticket_id);
                Err(LoadError::Fetch {
                    rental_id,
                    cause: Arc::new(anyhow::anyhow!("Protocol load task failed: {}", e)),
                })
            }
        }
    }

    async fn fetch_detail(
        self,
        rental_id: String,
        ticket_id: u64,
        generation: u64,
        epochs: [u64; 2],
    ) -> Result<Arc<ProtocolSet>, LoadError> {
        debug!(rental_id = %rental_id, ticket = ticket_id, "Loading protocols for rental");

        let outcome = match self.inner.source.fetch_rental_protocols(&rental_id).await {
            Ok(raw) => {
                let fetched = ProtocolSet::from_raw(&raw);
                let stored = self.store_fetched(&rental_id, fetched, generation, epochs);
                self.record_presence(&rental_id, &stored, generation);
                debug!(
                    rental_id = %rental_id,
                    handover_count = raw.handover_protocols.len(),
                    return_count = raw.return_protocols.len(),
                    "Protocols loaded for rental"
                );
                Ok(stored)
            }
            Err(cause) => {
                warn!(rental_id = %rental_id, error = %format!("{:#}", cause), "Failed to load protocols");
                Err(LoadError::Fetch {
                    rental_id: rental_id.clone(),
                    cause: Arc::new(cause),
                })
            }
        };

        self.clear_ticket(&rental_id, ticket_id);
        outcome
    }

    /// Cache a fetched set. Kinds written by `on_mutation_success` after this
    /// fetch started keep their reconciled record, even if the cached entry
    /// was invalidated or evicted in the meantime. A fetch from before the
    /// last `reset` is handed back without being cached.
    fn store_fetched(
        &self,
        rental_id: &str,
        mut fetched: ProtocolSet,
        generation: u64,
        started: [u64; 2],
    ) -> Arc<ProtocolSet> {
        let mut details = lock(&self.inner.details);
        let current = details.epochs(rental_id);

        for (i, kind) in ProtocolKind::ALL.into_iter().enumerate() {
            if current[i] == started[i] {
                continue;
            }
            if let Some(record) = details.reconciled(rental_id, kind) {
                debug!(rental_id, %kind, protocol_id = %record.id, "Keeping reconciled protocol over fetched one");
                fetched.set(kind, record.clone());
            }
        }

        let stored = Arc::new(fetched);
        if self.inner.generation() != generation {
            debug!(rental_id, "Protocol load finished after reset, not caching");
            return stored;
        }
        details.insert(rental_id, Arc::clone(&stored));
        stored
    }

    /// Bring the overlay in line with what a detail load found.
    fn record_presence(&self, rental_id: &str, set: &ProtocolSet, generation: u64) {
        let mut overlay = lock(&self.inner.overlay);
        if self.inner.generation() != generation {
            return;
        }
        for kind in ProtocolKind::ALL {
            if let Some(record) = set.get(kind) {
                overlay.patch(rental_id, &StatusPatch::present(kind, record.id.clone()));
            }
        }
    }

    fn clear_ticket(&self, rental_id: &str, ticket_id: u64) {
        let mut tickets = lock(&self.inner.tickets);
        if tickets.get(rental_id).is_some_and(|t| t.id == ticket_id) {
            tickets.remove(rental_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::models::{ProtocolRecord, RentalProtocols};
    use crate::testing::{record, FakeSource};
    use futures::poll;
    use pretty_assertions::assert_eq;

    fn protocols(handover: Vec<ProtocolRecord>, returns: Vec<ProtocolRecord>) -> RentalProtocols {
        RentalProtocols {
            handover_protocols: handover,
            return_protocols: returns,
        }
    }

    fn coordinator(source: &Arc<FakeSource>) -> ProtocolCoordinator {
        ProtocolCoordinator::new(source.clone(), CoordinatorConfig::default())
    }

    #[tokio::test]
    async fn test_load_detail_picks_latest_and_caches() {
        let source = Arc::new(FakeSource::new().with_protocols(
            "r1",
            protocols(
                vec![record("h-old", "2024-01-01"), record("h-new", "2024-01-03")],
                vec![record("ret1", "2024-01-05")],
            ),
        ));
        let coordinator = coordinator(&source);

        let detail = coordinator.load_detail("r1").await.unwrap();
        assert_eq!(detail.handover.as_ref().map(|r| r.id.as_str()), Some("h-new"));
        assert_eq!(detail.return_protocol.as_ref().map(|r| r.id.as_str()), Some("ret1"));

        let cached = coordinator.cached_detail("r1").unwrap();
        assert!(Arc::ptr_eq(&detail, &cached));
        assert!(!coordinator.is_loading("r1"));
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_fetch() {
        let source = Arc::new(
            FakeSource::gated().with_protocols("r1", protocols(vec![record("h1", "2024-01-01")], vec![])),
        );
        let coordinator = coordinator(&source);

        let mut first = Box::pin(coordinator.load_detail("r1"));
        let mut second = Box::pin(coordinator.load_detail("r1"));
        assert!(poll!(&mut first).is_pending());
        assert!(poll!(&mut second).is_pending());
        assert!(coordinator.is_loading("r1"));
        assert_eq!(coordinator.loads_in_flight(), 1);

        source.release(1);
        let (a, b) = tokio::join!(first, second);
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(source.detail_calls(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!coordinator.is_loading("r1"));
    }

    #[tokio::test]
    async fn test_many_concurrent_loads_one_fetch() {
        let source = Arc::new(FakeSource::gated());
        let coordinator = coordinator(&source);

        let mut loads: Vec<_> = (0..8).map(|_| Box::pin(coordinator.load_detail("r1"))).collect();
        for load in loads.iter_mut() {
            assert!(poll!(load).is_pending());
        }

        source.release(1);
        let results = futures::future::join_all(loads).await;
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(source.detail_calls(), 1);
    }

    #[tokio::test]
    async fn test_different_rentals_load_independently() {
        let source = Arc::new(FakeSource::new());
        let coordinator = coordinator(&source);

        let (a, b) = tokio::join!(coordinator.load_detail("r1"), coordinator.load_detail("r2"));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(source.detail_calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_reaches_all_callers_and_is_not_cached() {
        let source = Arc::new(FakeSource::gated());
        source.fail_rental("r1");
        let coordinator = coordinator(&source);

        let mut first = Box::pin(coordinator.load_detail("r1"));
        let mut second = Box::pin(coordinator.load_detail("r1"));
        assert!(poll!(&mut first).is_pending());
        assert!(poll!(&mut second).is_pending());

        source.release(1);
        let (a, b) = tokio::join!(first, second);
        let (a, b) = (a.unwrap_err(), b.unwrap_err());

        assert!(Arc::ptr_eq(a.cause(), b.cause()));
        assert_eq!(a.rental_id(), "r1");
        assert!(!coordinator.is_loading("r1"));
        assert!(coordinator.cached_detail("r1").is_none());

        // Retry goes back to the source
        source.recover_rental("r1");
        source.release(1);
        assert!(coordinator.load_detail("r1").await.is_ok());
        assert_eq!(source.detail_calls(), 2);
    }

    #[tokio::test]
    async fn test_sequential_loads_refetch() {
        let source = Arc::new(FakeSource::new());
        let coordinator = coordinator(&source);

        coordinator.load_detail("r1").await.unwrap();
        coordinator.load_detail("r1").await.unwrap();
        assert_eq!(source.detail_calls(), 2);
    }

    #[tokio::test]
    async fn test_load_patches_overlay_presence() {
        let source = Arc::new(
            FakeSource::new().with_protocols("r1", protocols(vec![record("h1", "2024-01-01")], vec![])),
        );
        let coordinator = coordinator(&source);

        coordinator.load_detail("r1").await.unwrap();
        let status = coordinator.status("r1");
        assert!(status.has_handover_protocol);
        assert!(!status.has_return_protocol);
        assert_eq!(status.handover_protocol_id.as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn test_dropped_load_still_fills_cache() {
        let source = Arc::new(
            FakeSource::gated().with_protocols("r1", protocols(vec![record("h1", "2024-01-01")], vec![])),
        );
        let coordinator = coordinator(&source);

        {
            let mut only_caller = Box::pin(coordinator.load_detail("r1"));
            assert!(poll!(&mut only_caller).is_pending());
        }

        source.release(1);
        while coordinator.is_loading("r1") {
            tokio::task::yield_now().await;
        }

        let cached = coordinator.cached_detail("r1").unwrap();
        assert_eq!(cached.handover.as_ref().map(|r| r.id.as_str()), Some("h1"));
        assert!(coordinator.status("r1").has_handover_protocol);
        assert_eq!(source.detail_calls(), 1);
    }

    #[test]
    fn test_load_outside_runtime_runs_on_poll() {
        let source = Arc::new(
            FakeSource::new().with_protocols("r1", protocols(vec![record("h1", "2024-01-01")], vec![])),
        );
        let coordinator = coordinator(&source);

        let detail = futures::executor::block_on(coordinator.load_detail("r1")).unwrap();
        assert_eq!(detail.handover.as_ref().map(|r| r.id.as_str()), Some("h1"));
        assert!(!coordinator.is_loading("r1"));
        assert_eq!(source.detail_calls(), 1);
    }

    #[tokio::test]
    async fn test_reconciled_record_survives_invalidation_during_load() {
        let source = Arc::new(
            FakeSource::gated().with_protocols("r1", protocols(vec![record("h1", "2024-01-01")], vec![])),
        );
        let coordinator = coordinator(&source);

        let mut load = Box::pin(coordinator.load_detail("r1"));
        assert!(poll!(&mut load).is_pending());

        coordinator.on_mutation_success("r1", ProtocolKind::Return, record("ret1", "2024-01-02"));
        assert!(coordinator.invalidate("r1"));

        source.release(1);
        let detail = load.await.unwrap();
        assert_eq!(detail.handover.as_ref().map(|r| r.id.as_str()), Some("h1"));
        assert_eq!(detail.return_protocol.as_ref().map(|r| r.id.as_str()), Some("ret1"));

        let cached = coordinator.cached_detail("r1").unwrap();
        assert!(Arc::ptr_eq(&detail, &cached));
        assert_eq!(coordinator.status("r1").return_protocol_id.as_deref(), Some("ret1"));
    }

    #[tokio::test]
    async fn test_abandoned_load_is_resumed_by_next_caller() {
        let source = Arc::new(FakeSource::gated());
        let coordinator = coordinator(&source);

        {
            let mut abandoned = Box::pin(coordinator.load_detail("r1"));
            assert!(poll!(&mut abandoned).is_pending());
        }
        assert!(coordinator.is_loading("r1"));

        source.release(1);
        coordinator.load_detail("r1").await.unwrap();
        assert_eq!(source.detail_calls(), 1);
        assert!(!coordinator.is_loading("r1"));
    }
}
