use tokio::runtime::Handle;
use tracing::debug;

use super::{lock, ProtocolCoordinator};

impl ProtocolCoordinator {
    /// Start background loads for the first `limit` rentals of a
    /// priority-ordered list, without waiting for them.
    ///
    /// Rentals the overlay knows nothing about are skipped, as are rentals
    /// already cached or already loading. Each load runs as its own task and
    /// a failure is only logged. Returns the number of loads started; outside
    /// a tokio runtime nothing is started.
    pub fn warm<I, S>(&self, rental_ids: I, limit: Option<usize>) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if Handle::try_current().is_err() {
            debug!("No runtime available, skipping protocol preload");
            return 0;
        }
        let limit = limit.unwrap_or(self.inner.config.preload_limit);

        let mut started = 0;
        for rental_id in rental_ids.into_iter().take(limit) {
            let rental_id = rental_id.as_ref();
            if !self.should_warm(rental_id) {
                continue;
            }

            // The fetch task keeps running without a waiter
            drop(self.ticket_for(rental_id));
            started += 1;
        }

        if started > 0 {
            debug!(started, limit, "Protocol preload started");
        }
        started
    }

    fn should_warm(&self, rental_id: &str) -> bool {
        if !lock(&self.inner.overlay).get(rental_id).has_any() {
            return false;
        }
        if lock(&self.inner.details).contains(rental_id) {
            return false;
        }
        !lock(&self.inner.tickets).contains_key(rental_id)
    }
}
