use std::sync::Arc;

use thiserror::Error;

use crate::models::ProtocolKind;

/// A failed per-rental protocol load.
///
/// Clonable so that every caller coalesced onto one in-flight load receives
/// the same failure; `cause` is shared, not copied.
#[derive(Error, Debug, Clone)]
pub enum LoadError {
    #[error("Failed to load protocols for rental {rental_id}: {cause:#}")]
    Fetch {
        rental_id: String,
        cause: Arc<anyhow::Error>,
    },
}

impl LoadError {
    pub fn rental_id(&self) -> &str {
        match self {
            LoadError::Fetch { rental_id, .. } => rental_id,
        }
    }

    pub fn cause(&self) -> &Arc<anyhow::Error> {
        match self {
            LoadError::Fetch { cause, .. } => cause,
        }
    }
}

/// The one-shot bulk status read failed; the overlay is unchanged and the
/// load may be retried.
#[derive(Error, Debug)]
#[error("Failed to load bulk protocol status: {cause:#}")]
pub struct BulkLoadError {
    pub cause: anyhow::Error,
}

/// A create/update call failed; the caches were not touched.
#[derive(Error, Debug)]
#[error("Failed to save {kind} protocol for rental {rental_id}: {cause:#}")]
pub struct MutationError {
    pub rental_id: String,
    pub kind: ProtocolKind,
    pub cause: anyhow::Error,
}
