//! In-memory caches owned by the coordinator.
//!
//! - `StatusOverlay`: presence flags for every rental, loaded in bulk once and
//!   then patched in place
//! - `DetailCache`: full protocol sets, filled lazily per rental
//! - `selector`: picks the authoritative record among several of one kind
//!
//! Nothing here is persisted; both caches live for one session.

pub mod detail;
pub mod overlay;
pub mod selector;

pub use detail::DetailCache;
pub use overlay::StatusOverlay;
pub use selector::pick_latest;
