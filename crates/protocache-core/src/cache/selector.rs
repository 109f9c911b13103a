use crate::models::ProtocolRecord;

/// Pick the authoritative record: the greatest `createdAt`, falling back to
/// `completedAt`, then to the epoch. On equal timestamps the record later in
/// the slice wins.
pub fn pick_latest(records: &[ProtocolRecord]) -> Option<&ProtocolRecord> {
    // max_by_key yields the last of several equal maxima
    records.iter().max_by_key(|record| record.recency_millis())
}
