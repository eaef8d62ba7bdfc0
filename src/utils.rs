use std::sync::atomic::{AtomicU64, Ordering};

pub fn new_fast_hashmap<K, V>(cap: usize) -> ahash::HashMap<K, V> {
    ahash::HashMap::with_capacity_and_hasher(cap, ahash::RandomState::default())
}

/// Server wall-clock in milliseconds since the epoch, the unit every
/// emitted frame and every store column uses.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-locally unique id for a live connection.
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_increasing() {
        let a = next_session_id();
        let b = next_session_id();
        assert!(b > a);
    }
}
