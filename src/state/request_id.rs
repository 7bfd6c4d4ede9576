use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local request id source: a random seed mixed with a counter, so
/// ids are unique without a syscall per request.
#[derive(Debug)]
pub struct RequestIdGenerator {
    seed: u128,
    counter: AtomicU64,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        let seed_hi = u128::from(fastrand::u64(..));
        let seed_lo = u128::from(fastrand::u64(..));
        Self::with_seed((seed_hi << 64) | seed_lo)
    }

    /// Generator with a fixed seed; replays and tests get stable ids.
    #[must_use]
    pub fn with_seed(seed: u128) -> Self {
        Self {
            seed,
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> uuid::Uuid {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        uuid::Uuid::from_u128(self.seed ^ u128::from(seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_ids_repeat_across_generators() {
        let a = RequestIdGenerator::with_seed(42);
        let b = RequestIdGenerator::with_seed(42);
        assert_eq!(a.next_id(), b.next_id());
        assert_ne!(a.next_id(), a.next_id());
    }
}
