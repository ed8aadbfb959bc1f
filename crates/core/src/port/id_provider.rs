// ID Provider Port (for deterministic testing)

/// ID provider interface
///
/// Implementations must hand out ids that sort (lexicographically) in the
/// order they were generated within one process; pipe age is derived from it.
pub trait IdProvider: Send + Sync {
    /// Generate a new unique, time-ordered id
    fn generate_id(&self) -> String;
}

/// UUID v7 provider (production)
///
/// `Uuid::now_v7` keeps a monotonic counter within the process, so ids
/// generated in the same millisecond still sort in creation order.
pub struct TimeOrderedIdProvider;

impl IdProvider for TimeOrderedIdProvider {
    fn generate_id(&self) -> String {
        uuid::Uuid::now_v7().to_string()
    }
}

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Deterministic ids: "id-00000000000000000001", "id-00000000000000000002", ...
    #[derive(Default)]
    pub struct SequentialIdProvider {
        counter: AtomicU64,
    }

    impl SequentialIdProvider {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl IdProvider for SequentialIdProvider {
        fn generate_id(&self) -> String {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            format!("id-{:020}", n)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::SequentialIdProvider;
    use super::*;

    #[test]
    fn test_time_ordered_ids_sort_in_creation_order() {
        let provider = TimeOrderedIdProvider;
        let ids: Vec<String> = (0..100).map(|_| provider.generate_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_sequential_ids_sort_lexicographically() {
        let provider = SequentialIdProvider::new();
        let a = provider.generate_id();
        let b = provider.generate_id();
        assert!(a < b);
        assert_eq!(a, "id-00000000000000000001");
    }
}
