//! Thread-safe monotonic id source.

use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe counter that only ever moves forward.
///
/// Used as the id source for builds, workers, and event-log records so
/// that ids are strictly increasing across the process lifetime.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a counter whose next `increment()` returns `start + 1`.
    pub const fn starting_at(start: u64) -> Self {
        Self { value: AtomicU64::new(start) }
    }

    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    /// Atomically advance the counter and return the new value.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current value without advancing the counter.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn increments_are_strictly_increasing() {
        let counter = Counter::new();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.increment(), 3);
    }

    #[test]
    fn concurrent_increments_never_collide() {
        let counter = Arc::new(Counter::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                (0..500).map(|_| counter.increment()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        let mut expected: Vec<u64> = (1..=4000).collect();
        expected.sort_unstable();
        assert_eq!(all, expected, "every increment must be unique and contiguous");
    }

    proptest::proptest! {
        #[test]
        fn increments_are_always_start_plus_n(start in 0u64..1_000_000, n in 0usize..200) {
            let counter = Counter::starting_at(start);
            let mut last = start;
            for _ in 0..n {
                let next = counter.increment();
                proptest::prop_assert_eq!(next, last + 1);
                last = next;
            }
            proptest::prop_assert_eq!(counter.value(), last);
        }
    }
}
