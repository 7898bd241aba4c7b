//! Process-wide lazily computed values with a reset hook.
//!
//! `std::sync::OnceLock` cannot be cleared, which makes process-wide settings impossible to
//! re-derive between tests. [`Memoized`] computes its value at most once per initialization and
//! exposes [`Memoized::reset`] so test code can force recomputation.

use std::sync::{Arc, PoisonError, RwLock};

pub struct Memoized<T> {
    slot: RwLock<Option<Arc<T>>>,
}

impl<T> Memoized<T> {
    pub const fn new() -> Self {
        Self { slot: RwLock::new(None) }
    }

    /// Return the memoized value, computing it with `init` if absent.
    ///
    /// Concurrent first callers race on the write lock; only the winner runs `init`.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> Arc<T> {
        if let Some(value) = self.slot.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return Arc::clone(value);
        }

        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = slot.as_ref() {
            return Arc::clone(value);
        }
        let value = Arc::new(init());
        *slot = Some(Arc::clone(&value));
        value
    }

    /// Replace the memoized value.
    pub fn set(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&value));
        value
    }

    /// Drop the memoized value so the next [`Memoized::get_or_init`] recomputes it.
    pub fn reset(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl<T> Default for Memoized<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_computes_once_until_reset() {
        let memo: Memoized<usize> = Memoized::new();
        let calls = AtomicUsize::new(0);
        let compute = || calls.fetch_add(1, Ordering::SeqCst) + 100;

        assert_eq!(*memo.get_or_init(compute), 100);
        assert_eq!(*memo.get_or_init(compute), 100);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        memo.reset();
        assert_eq!(*memo.get_or_init(compute), 101);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_init_runs_once() {
        let memo: Memoized<usize> = Memoized::new();
        let calls = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    memo.get_or_init(|| calls.fetch_add(1, Ordering::SeqCst));
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_overrides() {
        let memo: Memoized<&str> = Memoized::new();
        memo.get_or_init(|| "first");
        memo.set("second");
        assert_eq!(*memo.get_or_init(|| "third"), "second");
    }
}
