//! # Spin Flag
//!
//! An atomic test-and-set flag with an RAII guard.
//!
//! ## Thread Safety
//!
//! - `try_acquire`: single compare-and-swap, never waits
//! - `acquire_bounded`: at most `spins` attempts, then gives up
//! - `SpinGuard`: releases the flag when dropped

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Non-blocking mutual-exclusion flag.
///
/// There is no `lock()` that waits: callers that fail to
/// acquire must defer their work.
///
/// ## Usage
///
/// ```rust
/// use voxbond_core::SpinFlag;
///
/// let flag = SpinFlag::new();
/// {
///     let _guard = flag.try_acquire().unwrap();
///     assert!(flag.is_held());
///     assert!(flag.try_acquire().is_none());
/// }
/// assert!(!flag.is_held());
/// ```
#[derive(Debug, Default)]
pub struct SpinFlag {
    /// Whether a guard is currently alive.
    held: AtomicBool,
    /// Successful acquisitions since creation.
    acquisitions: AtomicU64,
    /// Failed acquisition attempts since creation.
    contentions: AtomicU64,
}

/// Acquisition counters of a [`SpinFlag`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SpinStats {
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Failed acquisition attempts.
    pub contentions: u64,
}

impl SpinFlag {
    /// Creates a released flag.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
            acquisitions: AtomicU64::new(0),
            contentions: AtomicU64::new(0),
        }
    }

    /// Returns whether the flag is currently held by someone.
    ///
    /// Only a hint: the answer may be stale by the time it is used.
    #[inline]
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Attempts to acquire the flag exactly once.
    #[inline]
    #[must_use]
    pub fn try_acquire(&self) -> Option<SpinGuard<'_>> {
        if self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.acquisitions.fetch_add(1, Ordering::Relaxed);
            Some(SpinGuard { flag: self })
        } else {
            self.contentions.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Attempts to acquire the flag up to `spins` times (at least once).
    #[must_use]
    pub fn acquire_bounded(&self, spins: u32) -> Option<SpinGuard<'_>> {
        spin_until(spins, || self.try_acquire())
    }

    /// Returns the acquisition counters.
    #[must_use]
    pub fn stats(&self) -> SpinStats {
        SpinStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
        }
    }
}

/// Proof of holding a [`SpinFlag`]. Releases on drop.
#[derive(Debug)]
#[must_use = "the flag is released as soon as the guard is dropped"]
pub struct SpinGuard<'a> {
    flag: &'a SpinFlag,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.flag.held.store(false, Ordering::Release);
    }
}

/// Calls `attempt` until it yields `Some`, at most `spins` times (at least once).
///
/// Used for every bounded try-acquire in the crate, including the
/// `parking_lot` check locks which are only ever `try_lock`ed.
pub fn spin_until<T>(spins: u32, mut attempt: impl FnMut() -> Option<T>) -> Option<T> {
    for _ in 0..spins.max(1) {
        if let Some(value) = attempt() {
            return Some(value);
        }
        std::hint::spin_loop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_flag_released_on_drop() {
        let flag = SpinFlag::new();
        let guard = flag.try_acquire();
        assert!(guard.is_some());
        assert!(flag.is_held());

        drop(guard);
        assert!(!flag.is_held());
        assert!(flag.try_acquire().is_some());
    }

    #[test]
    fn test_contention_counted() {
        let flag = SpinFlag::new();
        let _guard = flag.try_acquire().unwrap();

        assert!(flag.acquire_bounded(8).is_none());

        let stats = flag.stats();
        assert_eq!(stats.acquisitions, 1);
        assert_eq!(stats.contentions, 8);
    }

    #[test]
    fn test_spin_until_zero_spins_tries_once() {
        let mut calls = 0;
        let result: Option<()> = spin_until(0, || {
            calls += 1;
            None
        });
        assert!(result.is_none());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let flag = Arc::new(SpinFlag::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flag = Arc::clone(&flag);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        if let Some(_guard) = flag.try_acquire() {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!flag.is_held());
    }
}
