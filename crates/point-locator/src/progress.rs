//! Cooperative cancellation for long-running operations.
//!
//! Build and merge are fork-join parallel passes that never block on I/O;
//! the only way to interrupt them is a cooperative check. Callers install a
//! callback that returns `false` to cancel, and the locator polls it at
//! coarse granularity (between parallel phases, and once per batch inside
//! serial sweeps) so the check never becomes a point of contention.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let stop = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&stop);
//! locator.set_abort_callback(Some(Box::new(move || !flag.load(Ordering::Relaxed))));
//! ```

/// Callback polled during expensive operations.
///
/// Return `true` to continue processing, `false` to cancel. The callback
/// may be invoked concurrently from worker threads and must be cheap.
pub type AbortCallback = Box<dyn Fn() -> bool + Send + Sync>;

/// How many items are processed between abort checks in serial sweeps.
pub(crate) const ABORT_CHECK_INTERVAL: usize = 1024;

/// Batched poller around an optional [`AbortCallback`].
///
/// `check(i)` polls the callback only when `i` crosses a batch boundary,
/// and latches the result so subsequent calls stay cheap after a cancel.
pub(crate) struct AbortChecker<'a> {
    callback: Option<&'a AbortCallback>,
    aborted: bool,
}

impl<'a> AbortChecker<'a> {
    pub(crate) fn new(callback: Option<&'a AbortCallback>) -> Self {
        Self {
            callback,
            aborted: false,
        }
    }

    /// Poll at batch granularity; returns true once cancelled.
    #[inline]
    pub(crate) fn check(&mut self, index: usize) -> bool {
        if self.aborted {
            return true;
        }
        if index % ABORT_CHECK_INTERVAL == 0 {
            if let Some(cb) = self.callback {
                if !cb() {
                    self.aborted = true;
                }
            }
        }
        self.aborted
    }

    /// Poll unconditionally (used between parallel phases).
    #[inline]
    pub(crate) fn check_now(&mut self) -> bool {
        if self.aborted {
            return true;
        }
        if let Some(cb) = self.callback {
            if !cb() {
                self.aborted = true;
            }
        }
        self.aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_no_callback_never_aborts() {
        let mut checker = AbortChecker::new(None);
        assert!(!checker.check(0));
        assert!(!checker.check_now());
    }

    #[test]
    fn test_abort_latches() {
        let cb: AbortCallback = Box::new(|| false);
        let mut checker = AbortChecker::new(Some(&cb));
        assert!(checker.check_now());
        assert!(checker.check(1)); // latched, even off a batch boundary
    }

    #[test]
    fn test_batched_polling() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&calls);
        let cb: AbortCallback = Box::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            true
        });
        let mut checker = AbortChecker::new(Some(&cb));
        for i in 0..ABORT_CHECK_INTERVAL * 3 {
            checker.check(i);
        }
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }
}
