//! Testing infrastructure for chronokv
//!
//! Available to the crate's own tests and, through the `testing` feature,
//! to integration tests and dependent crates.
//!
//! # Usage
//!
//! ```rust,no_run
//! use chronokv_core::testing::TestContext;
//!
//! #[test]
//! fn my_test() {
//!     let ctx = TestContext::new();
//!     let store = ctx.open_store("node-a");
//!     // directory removed when ctx is dropped
//! }
//! ```

mod context;

pub use context::{TEST_MAP_SIZE, TestContext};

use std::time::Duration;

/// Poll `condition` every 20 ms until it holds or `timeout` elapses
///
/// Returns whether the condition was eventually met.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_until_polls_until_true() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let met = wait_until(Duration::from_secs(1), move || {
            seen.fetch_add(1, Ordering::SeqCst) >= 2
        })
        .await;
        assert!(met);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(50), || false).await);
    }
}
