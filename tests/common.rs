//! tests/common.rs
//! Shared helper functions for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures::future::BoxFuture;
use tickkeeper::{BuildError, JobResult, TickKeeper};
use tracing_subscriber::fmt::TestWriter;

/// Tick interval used by the tests; short so timing assertions stay tight.
pub const TEST_FREQUENCY: StdDuration = StdDuration::from_millis(50);

pub type JobFuture = BoxFuture<'static, JobResult>;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG) // Show debug/trace for scheduler internals
    .with_writer(TestWriter::new()) // Write to test output
    .with_test_writer() // Enable per-test log capture
    .try_init();
}

// Builds a scheduler ticking at `TEST_FREQUENCY`.
pub fn build_scheduler() -> Result<TickKeeper, BuildError> {
  TickKeeper::builder().frequency(TEST_FREQUENCY).build()
}

// Creates a job that sleeps for `delay`, then increments the counter.
pub fn job_count_after(
  counter: Arc<AtomicUsize>,
  delay: StdDuration,
) -> impl Fn() -> JobFuture + Send + Sync + 'static {
  move || {
    let ctr = counter.clone();
    Box::pin(async move {
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      let count = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!("Counter job finished (Count: {})", count);
      Ok(())
    })
  }
}

// Creates a job that increments the counter on start, then sleeps for `delay`.
pub fn job_count_before(
  counter: Arc<AtomicUsize>,
  delay: StdDuration,
) -> impl Fn() -> JobFuture + Send + Sync + 'static {
  move || {
    let ctr = counter.clone();
    Box::pin(async move {
      let count = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!("Counter job started (Count: {})", count);
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      Ok(())
    })
  }
}

// Creates a job that counts its invocations and then fails.
pub fn job_fail(counter: Arc<AtomicUsize>, message: &'static str) -> impl Fn() -> JobFuture + Send + Sync + 'static {
  move || {
    let ctr = counter.clone();
    Box::pin(async move {
      ctr.fetch_add(1, Ordering::SeqCst);
      let result: JobResult = Err(message.into());
      result
    })
  }
}

// Creates a job that counts its invocations and then panics.
pub fn job_panic(counter: Arc<AtomicUsize>) -> impl Fn() -> JobFuture + Send + Sync + 'static {
  move || {
    let ctr = counter.clone();
    Box::pin(async move {
      ctr.fetch_add(1, Ordering::SeqCst);
      // Ensure some async operation happens before panic
      tokio::task::yield_now().await;
      if ctr.load(Ordering::SeqCst) > 0 {
        panic!("Job forced panic!");
      }
      Ok(())
    })
  }
}

// Polls `condition` until it holds or `timeout` elapses. Returns whether it held.
pub async fn wait_until(timeout: StdDuration, condition: impl Fn() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if condition() {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
}
