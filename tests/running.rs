//! tests/running.rs
//! Running-invocation tracking, blocking jobs and draining.

mod common;

use crate::common::{build_scheduler, job_count_after, job_count_before, setup_tracing, wait_until};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tickkeeper::{JobOptions, ShutdownMode};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_job_drained_by_terminate_all_jobs() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));

  let job = scheduler
    .schedule_in(
      "0s",
      JobOptions::new().blocking(true),
      job_count_after(counter.clone(), StdDuration::from_secs(1)),
    )
    .unwrap();

  tokio::time::sleep(StdDuration::from_millis(400)).await;
  assert_eq!(scheduler.jobs(), vec![job.clone()], "running one-shot stays listed");
  assert_eq!(counter.load(Ordering::SeqCst), 0);
  assert!(job.is_running());

  scheduler.terminate_all_jobs().await;

  assert_eq!(counter.load(Ordering::SeqCst), 1);
  assert!(scheduler.jobs().is_empty());
  assert!(scheduler.running_jobs().is_empty());
  assert!(scheduler.job_threads().is_empty());

  scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_job_runs_on_scheduler_thread() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let seen = Arc::new(Mutex::new(None::<String>));

  let seen_clone = seen.clone();
  scheduler
    .schedule_in("0s", JobOptions::new().blocking(true), move || {
      let seen = seen_clone.clone();
      async move {
        *seen.lock() = std::thread::current().name().map(str::to_string);
        Ok(())
      }
    })
    .unwrap();

  assert!(wait_until(StdDuration::from_secs(2), || seen.lock().is_some()).await);
  assert_eq!(seen.lock().as_deref(), Some(scheduler.thread_name()));

  scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocking_job_delays_later_firings() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let blocking_done = Arc::new(Mutex::new(None::<Instant>));
  let other_started = Arc::new(Mutex::new(None::<Instant>));

  let done = blocking_done.clone();
  scheduler
    .schedule_in("0s", JobOptions::new().blocking(true), move || {
      let done = done.clone();
      async move {
        tokio::time::sleep(StdDuration::from_millis(500)).await;
        *done.lock() = Some(Instant::now());
        Ok(())
      }
    })
    .unwrap();
  let started = other_started.clone();
  scheduler
    .schedule_in("0.1s", JobOptions::new(), move || {
      let started = started.clone();
      async move {
        *started.lock() = Some(Instant::now());
        Ok(())
      }
    })
    .unwrap();

  assert!(wait_until(StdDuration::from_secs(3), || other_started.lock().is_some()).await);
  let done_at = blocking_done.lock().expect("blocking job should have finished first");
  let started_at = other_started.lock().unwrap();
  assert!(started_at >= done_at, "loop dispatched while a blocking job was running");

  scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_running_jobs_deduplicates_overlapping_invocations() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));

  let job = scheduler
    .schedule_every(
      "0.3s",
      JobOptions::new(),
      job_count_before(counter.clone(), StdDuration::from_secs(5)),
    )
    .unwrap();

  tokio::time::sleep(StdDuration::from_millis(1500)).await;

  assert_eq!(scheduler.running_jobs(), vec![job.clone()]);
  let threads = scheduler.job_threads();
  assert!(threads.len() >= 3, "expected overlapping invocations, got {}", threads.len());
  assert!(threads.iter().all(|instance| instance.job_id == job.id() && !instance.blocking));
  assert!(job.running_count() >= 3);
  assert!(counter.load(Ordering::SeqCst) >= 3);

  scheduler.shutdown(ShutdownMode::Kill).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_introspection_is_scoped_per_scheduler() {
  setup_tracing();
  let first = build_scheduler().unwrap();
  let second = build_scheduler().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));

  let job_a = first
    .schedule_in("0s", JobOptions::new(), job_count_before(counter.clone(), StdDuration::from_secs(2)))
    .unwrap();
  let job_b = second
    .schedule_in("0s", JobOptions::new(), job_count_before(counter.clone(), StdDuration::from_secs(2)))
    .unwrap();

  assert!(wait_until(StdDuration::from_secs(1), || counter.load(Ordering::SeqCst) == 2).await);

  assert_eq!(first.running_jobs(), vec![job_a.clone()]);
  assert_eq!(second.running_jobs(), vec![job_b.clone()]);
  let first_ids: HashSet<_> = first.job_threads().iter().map(|i| i.job_id).collect();
  let second_ids: HashSet<_> = second.job_threads().iter().map(|i| i.job_id).collect();
  assert_eq!(first_ids, HashSet::from([job_a.id()]));
  assert_eq!(second_ids, HashSet::from([job_b.id()]));

  first.shutdown(ShutdownMode::Kill).await;
  second.shutdown(ShutdownMode::Kill).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminate_all_jobs_waits_for_worker_tasks() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));

  for _ in 0..3 {
    scheduler
      .schedule_in("0s", JobOptions::new(), job_count_after(counter.clone(), StdDuration::from_millis(600)))
      .unwrap();
  }
  scheduler
    .schedule_every("1h", JobOptions::new(), job_count_after(counter.clone(), StdDuration::ZERO))
    .unwrap();

  assert!(wait_until(StdDuration::from_secs(1), || scheduler.job_threads().len() == 3).await);
  scheduler.terminate_all_jobs().await;

  assert_eq!(counter.load(Ordering::SeqCst), 3, "every in-flight body completed");
  assert!(scheduler.jobs().is_empty());
  assert!(scheduler.running_jobs().is_empty());
  assert!(!scheduler.is_shutdown(), "terminate_all_jobs leaves the loop running");

  // The scheduler still accepts work afterwards.
  scheduler
    .schedule_in("0s", JobOptions::new(), job_count_after(counter.clone(), StdDuration::ZERO))
    .unwrap();
  assert!(wait_until(StdDuration::from_secs(1), || counter.load(Ordering::SeqCst) == 4).await);

  scheduler.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_shot_listed_while_its_worker_runs() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));

  let job = scheduler
    .schedule_in("0s", JobOptions::new(), job_count_before(counter.clone(), StdDuration::from_millis(500)))
    .unwrap();

  assert!(wait_until(StdDuration::from_secs(1), || counter.load(Ordering::SeqCst) == 1).await);
  assert_eq!(scheduler.jobs(), vec![job.clone()]);
  assert_eq!(scheduler.running_jobs(), vec![job.clone()]);
  assert_eq!(job.next_time(), None);

  assert!(wait_until(StdDuration::from_secs(2), || scheduler.jobs().is_empty()).await);
  assert!(scheduler.running_jobs().is_empty());

  scheduler.stop().await;
}
