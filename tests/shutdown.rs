//! tests/shutdown.rs
//! Tests for graceful, terminating and forced shutdown.

mod common;

use crate::common::{build_scheduler, job_count_after, job_count_before, setup_tracing, wait_until};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tickkeeper::{JobOptions, ScheduleError, ShutdownMode};
use tracing::info;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_clears_uptime_and_rejects_new_jobs() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  scheduler
    .schedule_every("1h", JobOptions::new(), job_count_after(counter.clone(), StdDuration::ZERO))
    .unwrap();

  assert!(scheduler.uptime().is_some());
  scheduler.shutdown(ShutdownMode::Graceful).await;

  assert!(scheduler.is_shutdown());
  assert_eq!(scheduler.uptime(), None);
  assert_eq!(scheduler.uptime_s(), None);
  assert_eq!(scheduler.start_time(), None);
  assert!(scheduler.jobs().is_empty(), "shutdown unschedules every job");

  let result = scheduler.schedule_in("0s", JobOptions::new(), job_count_after(counter, StdDuration::ZERO));
  assert_eq!(result.unwrap_err(), ScheduleError::SchedulerShutdown);

  tokio::time::timeout(StdDuration::from_secs(2), scheduler.join())
    .await
    .expect("loop thread should exit after shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_graceful_shutdown_does_not_wait_for_jobs() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let started = Arc::new(AtomicUsize::new(0));
  let finished = Arc::new(AtomicUsize::new(0));

  let started_clone = started.clone();
  let finished_clone = finished.clone();
  scheduler
    .schedule_in("0s", JobOptions::new(), move || {
      let started = started_clone.clone();
      let finished = finished_clone.clone();
      async move {
        started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(StdDuration::from_secs(1)).await;
        finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    })
    .unwrap();
  assert!(wait_until(StdDuration::from_secs(1), || started.load(Ordering::SeqCst) == 1).await);

  info!("Initiating graceful shutdown while job running...");
  let shutdown_start = Instant::now();
  scheduler.stop().await;
  assert!(
    shutdown_start.elapsed() < StdDuration::from_millis(500),
    "graceful shutdown should not wait for in-flight jobs"
  );
  assert_eq!(finished.load(Ordering::SeqCst), 0);

  // The in-flight invocation still runs to completion.
  assert!(wait_until(StdDuration::from_secs(2), || finished.load(Ordering::SeqCst) == 1).await);
  assert!(scheduler.running_jobs().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_terminate_shutdown_waits_for_jobs() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));

  scheduler
    .schedule_in("0s", JobOptions::new(), job_count_after(counter.clone(), StdDuration::from_millis(800)))
    .unwrap();
  scheduler
    .schedule_in("0s", JobOptions::new().blocking(true), job_count_after(counter.clone(), StdDuration::from_millis(400)))
    .unwrap();
  assert!(wait_until(StdDuration::from_secs(1), || scheduler.job_threads().len() == 2).await);

  scheduler.shutdown(ShutdownMode::Terminate).await;

  assert_eq!(counter.load(Ordering::SeqCst), 2, "terminate waits for every in-flight job");
  assert!(scheduler.running_jobs().is_empty());
  assert!(scheduler.jobs().is_empty());
  assert_eq!(scheduler.uptime(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_aborts_worker_tasks() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let started = Arc::new(AtomicUsize::new(0));
  let finished = Arc::new(AtomicUsize::new(0));

  for _ in 0..2 {
    scheduler
      .schedule_in("0s", JobOptions::new(), job_count_before(started.clone(), StdDuration::from_secs(2)))
      .unwrap();
  }
  scheduler
    .schedule_in("0s", JobOptions::new(), job_count_after(finished.clone(), StdDuration::from_secs(1)))
    .unwrap();
  assert!(wait_until(StdDuration::from_secs(1), || scheduler.job_threads().len() == 3).await);

  scheduler.shutdown(ShutdownMode::Kill).await;

  assert!(scheduler.running_jobs().is_empty());
  assert!(scheduler.job_threads().is_empty());
  assert_eq!(scheduler.get_metrics_snapshot().jobs_killed, 3);

  tokio::time::sleep(StdDuration::from_millis(1500)).await;
  assert_eq!(finished.load(Ordering::SeqCst), 0, "killed job must not finish its work");
  assert_eq!(scheduler.get_metrics_snapshot().instances_running_current, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_drops_blocking_job() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));

  let job = scheduler
    .schedule_in("0s", JobOptions::new().blocking(true), job_count_after(counter.clone(), StdDuration::from_secs(2)))
    .unwrap();
  assert!(wait_until(StdDuration::from_secs(1), || job.is_running()).await);

  let kill_start = Instant::now();
  scheduler.shutdown(ShutdownMode::Kill).await;
  tokio::time::timeout(StdDuration::from_secs(1), scheduler.join())
    .await
    .expect("loop should stop without waiting for the blocking job");
  assert!(kill_start.elapsed() < StdDuration::from_secs(1));

  tokio::time::sleep(StdDuration::from_millis(2200)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 0);
  assert!(!job.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_is_idempotent() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));

  scheduler.stop().await;
  scheduler.stop().await;
  assert!(scheduler.is_shutdown());

  // A later terminate still waits (nothing is running here) and returns.
  tokio::time::timeout(StdDuration::from_secs(2), scheduler.shutdown(ShutdownMode::Terminate))
    .await
    .expect("repeated shutdown should return");
  scheduler.join().await;
  scheduler.join().await;

  assert!(scheduler
    .schedule_every("1s", JobOptions::new(), job_count_after(counter, StdDuration::ZERO))
    .is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_after_graceful_still_aborts() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));

  scheduler
    .schedule_in("0s", JobOptions::new(), job_count_after(counter.clone(), StdDuration::from_secs(1)))
    .unwrap();
  assert!(wait_until(StdDuration::from_secs(1), || scheduler.job_threads().len() == 1).await);

  scheduler.stop().await;
  assert_eq!(scheduler.job_threads().len(), 1, "graceful shutdown leaves the job running");
  scheduler.shutdown(ShutdownMode::Kill).await;
  assert!(scheduler.job_threads().is_empty());

  tokio::time::sleep(StdDuration::from_millis(1300)).await;
  assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dropping_the_handle_stops_the_loop() {
  setup_tracing();
  let scheduler = build_scheduler().unwrap();
  let counter = Arc::new(AtomicUsize::new(0));
  scheduler
    .schedule_every("0.1s", JobOptions::new(), job_count_after(counter.clone(), StdDuration::ZERO))
    .unwrap();
  assert!(wait_until(StdDuration::from_secs(1), || counter.load(Ordering::SeqCst) >= 1).await);

  drop(scheduler);
  tokio::time::sleep(StdDuration::from_millis(200)).await;
  let after_drop = counter.load(Ordering::SeqCst);
  tokio::time::sleep(StdDuration::from_millis(400)).await;
  assert_eq!(counter.load(Ordering::SeqCst), after_drop, "no firing after the handle is dropped");
}
