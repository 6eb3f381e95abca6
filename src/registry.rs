//! The job registry: sole owner of live job records.
//!
//! Jobs are indexed by id in a map, and the ones with a pending fire time are
//! also held in a handle-based priority queue keyed by `(next_time, seq)`, so the
//! loop can pop due jobs in ascending due order and unscheduling can remove a
//! queued entry in O(log n). Every mutation goes through the write lock; lookups,
//! listings and the due query only take the read lock.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use priority_queue::PriorityQueue;
use tracing::trace;

use crate::error::ScheduleError;
use crate::job::{Job, JobId, TriggerKind};
use crate::metrics::SchedulerMetrics;

type DueKey = Reverse<(DateTime<Utc>, u64)>;

#[derive(Default)]
struct RegistryInner {
  jobs: HashMap<JobId, Job>,
  due_queue: PriorityQueue<JobId, DueKey>,
}

#[derive(Default)]
pub(crate) struct JobRegistry {
  inner: RwLock<RegistryInner>,
  metrics: SchedulerMetrics,
}

impl JobRegistry {
  pub fn new(metrics: SchedulerMetrics) -> Self {
    Self {
      inner: RwLock::new(RegistryInner::default()),
      metrics,
    }
  }

  fn update_gauge(&self, len: usize) {
    self
      .metrics
      .jobs_registered_current
      .store(len, Ordering::Relaxed);
  }

  pub fn add(&self, job: Job) -> Result<(), ScheduleError> {
    let mut inner = self.inner.write();
    let id = job.id();
    if inner.jobs.contains_key(&id) {
      return Err(ScheduleError::DuplicateId(id));
    }
    if let Some(next) = job.next_time() {
      inner.due_queue.push(id, Reverse((next, job.seq())));
    }
    inner.jobs.insert(id, job);
    SchedulerMetrics::incr(&self.metrics.jobs_scheduled);
    self.update_gauge(inner.jobs.len());
    Ok(())
  }

  /// Removes the job and marks it unscheduled. Absent ids are a no-op.
  pub fn remove(&self, id: &JobId) -> Option<Job> {
    let mut inner = self.inner.write();
    inner.due_queue.remove(id);
    let job = inner.jobs.remove(id)?;
    job.mark_unscheduled();
    SchedulerMetrics::incr(&self.metrics.jobs_unscheduled);
    self.update_gauge(inner.jobs.len());
    Some(job)
  }

  pub fn find(&self, id: &JobId) -> Option<Job> {
    self.inner.read().jobs.get(id).cloned()
  }

  /// Scheduled jobs, in registration order.
  pub fn all(&self) -> Vec<Job> {
    let mut jobs: Vec<Job> = self
      .inner
      .read()
      .jobs
      .values()
      .filter(|job| job.is_scheduled())
      .cloned()
      .collect();
    jobs.sort_by_key(Job::seq);
    jobs
  }

  pub fn by_kind(&self, kind: TriggerKind) -> Vec<Job> {
    self
      .all()
      .into_iter()
      .filter(|job| job.kind() == kind)
      .collect()
  }

  pub fn len(&self) -> usize {
    self.inner.read().jobs.len()
  }

  /// Scheduled jobs whose next fire time is at or before `now`, in ascending
  /// due order (ties by registration order). Does not fire anything.
  pub fn due(&self, now: DateTime<Utc>) -> Vec<Job> {
    let inner = self.inner.read();
    let mut due: Vec<(DueKey, Job)> = inner
      .due_queue
      .iter()
      .filter(|(_, Reverse((at, _)))| *at <= now)
      .filter_map(|(id, key)| inner.jobs.get(id).map(|job| (*key, job.clone())))
      .filter(|(_, job)| job.is_scheduled())
      .collect();
    // Reverse keys: the earliest due time is the largest key.
    due.sort_by(|a, b| b.0.cmp(&a.0));
    due.into_iter().map(|(_, job)| job).collect()
  }

  /// Pops the earliest job due at `now`, fires it (records `last_time`,
  /// recomputes `next_time`) and re-queues it under its new fire time if it
  /// has one.
  ///
  /// A fired job's new fire time is always later than `now`, so repeated calls
  /// with the same `now` fire each job at most once. Jobs left without a fire
  /// time stay registered so they keep showing in listings until the caller
  /// retires them.
  pub fn take_next_due(&self, now: DateTime<Utc>) -> Option<Job> {
    let mut inner = self.inner.write();
    loop {
      match inner.due_queue.peek() {
        Some((_, Reverse((at, _)))) if *at <= now => {}
        _ => return None,
      }
      let (id, _) = inner.due_queue.pop()?;
      let Some(job) = inner.jobs.get(&id).cloned() else {
        trace!(job_id = %id, "Discarding queue entry for removed job.");
        continue;
      };
      if !job.fire(now) {
        continue;
      }
      if let Some(next) = job.next_time() {
        inner.due_queue.push(id, Reverse((next, job.seq())));
      }
      return Some(job);
    }
  }

  /// Removes every job, marking each unscheduled. Returns what was removed.
  pub fn clear(&self) -> Vec<Job> {
    let mut inner = self.inner.write();
    inner.due_queue.clear();
    let mut removed: Vec<Job> = inner.jobs.drain().map(|(_, job)| job).collect();
    for job in &removed {
      job.mark_unscheduled();
    }
    removed.sort_by_key(Job::seq);
    SchedulerMetrics::add(&self.metrics.jobs_unscheduled, removed.len());
    self.update_gauge(0);
    removed
  }
}
