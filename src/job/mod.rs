pub mod trigger;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::CallbackError;
pub use trigger::{Trigger, TriggerKind};

// --- Public Type Aliases ---

/// Unique identifier of a job. Uses UUID v4.
pub type JobId = Uuid;

/// Unique identifier of one invocation (firing) of a job. Uses UUID v4.
pub type InstanceId = Uuid;

/// Error type a job body may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a job body resolves to. `Err` is reported as a [`CallbackError::Failed`].
pub type JobResult = Result<(), BoxError>;

/// The function type that job invocations execute.
///
/// Called once per firing; the returned future is the body of that invocation.
/// Panics inside it are caught and reported as [`CallbackError::Panicked`].
pub type BoxedExecFn =
  Box<dyn Fn() -> Pin<Box<dyn Future<Output = JobResult> + Send + 'static>> + Send + Sync + 'static>;

/// Observer for failed invocations.
pub type ErrorHook = Arc<dyn Fn(&CallbackError) + Send + Sync + 'static>;

/// Whether a job is still eligible to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum JobState {
  Scheduled,
  Unscheduled,
}

// --- Scheduling Options ---

/// Per-job options passed to the `schedule_*` calls.
///
/// ```
/// use tickkeeper::JobOptions;
///
/// let opts = JobOptions::new()
///   .blocking(true)
///   .name("nightly-report")
///   .on_error(|err| eprintln!("report failed: {err}"));
/// assert!(opts.blocking);
/// ```
#[derive(Clone, Default)]
pub struct JobOptions {
  /// Run the body on the scheduler loop's own thread instead of a worker task.
  /// The loop does nothing else until the body returns.
  pub blocking: bool,
  /// A descriptive name, used in logging/tracing.
  pub name: Option<String>,
  /// Receives this job's failures instead of the scheduler-wide hook.
  pub on_error: Option<ErrorHook>,
}

impl JobOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn blocking(mut self, blocking: bool) -> Self {
    self.blocking = blocking;
    self
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn on_error<H>(mut self, hook: H) -> Self
  where
    H: Fn(&CallbackError) + Send + Sync + 'static,
  {
    self.on_error = Some(Arc::new(hook));
    self
  }
}

impl fmt::Debug for JobOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobOptions")
      .field("blocking", &self.blocking)
      .field("name", &self.name)
      .field("on_error", &self.on_error.as_ref().map(|_| "<Fn>"))
      .finish()
  }
}

// --- Core Job Structures ---

/// Mutable timing state, written only through the registry and the scheduler loop.
#[derive(Debug)]
struct JobTimes {
  next_time: Option<DateTime<Utc>>,
  last_time: Option<DateTime<Utc>>,
  state: JobState,
  fire_count: u64,
}

struct JobInner {
  id: JobId,
  /// Registration sequence number; orders listings and breaks due-time ties.
  seq: u64,
  original: String,
  name: Option<String>,
  trigger: Trigger,
  blocking: bool,
  created_at: DateTime<Utc>,
  exec_fn: Arc<BoxedExecFn>,
  on_error: Option<ErrorHook>,
  times: Mutex<JobTimes>,
  running: Mutex<HashSet<InstanceId>>,
}

/// A handle to a scheduled unit of work.
///
/// Cheap to clone. The scheduler owns the job's state; a `Job` only reads it,
/// so holding one never races the scheduler loop. Two handles are equal when
/// they refer to the same job id.
#[derive(Clone)]
pub struct Job {
  inner: Arc<JobInner>,
}

impl Job {
  pub(crate) fn new(
    id: JobId,
    seq: u64,
    original: String,
    trigger: Trigger,
    options: JobOptions,
    exec_fn: Arc<BoxedExecFn>,
    created_at: DateTime<Utc>,
  ) -> Self {
    let next_time = trigger.next_fire_after(created_at, None);
    Self {
      inner: Arc::new(JobInner {
        id,
        seq,
        original,
        name: options.name,
        trigger,
        blocking: options.blocking,
        created_at,
        exec_fn,
        on_error: options.on_error,
        times: Mutex::new(JobTimes {
          next_time,
          last_time: None,
          state: JobState::Scheduled,
          fire_count: 0,
        }),
        running: Mutex::new(HashSet::new()),
      }),
    }
  }

  pub fn id(&self) -> JobId {
    self.inner.id
  }

  /// The trigger specification exactly as given by the caller (e.g. `"10d"`).
  pub fn original(&self) -> &str {
    &self.inner.original
  }

  pub fn name(&self) -> Option<&str> {
    self.inner.name.as_deref()
  }

  pub fn trigger(&self) -> &Trigger {
    &self.inner.trigger
  }

  pub fn kind(&self) -> TriggerKind {
    self.inner.trigger.kind()
  }

  pub fn is_blocking(&self) -> bool {
    self.inner.blocking
  }

  pub fn created_at(&self) -> DateTime<Utc> {
    self.inner.created_at
  }

  /// When the job fires next; `None` once a one-shot job has fired or the job
  /// has been unscheduled.
  pub fn next_time(&self) -> Option<DateTime<Utc>> {
    self.inner.times.lock().next_time
  }

  /// When the most recent firing started; `None` if the job never fired.
  pub fn last_time(&self) -> Option<DateTime<Utc>> {
    self.inner.times.lock().last_time
  }

  pub fn state(&self) -> JobState {
    self.inner.times.lock().state
  }

  pub fn is_scheduled(&self) -> bool {
    self.state() == JobState::Scheduled
  }

  /// Number of times the job has fired.
  pub fn fire_count(&self) -> u64 {
    self.inner.times.lock().fire_count
  }

  /// `true` while at least one invocation of this job is executing.
  pub fn is_running(&self) -> bool {
    !self.inner.running.lock().is_empty()
  }

  /// Number of invocations of this job currently executing.
  pub fn running_count(&self) -> usize {
    self.inner.running.lock().len()
  }

  pub fn snapshot(&self) -> JobSnapshot {
    let times = self.inner.times.lock();
    JobSnapshot {
      id: self.inner.id,
      original: self.inner.original.clone(),
      name: self.inner.name.clone(),
      kind: self.kind(),
      blocking: self.inner.blocking,
      state: times.state,
      next_time: times.next_time,
      last_time: times.last_time,
      fire_count: times.fire_count,
      running_instances: self.running_count(),
    }
  }

  // --- Crate-internal mutation, driven by the registry and dispatcher ---

  pub(crate) fn seq(&self) -> u64 {
    self.inner.seq
  }

  pub(crate) fn exec_fn(&self) -> Arc<BoxedExecFn> {
    self.inner.exec_fn.clone()
  }

  pub(crate) fn error_hook(&self) -> Option<&ErrorHook> {
    self.inner.on_error.as_ref()
  }

  /// Records a firing at `now` and recomputes `next_time` in the same critical
  /// section, so a fired one-shot job is never observed as still due.
  /// Returns `false` (and changes nothing) if the job was already unscheduled.
  pub(crate) fn fire(&self, now: DateTime<Utc>) -> bool {
    let mut times = self.inner.times.lock();
    if times.state != JobState::Scheduled {
      return false;
    }
    times.last_time = Some(now);
    times.fire_count += 1;
    times.next_time = self.inner.trigger.next_fire_after(now, Some(now));
    true
  }

  /// Returns `true` if this call changed the state.
  pub(crate) fn mark_unscheduled(&self) -> bool {
    let mut times = self.inner.times.lock();
    times.next_time = None;
    std::mem::replace(&mut times.state, JobState::Unscheduled) == JobState::Scheduled
  }

  pub(crate) fn add_instance(&self, instance_id: InstanceId) {
    self.inner.running.lock().insert(instance_id);
  }

  pub(crate) fn remove_instance(&self, instance_id: &InstanceId) -> bool {
    self.inner.running.lock().remove(instance_id)
  }
}

impl PartialEq for Job {
  fn eq(&self, other: &Self) -> bool {
    self.inner.id == other.inner.id
  }
}

impl Eq for Job {}

impl From<&Job> for JobId {
  fn from(job: &Job) -> Self {
    job.id()
  }
}

// Manual implementation of Debug to avoid requiring Debug on the captured closure.
impl fmt::Debug for Job {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let times = self.inner.times.lock();
    f.debug_struct("Job")
      .field("id", &self.inner.id)
      .field("original", &self.inner.original)
      .field("name", &self.inner.name)
      .field("trigger", &self.inner.trigger)
      .field("blocking", &self.inner.blocking)
      .field("state", &times.state)
      .field("next_time", &times.next_time)
      .field("last_time", &times.last_time)
      .field("exec_fn", &format_args!("Arc<BoxedExecFn>"))
      .finish()
  }
}

// --- Public Snapshot Structs for Querying ---

/// A point-in-time copy of a job's state.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobSnapshot {
  pub id: JobId,
  pub original: String,
  pub name: Option<String>,
  pub kind: TriggerKind,
  pub blocking: bool,
  pub state: JobState,
  pub next_time: Option<DateTime<Utc>>,
  pub last_time: Option<DateTime<Utc>>,
  pub fire_count: u64,
  /// Number of invocations executing when the snapshot was taken.
  pub running_instances: usize,
}

/// One executing invocation, as reported by `TickKeeper::job_threads`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobInstance {
  pub instance_id: InstanceId,
  pub job_id: JobId,
  pub started_at: DateTime<Utc>,
  /// `true` if the invocation runs on the scheduler loop thread rather than a worker task.
  pub blocking: bool,
}
