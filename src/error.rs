use crate::job::{BoxError, JobId};

use thiserror::Error;

/// Errors that can occur while building a scheduler with `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("No Tokio runtime found. The scheduler must be built from within a runtime context.")]
  NoRuntime,
  #[error("The scheduler requires a multi-threaded Tokio runtime; a current-thread runtime cannot drive its loop thread.")]
  UnsupportedRuntime,
  #[error("Tick frequency must be greater than zero")]
  ZeroFrequency,
  #[error("Failed to spawn the scheduler loop thread: {0}")]
  ThreadSpawn(String),
}

/// Errors raised while turning a textual trigger specification into a time value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
  #[error("Invalid duration {0:?}")]
  InvalidDuration(String),
  #[error("Invalid point in time {0:?}")]
  InvalidTime(String),
  #[error("Invalid cron expression {expression:?}: {reason}")]
  InvalidCron { expression: String, reason: String },
}

/// Errors returned synchronously by the `schedule_*` family of calls.
/// A job that fails with one of these is never registered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
  #[error(transparent)]
  Parse(#[from] ParseError),
  #[error("An `every` job needs an interval greater than zero")]
  ZeroInterval,
  #[error("Job id {0} is already registered")]
  DuplicateId(JobId),
  #[error("Scheduler has been shut down; no new jobs are accepted.")]
  SchedulerShutdown,
}

/// A failure raised by a job body during one invocation.
///
/// Contained to that invocation: it never reaches the scheduler loop or other
/// jobs. Delivered to the job's `on_error` hook, else the scheduler-wide hook,
/// else logged at `warn` level and dropped.
#[derive(Error, Debug)]
pub enum CallbackError {
  #[error("Job {job_id} failed: {source}")]
  Failed {
    job_id: JobId,
    #[source]
    source: BoxError,
  },
  #[error("Job {job_id} panicked: {message}")]
  Panicked { job_id: JobId, message: String },
}

impl CallbackError {
  /// The id of the job whose invocation failed.
  pub fn job_id(&self) -> JobId {
    match self {
      CallbackError::Failed { job_id, .. } | CallbackError::Panicked { job_id, .. } => *job_id,
    }
  }

  pub fn is_panic(&self) -> bool {
    matches!(self, CallbackError::Panicked { .. })
  }
}
