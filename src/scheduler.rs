use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::{BuildError, CallbackError, ParseError, ScheduleError};
use crate::job::{
  BoxedExecFn, ErrorHook, Job, JobId, JobInstance, JobOptions, JobResult, Trigger, TriggerKind,
};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::parse::{format_duration, format_duration_spec, parse_duration, parse_time};
use crate::worker::Dispatcher;

#[cfg(feature = "cron_schedule")]
use crate::parse::CronExpr;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_FREQUENCY: Duration = Duration::from_millis(300);

/// Source of the per-process instance ids embedded in default thread names.
static NEXT_INSTANCE_ID: AtomicUsize = AtomicUsize::new(0);

/// How [`TickKeeper::shutdown`] treats invocations that are still running.
///
/// All modes stop the loop from firing anything further, unschedule every job
/// and clear the start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ShutdownMode {
  /// Return without waiting for in-flight invocations; they run to completion
  /// in the background.
  #[default]
  Graceful,
  /// Wait for the loop to stop and for every in-flight invocation to complete.
  Terminate,
  /// Abort every in-flight invocation at its next await point.
  Kill,
}

/// Builder for configuring and creating a [`TickKeeper`] scheduler instance.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use tickkeeper::TickKeeper;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = TickKeeper::builder()
///   .frequency(Duration::from_millis(100))
///   .thread_name("reports-scheduler")
///   .on_error(|err| eprintln!("job failed: {err}"))
///   .build()?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  frequency: Duration,
  thread_name: Option<String>,
  on_error: Option<ErrorHook>,
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      frequency: DEFAULT_FREQUENCY,
      thread_name: None,
      on_error: None,
    }
  }
}

impl fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("frequency", &self.frequency)
      .field("thread_name", &self.thread_name)
      .field("on_error", &self.on_error.as_ref().map(|_| "<Fn>"))
      .finish()
  }
}

impl SchedulerBuilder {
  /// Creates a new builder with default settings.
  /// - `frequency`: 300ms.
  /// - `thread_name`: `tickkeeper_<instance id>_scheduler`.
  /// - `on_error`: none; unhandled job errors are logged.
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the tick interval of the scheduler loop. Must be greater than zero.
  pub fn frequency(mut self, frequency: Duration) -> Self {
    self.frequency = frequency;
    self
  }

  /// Sets the name of the OS thread running the scheduler loop.
  pub fn thread_name(mut self, name: impl Into<String>) -> Self {
    self.thread_name = Some(name.into());
    self
  }

  /// Sets the scheduler-wide hook for failed invocations of jobs that do not
  /// carry their own.
  pub fn on_error<H>(mut self, hook: H) -> Self
  where
    H: Fn(&CallbackError) + Send + Sync + 'static,
  {
    self.on_error = Some(Arc::new(hook));
    self
  }

  /// Builds the scheduler and starts its loop thread.
  ///
  /// Must be called from within a multi-threaded Tokio runtime: worker tasks are
  /// spawned on it and the loop thread drives its timers.
  ///
  /// # Errors
  ///
  /// - [`BuildError::NoRuntime`]: not called within a Tokio runtime.
  /// - [`BuildError::UnsupportedRuntime`]: called within a current-thread runtime.
  /// - [`BuildError::ZeroFrequency`]: the frequency is zero.
  /// - [`BuildError::ThreadSpawn`]: the OS refused to create the loop thread.
  pub fn build(self) -> Result<TickKeeper, BuildError> {
    let handle = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;
    if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
      return Err(BuildError::UnsupportedRuntime);
    }
    if self.frequency.is_zero() {
      return Err(BuildError::ZeroFrequency);
    }

    let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
    let thread_name = self
      .thread_name
      .unwrap_or_else(|| format!("tickkeeper_{instance_id}_scheduler"));

    // --- Initialize Shared State & Channels ---
    let metrics = SchedulerMetrics::new();
    let state = Arc::new(CoordinatorState::new(metrics.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let (loop_done_tx, loop_done_rx) = watch::channel(false);

    let dispatcher = Dispatcher::new(
      handle.clone(),
      state.tracker.clone(),
      metrics.clone(),
      self.on_error,
      shutdown_rx.clone(),
    );
    let coordinator = Coordinator::new(state.clone(), dispatcher, shutdown_rx, self.frequency);

    // --- Spawn Loop Thread ---
    let started = (Utc::now(), Instant::now());
    std::thread::Builder::new()
      .name(thread_name.clone())
      .spawn(move || {
        let _done = LoopDone(loop_done_tx);
        handle.block_on(coordinator.run());
      })
      .map_err(|e| BuildError::ThreadSpawn(e.to_string()))?;

    info!(instance_id, %thread_name, frequency_ms = self.frequency.as_millis() as u64, "Scheduler started.");

    Ok(TickKeeper {
      state,
      shutdown_tx,
      loop_done_rx,
      started: Mutex::new(Some(started)),
      next_seq: AtomicU64::new(0),
      frequency: self.frequency,
      thread_name,
      instance_id,
    })
  }
}

/// The error for a trigger that parsed but can never fire: a cron expression
/// with no future occurrence, or a delay too large to represent as a time.
fn no_fire_time(job: &Job) -> ScheduleError {
  let original = job.original().to_string();
  let err = match job.kind() {
    TriggerKind::At => ParseError::InvalidTime(original),
    TriggerKind::In | TriggerKind::Every => ParseError::InvalidDuration(original),
    #[cfg(feature = "cron_schedule")]
    TriggerKind::Cron => ParseError::InvalidCron {
      expression: original,
      reason: "no future occurrence".to_string(),
    },
  };
  ScheduleError::Parse(err)
}

/// Flags the loop as finished when the loop thread exits, even by panic.
struct LoopDone(watch::Sender<bool>);

impl Drop for LoopDone {
  fn drop(&mut self) {
    self.0.send_replace(true);
  }
}

/// An in-process job scheduler.
///
/// Jobs are registered with one of the `schedule_*` calls and fired by a loop
/// running on its own named thread, which wakes every
/// [`frequency`](SchedulerBuilder::frequency). Each firing runs as its own tokio
/// task, unless the job is `blocking`, in which case the loop runs it inline and
/// does nothing else until it returns.
///
/// Dropping the handle stops the loop like a graceful shutdown, except that jobs
/// stay registered in the dropped registry and nothing is awaited.
///
/// Use [`TickKeeper::builder()`] to create and configure an instance.
pub struct TickKeeper {
  state: Arc<CoordinatorState>,
  shutdown_tx: watch::Sender<Option<ShutdownMode>>,
  loop_done_rx: watch::Receiver<bool>,
  started: Mutex<Option<(DateTime<Utc>, Instant)>>,
  next_seq: AtomicU64,
  frequency: Duration,
  thread_name: String,
  instance_id: usize,
}

impl TickKeeper {
  /// Returns a builder to configure and create a `TickKeeper` instance.
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  // --- Scheduling ---

  /// Runs `f` once at the point in time described by `at` (RFC 3339, or
  /// `YYYY-MM-DD HH:MM[:SS]` read as UTC). A time in the past fires on the
  /// next tick.
  ///
  /// # Errors
  ///
  /// - [`ScheduleError::Parse`]: `at` is not a recognizable point in time.
  /// - [`ScheduleError::SchedulerShutdown`]: the scheduler has been shut down.
  pub fn schedule_at<F, Fut>(&self, at: &str, options: JobOptions, f: F) -> Result<Job, ScheduleError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    let time = parse_time(at)?;
    self.register(at.to_string(), Trigger::At(time), options, f)
  }

  /// Runs `f` once at `at`.
  pub fn schedule_at_time<F, Fut>(
    &self,
    at: DateTime<Utc>,
    options: JobOptions,
    f: F,
  ) -> Result<Job, ScheduleError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    self.register(at.to_rfc3339(), Trigger::At(at), options, f)
  }

  /// Runs `f` once, after the delay described by `delay` (e.g. `"0.5s"`,
  /// `"1h30m"`, `"10d"`).
  ///
  /// # Errors
  ///
  /// - [`ScheduleError::Parse`]: `delay` is not a valid duration, or is too large
  ///   to add to the current time.
  /// - [`ScheduleError::SchedulerShutdown`]: the scheduler has been shut down.
  pub fn schedule_in<F, Fut>(&self, delay: &str, options: JobOptions, f: F) -> Result<Job, ScheduleError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    let duration = parse_duration(delay)?;
    self.register_in(delay.to_string(), duration, options, f)
  }

  pub fn schedule_in_duration<F, Fut>(
    &self,
    delay: Duration,
    options: JobOptions,
    f: F,
  ) -> Result<Job, ScheduleError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    self.register_in(format_duration_spec(delay), delay, options, f)
  }

  /// Runs `f` repeatedly, `interval` after each firing (the first one
  /// `interval` after now).
  ///
  /// # Errors
  ///
  /// - [`ScheduleError::Parse`]: `interval` is not a valid duration, or is too
  ///   large to add to the current time.
  /// - [`ScheduleError::ZeroInterval`]: `interval` is zero.
  /// - [`ScheduleError::SchedulerShutdown`]: the scheduler has been shut down.
  pub fn schedule_every<F, Fut>(
    &self,
    interval: &str,
    options: JobOptions,
    f: F,
  ) -> Result<Job, ScheduleError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    let duration = parse_duration(interval)?;
    self.register_every(interval.to_string(), duration, options, f)
  }

  pub fn schedule_every_duration<F, Fut>(
    &self,
    interval: Duration,
    options: JobOptions,
    f: F,
  ) -> Result<Job, ScheduleError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    self.register_every(format_duration_spec(interval), interval, options, f)
  }

  /// Runs `f` on every occurrence of a cron expression, evaluated in UTC.
  /// Five-field expressions have minute resolution; six and seven fields add
  /// seconds and years.
  ///
  /// # Errors
  ///
  /// - [`ScheduleError::Parse`]: `expression` is not a valid cron expression, or
  ///   has no occurrence after now (e.g. a year field in the past).
  /// - [`ScheduleError::SchedulerShutdown`]: the scheduler has been shut down.
  #[cfg(feature = "cron_schedule")]
  pub fn schedule_cron<F, Fut>(
    &self,
    expression: &str,
    options: JobOptions,
    f: F,
  ) -> Result<Job, ScheduleError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    let cron = CronExpr::parse(expression)?;
    self.register(expression.to_string(), Trigger::Cron(cron), options, f)
  }

  fn register_in<F, Fut>(
    &self,
    original: String,
    delay: Duration,
    options: JobOptions,
    f: F,
  ) -> Result<Job, ScheduleError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    let trigger = Trigger::In {
      created_at: Utc::now(),
      delay,
    };
    self.register(original, trigger, options, f)
  }

  fn register_every<F, Fut>(
    &self,
    original: String,
    interval: Duration,
    options: JobOptions,
    f: F,
  ) -> Result<Job, ScheduleError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    if interval.is_zero() {
      return Err(ScheduleError::ZeroInterval);
    }
    let trigger = Trigger::Every {
      created_at: Utc::now(),
      interval,
    };
    self.register(original, trigger, options, f)
  }

  fn register<F, Fut>(
    &self,
    original: String,
    trigger: Trigger,
    options: JobOptions,
    f: F,
  ) -> Result<Job, ScheduleError>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    if self.is_shutdown() {
      return Err(ScheduleError::SchedulerShutdown);
    }

    let exec_fn: BoxedExecFn = Box::new(move || -> Pin<Box<dyn Future<Output = JobResult> + Send>> {
      Box::pin(f())
    });
    let created_at = match &trigger {
      Trigger::In { created_at, .. } | Trigger::Every { created_at, .. } => *created_at,
      _ => Utc::now(),
    };
    let job = Job::new(
      Uuid::new_v4(),
      self.next_seq.fetch_add(1, Ordering::Relaxed),
      original,
      trigger,
      options,
      Arc::new(exec_fn),
      created_at,
    );
    if job.next_time().is_none() {
      return Err(no_fire_time(&job));
    }
    self.state.registry.add(job.clone())?;

    // A shutdown that cleared the registry while this job was being added.
    if self.is_shutdown() {
      self.state.registry.remove(&job.id());
      return Err(ScheduleError::SchedulerShutdown);
    }

    info!(
      job_id = %job.id(),
      kind = ?job.kind(),
      original = job.original(),
      job_name = job.name().unwrap_or(""),
      next_time = ?job.next_time(),
      "Job scheduled."
    );
    Ok(job)
  }

  // --- Control ---

  /// Removes a job so it never fires again. Invocations already running are
  /// not interrupted. Unknown or already-removed ids are a no-op.
  pub fn unschedule(&self, job: impl Into<JobId>) -> Option<Job> {
    let job_id = job.into();
    let removed = self.state.registry.remove(&job_id);
    match &removed {
      Some(_) => info!(%job_id, "Job unscheduled."),
      None => debug!(%job_id, "Unschedule requested for unknown job."),
    }
    removed
  }

  /// Stops firing jobs until [`resume`](Self::resume). The loop keeps ticking.
  pub fn pause(&self) {
    if !self.state.paused.swap(true, Ordering::SeqCst) {
      info!("Scheduler paused.");
    }
  }

  /// Resumes firing. Jobs that came due while paused fire once on the next
  /// tick; missed recurrences are not replayed.
  pub fn resume(&self) {
    if self.state.paused.swap(false, Ordering::SeqCst) {
      info!("Scheduler resumed.");
    }
  }

  pub fn is_paused(&self) -> bool {
    self.state.is_paused()
  }

  /// Unschedules every job, then waits until every running invocation has
  /// completed on its own.
  pub async fn terminate_all_jobs(&self) {
    let removed = self.state.clear_jobs();
    info!(unscheduled = removed.len(), running = self.state.tracker.len(), "Terminating all jobs.");
    self.state.tracker.wait_idle().await;
    info!("All jobs terminated.");
  }

  /// Shuts the scheduler down. See [`ShutdownMode`] for how running
  /// invocations are treated.
  ///
  /// Calling it again is harmless: a later `Kill` still aborts what is
  /// running and a later `Terminate` still waits for it.
  ///
  /// `Terminate` must not be awaited from inside a blocking job, since the loop
  /// cannot stop before that job returns.
  pub async fn shutdown(&self, mode: ShutdownMode) {
    let mut first = false;
    self.shutdown_tx.send_if_modified(|current| match current {
      None => {
        first = true;
        *current = Some(mode);
        true
      }
      Some(ShutdownMode::Kill) => false,
      Some(_) if mode == ShutdownMode::Kill => {
        *current = Some(mode);
        true
      }
      Some(_) => false,
    });

    if first {
      self.started.lock().take();
      info!(?mode, thread_name = %self.thread_name, "Shutting down scheduler.");
    } else {
      debug!(?mode, "Scheduler already shut down.");
    }

    self.state.clear_jobs();

    match mode {
      ShutdownMode::Graceful => {}
      ShutdownMode::Terminate => {
        self.join().await;
        self.state.tracker.wait_idle().await;
      }
      ShutdownMode::Kill => {
        let killed = self.state.tracker.kill_all();
        SchedulerMetrics::add(&self.state.metrics.jobs_killed, killed);
        if killed > 0 {
          warn!(killed, "Killed in-flight invocations.");
        }
      }
    }
  }

  /// Graceful shutdown.
  pub async fn stop(&self) {
    self.shutdown(ShutdownMode::Graceful).await;
  }

  /// Waits until the loop thread has exited. Returns immediately if it already has.
  pub async fn join(&self) {
    let mut loop_done_rx = self.loop_done_rx.clone();
    let _ = loop_done_rx.wait_for(|done| *done).await;
  }

  // --- Introspection ---

  /// Scheduled jobs, in registration order. A one-shot job is listed until its
  /// invocation completes.
  pub fn jobs(&self) -> Vec<Job> {
    self.state.registry.all()
  }

  pub fn at_jobs(&self) -> Vec<Job> {
    self.state.registry.by_kind(TriggerKind::At)
  }

  pub fn in_jobs(&self) -> Vec<Job> {
    self.state.registry.by_kind(TriggerKind::In)
  }

  pub fn every_jobs(&self) -> Vec<Job> {
    self.state.registry.by_kind(TriggerKind::Every)
  }

  #[cfg(feature = "cron_schedule")]
  pub fn cron_jobs(&self) -> Vec<Job> {
    self.state.registry.by_kind(TriggerKind::Cron)
  }

  /// Scheduled jobs whose fire time has passed but which have not fired yet,
  /// earliest first. Typically non-empty only while paused.
  pub fn due_jobs(&self) -> Vec<Job> {
    self.state.registry.due(Utc::now())
  }

  pub fn job(&self, job_id: impl Into<JobId>) -> Option<Job> {
    self.state.registry.find(&job_id.into())
  }

  /// Jobs with at least one invocation running, each listed once.
  pub fn running_jobs(&self) -> Vec<Job> {
    self.state.tracker.running_jobs()
  }

  /// Every invocation of this scheduler's jobs currently running, one entry
  /// per invocation.
  pub fn job_threads(&self) -> Vec<JobInstance> {
    self.state.tracker.instances()
  }

  /// When the scheduler started; `None` once it has been shut down.
  pub fn start_time(&self) -> Option<DateTime<Utc>> {
    (*self.started.lock()).map(|(at, _)| at)
  }

  /// Time since the scheduler started; `None` once it has been shut down.
  pub fn uptime(&self) -> Option<Duration> {
    (*self.started.lock()).map(|(_, instant)| instant.elapsed())
  }

  /// [`uptime`](Self::uptime) rendered compactly, e.g. `"1m5s250"`.
  pub fn uptime_s(&self) -> Option<String> {
    self.uptime().map(format_duration)
  }

  pub fn is_shutdown(&self) -> bool {
    self.shutdown_tx.borrow().is_some()
  }

  pub fn frequency(&self) -> Duration {
    self.frequency
  }

  pub fn thread_name(&self) -> &str {
    &self.thread_name
  }

  /// Process-unique number of this scheduler, embedded in the default thread name.
  pub fn instance_id(&self) -> usize {
    self.instance_id
  }

  /// Retrieves a snapshot of the scheduler's current metrics.
  pub fn get_metrics_snapshot(&self) -> MetricsSnapshot {
    self.state.metrics.snapshot()
  }
}

impl fmt::Debug for TickKeeper {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TickKeeper")
      .field("instance_id", &self.instance_id)
      .field("thread_name", &self.thread_name)
      .field("frequency", &self.frequency)
      .field("paused", &self.is_paused())
      .field("shutdown", &*self.shutdown_tx.borrow())
      .field("jobs", &self.state.registry.len())
      .field("running", &self.state.tracker.len())
      .finish()
  }
}
