//! Execution dispatch: turns a fired job into a running invocation.
//!
//! Every invocation is registered with the [`InstanceTracker`] before its body
//! starts and removed when it ends, however it ends (success, error, panic or
//! abort). The tracker is what `running_jobs`, `job_threads`, the drain in
//! `terminate_all_jobs` and forced termination all read from.

use crate::error::CallbackError;
use crate::job::{ErrorHook, InstanceId, Job, JobId, JobInstance};
use crate::metrics::SchedulerMetrics;
use crate::registry::JobRegistry;
use crate::scheduler::ShutdownMode;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;

// --- Instance Tracking ---

struct RunningInstance {
  job: Job,
  order: u64,
  started_at: DateTime<Utc>,
  blocking: bool,
  abort: Option<AbortHandle>,
}

#[derive(Default)]
struct TrackerState {
  instances: HashMap<InstanceId, RunningInstance>,
  next_order: u64,
  /// Set by a forced shutdown; no further invocations are admitted.
  closed: bool,
}

/// Live invocations of one scheduler instance.
pub(crate) struct InstanceTracker {
  state: Mutex<TrackerState>,
  registry: Arc<JobRegistry>,
  metrics: SchedulerMetrics,
  running_tx: watch::Sender<usize>,
}

impl InstanceTracker {
  pub fn new(registry: Arc<JobRegistry>, metrics: SchedulerMetrics) -> Self {
    let (running_tx, _) = watch::channel(0);
    Self {
      state: Mutex::new(TrackerState::default()),
      registry,
      metrics,
      running_tx,
    }
  }

  /// Called with the state lock held, so published counts never go stale.
  fn publish(&self, count: usize) {
    self
      .metrics
      .instances_running_current
      .store(count, Ordering::Relaxed);
    self.running_tx.send_replace(count);
  }

  /// Admits a new invocation of `job`. Returns `None` once the tracker has
  /// been closed by a forced shutdown.
  pub fn register(self: &Arc<Self>, job: &Job) -> Option<InstanceGuard> {
    let instance_id = Uuid::new_v4();
    let mut state = self.state.lock();
    if state.closed {
      return None;
    }
    let order = state.next_order;
    state.next_order += 1;
    state.instances.insert(
      instance_id,
      RunningInstance {
        job: job.clone(),
        order,
        started_at: Utc::now(),
        blocking: job.is_blocking(),
        abort: None,
      },
    );
    job.add_instance(instance_id);
    self.publish(state.instances.len());
    drop(state);

    Some(InstanceGuard {
      tracker: self.clone(),
      instance_id,
    })
  }

  /// Associates the worker task with its instance. If the instance is already
  /// gone (finished, or drained by a kill) the task is aborted straight away,
  /// which is harmless for a task that already completed.
  pub fn attach_abort(&self, instance_id: InstanceId, abort: AbortHandle) {
    let mut state = self.state.lock();
    match state.instances.get_mut(&instance_id) {
      Some(instance) => instance.abort = Some(abort),
      None => abort.abort(),
    }
  }

  fn finish(&self, instance_id: InstanceId) {
    let instance = {
      let mut state = self.state.lock();
      let Some(instance) = state.instances.remove(&instance_id) else {
        return;
      };
      instance.job.remove_instance(&instance_id);
      self.publish(state.instances.len());
      instance
    };
    trace!(job_id = %instance.job.id(), %instance_id, "Invocation finished.");

    // A job with no further fire time leaves the registry once its last
    // invocation is over.
    let job = instance.job;
    if job.next_time().is_none() && !job.is_running() && self.registry.remove(&job.id()).is_some() {
      debug!(job_id = %job.id(), "Retired exhausted job.");
    }
  }

  /// Distinct jobs with at least one live invocation, ordered by their
  /// earliest live invocation.
  pub fn running_jobs(&self) -> Vec<Job> {
    let state = self.state.lock();
    let mut instances: Vec<&RunningInstance> = state.instances.values().collect();
    instances.sort_by_key(|instance| instance.order);

    let mut seen: HashSet<JobId> = HashSet::new();
    instances
      .into_iter()
      .filter(|instance| seen.insert(instance.job.id()))
      .map(|instance| instance.job.clone())
      .collect()
  }

  /// Every live invocation, one entry per invocation, oldest first.
  pub fn instances(&self) -> Vec<JobInstance> {
    let state = self.state.lock();
    let mut instances: Vec<(u64, JobInstance)> = state
      .instances
      .iter()
      .map(|(instance_id, instance)| {
        (
          instance.order,
          JobInstance {
            instance_id: *instance_id,
            job_id: instance.job.id(),
            started_at: instance.started_at,
            blocking: instance.blocking,
          },
        )
      })
      .collect();
    instances.sort_by_key(|(order, _)| *order);
    instances.into_iter().map(|(_, instance)| instance).collect()
  }

  pub fn len(&self) -> usize {
    self.state.lock().instances.len()
  }

  /// Resolves once no invocation is running.
  pub async fn wait_idle(&self) {
    let mut running_rx = self.running_tx.subscribe();
    // The sender lives as long as `self`, so this cannot observe a closed channel.
    let _ = running_rx.wait_for(|count| *count == 0).await;
  }

  /// Closes the tracker and aborts every live worker task. Inline blocking
  /// invocations are dropped by the loop when it observes the kill signal.
  /// Returns how many invocations were cut short.
  pub fn kill_all(&self) -> usize {
    let drained: Vec<(InstanceId, RunningInstance)> = {
      let mut state = self.state.lock();
      state.closed = true;
      let drained: Vec<_> = state.instances.drain().collect();
      for (instance_id, instance) in &drained {
        instance.job.remove_instance(instance_id);
      }
      self.publish(0);
      drained
    };
    for (instance_id, instance) in &drained {
      if let Some(abort) = &instance.abort {
        abort.abort();
      }
      debug!(job_id = %instance.job.id(), %instance_id, blocking = instance.blocking, "Killed invocation.");
    }
    drained.len()
  }
}

/// Removes its invocation from the tracker when dropped, so an invocation that
/// is aborted mid-flight is accounted for exactly like one that returned.
pub(crate) struct InstanceGuard {
  tracker: Arc<InstanceTracker>,
  instance_id: InstanceId,
}

impl InstanceGuard {
  pub fn instance_id(&self) -> InstanceId {
    self.instance_id
  }
}

impl Drop for InstanceGuard {
  fn drop(&mut self) {
    self.tracker.finish(self.instance_id);
  }
}

// --- Dispatcher ---

/// Runs fired jobs: blocking ones inline on the loop, the rest as tokio tasks.
pub(crate) struct Dispatcher {
  handle: Handle,
  tracker: Arc<InstanceTracker>,
  metrics: SchedulerMetrics,
  error_hook: Option<ErrorHook>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
}

impl Dispatcher {
  pub fn new(
    handle: Handle,
    tracker: Arc<InstanceTracker>,
    metrics: SchedulerMetrics,
    error_hook: Option<ErrorHook>,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  ) -> Self {
    Self {
      handle,
      tracker,
      metrics,
      error_hook,
      shutdown_rx,
    }
  }

  /// Starts the admitted invocation of `job`. For a blocking job this only
  /// returns once the body has finished, or once a forced shutdown has dropped it.
  pub async fn dispatch(&self, job: &Job, guard: InstanceGuard) {
    let instance_id = guard.instance_id();
    SchedulerMetrics::incr(&self.metrics.jobs_fired);

    let job_span = tracing::span!(
      tracing::Level::INFO,
      "job_exec",
      job_id = %job.id(),
      %instance_id,
      job_name = job.name().unwrap_or(""),
      blocking = job.is_blocking()
    );
    let invocation = execute(
      job.clone(),
      guard,
      self.metrics.clone(),
      self.error_hook.clone(),
    )
    .instrument(job_span);

    if job.is_blocking() {
      debug!(job_id = %job.id(), %instance_id, "Running blocking job inline.");
      let mut shutdown_rx = self.shutdown_rx.clone();
      tokio::select! {
        _ = invocation => {}
        Ok(_) = shutdown_rx.wait_for(|mode| *mode == Some(ShutdownMode::Kill)) => {
          warn!(job_id = %job.id(), %instance_id, "Blocking job dropped by forced shutdown.");
        }
      }
    } else {
      debug!(job_id = %job.id(), %instance_id, "Spawning worker task.");
      let task = self.handle.spawn(invocation);
      self.tracker.attach_abort(instance_id, task.abort_handle());
    }
  }
}

/// Runs the body once, containing errors and panics, then reports the outcome.
/// `guard` is held for the whole invocation.
async fn execute(
  job: Job,
  guard: InstanceGuard,
  metrics: SchedulerMetrics,
  scheduler_hook: Option<ErrorHook>,
) {
  let _guard = guard;
  let job_id = job.id();
  let exec_fn = job.exec_fn();
  let started = Instant::now();
  info!("Starting job execution.");

  // The call itself sits inside the async block so a panic while building the
  // future is caught too.
  let result = AssertUnwindSafe(async move { (exec_fn)().await })
    .catch_unwind()
    .await;
  let duration = started.elapsed();
  metrics.job_execution_duration.record(duration);

  let (outcome, failure) = match result {
    Ok(Ok(())) => {
      SchedulerMetrics::incr(&metrics.jobs_executed_success);
      ("Success", None)
    }
    Ok(Err(source)) => {
      SchedulerMetrics::incr(&metrics.jobs_executed_fail);
      ("Fail", Some(CallbackError::Failed { job_id, source }))
    }
    Err(payload) => {
      SchedulerMetrics::incr(&metrics.jobs_panicked);
      let message = panic_message(payload.as_ref());
      error!(%job_id, panic = %message, "Job function panicked!");
      ("Panic", Some(CallbackError::Panicked { job_id, message }))
    }
  };
  info!(
    duration_ms = duration.as_millis() as u64,
    outcome,
    "Finished job execution."
  );

  if let Some(err) = failure {
    report(&job, scheduler_hook.as_ref(), &err);
  }
}

fn report(job: &Job, scheduler_hook: Option<&ErrorHook>, err: &CallbackError) {
  let Some(hook) = job.error_hook().or(scheduler_hook) else {
    warn!(job_id = %err.job_id(), error = %err, "Unhandled job error.");
    return;
  };
  if std::panic::catch_unwind(AssertUnwindSafe(|| hook(err))).is_err() {
    error!(job_id = %err.job_id(), "Error hook panicked while handling a job error.");
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
