use crate::metrics::SchedulerMetrics;
use crate::registry::JobRegistry;
use crate::scheduler::ShutdownMode;
use crate::job::Job;
use crate::worker::{Dispatcher, InstanceGuard, InstanceTracker};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

/// State shared between the scheduler handle and its loop.
pub(crate) struct CoordinatorState {
  pub registry: Arc<JobRegistry>,
  pub tracker: Arc<InstanceTracker>,
  pub metrics: SchedulerMetrics,
  pub paused: AtomicBool,
  /// Held while a due job is taken and its invocation admitted, and while the
  /// registry is cleared, so a clear never lands between the two.
  dispatch_gate: Mutex<()>,
}

impl CoordinatorState {
  pub fn new(metrics: SchedulerMetrics) -> Self {
    let registry = Arc::new(JobRegistry::new(metrics.clone()));
    let tracker = Arc::new(InstanceTracker::new(registry.clone(), metrics.clone()));
    Self {
      registry,
      tracker,
      metrics,
      paused: AtomicBool::new(false),
      dispatch_gate: Mutex::new(()),
    }
  }

  pub fn is_paused(&self) -> bool {
    self.paused.load(Ordering::SeqCst)
  }

  /// Fires the earliest due job and admits one invocation of it. The guard is
  /// `None` if the tracker refused the invocation (forced shutdown).
  pub fn take_next_invocation(&self, now: DateTime<Utc>) -> Option<(Job, Option<InstanceGuard>)> {
    let _gate = self.dispatch_gate.lock();
    let job = self.registry.take_next_due(now)?;
    let guard = self.tracker.register(&job);
    Some((job, guard))
  }

  /// Unschedules every job. Anything already admitted is visible to the
  /// tracker by the time this returns.
  pub fn clear_jobs(&self) -> Vec<Job> {
    let _gate = self.dispatch_gate.lock();
    self.registry.clear()
  }
}

/// The scheduler loop. Wakes every `frequency`, fires whatever is due and hands
/// it to the dispatcher, until a shutdown mode is published or the scheduler
/// handle goes away.
pub(crate) struct Coordinator {
  state: Arc<CoordinatorState>,
  dispatcher: Dispatcher,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  frequency: Duration,
}

impl Coordinator {
  pub fn new(
    state: Arc<CoordinatorState>,
    dispatcher: Dispatcher,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    frequency: Duration,
  ) -> Self {
    Self {
      state,
      dispatcher,
      shutdown_rx,
      frequency,
    }
  }

  pub async fn run(mut self) {
    info!(
      frequency_ms = self.frequency.as_millis() as u64,
      "Scheduler loop started."
    );

    let mut ticker = tokio::time::interval(self.frequency);
    // A long blocking job must not be followed by a burst of catch-up ticks.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        biased; // Prioritize checking the shutdown signal

        changed = self.shutdown_rx.changed() => {
          if changed.is_err() {
            info!("Scheduler handle dropped, stopping loop.");
            break;
          }
          let mode = *self.shutdown_rx.borrow_and_update();
          if let Some(mode) = mode {
            info!(?mode, "Scheduler loop received shutdown signal.");
            break;
          }
        }

        _ = ticker.tick() => {
          self.tick().await;
          if self.is_shutting_down() {
            break;
          }
        }
      }
    }

    info!("Scheduler loop stopped.");
  }

  fn is_shutting_down(&self) -> bool {
    self.shutdown_rx.borrow().is_some()
  }

  async fn tick(&mut self) {
    SchedulerMetrics::incr(&self.state.metrics.ticks);
    if self.state.is_paused() {
      SchedulerMetrics::incr(&self.state.metrics.ticks_paused);
      trace!("Scheduler paused, skipping dispatch.");
      return;
    }

    let now = Utc::now();
    let mut fired = 0usize;

    // Pause and shutdown are re-checked between firings, so a blocking job
    // that pauses or stops the scheduler takes effect before the next one.
    while !self.is_shutting_down() && !self.state.is_paused() {
      let Some((job, guard)) = self.state.take_next_invocation(now) else {
        break;
      };
      fired += 1;
      match guard {
        Some(guard) => {
          debug!(job_id = %job.id(), job_name = job.name().unwrap_or(""), original = job.original(), "Job due, dispatching.");
          self.dispatcher.dispatch(&job, guard).await;
        }
        None => debug!(job_id = %job.id(), "Invocation refused, scheduler is being killed."),
      }

      if job.next_time().is_none() && !job.is_running() && self.state.registry.remove(&job.id()).is_some() {
        debug!(job_id = %job.id(), "Retired exhausted job.");
      }
    }

    if fired == 0 {
      trace!(%now, "Nothing due.");
    }
  }
}
