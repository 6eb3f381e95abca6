use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// Count and running total of job invocation durations.
///
/// Fed once per finished invocation (success, failure or panic; killed ones are
/// never recorded). Only the mean is derivable; there are no buckets.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Adds one invocation's wall-clock duration, clamped to `usize::MAX` micros.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  /// Invocations recorded so far.
  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Summed duration of the recorded invocations, in microseconds.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Internal state for tracking scheduler metrics using atomic counters.
///
/// Cloning only clones the `Arc`s, so the loop, the dispatcher and the public
/// handle all update the same values.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
  // --- Counters (Monotonically increasing) ---
  /// Jobs accepted by a `schedule_*` call.
  pub jobs_scheduled: Arc<AtomicUsize>,
  /// Jobs removed by `unschedule`, `terminate_all_jobs` or shutdown.
  pub jobs_unscheduled: Arc<AtomicUsize>,
  /// Firings handed to the dispatcher.
  pub jobs_fired: Arc<AtomicUsize>,
  /// Invocations whose body returned `Ok`.
  pub jobs_executed_success: Arc<AtomicUsize>,
  /// Invocations whose body returned `Err`.
  pub jobs_executed_fail: Arc<AtomicUsize>,
  /// Invocations whose body panicked.
  pub jobs_panicked: Arc<AtomicUsize>,
  /// Invocations cut short by a forced shutdown.
  pub jobs_killed: Arc<AtomicUsize>,
  /// Loop iterations, paused ones included.
  pub ticks: Arc<AtomicUsize>,
  /// Loop iterations skipped because the scheduler was paused.
  pub ticks_paused: Arc<AtomicUsize>,

  // --- Gauges (Current state values) ---
  /// Jobs currently held by the registry.
  pub jobs_registered_current: Arc<AtomicUsize>,
  /// Invocations currently executing, blocking ones included.
  pub instances_running_current: Arc<AtomicUsize>,

  // --- Histograms/Summaries ---
  /// Execution duration of completed invocations (in microseconds).
  pub job_execution_duration: Arc<SimpleHistogram>,
}

impl SchedulerMetrics {
  /// Creates a new `SchedulerMetrics` instance with all counters initialized to zero.
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn add(counter: &AtomicUsize, n: usize) {
    counter.fetch_add(n, Ordering::Relaxed);
  }

  /// Creates a snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      jobs_scheduled: self.jobs_scheduled.load(order),
      jobs_unscheduled: self.jobs_unscheduled.load(order),
      jobs_fired: self.jobs_fired.load(order),
      jobs_executed_success: self.jobs_executed_success.load(order),
      jobs_executed_fail: self.jobs_executed_fail.load(order),
      jobs_panicked: self.jobs_panicked.load(order),
      jobs_killed: self.jobs_killed.load(order),
      ticks: self.ticks.load(order),
      ticks_paused: self.ticks_paused.load(order),
      jobs_registered_current: self.jobs_registered_current.load(order),
      instances_running_current: self.instances_running_current.load(order),
      job_execution_duration_count: self.job_execution_duration.get_count(),
      job_execution_duration_sum_micros: self.job_execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of the scheduler's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
  // Counters
  pub jobs_scheduled: usize,
  pub jobs_unscheduled: usize,
  pub jobs_fired: usize,
  pub jobs_executed_success: usize,
  pub jobs_executed_fail: usize,
  pub jobs_panicked: usize,
  pub jobs_killed: usize,
  pub ticks: usize,
  pub ticks_paused: usize,
  // Gauges
  pub jobs_registered_current: usize,
  pub instances_running_current: usize,
  // Histogram Data
  pub job_execution_duration_count: usize,
  pub job_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean job execution duration in microseconds, or `None` if nothing completed yet.
  pub fn mean_execution_duration_micros(&self) -> Option<f64> {
    if self.job_execution_duration_count == 0 {
      None
    } else {
      Some(self.job_execution_duration_sum_micros as f64 / self.job_execution_duration_count as f64)
    }
  }

  pub fn mean_execution_duration(&self) -> Option<Duration> {
    self
      .mean_execution_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }
}
