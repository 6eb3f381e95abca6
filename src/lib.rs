//! TickKeeper: An In-Process Job Scheduler
//!
//! Runs time-specified units of work concurrently with the rest of the program:
//! once at a point in time, once after a delay, repeatedly at a fixed interval,
//! or on a CRON expression. A loop on its own named thread wakes at a fixed
//! frequency, fires whatever is due and hands each firing to its own tokio task.
//!
//! # Features
//!
//! - Schedule jobs using:
//!   - A point in time (`schedule_at`, `schedule_at_time`).
//!   - A delay (`schedule_in`, `schedule_in_duration`), e.g. `"1h30m"`.
//!   - A fixed interval (`schedule_every`, `schedule_every_duration`).
//!   - Standard CRON expressions (UTC interpretation, requires the `cron_schedule` feature).
//! - Blocking jobs, run inline on the scheduler thread and serialized with it.
//! - Pause and resume without stopping the loop.
//! - Introspection: job listings by kind, running jobs, live invocations, uptime.
//! - Per-job and scheduler-wide error hooks; errors and panics in job bodies are
//!   contained to their invocation.
//! - Graceful, terminating (drain) and forced (kill) shutdown.
//! - Built-in metrics collection (queryable snapshot using `MetricsSnapshot`).
//! - Optional Serde support for snapshot types (requires `serde` feature).
//!
//! # Usage
//!
//! ```no_run
//! use tickkeeper::{JobOptions, ShutdownMode, TickKeeper};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Basic tracing setup (optional)
//!     // tracing_subscriber::fmt().with_env_filter("warn,tickkeeper=info").init();
//!
//!     let scheduler = TickKeeper::builder()
//!         .frequency(Duration::from_millis(100))
//!         .build()?;
//!
//!     let counter = Arc::new(AtomicUsize::new(0));
//!
//!     // --- A recurring job ---
//!     let c = counter.clone();
//!     let every = scheduler.schedule_every("2s", JobOptions::new().name("tick"), move || {
//!         let c = c.clone();
//!         async move {
//!             c.fetch_add(1, Ordering::SeqCst);
//!             Ok(())
//!         }
//!     })?;
//!
//!     // --- A one-shot job, run on the scheduler thread ---
//!     scheduler.schedule_in("500ms", JobOptions::new().blocking(true), || async {
//!         println!("ran inline on {:?}", std::thread::current().name());
//!         Ok(())
//!     })?;
//!
//!     // --- A CRON job (every minute) ---
//!     #[cfg(feature = "cron_schedule")]
//!     scheduler.schedule_cron("* * * * *", JobOptions::new(), || async {
//!         println!("top of the minute");
//!         Ok(())
//!     })?;
//!
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!     println!("next tick at {:?}, uptime {:?}", every.next_time(), scheduler.uptime_s());
//!     println!("metrics: {:?}", scheduler.get_metrics_snapshot());
//!
//!     // Wait for running jobs, then stop.
//!     scheduler.shutdown(ShutdownMode::Terminate).await;
//!     Ok(())
//! }
//! ```

// Declare modules within the crate
mod coordinator;
pub mod error;
pub mod job;
pub mod metrics;
pub mod parse;
mod registry;
pub mod scheduler;
mod worker;

// --- Public Re-exports ---

// Core scheduler components
pub use scheduler::{SchedulerBuilder, ShutdownMode, TickKeeper};

// Error types
pub use error::{BuildError, CallbackError, ParseError, ScheduleError};

// Job related types
pub use job::{
  BoxError, BoxedExecFn, ErrorHook, InstanceId, Job, JobId, JobInstance, JobOptions, JobResult,
  JobSnapshot, JobState, Trigger, TriggerKind,
};

// Metrics related types
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
