use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::warn;

#[cfg(feature = "cron_schedule")]
use crate::parse::CronExpr;

/// The variant tag of a [`Trigger`], used to filter job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TriggerKind {
  At,
  In,
  Every,
  #[cfg(feature = "cron_schedule")]
  Cron,
}

/// Decides when a job fires.
///
/// `At` and `In` are one-shot: they yield a single fire time and are exhausted
/// once the job has fired. `Every` and `Cron` are recurring and never exhaust.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
  /// Fire once at a fixed point in time.
  At(DateTime<Utc>),
  /// Fire once, `delay` after the job was created.
  In {
    created_at: DateTime<Utc>,
    delay: StdDuration,
  },
  /// Fire repeatedly, `interval` after the previous firing (or after creation).
  Every {
    created_at: DateTime<Utc>,
    interval: StdDuration,
  },
  /// Fire on each occurrence of a CRON expression (UTC).
  #[cfg(feature = "cron_schedule")]
  Cron(CronExpr),
}

impl Trigger {
  pub fn kind(&self) -> TriggerKind {
    match self {
      Trigger::At(_) => TriggerKind::At,
      Trigger::In { .. } => TriggerKind::In,
      Trigger::Every { .. } => TriggerKind::Every,
      #[cfg(feature = "cron_schedule")]
      Trigger::Cron(_) => TriggerKind::Cron,
    }
  }

  pub fn is_recurring(&self) -> bool {
    !self.is_one_shot()
  }

  pub fn is_one_shot(&self) -> bool {
    matches!(self, Trigger::At(_) | Trigger::In { .. })
  }

  /// Computes the next fire time given the current time and the start of the
  /// most recent firing.
  ///
  /// A result in the past is still returned; the scheduler loop fires it on its
  /// next tick rather than skipping it.
  pub fn next_fire_after(
    &self,
    now: DateTime<Utc>,
    last_time: Option<DateTime<Utc>>,
  ) -> Option<DateTime<Utc>> {
    match self {
      Trigger::At(at) => match last_time {
        None => Some(*at),
        Some(_) => None,
      },
      Trigger::In { created_at, delay } => match last_time {
        None => add_std(*created_at, *delay),
        Some(_) => None,
      },
      Trigger::Every {
        created_at,
        interval,
      } => add_std(last_time.unwrap_or(*created_at), *interval),
      #[cfg(feature = "cron_schedule")]
      Trigger::Cron(expr) => expr.next_after(now),
    }
    .or_else(|| {
      if self.is_recurring() {
        warn!(trigger = ?self, %now, "Recurring trigger produced no further fire time.");
      }
      None
    })
  }
}

fn add_std(base: DateTime<Utc>, duration: StdDuration) -> Option<DateTime<Utc>> {
  ChronoDuration::from_std(duration)
    .ok()
    .and_then(|d| base.checked_add_signed(d))
}
