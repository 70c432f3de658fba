//! When the orchestrator runs: a fixed polling interval, or once a week at a
//! given local day and time.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Weekday};

use crate::error::PipelineError;

/// Longest daylight-saving jump handled when a weekly time is skipped.
const MAX_GAP_MINUTES: i64 = 180;

/// `local` in `tz`. A repeated local time resolves to its first occurrence;
/// a skipped one to the first valid minute after the gap.
fn resolve_local<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    (0..=MAX_GAP_MINUTES).find_map(|shift| {
        let shifted = local.checked_add_signed(TimeDelta::minutes(shift))?;
        tz.from_local_datetime(&shifted).earliest()
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Polling { interval: Duration },
    Weekly { day: Weekday, time: NaiveTime },
}

impl Trigger {
    /// Parse a weekday name (`tuesday`, `Tue`) and `HH:MM` time.
    pub fn weekly(day: &str, time: &str) -> Result<Self, PipelineError> {
        let day = day
            .trim()
            .parse::<Weekday>()
            .map_err(|_| PipelineError::config(format!("unknown schedule day: {day}")))?;
        let time = NaiveTime::parse_from_str(time.trim(), "%H:%M")
            .map_err(|e| PipelineError::config(format!("invalid schedule time {time}: {e}")))?;
        Ok(Self::Weekly { day, time })
    }

    /// First fire time strictly after `now`, in `now`'s time zone.
    pub fn next_fire<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match self {
            Self::Polling { interval } => {
                now.clone().checked_add_signed(TimeDelta::from_std(*interval).ok()?)
            }
            Self::Weekly { day, time } => {
                let today = now.date_naive();
                (0..=14u64).find_map(|ahead| {
                    let date = today.checked_add_days(chrono::Days::new(ahead))?;
                    if date.weekday() != *day {
                        return None;
                    }
                    let candidate = resolve_local(&now.timezone(), date.and_time(*time))?;
                    (candidate > *now).then_some(candidate)
                })
            }
        }
    }
}

/// Time left until `next`, zero if it already passed.
pub fn until<Tz: TimeZone>(now: &DateTime<Tz>, next: &DateTime<Tz>) -> Duration {
    next.clone()
        .signed_duration_since(now.clone())
        .to_std()
        .unwrap_or(Duration::ZERO)
}
