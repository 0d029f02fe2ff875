//! Schedule entry definition

use chrono::{DateTime, Days, TimeZone, Timelike};
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, TrunkError};

/// Task body run by the scheduler thread.
///
/// Any state the task needs is captured by the closure. Errors are logged by
/// the scheduler and never retried.
pub type TaskFn = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Daily anchor: the task fires on a grid aligned to `hour:minute` local time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub hour: u32,
    pub minute: u32,
}

/// A periodic task
#[derive(Clone)]
pub struct ScheduleEntry {
    pub id: u32,
    pub time_base: Option<TimeBase>,
    /// Period in seconds, must be > 0
    pub interval: u64,
    pub(crate) task: TaskFn,
    pub(crate) next_call_time: i64,
}

impl ScheduleEntry {
    /// Create an entry that first fires `interval` seconds after it is scheduled
    pub fn new<F>(id: u32, interval: u64, task: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        Self {
            id,
            time_base: None,
            interval,
            task: Arc::new(task),
            next_call_time: 0,
        }
    }

    /// Align the firing grid to a daily `hour:minute`
    pub fn with_time_base(mut self, hour: u32, minute: u32) -> Self {
        self.time_base = Some(TimeBase { hour, minute });
        self
    }

    pub fn next_call_time(&self) -> i64 {
        self.next_call_time
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(TrunkError::InvalidArgument(format!(
                "schedule id {}: interval must be > 0",
                self.id
            )));
        }
        if let Some(tb) = self.time_base {
            if tb.hour > 23 || tb.minute > 59 {
                return Err(TrunkError::InvalidArgument(format!(
                    "schedule id {}: invalid time base {:02}:{:02}",
                    self.id, tb.hour, tb.minute
                )));
            }
        }
        Ok(())
    }

    /// Compute the first fire time relative to `now`.
    ///
    /// Without a time base the task fires one interval from now. With one, the
    /// anchor is today's `hour:minute` if that has passed, otherwise
    /// yesterday's, and the next point on the `anchor + k * interval` grid
    /// strictly after `now` is chosen.
    pub fn first_call_time<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> i64 {
        let now_ts = now.timestamp();
        let interval = self.interval as i64;

        let Some(tb) = self.time_base else {
            return now_ts + interval;
        };

        let today = now.date_naive();
        let passed = (now.hour(), now.minute()) >= (tb.hour, tb.minute);
        let base_day = if passed {
            Some(today)
        } else {
            today.checked_sub_days(Days::new(1))
        };

        let base = base_day
            .and_then(|day| day.and_hms_opt(tb.hour, tb.minute, 0))
            .and_then(|naive| now.timezone().from_local_datetime(&naive).earliest())
            .map(|dt| dt.timestamp());

        match base {
            Some(base_ts) => now_ts + interval - (now_ts - base_ts).rem_euclid(interval),
            // Anchor falls in a DST gap
            None => now_ts + interval,
        }
    }
}

impl fmt::Debug for ScheduleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleEntry")
            .field("id", &self.id)
            .field("time_base", &self.time_base)
            .field("interval", &self.interval)
            .field("next_call_time", &self.next_call_time)
            .finish()
    }
}
