//! Daily trigger state and the clock it is evaluated against.

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use std::time::Duration;

/// Source of local wall-clock time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> NaiveDateTime;
}

/// The process's local time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// At most one trigger per calendar date, during the target hour.
///
/// State lives for the process only; a restart during the target hour may
/// trigger a second run on the same date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyTrigger {
    target_hour: u32,
    last_triggered: Option<NaiveDate>,
}

impl DailyTrigger {
    pub fn new(target_hour: u32) -> Self {
        Self {
            target_hour,
            last_triggered: None,
        }
    }

    pub fn target_hour(&self) -> u32 {
        self.target_hour
    }

    pub fn last_triggered(&self) -> Option<NaiveDate> {
        self.last_triggered
    }

    /// Record `date` as triggered without evaluating the hour.
    pub fn mark(&mut self, date: NaiveDate) {
        self.last_triggered = Some(date);
    }

    /// Whether a run fires at `now`. Firing marks the date immediately.
    pub fn should_trigger(&mut self, now: NaiveDateTime) -> bool {
        let date = now.date();
        if now.hour() != self.target_hour || self.last_triggered == Some(date) {
            return false;
        }
        self.mark(date);
        true
    }

    /// Time from `now` until the next start of the target hour.
    pub fn until_next(&self, now: NaiveDateTime) -> Duration {
        let at = NaiveTime::from_hms_opt(self.target_hour, 0, 0).unwrap_or(NaiveTime::MIN);
        let mut next = now.date().and_time(at);
        if next <= now {
            next += TimeDelta::days(1);
        }
        (next - now).to_std().unwrap_or_default()
    }
}
