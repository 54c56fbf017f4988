use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Fixed-cadence schedule without catch-up.
///
/// Fire times are the interval boundaries counted from midnight UTC of
/// `start_date`. Boundaries that passed while nothing was running are never
/// replayed; the next fire time is always computed from the current clock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub interval: ScheduleInterval,
    pub start_date: NaiveDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleInterval {
    Hourly,
    Daily,
}

impl ScheduleInterval {
    pub fn duration(&self) -> Duration {
        match self {
            ScheduleInterval::Hourly => Duration::hours(1),
            ScheduleInterval::Daily => Duration::days(1),
        }
    }
}

impl FromStr for ScheduleInterval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "@daily" | "daily" => Ok(ScheduleInterval::Daily),
            "@hourly" | "hourly" => Ok(ScheduleInterval::Hourly),
            other => Err(Error::InvalidInput(format!(
                "Unsupported schedule interval '{other}', expected @daily or @hourly"
            ))),
        }
    }
}

impl Schedule {
    pub fn daily(start_date: NaiveDate) -> Self {
        Self {
            interval: ScheduleInterval::Daily,
            start_date,
        }
    }

    fn origin(&self) -> DateTime<Utc> {
        self.start_date.and_time(chrono::NaiveTime::MIN).and_utc()
    }

    /// The first boundary strictly after `now`, never earlier than the
    /// start date.
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let origin = self.origin();
        if now < origin {
            return origin;
        }

        let step = self.interval.duration().num_seconds();
        let elapsed = (now - origin).num_seconds();
        let intervals = elapsed / step + 1;

        origin + Duration::seconds(intervals * step)
    }

    /// Logical date of the interval that closes at `fire_time`.
    pub fn logical_date(&self, fire_time: DateTime<Utc>) -> NaiveDate {
        (fire_time - self.interval.duration()).date_naive()
    }

    /// Number of boundaries in `(after, now]` that were not fired. With no
    /// catch-up these are only reported, never executed.
    pub fn missed_between(&self, after: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        if now <= after {
            return 0;
        }
        let step = self.interval.duration().num_seconds();
        (now - after).num_seconds() / step
    }
}
