//! Cron schedules for `scheduled` triggers.
//!
//! Schedules are evaluated in UTC. Expressions use the classic five fields
//! (`minute hour day-of-month month day-of-week`) or six with a leading
//! seconds field.

use crate::error::ScheduleError;
use chrono::{DateTime, Utc};
use std::str::FromStr;

/// Upper bound on ticks enumerated for one window.
const MAX_TICKS: usize = 1024;

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parses a five- or six-field cron expression.
    ///
    /// # Errors
    ///
    /// Returns an error if the expression has the wrong number of fields or
    /// does not parse.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidCronExpression {
            expression: expression.to_string(),
            reason,
        };
        let fields = expression.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {}", expression.trim()),
            6 => expression.trim().to_string(),
            n => return Err(invalid(format!("expected 5 or 6 fields, got {n}"))),
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// The expression as written.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Ticks in `(after, until]`, oldest first, at most 1024.
    #[must_use]
    pub fn ticks_between(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after)
            .take_while(|tick| *tick <= until)
            .take(MAX_TICKS)
            .collect()
    }

    /// The most recent tick in `(after, until]`.
    #[must_use]
    pub fn latest_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut latest = None;
        for tick in self.schedule.after(&after) {
            if tick > until {
                break;
            }
            latest = Some(tick);
        }
        latest
    }

    /// The first tick after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}
