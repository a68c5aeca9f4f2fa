//! Cron schedules of triggered jobs
//!
//! Expressions have six fields, seconds first: `sec min hour day month weekday`.
//! Times are UTC.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::error::{CoordinatorError, Result};

/// Occurrences missed by more than this are skipped instead of fired late
pub const MISSED_SCHEDULE_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Upper bound when counting missed occurrences for the warning
const MAX_COUNTED_MISSES: usize = 10_000;

#[derive(Debug, Clone)]
pub struct Schedule {
    expression: String,
    cron: cron::Schedule,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        let fields = expression.split_whitespace().count();
        if fields != 6 {
            return Err(CoordinatorError::Validation(format!(
                "schedule '{}' must have 6 fields (seconds first), found {}",
                expression, fields
            )));
        }
        let cron = cron::Schedule::from_str(expression).map_err(|e| {
            CoordinatorError::Validation(format!("invalid schedule '{}': {}", expression, e))
        })?;
        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `after`
    pub fn next_occurrence_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.after(&after).next()
    }

    /// Time from `now` until the job is due, given its last occurrence
    ///
    /// With no `last`, counting starts at `now`. An occurrence that is already
    /// past is due immediately if it is inside [`MISSED_SCHEDULE_WINDOW`] or
    /// `ignore_missed` is set; otherwise the missed occurrences are skipped
    /// and the next one after `now` is used. `None` if the schedule has no
    /// further occurrences.
    pub fn next_interval(
        &self,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        ignore_missed: bool,
    ) -> Option<Duration> {
        let last = last.unwrap_or(now);
        let next = self.next_occurrence_after(last)?;
        if next >= now {
            return Some(until(now, next));
        }
        if ignore_missed || until(next, now) <= MISSED_SCHEDULE_WINDOW {
            return Some(Duration::ZERO);
        }

        let missed: Vec<DateTime<Utc>> = self
            .cron
            .after(&last)
            .take_while(|occurrence| *occurrence <= now)
            .take(MAX_COUNTED_MISSES)
            .collect();
        if let Some(most_recent) = missed.last() {
            warn!(
                "Missed {} occurrence(s) of schedule '{}', most recent at {}",
                missed.len(),
                self.expression,
                most_recent
            );
        }
        self.next_occurrence_after(now).map(|next| until(now, next))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn until(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_requires_six_fields() {
        assert!(Schedule::parse("0 */5 * * * *").is_ok());
        assert!(matches!(
            Schedule::parse("*/5 * * * *"),
            Err(CoordinatorError::Validation(_))
        ));
        assert!(matches!(
            Schedule::parse("0 0 0 * * * 2030"),
            Err(CoordinatorError::Validation(_))
        ));
        assert!(matches!(
            Schedule::parse("0 61 * * * *"),
            Err(CoordinatorError::Validation(_))
        ));
    }

    #[test]
    fn test_next_occurrence_is_strictly_after() {
        let schedule = Schedule::parse("0 */5 * * * *").unwrap();
        assert_eq!(schedule.next_occurrence_after(at(10, 0, 0)), Some(at(10, 5, 0)));
        assert_eq!(schedule.next_occurrence_after(at(10, 3, 7)), Some(at(10, 5, 0)));
    }

    #[test]
    fn test_next_interval_in_the_future() {
        let schedule = Schedule::parse("0 */5 * * * *").unwrap();
        assert_eq!(
            schedule.next_interval(None, at(10, 3, 0), false),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            schedule.next_interval(Some(at(10, 0, 0)), at(10, 3, 0), false),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_recently_missed_occurrence_is_due() {
        let schedule = Schedule::parse("0 */5 * * * *").unwrap();
        // 10:05 was missed by 4 minutes
        assert_eq!(
            schedule.next_interval(Some(at(10, 0, 0)), at(10, 9, 0), false),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_old_misses_are_skipped() {
        let schedule = Schedule::parse("0 0 * * * *").unwrap();
        // Last run at 01:00; 02:00 through 09:00 were missed
        assert_eq!(
            schedule.next_interval(Some(at(1, 0, 0)), at(9, 30, 0), false),
            Some(Duration::from_secs(30 * 60))
        );
        assert_eq!(
            schedule.next_interval(Some(at(1, 0, 0)), at(9, 30, 0), true),
            Some(Duration::ZERO)
        );
    }
}
