//! Scheduler layer
//!
//! Fires cron-scheduled triggered jobs. The schedule parsing and the
//! missed-occurrence policy live in [`schedule`]; the polling loop that
//! follows job changes and fires due jobs lives in [`poller`].

pub mod poller;
pub mod schedule;

pub use poller::TriggeredJobsScheduler;
pub use schedule::{MISSED_SCHEDULE_WINDOW, Schedule};
