//! Cron schedules for plans.

mod cron;
mod schedule;

pub use cron::{CronExpr, CronField, CronParseError};
pub use schedule::Schedule;
