use chrono::{Datelike, Local, NaiveDateTime, Timelike};

use crate::schedule_config::{ScheduleConfig, WEEK_MINUTES};

/// Source of wall-clock time for the daemon.
///
/// The scheduling predicates below never read the clock themselves; the
/// daemon loop asks its `Clock` and passes the result in.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// True once at least `interval_minutes` have elapsed since `last_run`
fn interval_elapsed(last_run: NaiveDateTime, now: NaiveDateTime, interval_minutes: u32) -> bool {
    (now - last_run).num_seconds() >= i64::from(interval_minutes) * 60
}

/// Monday = 0 ... Sunday = 6, matching `ScheduleConfig::summary_day`
fn weekday_index(now: NaiveDateTime) -> u32 {
    now.weekday().num_days_from_monday()
}

fn at_summary_slot(config: &ScheduleConfig, now: NaiveDateTime) -> bool {
    weekday_index(now) == u32::from(config.summary_day)
        && now.hour() == u32::from(config.summary_hour)
}

/// Decide whether the note-processing job is due.
///
/// A job that has never run is always due.
pub fn should_process(
    last_run: Option<NaiveDateTime>,
    config: &ScheduleConfig,
    now: NaiveDateTime,
) -> bool {
    match last_run {
        None => true,
        Some(last) => interval_elapsed(last, now, config.processing_interval),
    }
}

/// Decide whether the summary job is due.
///
/// With a custom interval this is plain elapsed-time gating. With the weekly
/// interval the job only fires during the configured weekday and hour, and
/// (after the first run) only once a full week has passed. The hour match is
/// exact: if no tick lands inside that hour the summary waits a week.
pub fn should_summarize(
    last_run: Option<NaiveDateTime>,
    config: &ScheduleConfig,
    now: NaiveDateTime,
) -> bool {
    if config.summary_interval != WEEK_MINUTES {
        return match last_run {
            None => true,
            Some(last) => interval_elapsed(last, now, config.summary_interval),
        };
    }

    match last_run {
        None => at_summary_slot(config, now),
        Some(last) => at_summary_slot(config, now) && interval_elapsed(last, now, WEEK_MINUTES),
    }
}
