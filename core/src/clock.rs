/*!
# Clock Module

Small clock abstraction so the engine's time-of-day gating and daily-reset
logic can be tested without real wall-clock waits.
*/

use chrono::{DateTime, Datelike, Local, NaiveDate, Timelike, Utc, Weekday};

/// Source of time for the automation engine
pub trait Clock: Send + Sync {
    /// Instant used for task timestamps and runtime accounting
    fn now(&self) -> DateTime<Utc>;

    /// Local calendar date, used for daily quota resets
    fn today(&self) -> NaiveDate;

    /// Local hour-of-day and weekday, used for the operating window
    fn local_hour_and_weekday(&self) -> (u32, Weekday);
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }

    fn local_hour_and_weekday(&self) -> (u32, Weekday) {
        let now = Local::now();
        (now.hour(), now.weekday())
    }
}
