use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A start time less than this far in the past still counts as "now".
pub const GRACE_WINDOW_SECS: i64 = 60;

/// Absolute recording window in the daemon's wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Window {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn duration_minutes(&self) -> i64 {
        self.duration().num_minutes()
    }

    /// `ddmmYYYY_HHMM-HHMM`, the stem shared by every file of a job.
    pub fn base_name(&self) -> String {
        format!(
            "{}_{}-{}",
            self.start.format("%d%m%Y"),
            self.start.format("%H%M"),
            self.end.format("%H%M")
        )
    }
}

pub fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

/// Anchor two HH:MM times to `now`'s date.
///
/// An end at or before the start rolls over to the next day. A start more
/// than the grace window in the past moves the whole window to tomorrow.
pub fn calculate_schedule(start: NaiveTime, end: NaiveTime, now: NaiveDateTime) -> Window {
    let today = now.date();
    let mut start_dt = today.and_time(start);
    let mut end_dt = today.and_time(end);

    if end_dt <= start_dt {
        end_dt += Duration::days(1);
    }

    if start_dt < now - Duration::seconds(GRACE_WINDOW_SECS) {
        start_dt += Duration::days(1);
        end_dt += Duration::days(1);
    }

    Window {
        start: start_dt,
        end: end_dt,
    }
}

/// Current wall-clock time, in `tz` when configured, else the system zone.
pub fn local_now(tz: Option<Tz>) -> NaiveDateTime {
    match tz {
        Some(tz) => Utc::now().with_timezone(&tz).naive_local(),
        None => chrono::Local::now().naive_local(),
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|e| anyhow!("Invalid timezone {}: {}", name, e))
}
