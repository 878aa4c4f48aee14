//! Time-of-day windows (with midnight wrap) and the node's local wall clock.

use anyhow::{Context, Result};
use time::macros::format_description;
use time::{OffsetDateTime, Time, UtcOffset};

// ---------------------------------------------------------------------------
// Window evaluation
// ---------------------------------------------------------------------------

/// A start/end pair of wall-clock times. When `start >= end` the window
/// crosses midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: Time,
    pub end: Time,
}

impl TimeWindow {
    pub fn new(start: Time, end: Time) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, now: Time) -> bool {
        contains(self.start, self.end, now)
    }
}

/// Decide whether `now` falls inside `[start, end]`, wrapping past midnight
/// when `start >= end`. All three values are compared at second resolution.
pub fn contains(start: Time, end: Time, now: Time) -> bool {
    let (start, end, now) = (whole_seconds(start), whole_seconds(end), whole_seconds(now));
    if start < end {
        start <= now && now <= end
    } else {
        now >= start || now <= end
    }
}

fn whole_seconds(t: Time) -> Time {
    t.replace_nanosecond(0).unwrap_or(t)
}

// ---------------------------------------------------------------------------
// HH:MM:SS text form (config values, command payloads, telemetry)
// ---------------------------------------------------------------------------

/// Components may omit their leading zero ("8:00:00").
pub fn parse_hms(s: &str) -> Result<Time> {
    Time::parse(
        s.trim(),
        format_description!("[hour padding:none]:[minute padding:none]:[second padding:none]"),
    )
        .with_context(|| format!("invalid time of day {s:?} (expected HH:MM:SS)"))
}

pub fn format_hms(t: Time) -> String {
    format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second())
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// The node's wall clock. `System` looks up the host's UTC offset on every
/// reading, so DST transitions apply without a restart.
#[derive(Debug, Clone, Copy)]
pub enum LocalClock {
    System,
    Fixed(UtcOffset),
}

impl LocalClock {
    pub fn fixed(offset: UtcOffset) -> Self {
        Self::Fixed(offset)
    }

    pub fn offset(&self) -> UtcOffset {
        match self {
            Self::System => system_offset(),
            Self::Fixed(offset) => *offset,
        }
    }

    pub fn now(&self) -> Time {
        OffsetDateTime::now_utc().to_offset(self.offset()).time()
    }
}

fn system_offset() -> UtcOffset {
    let secs = chrono::Local::now().offset().local_minus_utc();
    UtcOffset::from_whole_seconds(secs).unwrap_or(UtcOffset::UTC)
}

// ===========================================================================
// Tests
// ===========================================================================
