//! Market clock
//!
//! Computes OPEN / PREMARKET / CLOSED for a market from its weekly schedule,
//! holiday exceptions and an instant. Deterministic, no IO, no wall-clock.
//!
//! Every trading day contributes up to two windows in local time:
//! `[pre_open, open)` as PREMARKET and `[open, close)` as OPEN. A close at or
//! before the open belongs to the next calendar day, a pre-open after the open
//! belongs to the previous one, so sessions crossing midnight resolve to an
//! ordered pair of instants. Time not covered by a window is CLOSED.

use crate::db::sqlite::models::MarketStatus;
use crate::error::{AppError, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::HashMap;

/// Days of history scanned to find when the current state began
const LOOKBEHIND_DAYS: i64 = 3;

/// Days scanned ahead for the next transition (covers long holiday runs)
const LOOKAHEAD_DAYS: i64 = 21;

/// Trading window of a single local day
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaySchedule {
    pub pre_open: Option<NaiveTime>,
    pub open: NaiveTime,
    pub close: NaiveTime,
}

/// Holiday exception for one local date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolidayRule {
    Closed,
    EarlyClose(NaiveTime),
}

/// Weekly schedule plus holidays of one market
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    timezone: Tz,
    weekly: [Option<DaySchedule>; 7],
    holidays: HashMap<NaiveDate, HolidayRule>,
}

impl MarketCalendar {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone,
            weekly: [None; 7],
            holidays: HashMap::new(),
        }
    }

    /// Build an empty calendar from an IANA timezone name
    pub fn for_timezone(name: &str) -> Result<Self> {
        let timezone: Tz = name
            .parse()
            .map_err(|e| AppError::Timezone(format!("{}: {}", name, e)))?;
        Ok(Self::new(timezone))
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn set_day(&mut self, weekday: Weekday, schedule: Option<DaySchedule>) {
        self.weekly[weekday.num_days_from_monday() as usize] = schedule;
    }

    pub fn add_holiday(&mut self, date: NaiveDate, rule: HolidayRule) {
        self.holidays.insert(date, rule);
    }

    /// Effective schedule for a local date after applying holidays
    pub fn schedule_for(&self, date: NaiveDate) -> Option<DaySchedule> {
        let base = self.weekly[date.weekday().num_days_from_monday() as usize]?;
        match self.holidays.get(&date) {
            None => Some(base),
            Some(HolidayRule::Closed) => None,
            Some(HolidayRule::EarlyClose(close)) => Some(DaySchedule {
                close: *close,
                ..base
            }),
        }
    }

    /// Convert a local wall time to UTC. Ambiguous times take the earlier
    /// instant; times inside a DST gap are pushed forward one hour.
    fn resolve(&self, local: NaiveDateTime) -> DateTime<Utc> {
        self.timezone
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(local + Duration::hours(1)))
                    .earliest()
            })
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&local))
    }

    /// PREMARKET and OPEN windows of the local dates in `from..=to`, sorted
    fn windows(&self, from: NaiveDate, to: NaiveDate) -> Vec<Segment> {
        let mut windows = Vec::new();
        let mut date = from;

        while date <= to {
            if let Some(day) = self.schedule_for(date) {
                let open = self.resolve(date.and_time(day.open));
                let close_date = if day.close > day.open { date } else { date + Duration::days(1) };
                let close = self.resolve(close_date.and_time(day.close));

                if let Some(pre_open) = day.pre_open {
                    let pre_date = if pre_open <= day.open { date } else { date - Duration::days(1) };
                    let pre = self.resolve(pre_date.and_time(pre_open));
                    if pre < open {
                        windows.push(Segment { start: pre, end: open, status: MarketStatus::Premarket });
                    }
                }
                if open < close {
                    windows.push(Segment { start: open, end: close, status: MarketStatus::Open });
                }
            }
            date += Duration::days(1);
        }

        windows.sort_by_key(|w| w.start);
        windows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    status: MarketStatus,
}

/// The next status change after a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NextTransition {
    pub at: DateTime<Utc>,
    pub status: MarketStatus,
}

/// Result of [`compute_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClockReading {
    pub status: MarketStatus,
    /// Instant the current status began (the boundary of the last transition)
    pub since: DateTime<Utc>,
    /// `false` when `since` is only the start of the lookbehind range, as for
    /// a market that has been open around the clock
    pub since_is_boundary: bool,
    /// `None` when the market has no change within the lookahead horizon
    pub next: Option<NextTransition>,
}

/// Compute the status of a market at `instant`
pub fn compute_status(calendar: &MarketCalendar, instant: DateTime<Utc>) -> ClockReading {
    let range_start = instant - Duration::days(LOOKBEHIND_DAYS);
    let range_end = instant + Duration::days(LOOKAHEAD_DAYS);

    let local_date = instant.with_timezone(&calendar.timezone).date_naive();
    let windows = calendar.windows(
        local_date - Duration::days(LOOKBEHIND_DAYS + 1),
        local_date + Duration::days(LOOKAHEAD_DAYS + 1),
    );
    let timeline = build_timeline(windows, range_start, range_end);

    let position = timeline
        .iter()
        .position(|s| s.start <= instant && instant < s.end)
        .unwrap_or(0);

    match timeline.get(position) {
        Some(current) => ClockReading {
            status: current.status,
            since: current.start,
            since_is_boundary: current.start > range_start,
            next: timeline.get(position + 1).map(|next| NextTransition {
                at: next.start,
                status: next.status,
            }),
        },
        None => ClockReading {
            status: MarketStatus::Closed,
            since: range_start,
            since_is_boundary: false,
            next: None,
        },
    }
}

/// Fill the gaps between windows with CLOSED and merge equal neighbours.
/// Overlapping windows are clipped so earlier ones take precedence.
fn build_timeline(windows: Vec<Segment>, range_start: DateTime<Utc>, range_end: DateTime<Utc>) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut cursor = range_start;

    for window in windows {
        let start = window.start.max(cursor);
        let end = window.end.min(range_end);
        if start >= end {
            continue;
        }
        if start > cursor {
            push_merged(&mut segments, Segment { start: cursor, end: start, status: MarketStatus::Closed });
        }
        push_merged(&mut segments, Segment { start, end, status: window.status });
        cursor = end;
    }

    if cursor < range_end {
        push_merged(&mut segments, Segment { start: cursor, end: range_end, status: MarketStatus::Closed });
    }

    segments
}

fn push_merged(segments: &mut Vec<Segment>, segment: Segment) {
    match segments.last_mut() {
        Some(last) if last.status == segment.status && last.end == segment.start => last.end = segment.end,
        _ => segments.push(segment),
    }
}
