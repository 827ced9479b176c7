//! Station opening hours on a concrete calendar day.
//!
//! Stations describe availability either as always open or as recurring weekly
//! windows in the station's local timezone. Everything downstream works on
//! absolute [`Span`]s, so this module is the only place wall-clock dates and
//! clock times are turned into instants.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Weekday};
use chrono_tz::Tz;

use crate::model::*;

/// The absolute `[start, end)` of a local calendar day.
///
/// Returns `None` only for dates at the edge of chrono's representable range.
pub fn day_bounds(tz: Tz, date: NaiveDate) -> Option<Span> {
    let start = local_instant(tz, date.and_hms_opt(0, 0, 0)?)?;
    let next = date.succ_opt()?;
    let end = local_instant(tz, next.and_hms_opt(0, 0, 0)?)?;
    (start < end).then(|| Span::new(start, end))
}

/// Opening windows of `station` on `date`, ordered by start.
///
/// Configured windows are not merged; each matching one becomes its own span.
/// Windows with `start >= end` are dropped.
pub fn windows_for(station: &Station, date: NaiveDate) -> Vec<Span> {
    if station.always_open {
        return day_bounds(station.timezone, date).into_iter().collect();
    }

    let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
        return Vec::new();
    };
    let weekday = date.weekday();
    let mut spans: Vec<Span> = station
        .windows
        .iter()
        .filter(|w| w.day == weekday && !w.is_empty())
        .filter_map(|w| {
            let start = clock_instant(station.timezone, midnight, w.start)?;
            let end = clock_instant(station.timezone, midnight, w.end)?;
            (start < end).then(|| Span::new(start, end))
        })
        .collect();
    spans.sort_by_key(|s| s.start);
    spans
}

/// The local calendar date of instant `now` at the station.
pub fn local_date(tz: Tz, now: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(now).map(|utc| utc.with_timezone(&tz).date_naive())
}

/// Accepts `mon`..`sun`, full English names, or `0`..`6` counting from Sunday.
pub fn parse_weekday(s: &str) -> Result<Weekday, String> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u8>() {
        return match n {
            0 => Ok(Weekday::Sun),
            1..=6 => Weekday::try_from(n - 1).map_err(|e| e.to_string()),
            _ => Err(format!("day of week out of range: {n}")),
        };
    }
    s.parse::<Weekday>()
        .map_err(|_| format!("unknown day of week: {s}"))
}

fn clock_instant(tz: Tz, midnight: NaiveDateTime, clock: ClockTime) -> Option<Ms> {
    let local = midnight.checked_add_signed(Duration::minutes(i64::from(clock.minutes())))?;
    local_instant(tz, local)
}

/// Resolve a local wall-clock time to an instant.
///
/// A time repeated by a DST fold resolves to its first occurrence. A time
/// skipped by a DST gap moves forward to the first minute that exists.
fn local_instant(tz: Tz, local: NaiveDateTime) -> Option<Ms> {
    let mut probe = local;
    // Real-world gaps are at most a couple of hours.
    for _ in 0..=(4 * 60) {
        if let Some(t) = tz.from_local_datetime(&probe).earliest() {
            return Some(t.timestamp_millis());
        }
        probe = probe.checked_add_signed(Duration::minutes(1))?;
    }
    None
}
