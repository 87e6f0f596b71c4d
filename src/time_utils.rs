//! Time formatting and parsing helpers.
//!
//! Holds the one piece of process-wide configuration in the crate: the agency
//! timezone used to render timestamps and to anchor GTFS schedule times. When
//! it is unset, UTC is used.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::FeedError;

static AGENCY_TIMEZONE: RwLock<Option<Tz>> = RwLock::new(None);

const SERVICE_DATE_FORMAT: &str = "%Y%m%d";

pub fn set_agency_timezone(tz: Tz) {
    *AGENCY_TIMEZONE
        .write()
        .unwrap_or_else(PoisonError::into_inner) = Some(tz);
}

/// Sets the agency timezone from an IANA name such as `"America/New_York"`.
pub fn set_agency_timezone_name(name: &str) -> Result<Tz, FeedError> {
    let tz: Tz = name
        .parse()
        .map_err(|e| FeedError::Config(format!("unknown agency timezone '{name}': {e}")))?;
    set_agency_timezone(tz);
    Ok(tz)
}

pub fn clear_agency_timezone() {
    *AGENCY_TIMEZONE
        .write()
        .unwrap_or_else(PoisonError::into_inner) = None;
}

/// The configured agency timezone, or UTC.
pub fn agency_timezone() -> Tz {
    AGENCY_TIMEZONE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .unwrap_or(Tz::UTC)
}

/// Renders a POSIX timestamp (seconds) in the agency timezone.
///
/// `format` takes `strftime`-style specifiers; without one the output is
/// RFC 3339. Returns `None` if the timestamp is out of range.
pub fn format_timestamp(posix: i64, format: Option<&str>) -> Option<String> {
    format_timestamp_in(agency_timezone(), posix, format)
}

pub fn format_timestamp_in(tz: Tz, posix: i64, format: Option<&str>) -> Option<String> {
    let local = DateTime::<Utc>::from_timestamp(posix, 0)?.with_timezone(&tz);
    Some(match format {
        Some(f) => local.format(f).to_string(),
        None => local.to_rfc3339(),
    })
}

/// Parses a local date-time in the agency timezone into POSIX seconds.
pub fn parse_timestamp(text: &str, format: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(text, format).ok()?;
    local_to_posix(agency_timezone(), naive)
}

/// Parses a GTFS service date (`YYYYMMDD`).
pub fn parse_service_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, SERVICE_DATE_FORMAT).ok()
}

/// Parses a GTFS schedule time (`HH:MM:SS`).
///
/// Hours may run past 23 for trips that continue after midnight; the result is
/// the number of whole days to roll the service date forward and the
/// remaining time of day.
pub fn parse_schedule_time(text: &str) -> Option<(u32, NaiveTime)> {
    let mut parts = text.trim().split(':');
    let hours: u32 = parts.next()?.parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    let seconds: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    let time = NaiveTime::from_hms_opt(hours % 24, minutes, seconds)?;
    Some((hours / 24, time))
}

/// Combines a service date and a schedule time into POSIX seconds in `tz`.
pub fn scheduled_timestamp(tz: Tz, service_date: NaiveDate, schedule_time: &str) -> Option<i64> {
    let (days, time) = parse_schedule_time(schedule_time)?;
    let date = service_date.checked_add_days(Days::new(u64::from(days)))?;
    local_to_posix(tz, date.and_time(time))
}

/// Timestamp for a schedule expressed in hundredths of a minute past midnight
/// of `service_date`, as some agencies publish origin times.
pub fn timestamp_for_hundredths_of_minute_past_midnight(
    tz: Tz,
    service_date: NaiveDate,
    hundredths: u32,
) -> Option<i64> {
    let midnight = local_to_posix(tz, service_date.and_time(NaiveTime::from_hms_opt(0, 0, 0)?))?;
    // one hundredth of a minute is 600 ms
    Some(midnight + i64::from(hundredths) * 600 / 1000)
}

/// The date of a POSIX timestamp in `tz`.
pub fn local_date(tz: Tz, posix: i64) -> Option<NaiveDate> {
    Some(
        DateTime::<Utc>::from_timestamp(posix, 0)?
            .with_timezone(&tz)
            .date_naive(),
    )
}

fn local_to_posix(tz: Tz, naive: NaiveDateTime) -> Option<i64> {
    // During a DST gap there is no such local time; at an overlap the earlier
    // instant is used.
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}
