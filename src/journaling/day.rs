use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime, Time, UtcOffset};

/// Source of wall-clock time for day-boundary decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock in local time.
///
/// The local offset is re-read on every call so a DST change during a long
/// session moves "today" with it. Where the platform refuses to report the
/// offset once other threads exist (Linux with a multi-threaded runtime), the
/// offset captured at construction is used instead.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    fallback: UtcOffset,
}

impl SystemClock {
    /// Captures the current local offset as the fallback. Call this before the
    /// async runtime starts worker threads.
    pub fn local() -> Self {
        let fallback = UtcOffset::current_local_offset().unwrap_or_else(|err| {
            tracing::warn!(?err, "local UTC offset unavailable, day boundaries use UTC");
            UtcOffset::UTC
        });
        Self { fallback }
    }

    pub fn with_offset(offset: UtcOffset) -> Self {
        Self { fallback: offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        let offset = UtcOffset::current_local_offset().unwrap_or(self.fallback);
        OffsetDateTime::now_utc().to_offset(offset)
    }
}

/// True when `b`, seen in `a`'s offset, falls on the same year/month/day as `a`.
pub fn is_same_calendar_day(a: OffsetDateTime, b: OffsetDateTime) -> bool {
    a.date() == b.to_offset(a.offset()).date()
}

/// The first 00:00:00 strictly after `from`, in `from`'s offset.
pub fn next_midnight(from: OffsetDateTime) -> OffsetDateTime {
    let tomorrow = from.date().next_day().unwrap_or(Date::MAX);
    tomorrow.with_time(Time::MIDNIGHT).assume_offset(from.offset())
}

/// Date stamp written on locally created entries.
pub fn stamp(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

/// Normalises the date formats seen on entries to a calendar day.
///
/// Three dash-separated numbers are a date-only stamp (`2024-04-03`). Anything
/// else is tried as RFC 3339, a US locale date (`4/3/2024`) and a JavaScript
/// `Date.toString()` rendering (`Wed Apr 03 2024 10:00:00 GMT+0200 (...)`).
/// Timestamps carrying their own offset are moved into `offset` first.
pub fn parse_entry_date(raw: &str, offset: UtcOffset) -> Option<Date> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let parts: Vec<&str> = raw.split('-').collect();
    if parts.len() == 3 && parts.iter().all(|part| is_numeric(part)) {
        let year = parts[0].parse::<i32>().ok()?;
        let month = Month::try_from(parts[1].parse::<u8>().ok()?).ok()?;
        let day = parts[2].parse::<u8>().ok()?;
        return Date::from_calendar_date(year, month, day).ok();
    }

    if let Ok(timestamp) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(timestamp.to_offset(offset).date());
    }

    if let Ok(date) = Date::parse(
        raw,
        format_description!("[month padding:none]/[day padding:none]/[year]"),
    ) {
        return Some(date);
    }

    let tokens: Vec<&str> = raw.split_whitespace().collect();
    if tokens.len() >= 4 {
        let calendar = tokens[1..4].join(" ");
        if let Ok(date) = Date::parse(
            &calendar,
            format_description!("[month repr:short] [day] [year]"),
        ) {
            return Some(date);
        }
    }

    None
}

/// Whether `raw` names the same calendar day as `now`. Unparsable stamps are
/// never today.
pub fn is_today(raw: &str, now: OffsetDateTime) -> bool {
    match parse_entry_date(raw, now.offset()) {
        Some(date) => date == now.date(),
        None => {
            tracing::debug!(raw, "unparsable entry date, treating as a past day");
            false
        }
    }
}

fn is_numeric(part: &str) -> bool {
    !part.is_empty() && part.chars().all(|ch| ch.is_ascii_digit())
}


#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, offset};

    #[test]
    fn same_day_ignores_time_of_day() {
        let morning = datetime!(2024-04-03 00:00:01 +2);
        let night = datetime!(2024-04-03 23:59:59 +2);
        assert!(is_same_calendar_day(morning, night));
        assert!(!is_same_calendar_day(
            night,
            datetime!(2024-04-04 00:00:00 +2)
        ));
    }

    #[test]
    fn same_day_compares_in_first_offset() {
        let local = datetime!(2024-04-03 23:30:00 +2);
        let utc = datetime!(2024-04-03 21:30:00 UTC);
        assert!(is_same_calendar_day(local, utc));
    }

    #[test]
    fn next_midnight_is_strictly_after() {
        assert_eq!(
            next_midnight(datetime!(2024-04-03 13:45:00 -5)),
            datetime!(2024-04-04 00:00:00 -5)
        );
        assert_eq!(
            next_midnight(datetime!(2024-04-03 00:00:00 -5)),
            datetime!(2024-04-04 00:00:00 -5)
        );
        assert_eq!(
            next_midnight(datetime!(2024-12-31 23:59:59 UTC)),
            datetime!(2025-01-01 00:00:00 UTC)
        );
    }

    #[test]
    fn dashed_and_locale_formats_parse_to_the_same_day() {
        let utc = offset!(UTC);
        let expected = Some(date!(2024 - 04 - 03));
        assert_eq!(parse_entry_date("2024-04-03", utc), expected);
        assert_eq!(parse_entry_date("2024-4-3", utc), expected);
        assert_eq!(parse_entry_date("4/3/2024", utc), expected);
        assert_eq!(parse_entry_date("04/03/2024", utc), expected);
        assert_eq!(
            parse_entry_date(
                "Wed Apr 03 2024 10:00:00 GMT+0200 (Central European Summer Time)",
                utc
            ),
            expected
        );
    }

    #[test]
    fn rfc3339_timestamps_move_into_the_local_offset() {
        assert_eq!(
            parse_entry_date("2024-04-03T23:30:00Z", offset!(+2)),
            Some(date!(2024 - 04 - 04))
        );
    }

    #[test]
    fn unparsable_dates_fail_closed() {
        let now = datetime!(2024-04-03 12:00:00 UTC);
        assert_eq!(parse_entry_date("", now.offset()), None);
        assert_eq!(parse_entry_date("yesterday-ish", now.offset()), None);
        assert_eq!(parse_entry_date("2024-13-40", now.offset()), None);
        assert!(!is_today("not a date", now));
        assert!(is_today("2024-04-03", now));
        assert!(!is_today("2024-04-02", now));
    }

    #[test]
    fn system_clock_reads_the_current_instant() {
        let clock = SystemClock::with_offset(offset!(+5));
        let drift = clock.now() - OffsetDateTime::now_utc();
        assert!(drift.abs() < time::Duration::seconds(5));
    }

    #[test]
    fn stamp_round_trips_through_parser() {
        let day = date!(2025 - 01 - 09);
        assert_eq!(stamp(day), "2025-01-09");
        assert_eq!(parse_entry_date(&stamp(day), offset!(UTC)), Some(day));
    }
}
