//! Session generation from recurring weekday + time-of-day rules.
//!
//! Local dates are walked in the schedule's fixed UTC offset; each enabled
//! weekday yields one session per configured start time. A generated session
//! is kept when its start falls inside the event's `[start, end)` range.

use chrono::{Datelike, FixedOffset, NaiveTime, TimeZone, Weekday};

use crate::limits::{MAX_SESSIONS_PER_EVENT, MAX_SESSION_DURATION_MS};
use crate::model::{Ms, Schedule, Span};

pub const DAILY: u8 = 0b111_1111;
pub const WEEKDAYS: u8 = 0b001_1111;
pub const WEEKENDS: u8 = 0b110_0000;

const MINUTE_MS: Ms = 60_000;

pub fn day_bit(day: Weekday) -> u8 {
    1 << day.num_days_from_monday()
}

/// Parse `mon,wed,fri`, full day names, `daily`, `weekdays` or `weekends`.
pub fn parse_days(s: &str) -> Result<u8, ScheduleError> {
    let mut mask = 0u8;
    for part in s.split(',') {
        let part = part.trim().to_lowercase();
        if part.is_empty() {
            continue;
        }
        mask |= match part.as_str() {
            "daily" | "everyday" => DAILY,
            "weekdays" => WEEKDAYS,
            "weekends" => WEEKENDS,
            other => day_bit(
                other
                    .parse::<Weekday>()
                    .map_err(|_| ScheduleError::BadDay(other.to_string()))?,
            ),
        };
    }
    if mask == 0 {
        return Err(ScheduleError::NoDays);
    }
    Ok(mask)
}

/// Parse `HH:MM[,HH:MM...]` into sorted, deduplicated minutes after midnight.
pub fn parse_times(s: &str) -> Result<Vec<u16>, ScheduleError> {
    let mut times = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (h, m) = part
            .split_once(':')
            .ok_or_else(|| ScheduleError::BadTime(part.to_string()))?;
        let h: u16 = h.parse().map_err(|_| ScheduleError::BadTime(part.to_string()))?;
        let m: u16 = m.parse().map_err(|_| ScheduleError::BadTime(part.to_string()))?;
        if h > 23 || m > 59 {
            return Err(ScheduleError::BadTime(part.to_string()));
        }
        times.push(h * 60 + m);
    }
    if times.is_empty() {
        return Err(ScheduleError::NoTimes);
    }
    times.sort_unstable();
    times.dedup();
    Ok(times)
}

/// Expand a schedule over an event range into session spans, sorted by start.
pub fn expand(range: &Span, schedule: &Schedule) -> Result<Vec<Span>, ScheduleError> {
    if schedule.days & DAILY == 0 {
        return Err(ScheduleError::NoDays);
    }
    if schedule.times.is_empty() {
        return Err(ScheduleError::NoTimes);
    }
    if schedule.duration_min == 0 {
        return Err(ScheduleError::ZeroDuration);
    }
    let duration_ms = Ms::from(schedule.duration_min) * MINUTE_MS;
    if duration_ms > MAX_SESSION_DURATION_MS {
        return Err(ScheduleError::TooLong);
    }
    let offset = schedule
        .utc_offset_min
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or(ScheduleError::BadOffset(schedule.utc_offset_min))?;

    let first = offset
        .timestamp_millis_opt(range.start)
        .single()
        .ok_or(ScheduleError::OutOfRange)?
        .date_naive();
    let last = offset
        .timestamp_millis_opt(range.end - 1)
        .single()
        .ok_or(ScheduleError::OutOfRange)?
        .date_naive();

    let mut sessions = Vec::new();
    let mut date = first;
    while date <= last {
        if schedule.days & day_bit(date.weekday()) != 0 {
            for &minutes in &schedule.times {
                let time = NaiveTime::from_hms_opt(u32::from(minutes / 60), u32::from(minutes % 60), 0)
                    .ok_or_else(|| ScheduleError::BadTime(minutes.to_string()))?;
                let start = offset
                    .from_local_datetime(&date.and_time(time))
                    .single()
                    .ok_or(ScheduleError::OutOfRange)?
                    .timestamp_millis();
                if !range.contains_instant(start) {
                    continue;
                }
                if sessions.len() >= MAX_SESSIONS_PER_EVENT {
                    return Err(ScheduleError::TooManySessions);
                }
                sessions.push(Span::new(start, start + duration_ms));
            }
        }
        date = date.succ_opt().ok_or(ScheduleError::OutOfRange)?;
    }
    Ok(sessions)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    BadDay(String),
    BadTime(String),
    BadOffset(i32),
    NoDays,
    NoTimes,
    ZeroDuration,
    TooLong,
    TooManySessions,
    OutOfRange,
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::BadDay(d) => write!(f, "unknown day: {d}"),
            ScheduleError::BadTime(t) => write!(f, "bad time of day: {t} (expected HH:MM)"),
            ScheduleError::BadOffset(o) => write!(f, "bad utc offset: {o} minutes"),
            ScheduleError::NoDays => write!(f, "schedule has no days"),
            ScheduleError::NoTimes => write!(f, "schedule has no start times"),
            ScheduleError::ZeroDuration => write!(f, "session duration must be positive"),
            ScheduleError::TooLong => write!(f, "session duration too long"),
            ScheduleError::TooManySessions => write!(f, "schedule generates too many sessions"),
            ScheduleError::OutOfRange => write!(f, "schedule date out of range"),
        }
    }
}

impl std::error::Error for ScheduleError {}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const DAY: Ms = 24 * H;
    /// 2026-01-05T00:00:00Z, a Monday.
    const MONDAY: Ms = 1_767_571_200_000;

    fn schedule(days: u8, times: &[u16], duration_min: u32, utc_offset_min: i32) -> Schedule {
        Schedule {
            days,
            times: times.to_vec(),
            duration_min,
            capacity: 10,
            utc_offset_min,
        }
    }

    #[test]
    fn parse_days_lists_and_aliases() {
        assert_eq!(parse_days("mon").unwrap(), 0b1);
        assert_eq!(parse_days("Mon, wednesday ,FRI").unwrap(), 0b1_0101);
        assert_eq!(parse_days("weekdays").unwrap(), WEEKDAYS);
        assert_eq!(parse_days("weekends,mon").unwrap(), WEEKENDS | 1);
        assert_eq!(parse_days("daily").unwrap(), DAILY);
    }

    #[test]
    fn parse_days_rejects() {
        assert_eq!(parse_days(""), Err(ScheduleError::NoDays));
        assert_eq!(parse_days("funday"), Err(ScheduleError::BadDay("funday".into())));
    }

    #[test]
    fn parse_times_sorted_and_deduped() {
        assert_eq!(parse_times("14:30, 09:00,14:30").unwrap(), vec![540, 870]);
    }

    #[test]
    fn parse_times_rejects() {
        assert_eq!(parse_times(""), Err(ScheduleError::NoTimes));
        assert!(matches!(parse_times("24:00"), Err(ScheduleError::BadTime(_))));
        assert!(matches!(parse_times("12:60"), Err(ScheduleError::BadTime(_))));
        assert!(matches!(parse_times("noon"), Err(ScheduleError::BadTime(_))));
    }

    #[test]
    fn expand_weekly_pattern() {
        // Mon + Wed, 09:00 and 14:00 UTC, one week.
        let range = Span::new(MONDAY, MONDAY + 7 * DAY);
        let s = schedule(0b101, &[9 * 60, 14 * 60], 90, 0);
        let sessions = expand(&range, &s).unwrap();
        assert_eq!(
            sessions,
            vec![
                Span::new(MONDAY + 9 * H, MONDAY + 10 * H + H / 2),
                Span::new(MONDAY + 14 * H, MONDAY + 15 * H + H / 2),
                Span::new(MONDAY + 2 * DAY + 9 * H, MONDAY + 2 * DAY + 10 * H + H / 2),
                Span::new(MONDAY + 2 * DAY + 14 * H, MONDAY + 2 * DAY + 15 * H + H / 2),
            ]
        );
    }

    #[test]
    fn expand_applies_utc_offset() {
        // 09:00 at UTC-5 is 14:00 UTC.
        let range = Span::new(MONDAY, MONDAY + DAY);
        let s = schedule(DAILY, &[9 * 60], 60, -300);
        let sessions = expand(&range, &s).unwrap();
        assert_eq!(sessions, vec![Span::new(MONDAY + 14 * H, MONDAY + 15 * H)]);
    }

    #[test]
    fn expand_skips_times_before_range_start() {
        let range = Span::new(MONDAY + 12 * H, MONDAY + DAY);
        let s = schedule(DAILY, &[9 * 60, 18 * 60], 60, 0);
        let sessions = expand(&range, &s).unwrap();
        assert_eq!(sessions, vec![Span::new(MONDAY + 18 * H, MONDAY + 19 * H)]);
    }

    #[test]
    fn expand_end_is_exclusive() {
        // Range ends exactly at the second Monday's 00:00; a midnight slot there is excluded.
        let range = Span::new(MONDAY, MONDAY + 7 * DAY);
        let s = schedule(0b1, &[0], 30, 0);
        let sessions = expand(&range, &s).unwrap();
        assert_eq!(sessions, vec![Span::new(MONDAY, MONDAY + 30 * 60_000)]);
    }

    #[test]
    fn expand_no_matching_days_is_empty() {
        // Saturday only, over Mon..Wed.
        let range = Span::new(MONDAY, MONDAY + 3 * DAY);
        let s = schedule(0b10_0000, &[600], 60, 0);
        assert!(expand(&range, &s).unwrap().is_empty());
    }

    #[test]
    fn expand_rejects_bad_rules() {
        let range = Span::new(MONDAY, MONDAY + DAY);
        assert_eq!(expand(&range, &schedule(DAILY, &[600], 0, 0)), Err(ScheduleError::ZeroDuration));
        assert_eq!(expand(&range, &schedule(0, &[600], 60, 0)), Err(ScheduleError::NoDays));
        assert_eq!(expand(&range, &schedule(DAILY, &[], 60, 0)), Err(ScheduleError::NoTimes));
        assert_eq!(
            expand(&range, &schedule(DAILY, &[600], 60, 24 * 60)),
            Err(ScheduleError::BadOffset(24 * 60))
        );
        assert_eq!(
            expand(&range, &schedule(DAILY, &[600], 8 * 24 * 60, 0)),
            Err(ScheduleError::TooLong)
        );
    }

    #[test]
    fn expand_caps_session_count() {
        // Every minute-of-day slot would exceed the per-event cap within a few days.
        let times: Vec<u16> = (0..24 * 60).step_by(5).collect();
        let range = Span::new(MONDAY, MONDAY + 30 * DAY);
        let s = schedule(DAILY, &times, 5, 0);
        assert_eq!(expand(&range, &s), Err(ScheduleError::TooManySessions));
    }
}
