//! Time / recurrence engine, spec.md §4.1.
//!
//! Pure functions over a job's recurrence fields — no IO. Two recurrence
//! modes (`repeatInterval`, `repeatAt`), composed with `startDate` /
//! `skipDays` / `endDate` constraints in the fixed order spec.md §4.1 lays
//! out.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{Result, TaskloomError};
use crate::job::Job;

const SKIP_DAYS_MAX_ITERATIONS: u32 = 8;
const STUCK_TICK_GUARD: u32 = 100;

pub fn parse_timezone(tz: Option<&str>) -> Result<Tz> {
    match tz {
        None => Ok(Tz::UTC),
        Some(name) => Tz::from_str(name)
            .map_err(|_| TaskloomError::InvalidTimezone(name.to_string())),
    }
}

/// Computes the next `nextRunAt` for a recurring job from its current
/// fields, or `Ok(None)` if the job does not recur (no `repeatInterval` or
/// `repeatAt`) or its recurrence has ended (`endDate` crossed, or all
/// `skipDays` exhausted).
pub fn compute_next_run_at(job: &Job, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let tz = parse_timezone(job.repeat_timezone.as_deref())?;
    let anchor = job.last_run_at.unwrap_or(now);

    let base = if let Some(expr) = job.repeat_interval.as_deref() {
        Some(interval_next(expr, tz, anchor, job.next_run_at)?)
    } else if let Some(phrase) = job.repeat_at.as_deref() {
        Some(repeat_at_next(phrase, tz, anchor)?)
    } else {
        None
    };

    let Some(base) = base else {
        return Ok(None);
    };

    Ok(apply_constraints(base, job, tz))
}

/// Applies `startDate` / `skipDays` / `endDate` in the order spec.md §4.1
/// prescribes. Returns `None` if the recurrence has ended or every
/// candidate day is skipped.
fn apply_constraints(mut candidate: DateTime<Utc>, job: &Job, tz: Tz) -> Option<DateTime<Utc>> {
    if let Some(start) = job.start_date {
        if candidate < start {
            candidate = start;
        }
    }

    if !job.skip_days.0.is_empty() {
        if job.skip_days.is_full() {
            return None;
        }
        let mut iterations = 0;
        while job.skip_days.contains(candidate.with_timezone(&tz).weekday()) {
            iterations += 1;
            if iterations > SKIP_DAYS_MAX_ITERATIONS {
                return None;
            }
            candidate += Duration::days(1);
        }
    }

    if let Some(end) = job.end_date {
        if candidate > end {
            return None;
        }
    }

    Some(candidate)
}

/// Interval mode: try cron first, then a human interval phrase.
fn interval_next(
    expr: &str,
    tz: Tz,
    mut anchor: DateTime<Utc>,
    previous_next_run_at: Option<DateTime<Utc>>,
) -> Result<DateTime<Utc>> {
    if let Ok(schedule) = Schedule::from_str(expr) {
        let mut candidate = cron_after(&schedule, tz, anchor)
            .ok_or_else(|| TaskloomError::InvalidRepeatInterval(expr.to_string()))?;

        let mut guard = 0;
        while candidate == anchor || previous_next_run_at.is_some_and(|p| candidate <= p) {
            guard += 1;
            if guard > STUCK_TICK_GUARD {
                return Err(TaskloomError::InvalidRepeatInterval(expr.to_string()));
            }
            anchor += Duration::seconds(1);
            candidate = cron_after(&schedule, tz, anchor)
                .ok_or_else(|| TaskloomError::InvalidRepeatInterval(expr.to_string()))?;
        }
        return Ok(candidate);
    }

    let duration = parse_human_interval(expr)
        .ok_or_else(|| TaskloomError::InvalidRepeatInterval(expr.to_string()))?;
    if duration <= Duration::zero() {
        return Err(TaskloomError::InvalidRepeatInterval(expr.to_string()));
    }
    Ok(anchor + duration)
}

fn cron_after(schedule: &Schedule, tz: Tz, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let anchor_tz = anchor.with_timezone(&tz);
    schedule.after(&anchor_tz).next().map(|dt| dt.with_timezone(&Utc))
}

/// RepeatAt mode: next occurrence of a wall-clock time-of-day, strictly
/// after `anchor`; advances to the next day when it would otherwise land on
/// or before the anchor (covers the "equals lastRunAt" edge case in
/// spec.md §4.1).
fn repeat_at_next(phrase: &str, tz: Tz, anchor: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let time = parse_time_of_day(phrase)
        .ok_or_else(|| TaskloomError::InvalidRepeatAt(phrase.to_string()))?;

    let anchor_tz = anchor.with_timezone(&tz);
    let mut date = anchor_tz.date_naive();
    let mut candidate = local_datetime(tz, date, time)
        .ok_or_else(|| TaskloomError::InvalidRepeatAt(phrase.to_string()))?;

    if candidate <= anchor_tz {
        date = date.succ_opt().ok_or_else(|| TaskloomError::InvalidRepeatAt(phrase.to_string()))?;
        candidate = local_datetime(tz, date, time)
            .ok_or_else(|| TaskloomError::InvalidRepeatAt(phrase.to_string()))?;
    }

    Ok(candidate.with_timezone(&Utc))
}

fn local_datetime(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&date.and_time(time)).single()
}

/// Parses phrases like `"30 seconds"`, `"2 hours"`, `"1 day"`. Whole or
/// fractional magnitudes, singular or plural units.
pub fn parse_human_interval(s: &str) -> Option<Duration> {
    let s = s.trim();
    let mut parts = s.splitn(2, char::is_whitespace);
    let magnitude: f64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?.trim().to_ascii_lowercase();
    let unit = unit.trim_end_matches('s');

    let millis_per_unit: f64 = match unit {
        "millisecond" | "ms" => 1.0,
        "second" | "sec" => 1_000.0,
        "minute" | "min" => 60_000.0,
        "hour" | "hr" => 3_600_000.0,
        "day" => 86_400_000.0,
        "week" => 7.0 * 86_400_000.0,
        "month" => 30.0 * 86_400_000.0,
        "year" => 365.0 * 86_400_000.0,
        _ => return None,
    };

    Some(Duration::milliseconds((magnitude * millis_per_unit).round() as i64))
}

/// Parses a one-off schedule phrase: `"now"`, `"today at 9am"`, `"tomorrow at
/// 3pm"`, or a bare time-of-day (today, advancing to tomorrow if it has
/// already passed). Used by the facade's `schedule()` for the human-phrase
/// form of spec.md §4.6.
pub fn parse_date_phrase(phrase: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let trimmed = phrase.trim();
    let lower = trimmed.to_ascii_lowercase();

    if lower == "now" {
        return Ok(now);
    }

    let (day_offset, rest) = if let Some(rest) = lower.strip_prefix("tomorrow") {
        (1, rest)
    } else if let Some(rest) = lower.strip_prefix("today") {
        (0, rest)
    } else {
        (0, lower.as_str())
    };
    let rest = rest.trim_start().strip_prefix("at ").unwrap_or(rest).trim();

    let time = parse_time_of_day(rest).ok_or_else(|| TaskloomError::InvalidDatePhrase(phrase.to_string()))?;
    let mut date = now.date_naive() + Duration::days(day_offset);
    let mut candidate = date
        .and_time(time)
        .and_utc();

    if day_offset == 0 && candidate <= now {
        date = date.succ_opt().ok_or_else(|| TaskloomError::InvalidDatePhrase(phrase.to_string()))?;
        candidate = date.and_time(time).and_utc();
    }

    Ok(candidate)
}

/// Parses time-of-day phrases: `"3:00pm"`, `"9am"`, `"15:04"`, `"15:04:00"`.
pub fn parse_time_of_day(phrase: &str) -> Option<NaiveTime> {
    let phrase = phrase.trim().to_ascii_lowercase();
    let phrase = phrase.strip_prefix("at ").unwrap_or(&phrase);

    let (digits, meridiem) = if let Some(rest) = phrase.strip_suffix("am") {
        (rest.trim(), Some(false))
    } else if let Some(rest) = phrase.strip_suffix("pm") {
        (rest.trim(), Some(true))
    } else {
        (phrase, None)
    };

    let mut segments = digits.splitn(3, ':');
    let mut hour: u32 = segments.next()?.parse().ok()?;
    let minute: u32 = segments.next().map(|m| m.parse().ok()).unwrap_or(Some(0))?;
    let second: u32 = segments.next().map(|s| s.parse().ok()).unwrap_or(Some(0))?;

    if let Some(is_pm) = meridiem {
        if !(1..=12).contains(&hour) {
            return None;
        }
        hour %= 12;
        if is_pm {
            hour += 12;
        }
    }

    NaiveTime::from_hms_opt(hour, minute, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SkipDays;
    use chrono::Weekday;

    fn job_with_interval(interval: &str) -> Job {
        let mut job = Job::new("x", serde_json::Value::Null);
        job.repeat_interval = Some(interval.to_string());
        job
    }

    #[test]
    fn human_interval_parses_plural_and_singular() {
        assert_eq!(parse_human_interval("30 seconds"), Some(Duration::seconds(30)));
        assert_eq!(parse_human_interval("1 day"), Some(Duration::days(1)));
        assert_eq!(parse_human_interval("2 hours"), Some(Duration::hours(2)));
    }

    #[test]
    fn time_of_day_parses_meridiem_and_24h() {
        assert_eq!(parse_time_of_day("3:00pm"), NaiveTime::from_hms_opt(15, 0, 0));
        assert_eq!(parse_time_of_day("9am"), NaiveTime::from_hms_opt(9, 0, 0));
        assert_eq!(parse_time_of_day("15:04"), NaiveTime::from_hms_opt(15, 4, 0));
    }

    #[test]
    fn human_interval_recurrence_advances_from_anchor() {
        let job = job_with_interval("5 minutes");
        let now = Utc::now();
        let next = compute_next_run_at(&job, now).unwrap().unwrap();
        assert_eq!(next, now + Duration::minutes(5));
    }

    #[test]
    fn cron_recurrence_computes_next_minute_boundary() {
        let job = job_with_interval("0 * * * * *");
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 30).unwrap();
        let mut j = job;
        j.last_run_at = Some(now);
        let next = compute_next_run_at(&j, now).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 12, 1, 0).unwrap());
    }

    #[test]
    fn end_date_terminates_recurrence() {
        let mut job = job_with_interval("1 day");
        let now = Utc::now();
        job.end_date = Some(now - Duration::hours(1));
        assert_eq!(compute_next_run_at(&job, now).unwrap(), None);
    }

    #[test]
    fn start_date_pulls_next_run_forward() {
        let mut job = job_with_interval("1 day");
        let now = Utc::now();
        let start = now + Duration::days(3);
        job.start_date = Some(start);
        let next = compute_next_run_at(&job, now).unwrap().unwrap();
        assert_eq!(next, start);
    }

    #[test]
    fn skip_days_advances_past_forbidden_weekday() {
        let mut job = job_with_interval("1 day");
        job.skip_days = SkipDays::new([Weekday::Mon]);
        // Anchor a Sunday 00:00 UTC so the naive +1 day lands on Monday.
        let sunday = Utc.with_ymd_and_hms(2026, 8, 2, 0, 0, 0).unwrap();
        job.last_run_at = Some(sunday);
        let next = compute_next_run_at(&job, sunday).unwrap().unwrap();
        assert_ne!(next.with_timezone(&Tz::UTC).weekday(), Weekday::Mon);
    }

    #[test]
    fn skip_days_covering_all_week_yields_none() {
        let mut job = job_with_interval("1 day");
        job.skip_days = SkipDays::new([
            Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu,
            Weekday::Fri, Weekday::Sat, Weekday::Sun,
        ]);
        let now = Utc::now();
        assert_eq!(compute_next_run_at(&job, now).unwrap(), None);
    }

    #[test]
    fn non_recurring_job_has_no_engine_computed_next_run() {
        let job = Job::new("x", serde_json::Value::Null);
        assert_eq!(compute_next_run_at(&job, Utc::now()).unwrap(), None);
    }

    #[test]
    fn invalid_repeat_interval_is_an_error() {
        let job = job_with_interval("not a valid interval");
        assert!(compute_next_run_at(&job, Utc::now()).is_err());
    }
}
