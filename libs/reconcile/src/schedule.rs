//! Schedule evaluation.
//!
//! Turns a cron expression plus the last fired time into the single slot
//! that is due now, if any. A backlog of missed slots collapses into one
//! firing of the most recent slot (skip-ahead); the walk over missed slots
//! is bounded by [`MAX_MISSED_SCHEDULES`].
//!
//! Accepted forms:
//!
//! - `min hour day-of-month month day-of-week`, standard numbering
//!   (Sunday is 0 or 7). When both day fields are restricted, a day
//!   matches if either one does.
//! - Descriptors: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
//!   `@midnight`, `@hourly`.
//! - `@every <duration>` such as `@every 1h30m`: fixed steps from the last
//!   fired time (or the creation time).
//! - An optional `CRON_TZ=<zone>` or `TZ=<zone>` prefix; calendar fields are
//!   then evaluated in that zone. The default zone is UTC.

use std::iter::Peekable;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::ScheduleError;

/// Upper bound on missed occurrences walked in one evaluation.
pub const MAX_MISSED_SCHEDULES: usize = 100;

const WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Largest `@every` interval, in seconds (about 292 years).
const MAX_EVERY_SECS: f64 = 9_223_372_036.0;

/// A parsed schedule expression.
#[derive(Debug, Clone)]
pub struct CronExpr {
    cadence: Cadence,
}

#[derive(Debug, Clone)]
enum Cadence {
    /// Calendar fields. Two schedules when day-of-month and day-of-week
    /// are both restricted; occurrences are the union of both.
    Calendar { schedules: Vec<Schedule>, tz: Tz },
    /// Fixed interval of whole seconds.
    Every(TimeDelta),
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let invalid = |message: String| ScheduleError::InvalidExpression {
            expr: expr.to_string(),
            message,
        };

        let (tz, body) = split_time_zone(expr.trim()).map_err(invalid)?;

        if let Some(interval) = body.strip_prefix("@every") {
            if !interval.is_empty() && !interval.starts_with(char::is_whitespace) {
                return Err(invalid(format!("unknown descriptor {body}")));
            }
            let step = parse_interval(interval.trim()).map_err(invalid)?;
            return Ok(Self {
                cadence: Cadence::Every(step),
            });
        }

        let standard = match body {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other if other.starts_with('@') => {
                return Err(invalid(format!("unknown descriptor {other}")))
            }
            other => other,
        };

        let fields: Vec<&str> = standard.split_whitespace().collect();
        let &[minute, hour, day_of_month, month, day_of_week] = fields.as_slice() else {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        };

        // The cron crate wants a leading seconds field and numbers weekdays
        // 1-7 from Sunday, so weekdays are rewritten as names.
        let weekdays = translate_weekdays(day_of_week).map_err(invalid)?;
        let day_of_month = if day_of_month == "?" { "*" } else { day_of_month };

        let build = |dom: &str, dow: &str| {
            Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}"))
                .map_err(|e| invalid(e.to_string()))
        };
        let schedules = if is_unrestricted(day_of_month) || is_unrestricted(day_of_week) {
            vec![build(day_of_month, &weekdays)?]
        } else {
            vec![build(day_of_month, "*")?, build("*", &weekdays)?]
        };

        Ok(Self {
            cadence: Cadence::Calendar { schedules, tz },
        })
    }

    /// First occurrence strictly after `t`. For `@every`, `t` is taken as
    /// the start of the interval.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.cadence {
            Cadence::Calendar { schedules, tz } => calendar_after(schedules, *tz, t).next(),
            Cadence::Every(step) => t.checked_add_signed(*step),
        }
    }

    /// The slot due at `now`, if any.
    ///
    /// Occurrences are walked from `last_fired`, or from `lower_bound` (the
    /// schedule's creation time) when nothing has fired yet. The most
    /// recent occurrence at or before `now` is returned. More than
    /// [`MAX_MISSED_SCHEDULES`] occurrences aborts the walk with
    /// [`ScheduleError::TooManyMissed`].
    pub fn due_time(
        &self,
        last_fired: Option<DateTime<Utc>>,
        lower_bound: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let anchor = last_fired.unwrap_or(lower_bound);
        if anchor > now {
            return Ok(None);
        }

        let latest = match &self.cadence {
            Cadence::Calendar { schedules, tz } => {
                let mut latest = None;
                let mut missed = 0usize;
                for occurrence in calendar_after(schedules, *tz, anchor) {
                    if occurrence > now {
                        break;
                    }
                    missed += 1;
                    if missed > MAX_MISSED_SCHEDULES {
                        return Err(too_many_missed());
                    }
                    latest = Some(occurrence);
                }
                latest
            }
            Cadence::Every(step) => {
                let missed = (now - anchor).num_seconds() / step.num_seconds();
                if missed > MAX_MISSED_SCHEDULES as i64 {
                    return Err(too_many_missed());
                }
                (missed > 0).then(|| anchor + *step * missed as i32)
            }
        };

        if latest.is_some() && latest == last_fired {
            return Ok(None);
        }
        Ok(latest)
    }

    /// Time from `now` until the next occurrence. A scheduling hint only.
    ///
    /// `anchor` is the time the walk in [`Self::due_time`] started from;
    /// only `@every` schedules depend on it.
    pub fn next_wakeup_delay(
        &self,
        anchor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let next = match &self.cadence {
            Cadence::Every(step) if anchor <= now => {
                let elapsed = (now - anchor).num_seconds() / step.num_seconds();
                let steps = i32::try_from(elapsed + 1).ok()?;
                anchor.checked_add_signed(step.checked_mul(steps)?)?
            }
            Cadence::Every(step) => anchor.checked_add_signed(*step)?,
            Cadence::Calendar { .. } => self.next_after(now)?,
        };
        (next - now).to_std().ok()
    }
}

fn too_many_missed() -> ScheduleError {
    ScheduleError::TooManyMissed {
        limit: MAX_MISSED_SCHEDULES,
    }
}

fn is_unrestricted(field: &str) -> bool {
    matches!(field, "*" | "?")
}

/// Splits an optional `CRON_TZ=` or `TZ=` prefix off `expr`.
fn split_time_zone(expr: &str) -> Result<(Tz, &str), String> {
    let Some(rest) = expr
        .strip_prefix("CRON_TZ=")
        .or_else(|| expr.strip_prefix("TZ="))
    else {
        return Ok((Tz::UTC, expr));
    };
    let (zone, body) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| "time zone prefix without a schedule".to_string())?;
    let tz = zone
        .parse::<Tz>()
        .map_err(|_| format!("unknown time zone {zone:?}"))?;
    Ok((tz, body.trim()))
}

/// Occurrences of every schedule after `t`, merged in time order.
fn calendar_after(
    schedules: &[Schedule],
    tz: Tz,
    t: DateTime<Utc>,
) -> impl Iterator<Item = DateTime<Utc>> + '_ {
    let start = t.with_timezone(&tz);
    let mut sources: Vec<Peekable<_>> = schedules
        .iter()
        .map(|schedule| {
            schedule
                .after(&start)
                .map(|occurrence| occurrence.with_timezone(&Utc))
                .peekable()
        })
        .collect();

    std::iter::from_fn(move || {
        let next = sources.iter_mut().filter_map(|s| s.peek().copied()).min()?;
        for source in &mut sources {
            if source.peek() == Some(&next) {
                source.next();
            }
        }
        Some(next)
    })
}

/// Parses an `@every` interval: one or more `<number><unit>` terms, units
/// `h`, `m`, `s`, `ms`, `us`, `ns`. The sum is truncated to whole seconds;
/// anything shorter than a second runs every second.
fn parse_interval(s: &str) -> Result<TimeDelta, String> {
    if s.is_empty() {
        return Err("@every needs an interval such as 5m".to_string());
    }

    let mut rest = s;
    let mut total = 0.0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid interval {s:?}"))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let seconds = match unit {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            "" => return Err(format!("interval {s:?} is missing a unit")),
            other => return Err(format!("unknown interval unit {other:?}")),
        };

        total += value * seconds;
        if !total.is_finite() || total > MAX_EVERY_SECS {
            return Err(format!("interval {s:?} is too long"));
        }
        rest = tail;
    }

    Ok(TimeDelta::seconds((total as i64).max(1)))
}

/// Rewrites a standard day-of-week field (0-7, Sunday = 0 or 7) as an
/// explicit list of weekday names.
fn translate_weekdays(field: &str) -> Result<String, String> {
    if is_unrestricted(field) {
        return Ok("*".to_string());
    }

    let mut days = [false; 7];
    for token in field.split(',') {
        let (base, step) = match token.split_once('/') {
            Some((base, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid weekday step {step:?}"))?;
                if !(1..=7).contains(&step) {
                    return Err(format!("weekday step {step} out of range 1-7"));
                }
                (base, Some(step))
            }
            None => (token, None),
        };

        let (start, end) = match base {
            "*" | "?" => (0, 6),
            range if range.contains('-') => {
                let (a, b) = range
                    .split_once('-')
                    .ok_or_else(|| format!("invalid weekday range {range:?}"))?;
                (parse_weekday(a)?, parse_weekday(b)?)
            }
            single => {
                let day = parse_weekday(single)?;
                // `a/step` runs from a to the end of the week.
                (day, if step.is_some() { 6 } else { day })
            }
        };
        if start > end {
            return Err(format!("weekday range {base:?} runs backwards"));
        }

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    let names: Vec<&str> = WEEKDAYS
        .iter()
        .zip(days)
        .filter_map(|(name, set)| set.then_some(*name))
        .collect();
    if names.is_empty() {
        return Err(format!("empty weekday field {field:?}"));
    }
    Ok(names.join(","))
}

fn parse_weekday(s: &str) -> Result<usize, String> {
    if let Ok(n) = s.parse::<usize>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("weekday {n} out of range 0-7"))
        };
    }
    WEEKDAYS
        .iter()
        .position(|name| name.eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("invalid weekday {s:?}"))
}
