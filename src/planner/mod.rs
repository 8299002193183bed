//! Window planning: turn an end date plus a look-back spec into the ordered
//! list of API-sized windows.
//!
//! The API refuses queries spanning more than a week, so the requested range
//! is carved backward from the end date. Freshest data is requested first, so
//! a run that dies halfway still leaves the most recent days loaded.

use crate::error::{Result, SmartError};
use crate::models::DateWindow;
use chrono::{Days, Local, Months, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest span the sitrep API accepts in one query, in inclusive days.
pub const MAX_WINDOW_DAYS: u32 = 7;

// ── Window spec ───────────────────────────────────────────────────────────────

/// How far back from the end date a run reaches.
///
/// Configured either as a bare day count (`10`) or as `"<N> <unit>"` with
/// unit one of day(s), week(s), month(s), year(s).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum WindowSpec {
    Days(i64),
    Text(String),
}

/// Text goes through [`FromStr`], so `"10"` from an env var is a day count.
impl<'de> Deserialize<'de> for WindowSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Days(i64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Days(n) => WindowSpec::Days(n),
            Raw::Text(s) => {
                let Ok(spec) = s.parse::<WindowSpec>();
                spec
            }
        })
    }
}

impl Default for WindowSpec {
    fn default() -> Self {
        WindowSpec::Days(MAX_WINDOW_DAYS as i64)
    }
}

impl FromStr for WindowSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().parse::<i64>() {
            Ok(n) => WindowSpec::Days(n),
            Err(_) => WindowSpec::Text(s.to_string()),
        })
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowSpec::Days(n) => write!(f, "{n} days"),
            WindowSpec::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Day,
    Week,
    Month,
    Year,
}

impl WindowSpec {
    fn parse(&self) -> Result<(i64, Unit)> {
        let text = match self {
            WindowSpec::Days(n) => return Ok((*n, Unit::Day)),
            WindowSpec::Text(s) => s,
        };
        if let Ok(n) = text.trim().parse::<i64>() {
            return Ok((n, Unit::Day));
        }

        let tokens: Vec<&str> = text.split_whitespace().collect();
        let [count, unit] = tokens.as_slice() else {
            return Err(SmartError::config(format!(
                "window `{text}` is not formatted as \"<N> <unit>\""
            )));
        };

        let count: i64 = count.parse().map_err(|_| {
            SmartError::config(format!("window `{text}` does not start with a whole number"))
        })?;

        let unit = unit.to_lowercase();
        let unit = match unit.strip_suffix('s').unwrap_or(unit.as_str()) {
            "day" => Unit::Day,
            "week" => Unit::Week,
            "month" => Unit::Month,
            "year" => Unit::Year,
            other => {
                return Err(SmartError::config(format!(
                    "window unit `{other}` is not supported"
                )));
            }
        };

        Ok((count, unit))
    }
}

// ── Planning ──────────────────────────────────────────────────────────────────

/// Resolve the configured end date: `today` or `YYYY-MM-DD`.
pub fn resolve_end_date(input: &str) -> Result<NaiveDate> {
    let input = input.trim();
    if input.eq_ignore_ascii_case("today") {
        return Ok(Local::now().date_naive());
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| SmartError::config(format!("unrecognised end date `{input}`")))
}

/// First date covered by a run ending on `end`.
///
/// Day and week counts are inclusive of `end`; months and years are calendar
/// subtraction, clamped to the end of shorter months.
pub fn plan(spec: &WindowSpec, end: NaiveDate) -> Result<NaiveDate> {
    let (count, unit) = spec.parse()?;
    if count < 1 {
        return Err(SmartError::config(format!(
            "window `{spec}` must cover at least one day"
        )));
    }
    let count = u32::try_from(count)
        .map_err(|_| SmartError::config(format!("window `{spec}` is too large")))?;

    let start = match unit {
        Unit::Day => end.checked_sub_days(Days::new(u64::from(count) - 1)),
        Unit::Week => end.checked_sub_days(Days::new(u64::from(count) * 7 - 1)),
        Unit::Month => end.checked_sub_months(Months::new(count)),
        Unit::Year => count
            .checked_mul(12)
            .and_then(|months| end.checked_sub_months(Months::new(months))),
    };

    start.ok_or_else(|| SmartError::config(format!("window `{spec}` reaches before year 1")))
}

/// Split `[start, end]` into windows of at most [`MAX_WINDOW_DAYS`] days.
pub fn split(start: NaiveDate, end: NaiveDate) -> Result<Vec<DateWindow>> {
    split_with_span(start, end, MAX_WINDOW_DAYS)
}

/// Split `[start, end]` into windows of at most `max_days` inclusive days,
/// carved backward from `end`. Most recent window first; only the last
/// (oldest) window may be shorter.
pub fn split_with_span(start: NaiveDate, end: NaiveDate, max_days: u32) -> Result<Vec<DateWindow>> {
    if start > end {
        return Err(SmartError::config(format!(
            "start date {start} is after end date {end}"
        )));
    }
    if max_days == 0 {
        return Err(SmartError::config("maximum window span must be at least one day"));
    }

    let span = i64::from(max_days);
    let mut windows = Vec::new();
    let mut cursor = end;

    while (cursor - start).num_days() + 1 > span {
        let window_start = cursor - Days::new(u64::from(max_days) - 1);
        windows.push(DateWindow::new(window_start, cursor));
        cursor = window_start - Days::new(1);
    }
    windows.push(DateWindow::new(start, cursor));

    Ok(windows)
}

/// Every window a run ending on `date_end` and reaching back `spec` will request.
pub fn plan_windows(date_end: &str, spec: &WindowSpec, max_days: u32) -> Result<Vec<DateWindow>> {
    let end = resolve_end_date(date_end)?;
    let start = plan(spec, end)?;
    split_with_span(start, end, max_days)
}
