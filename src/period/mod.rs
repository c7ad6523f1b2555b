// src/period/mod.rs

pub mod date_parser;

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};
use std::{cmp::Ordering, fmt, str::FromStr};

use crate::error::{Error, Result};

pub use date_parser::{parse_date, parse_range};

static QUARTER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})q([1-4])$").expect("quarter token regex"));
static MONTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})_(0[1-9]|1[0-2])$").expect("month token regex"));

/// Identifier of one release: `2019q3` for quarterly, `2020_10` for monthly.
///
/// Tokens order chronologically by the first day they cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodToken {
    Quarter { year: i32, quarter: u32 },
    Month { year: i32, month: u32 },
}

impl PeriodToken {
    /// The quarter containing `date`.
    pub fn quarter_of(date: NaiveDate) -> Self {
        PeriodToken::Quarter {
            year: date.year(),
            quarter: date.month0() / 3 + 1,
        }
    }

    /// The month containing `date`.
    pub fn month_of(date: NaiveDate) -> Self {
        PeriodToken::Month {
            year: date.year(),
            month: date.month(),
        }
    }

    /// First day covered by this release.
    pub fn start_date(&self) -> NaiveDate {
        let (year, month) = match *self {
            PeriodToken::Quarter { year, quarter } => (year, (quarter - 1) * 3 + 1),
            PeriodToken::Month { year, month } => (year, month),
        };
        NaiveDate::from_ymd_opt(year, month, 1).expect("token fields are always in range")
    }

    /// The release immediately after this one, at the same granularity.
    pub fn succ(&self) -> Self {
        match *self {
            PeriodToken::Quarter { year, quarter: 4 } => PeriodToken::Quarter {
                year: year + 1,
                quarter: 1,
            },
            PeriodToken::Quarter { year, quarter } => PeriodToken::Quarter {
                year,
                quarter: quarter + 1,
            },
            PeriodToken::Month { year, month: 12 } => PeriodToken::Month {
                year: year + 1,
                month: 1,
            },
            PeriodToken::Month { year, month } => PeriodToken::Month {
                year,
                month: month + 1,
            },
        }
    }

    pub fn is_monthly(&self) -> bool {
        matches!(self, PeriodToken::Month { .. })
    }
}

impl Ord for PeriodToken {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.start_date(), self.is_monthly()).cmp(&(other.start_date(), other.is_monthly()))
    }
}

impl PartialOrd for PeriodToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PeriodToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodToken::Quarter { year, quarter } => write!(f, "{}q{}", year, quarter),
            PeriodToken::Month { year, month } => write!(f, "{}_{:02}", year, month),
        }
    }
}

impl FromStr for PeriodToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::InvalidPeriodToken(s.to_string());
        if let Some(caps) = QUARTER_RE.captures(s) {
            return Ok(PeriodToken::Quarter {
                year: caps[1].parse().map_err(|_| bad())?,
                quarter: caps[2].parse().map_err(|_| bad())?,
            });
        }
        if let Some(caps) = MONTH_RE.captures(s) {
            return Ok(PeriodToken::Month {
                year: caps[1].parse().map_err(|_| bad())?,
                month: caps[2].parse().map_err(|_| bad())?,
            });
        }
        Err(bad())
    }
}

impl Serialize for PeriodToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn check_range(start: NaiveDate, end: NaiveDate) -> Result<()> {
    if start > end {
        return Err(Error::EmptyDateRange { start, end });
    }
    Ok(())
}

fn walk(first: PeriodToken, end: NaiveDate) -> Vec<PeriodToken> {
    let mut out = Vec::new();
    let mut cur = first;
    while cur.start_date() <= end {
        out.push(cur);
        cur = cur.succ();
    }
    out
}

/// Every quarter overlapping `[start, end]`, including the quarters that
/// contain `start` and `end` even when they only partially overlap.
pub fn resolve_quarters(start: NaiveDate, end: NaiveDate) -> Result<Vec<PeriodToken>> {
    check_range(start, end)?;
    Ok(walk(PeriodToken::quarter_of(start), end))
}

/// Every month overlapping `[start, end]`.
pub fn resolve_months(start: NaiveDate, end: NaiveDate) -> Result<Vec<PeriodToken>> {
    check_range(start, end)?;
    Ok(walk(PeriodToken::month_of(start), end))
}

/// Resolve a range for a dataset whose releases switch from quarterly to
/// monthly on `cutover`.
///
/// Quarters cover `[start, cutover - 1 day]`, months cover
/// `[max(start, cutover), end]`. Without a cutover, or when `end` is before
/// it, this is plain [`resolve_quarters`].
pub fn resolve_with_cutover(
    start: NaiveDate,
    end: NaiveDate,
    cutover: Option<NaiveDate>,
) -> Result<Vec<PeriodToken>> {
    check_range(start, end)?;
    let cutover = match cutover {
        Some(c) if end >= c => c,
        _ => return resolve_quarters(start, end),
    };

    let mut tokens = Vec::new();
    if start < cutover {
        // cutover > start >= NaiveDate::MIN, so pred exists
        let last_quarterly_day = cutover.pred_opt().unwrap_or(cutover);
        tokens.extend(resolve_quarters(start, last_quarterly_day)?);
    }
    tokens.extend(resolve_months(start.max(cutover), end)?);

    debug_assert!(tokens.windows(2).all(|w| w[0] < w[1]));
    Ok(tokens)
}
