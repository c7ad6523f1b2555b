use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};

use crate::error::{Error, Result};

/// Day-resolution formats, tried in order. Year-first shapes come before the
/// day-first ones so `2019-12-01` is never read as a day/month pair, and
/// month-first shapes come last so they only match when the day-first
/// reading is impossible (`12/31/2019`).
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%Y-%b-%d",
    "%d-%m-%Y",
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%d-%b-%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
    "%B %d %Y",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%m.%d.%Y",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parse a calendar date written in any of the supported shapes and
/// normalise it to a plain day.
///
/// Numeric dates are year-first (`2019-12-15`, `2019/12/15`, `20191215`) or
/// day-first (`15-12-2019`, `15/12/2019`). `01/10/2019` is the 1st of
/// October; a month-first reading is only taken when the day-first one is
/// impossible, as in `12/31/2019`. Date-times are truncated to their day.
pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::InvalidDateFormat(raw.to_string()));
    }

    // compact YYYYMMDD
    if s.len() == 8 && s.chars().all(|c| c.is_ascii_digit()) {
        let year: i32 = s[0..4].parse().map_err(|_| invalid(raw))?;
        let month: u32 = s[4..6].parse().map_err(|_| invalid(raw))?;
        let day: u32 = s[6..8].parse().map_err(|_| invalid(raw))?;
        return NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| invalid(raw));
    }

    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            if d.year() >= 1000 {
                return Ok(d);
            }
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.date_naive());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.date());
        }
    }

    Err(invalid(raw))
}

/// Parse `start` and an optional `end`; a missing end means today (UTC).
pub fn parse_range(start: &str, end: Option<&str>) -> Result<(NaiveDate, NaiveDate)> {
    let start = parse_date(start)?;
    let end = match end {
        Some(e) => parse_date(e)?,
        None => Utc::now().date_naive(),
    };
    if start > end {
        return Err(Error::EmptyDateRange { start, end });
    }
    Ok((start, end))
}

fn invalid(raw: &str) -> Error {
    Error::InvalidDateFormat(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn accepts_every_supported_shape() {
        let expected = ymd(2019, 12, 15);
        for s in [
            "2019-12-15",
            "2019/12/15",
            "2019.12.15",
            "20191215",
            "15-12-2019",
            "15/12/2019",
            "15.12.2019",
            "15 Dec 2019",
            "15 December 2019",
            "Dec 15, 2019",
            "December 15, 2019",
            "2019-Dec-15",
            "15-Dec-2019",
            "2019-12-15 08:30:00",
            "2019-12-15T08:30:00",
            "2019-12-15T08:30:00+10:00",
            "  2019-12-15  ",
        ] {
            assert_eq!(parse_date(s).unwrap(), expected, "input {s:?}");
        }
    }

    #[test]
    fn day_first_numeric_dates() {
        assert_eq!(parse_date("01-10-2019").unwrap(), ymd(2019, 10, 1));
        assert_eq!(parse_date("01/03/2020").unwrap(), ymd(2020, 3, 1));
    }

    #[test]
    fn month_first_only_when_unambiguous() {
        assert_eq!(parse_date("12/31/2019").unwrap(), ymd(2019, 12, 31));
        assert_eq!(parse_date("02-29-2020").unwrap(), ymd(2020, 2, 29));
        assert_eq!(parse_date("07.15.2019").unwrap(), ymd(2019, 7, 15));
        assert_eq!(parse_date("December 31 2019").unwrap(), ymd(2019, 12, 31));
        // both readings valid: day-first wins
        assert_eq!(parse_date("03/04/2020").unwrap(), ymd(2020, 4, 3));
    }

    #[test]
    fn rejects_garbage_and_impossible_dates() {
        for s in ["", "yesterday", "2019-13-01", "31/02/2020", "20191341", "13/31/2019"] {
            assert!(
                matches!(parse_date(s), Err(Error::InvalidDateFormat(_))),
                "input {s:?} should be rejected"
            );
        }
    }

    #[test]
    fn range_rejects_reversed_dates() {
        let err = parse_range("2020-02-01", Some("2020-01-01")).unwrap_err();
        assert!(matches!(err, Error::EmptyDateRange { .. }));
    }

    #[test]
    fn range_defaults_end_to_today() {
        let (start, end) = parse_range("2019-01-01", None).unwrap();
        assert_eq!(start, ymd(2019, 1, 1));
        assert_eq!(end, Utc::now().date_naive());
    }
}
