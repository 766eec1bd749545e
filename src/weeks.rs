//! ISO week-key helpers.
//!
//! A week key like `2026-W07` names a Monday-Sunday period and is the
//! partition unit for all event and aggregate queries.

use chrono::{Datelike, Duration, Local, NaiveDate, Weekday};

/// Week key for today's date in local time.
pub fn current_week_key() -> String {
    week_key_for(Local::now().date_naive())
}

/// Week key for an arbitrary date.
pub fn week_key_for(date: NaiveDate) -> String {
    let iso = date.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}

/// Parse `YYYY-Wnn` into (ISO year, ISO week), rejecting weeks that do
/// not exist in that year.
pub fn parse_week_key(week_key: &str) -> Option<(i32, u32)> {
    let (year_part, week_part) = week_key.split_once("-W")?;
    if year_part.len() != 4 || week_part.len() != 2 {
        return None;
    }
    let year: i32 = year_part.parse().ok()?;
    let week: u32 = week_part.parse().ok()?;
    NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)?;
    Some((year, week))
}

pub fn is_valid_week_key(week_key: &str) -> bool {
    parse_week_key(week_key).is_some()
}

/// Week key `offset` weeks away from `week_key` (negative = earlier).
pub fn week_offset(week_key: &str, offset: i64) -> Option<String> {
    let (year, week) = parse_week_key(week_key)?;
    let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)?;
    Some(week_key_for(monday + Duration::weeks(offset)))
}

/// Human-readable date range, e.g. "Feb 09 - Feb 15, 2026".
pub fn week_display(week_key: &str) -> Option<String> {
    let (year, week) = parse_week_key(week_key)?;
    let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)?;
    let sunday = monday + Duration::days(6);
    Some(format!(
        "{} - {}",
        monday.format("%b %d"),
        sunday.format("%b %d, %Y")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_week_key_for_known_dates() {
        // 2026-02-11 falls in ISO week 7
        let date = NaiveDate::from_ymd_opt(2026, 2, 11).unwrap();
        assert_eq!(week_key_for(date), "2026-W07");

        // ISO year differs from calendar year at the boundary:
        // Jan 1 2027 is a Friday and belongs to 2026-W53
        let date = NaiveDate::from_ymd_opt(2027, 1, 1).unwrap();
        assert_eq!(week_key_for(date), "2026-W53");
    }

    #[test]
    fn test_parse_week_key() {
        assert_eq!(parse_week_key("2026-W07"), Some((2026, 7)));
        assert_eq!(parse_week_key("2026-W53"), Some((2026, 53)));
        assert!(parse_week_key("2026-W00").is_none());
        // 2026 has 53 ISO weeks but 2025 does not
        assert!(parse_week_key("2025-W53").is_none());
        assert!(parse_week_key("2026-07").is_none());
        assert!(parse_week_key("garbage").is_none());
        assert!(parse_week_key("2026-W7").is_none());
    }

    #[test]
    fn test_week_offset() {
        assert_eq!(week_offset("2026-W07", 1).as_deref(), Some("2026-W08"));
        assert_eq!(week_offset("2026-W07", -1).as_deref(), Some("2026-W06"));
        // Crosses the year boundary
        assert_eq!(week_offset("2026-W01", -1).as_deref(), Some("2025-W52"));
        assert!(week_offset("bogus", 1).is_none());
    }

    #[test]
    fn test_week_display() {
        assert_eq!(
            week_display("2026-W07").as_deref(),
            Some("Feb 09 - Feb 15, 2026")
        );
        assert!(week_display("bogus").is_none());
    }

    #[test]
    fn test_current_week_key_is_valid() {
        assert!(is_valid_week_key(&current_week_key()));
    }
}
