//! 5-field cron evaluation (min hour dom month dow), timezone-aware.
//!
//! Supports `*`, `*/n`, comma lists, and inclusive ranges. Day-of-week is
//! 0-based from Sunday. DST handling: local times inside a spring-forward
//! gap are skipped; fall-back overlaps resolve to the earlier instant.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};

/// Parse a timezone string, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

#[derive(Debug, Clone)]
enum Field {
    Any,
    Step(u32),
    /// Inclusive ranges; single values are `(n, n)`.
    Ranges(Vec<(u32, u32)>),
}

impl Field {
    fn parse(raw: &str) -> Self {
        if raw == "*" {
            return Field::Any;
        }
        if let Some(step) = raw.strip_prefix("*/") {
            if let Ok(n) = step.parse::<u32>() {
                if n > 0 {
                    return Field::Step(n);
                }
            }
        }
        let mut ranges = Vec::new();
        for part in raw.split(',') {
            if let Some((lo, hi)) = part.split_once('-') {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                    ranges.push((lo, hi));
                }
            } else if let Ok(n) = part.parse::<u32>() {
                ranges.push((n, n));
            }
        }
        Field::Ranges(ranges)
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Field::Any => true,
            Field::Step(n) => value % n == 0,
            Field::Ranges(ranges) => ranges.iter().any(|(lo, hi)| value >= *lo && value <= *hi),
        }
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct Cadence {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl Cadence {
    pub fn parse(expr: &str) -> Option<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return None;
        }
        Some(Self {
            minute: Field::parse(fields[0]),
            hour: Field::parse(fields[1]),
            day_of_month: Field::parse(fields[2]),
            month: Field::parse(fields[3]),
            day_of_week: Field::parse(fields[4]),
        })
    }

    fn matches_local(&self, dt: &NaiveDateTime) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day_of_month.matches(dt.day())
            && self.month.matches(dt.month())
            && self.day_of_week.matches(dt.weekday().num_days_from_sunday())
    }
}

/// Whether a UTC instant matches the expression (evaluated in UTC).
pub fn matches(expr: &str, at: &DateTime<Utc>) -> bool {
    Cadence::parse(expr)
        .map(|c| c.matches_local(&at.naive_utc()))
        .unwrap_or(false)
}

/// Next occurrence strictly after `after`, evaluated in `tz`, as UTC.
pub fn next_occurrence(
    expr: &str,
    after: &DateTime<Utc>,
    tz: chrono_tz::Tz,
) -> Option<DateTime<Utc>> {
    let cadence = Cadence::parse(expr)?;

    // Advance to the next whole local minute.
    let local_after = after.with_timezone(&tz).naive_local();
    let mut candidate =
        local_after + chrono::Duration::seconds(60 - local_after.second() as i64);
    candidate = candidate.with_second(0).unwrap_or(candidate);

    // Bounded walk: one year of minutes.
    let max_checks = 366 * 24 * 60;
    for _ in 0..max_checks {
        if cadence.matches_local(&candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                // Spring-forward gap: this local minute does not exist.
                chrono::LocalResult::None => {}
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

/// Up to `n` upcoming occurrences.
pub fn next_occurrences(
    expr: &str,
    after: &DateTime<Utc>,
    n: usize,
    tz: chrono_tz::Tz,
) -> Vec<DateTime<Utc>> {
    let mut results = Vec::with_capacity(n);
    let mut cursor = *after;
    for _ in 0..n {
        match next_occurrence(expr, &cursor, tz) {
            Some(next) => {
                results.push(next);
                cursor = next;
            }
            None => break,
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_5_minutes() {
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        assert!(matches("*/5 * * * *", &at));
        let off = Utc.with_ymd_and_hms(2024, 6, 15, 10, 3, 0).unwrap();
        assert!(!matches("*/5 * * * *", &off));
    }

    #[test]
    fn specific_time() {
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 9, 30, 0).unwrap();
        assert!(matches("30 9 * * *", &at));
        assert!(!matches("30 10 * * *", &at));
    }

    #[test]
    fn ranges_and_lists() {
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 10, 15, 0).unwrap();
        assert!(matches("0,15,30,45 * * * *", &at));
        assert!(matches("0 9-17 * * *", &Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap()));
        assert!(!matches("0 9-17 * * *", &Utc.with_ymd_and_hms(2024, 6, 15, 20, 0, 0).unwrap()));
    }

    #[test]
    fn day_of_week_from_sunday() {
        // 2024-06-16 is a Sunday.
        let sunday = Utc.with_ymd_and_hms(2024, 6, 16, 8, 0, 0).unwrap();
        assert!(matches("0 8 * * 0", &sunday));
        assert!(!matches("0 8 * * 1", &sunday));
    }

    #[test]
    fn malformed_expressions_never_match() {
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        assert!(!matches("* * * *", &at));
        assert!(!matches("not a cron", &at));
        assert!(next_occurrence("* * *", &at, chrono_tz::UTC).is_none());
    }

    #[test]
    fn next_occurrence_is_strictly_after() {
        let after = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
        let next = next_occurrence("30 * * * *", &after, chrono_tz::UTC).unwrap();
        assert_eq!(next.minute(), 30);
        assert_eq!(next.hour(), 11);
    }

    #[test]
    fn next_occurrences_advance() {
        let after = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let upcoming = next_occurrences("0 * * * *", &after, 5, chrono_tz::UTC);
        assert_eq!(upcoming.len(), 5);
        for pair in upcoming.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    // ── Timezone behaviour ────────────────────────────────────────

    #[test]
    fn tz_offset_applies() {
        let after = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let tz = parse_tz("US/Eastern");
        let next = next_occurrence("0 9 * * *", &after, tz).unwrap();
        // 9 ET = 13 UTC during EDT.
        assert_eq!(next.hour(), 13);
    }

    #[test]
    fn spring_forward_gap_is_skipped() {
        // US/Eastern 2024-03-10: 02:30 local does not exist.
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 6, 0, 0).unwrap();
        let next = next_occurrence("30 2 * * *", &after, parse_tz("US/Eastern")).unwrap();
        assert_eq!(next.day(), 11);
        assert_eq!(next.hour(), 6);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn fall_back_overlap_takes_earliest() {
        // US/Eastern 2024-11-03: 01:30 local occurs twice.
        let after = Utc.with_ymd_and_hms(2024, 11, 3, 4, 0, 0).unwrap();
        let next = next_occurrence("30 1 * * *", &after, parse_tz("US/Eastern")).unwrap();
        assert_eq!(next.hour(), 5);
        assert_eq!(next.minute(), 30);
    }

    #[test]
    fn invalid_tz_falls_back_to_utc() {
        assert_eq!(parse_tz("Not/Real"), chrono_tz::UTC);
        assert_eq!(parse_tz(""), chrono_tz::UTC);
    }
}
