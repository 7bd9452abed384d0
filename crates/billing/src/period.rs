//! Billing-period calendar arithmetic
//!
//! A billing cycle is one calendar month, not a fixed day count. Advancing a
//! period end must respect month lengths and leap years: Jan 31 + 1 month is
//! Feb 29 in a leap year and Feb 28 otherwise, never a roll-over into March.

use time::{Date, Month, OffsetDateTime};

use crate::error::{BillingError, BillingResult};

/// Advance a timestamp by whole calendar months, clamping the day-of-month to
/// the last valid day of the target month. The time of day is preserved.
pub fn add_calendar_months(from: OffsetDateTime, months: u32) -> BillingResult<OffsetDateTime> {
    let date = from.date();
    let zero_based = (u8::from(date.month()) as u32 - 1) + months;
    let year = date.year() + (zero_based / 12) as i32;
    let month = Month::try_from((zero_based % 12 + 1) as u8)
        .map_err(|e| BillingError::Internal(format!("month arithmetic: {e}")))?;

    let last_day = time::util::days_in_year_month(year, month);
    let day = date.day().min(last_day);

    let new_date = Date::from_calendar_date(year, month, day)
        .map_err(|e| BillingError::Internal(format!("month arithmetic: {e}")))?;

    Ok(from.replace_date(new_date))
}

/// Whole days in a half-open period, never below 1 so proration cannot divide
/// by zero on a degenerate interval.
pub fn days_in_period(start: OffsetDateTime, end: OffsetDateTime) -> i64 {
    ((end - start).whole_days()).max(1)
}

/// Whole days of the period still ahead of `now`, floored at zero.
pub fn days_remaining(now: OffsetDateTime, end: OffsetDateTime) -> i64 {
    ((end - now).whole_days()).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_plain_month_advance() {
        let d = datetime!(2025-03-15 08:30 UTC);
        assert_eq!(
            add_calendar_months(d, 1).unwrap(),
            datetime!(2025-04-15 08:30 UTC)
        );
    }

    #[test]
    fn test_jan_31_clamps_to_feb_end() {
        // Non-leap year
        let d = datetime!(2025-01-31 00:00 UTC);
        assert_eq!(
            add_calendar_months(d, 1).unwrap(),
            datetime!(2025-02-28 00:00 UTC)
        );

        // Leap year
        let d = datetime!(2024-01-31 00:00 UTC);
        assert_eq!(
            add_calendar_months(d, 1).unwrap(),
            datetime!(2024-02-29 00:00 UTC)
        );
    }

    #[test]
    fn test_never_rolls_into_following_month() {
        let d = datetime!(2025-05-31 12:00 UTC);
        assert_eq!(
            add_calendar_months(d, 1).unwrap(),
            datetime!(2025-06-30 12:00 UTC)
        );
    }

    #[test]
    fn test_year_boundary() {
        let d = datetime!(2025-12-10 00:00 UTC);
        assert_eq!(
            add_calendar_months(d, 1).unwrap(),
            datetime!(2026-01-10 00:00 UTC)
        );
    }

    #[test]
    fn test_multiple_months() {
        let d = datetime!(2025-01-31 00:00 UTC);
        // Jan 31 + 3 months clamps against April's 30 days
        assert_eq!(
            add_calendar_months(d, 3).unwrap(),
            datetime!(2025-04-30 00:00 UTC)
        );
    }

    #[test]
    fn test_days_in_period_floor() {
        let start = datetime!(2025-01-01 00:00 UTC);
        assert_eq!(days_in_period(start, start), 1);
        assert_eq!(days_in_period(start, datetime!(2025-01-31 00:00 UTC)), 30);
    }

    #[test]
    fn test_days_remaining_floor() {
        let end = datetime!(2025-01-01 00:00 UTC);
        assert_eq!(days_remaining(datetime!(2025-02-01 00:00 UTC), end), 0);
        assert_eq!(days_remaining(datetime!(2024-12-22 00:00 UTC), end), 10);
    }
}
