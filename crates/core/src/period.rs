//! Billing-period arithmetic: boundary computation from an anchor, calendar
//! alignment, elapsed fractions for proration, and entitlement reset buckets.
//!
//! `current_period_end` is always the exclusive instant of the next boundary,
//! so a March period is `[2024-03-01T00:00Z, 2024-04-01T00:00Z)`.

use crate::catalog::UsageResetPeriod;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The nominal unit of recurring billing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    HalfYearly,
    Annual,
}

impl BillingPeriod {
    /// Month count for month-granular periods.
    pub fn months(&self) -> Option<u32> {
        match self {
            Self::Monthly => Some(1),
            Self::Quarterly => Some(3),
            Self::HalfYearly => Some(6),
            Self::Annual => Some(12),
            Self::Daily | Self::Weekly => None,
        }
    }

    /// Day count for day-granular periods.
    pub fn days(&self) -> Option<i64> {
        match self {
            Self::Daily => Some(1),
            Self::Weekly => Some(7),
            _ => None,
        }
    }
}

/// CALENDAR periods snap to calendar boundaries; ANNIVERSARY periods walk
/// from the billing anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Calendar,
    Anniversary,
}

/// How partial periods are measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationStrategy {
    DayBased,
    SecondBased,
}

/// `from + n × (period_count × period)`. Month arithmetic clamps to the last
/// day of the month, so an anchor of Jan 31 yields Feb 28/29.
pub fn add_periods(
    from: DateTime<Utc>,
    period: BillingPeriod,
    period_count: u32,
    n: u32,
) -> DateTime<Utc> {
    let steps = period_count.saturating_mul(n);
    if let Some(months) = period.months() {
        from.checked_add_months(Months::new(months.saturating_mul(steps)))
            .expect("billing date out of range")
    } else {
        let days = period.days().unwrap_or(1) * i64::from(steps);
        from + Duration::days(days)
    }
}

/// The first period boundary strictly after `current`, walked from `anchor`.
pub fn next_anchor_date(
    current: DateTime<Utc>,
    anchor: DateTime<Utc>,
    period: BillingPeriod,
    period_count: u32,
) -> DateTime<Utc> {
    if anchor > current {
        return anchor;
    }
    // Estimate the step index, then settle on the exact boundary.
    let mut k = match period.months() {
        Some(months) => {
            let elapsed_months = (current.year() - anchor.year()) * 12
                + (current.month() as i32 - anchor.month() as i32);
            let step = (months * period_count.max(1)) as i32;
            (elapsed_months / step.max(1)).max(0) as u32
        }
        None => {
            let step_days = period.days().unwrap_or(1) * i64::from(period_count.max(1));
            ((current - anchor).num_days() / step_days.max(1)).max(0) as u32
        }
    };
    while add_periods(anchor, period, period_count, k) <= current {
        k += 1;
    }
    while k > 1 && add_periods(anchor, period, period_count, k - 1) > current {
        k -= 1;
    }
    add_periods(anchor, period, period_count, k)
}

/// Start of the calendar bucket containing `at` (UTC).
fn calendar_period_start(at: DateTime<Utc>, period: BillingPeriod) -> DateTime<Utc> {
    let date = at.date_naive();
    let start = match period {
        BillingPeriod::Daily => date,
        BillingPeriod::Weekly => date - Duration::days(date.weekday().num_days_from_monday() as i64),
        BillingPeriod::Monthly => first_of_month(date.year(), date.month()),
        BillingPeriod::Quarterly => {
            let month = ((date.month() - 1) / 3) * 3 + 1;
            first_of_month(date.year(), month)
        }
        BillingPeriod::HalfYearly => {
            let month = if date.month() <= 6 { 1 } else { 7 };
            first_of_month(date.year(), month)
        }
        BillingPeriod::Annual => first_of_month(date.year(), 1),
    };
    midnight_utc(start)
}

/// Next billing boundary after `current`. CALENDAR aligns to calendar period
/// starts; ANNIVERSARY walks from the anchor.
pub fn next_billing_date(
    current: DateTime<Utc>,
    anchor: DateTime<Utc>,
    period: BillingPeriod,
    period_count: u32,
    cycle: BillingCycle,
) -> DateTime<Utc> {
    match cycle {
        BillingCycle::Anniversary => next_anchor_date(current, anchor, period, period_count),
        BillingCycle::Calendar => {
            let bucket_start = calendar_period_start(current, period);
            add_periods(bucket_start, period, period_count, 1)
        }
    }
}

/// Fraction of `[start, end)` elapsed at `at`, clamped to `[0, 1]`.
///
/// DAY_BASED counts calendar days in the given UTC offset, start-day
/// inclusive and end-day exclusive; SECOND_BASED counts wall-clock seconds.
pub fn elapsed_fraction(
    start: DateTime<Utc>,
    at: DateTime<Utc>,
    end: DateTime<Utc>,
    strategy: ProrationStrategy,
    tz: chrono::FixedOffset,
) -> Decimal {
    if end <= start {
        return Decimal::ONE;
    }
    let at = at.clamp(start, end);
    match strategy {
        ProrationStrategy::DayBased => {
            let start_d = start.with_timezone(&tz).date_naive();
            let at_d = at.with_timezone(&tz).date_naive();
            let end_d = end.with_timezone(&tz).date_naive();
            let total = (end_d - start_d).num_days();
            if total <= 0 {
                return Decimal::ONE;
            }
            let elapsed = (at_d - start_d).num_days().clamp(0, total);
            Decimal::from(elapsed) / Decimal::from(total)
        }
        ProrationStrategy::SecondBased => {
            let total = (end - start).num_seconds();
            if total <= 0 {
                return Decimal::ONE;
            }
            let elapsed = (at - start).num_seconds().clamp(0, total);
            Decimal::from(elapsed) / Decimal::from(total)
        }
    }
}

/// Fraction of `[start, end)` remaining at `at`.
pub fn remaining_fraction(
    start: DateTime<Utc>,
    at: DateTime<Utc>,
    end: DateTime<Utc>,
    strategy: ProrationStrategy,
    tz: chrono::FixedOffset,
) -> Decimal {
    Decimal::ONE - elapsed_fraction(start, at, end, strategy, tz)
}

/// UTC reset buckets of the given cadence intersecting `[period_start,
/// period_end)`, each clipped to the period. BILLING_PERIOD and NEVER yield
/// the whole period as one bucket.
pub fn reset_buckets(
    reset: UsageResetPeriod,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let step = match reset {
        UsageResetPeriod::Daily => BillingPeriod::Daily,
        UsageResetPeriod::Weekly => BillingPeriod::Weekly,
        UsageResetPeriod::Monthly => BillingPeriod::Monthly,
        UsageResetPeriod::BillingPeriod | UsageResetPeriod::Never => {
            return vec![(period_start, period_end)];
        }
    };
    let mut buckets = Vec::new();
    let mut cursor = calendar_period_start(period_start, step);
    while cursor < period_end {
        let next = add_periods(cursor, step, 1, 1);
        buckets.push((cursor.max(period_start), next.min(period_end)));
        cursor = next;
    }
    buckets
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).expect("valid first-of-month date")
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("valid midnight"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn utc(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    fn utc_offset() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn test_add_periods_month_clamping() {
        let jan31 = utc(2024, 1, 31);
        assert_eq!(add_periods(jan31, BillingPeriod::Monthly, 1, 1), utc(2024, 2, 29));
        assert_eq!(add_periods(jan31, BillingPeriod::Monthly, 1, 2), utc(2024, 3, 31));
        assert_eq!(add_periods(jan31, BillingPeriod::Quarterly, 1, 1), utc(2024, 4, 30));
    }

    #[test]
    fn test_next_anchor_date() {
        let anchor = utc(2024, 1, 15);
        // Mid-period: the next boundary is the 15th of the next month.
        let next = next_anchor_date(utc(2024, 3, 20), anchor, BillingPeriod::Monthly, 1);
        assert_eq!(next, utc(2024, 4, 15));
        // Exactly on a boundary moves to the following one.
        let next = next_anchor_date(utc(2024, 4, 15), anchor, BillingPeriod::Monthly, 1);
        assert_eq!(next, utc(2024, 5, 15));
        // Anchor in the future is the next boundary itself.
        let next = next_anchor_date(utc(2023, 12, 1), anchor, BillingPeriod::Monthly, 1);
        assert_eq!(next, anchor);
    }

    #[test]
    fn test_next_anchor_date_weekly() {
        let anchor = utc(2024, 1, 1); // a Monday
        let next = next_anchor_date(utc(2024, 1, 10), anchor, BillingPeriod::Weekly, 2);
        assert_eq!(next, utc(2024, 1, 15));
    }

    #[test]
    fn test_next_billing_date_calendar() {
        let anchor = utc(2024, 1, 15);
        let next = next_billing_date(
            utc(2024, 3, 20),
            anchor,
            BillingPeriod::Monthly,
            1,
            BillingCycle::Calendar,
        );
        assert_eq!(next, utc(2024, 4, 1));

        let next = next_billing_date(
            utc(2024, 5, 2),
            anchor,
            BillingPeriod::Quarterly,
            1,
            BillingCycle::Calendar,
        );
        assert_eq!(next, utc(2024, 7, 1));

        let next = next_billing_date(
            utc(2024, 3, 20),
            anchor,
            BillingPeriod::Annual,
            1,
            BillingCycle::Anniversary,
        );
        assert_eq!(next, utc(2025, 1, 15));
    }

    #[test]
    fn test_day_based_fraction_march_upgrade() {
        // March 2024 period, change on the 15th: 14 of 31 days elapsed,
        // 17 of 31 remaining.
        let start = utc(2024, 3, 1);
        let end = utc(2024, 4, 1);
        let at = utc(2024, 3, 15);

        let elapsed = elapsed_fraction(start, at, end, ProrationStrategy::DayBased, utc_offset());
        assert_eq!(elapsed, Decimal::from(14) / Decimal::from(31));
        let remaining = remaining_fraction(start, at, end, ProrationStrategy::DayBased, utc_offset());
        assert_eq!(remaining, Decimal::from(17) / Decimal::from(31));
    }

    #[test]
    fn test_fraction_boundaries() {
        let start = utc(2024, 3, 1);
        let end = utc(2024, 4, 1);
        let tz = utc_offset();

        // At period start nothing has elapsed; at period end everything has.
        for strategy in [ProrationStrategy::DayBased, ProrationStrategy::SecondBased] {
            assert_eq!(elapsed_fraction(start, start, end, strategy, tz), Decimal::ZERO);
            assert_eq!(elapsed_fraction(start, end, end, strategy, tz), Decimal::ONE);
            assert_eq!(remaining_fraction(start, end, end, strategy, tz), Decimal::ZERO);
        }

        // Out-of-range instants clamp.
        assert_eq!(
            elapsed_fraction(start, utc(2024, 5, 1), end, ProrationStrategy::DayBased, tz),
            Decimal::ONE
        );
    }

    #[test]
    fn test_second_based_fraction() {
        let start = utc(2024, 3, 1);
        let end = utc(2024, 3, 3);
        let at = start + Duration::hours(12);
        let f = elapsed_fraction(start, at, end, ProrationStrategy::SecondBased, utc_offset());
        assert_eq!(f, Decimal::ONE / Decimal::from(4));
    }

    #[test]
    fn test_reset_buckets_daily() {
        let buckets = reset_buckets(UsageResetPeriod::Daily, utc(2024, 3, 1), utc(2024, 3, 4));
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0], (utc(2024, 3, 1), utc(2024, 3, 2)));
        assert_eq!(buckets[2], (utc(2024, 3, 3), utc(2024, 3, 4)));
    }

    #[test]
    fn test_reset_buckets_clip_to_period() {
        // A period starting mid-week clips the first weekly bucket.
        let start = utc(2024, 1, 10); // Wednesday
        let end = utc(2024, 1, 24);
        let buckets = reset_buckets(UsageResetPeriod::Weekly, start, end);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0], (start, utc(2024, 1, 15)));
        assert_eq!(buckets[1], (utc(2024, 1, 15), utc(2024, 1, 22)));
        assert_eq!(buckets[2], (utc(2024, 1, 22), end));
    }

    #[test]
    fn test_reset_buckets_billing_period() {
        let start = utc(2024, 3, 1);
        let end = utc(2024, 4, 1);
        let buckets = reset_buckets(UsageResetPeriod::BillingPeriod, start, end);
        assert_eq!(buckets, vec![(start, end)]);
    }
}
