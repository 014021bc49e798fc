//! Subscriptions and their line items.

use crate::catalog::{InvoiceCadence, PriceType};
use crate::error::{BillingError, BillingResult};
use crate::period::{BillingCycle, BillingPeriod};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Cancelled,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    /// Whether the subscription can still accrue charges.
    pub fn is_billable(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::IncompleteExpired)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub currency: String,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    /// Current period bounds; `current_period_end` is exclusive.
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub billing_period: BillingPeriod,
    pub billing_period_count: u32,
    /// Fixed timestamp future boundaries are computed from.
    pub billing_anchor: DateTime<Utc>,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    /// Whether recurring fixed charges bill at period start.
    pub pay_in_advance: bool,
    pub line_items: Vec<SubscriptionLineItem>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn validate(&self) -> BillingResult<()> {
        if self.current_period_start >= self.current_period_end {
            return Err(BillingError::Validation(format!(
                "subscription {}: current_period_start must precede current_period_end",
                self.id
            )));
        }
        if self.billing_period_count == 0 {
            return Err(BillingError::Validation(format!(
                "subscription {}: billing_period_count must be positive",
                self.id
            )));
        }
        for item in &self.line_items {
            if !item.currency.eq_ignore_ascii_case(&self.currency) {
                return Err(BillingError::Validation(format!(
                    "line item {} currency {} does not match subscription currency {}",
                    item.id, item.currency, self.currency
                )));
            }
        }
        Ok(())
    }

    /// The period immediately after the current one.
    pub fn next_period(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let next_start = self.current_period_end;
        let next_end = crate::period::next_billing_date(
            next_start,
            self.billing_anchor,
            self.billing_period,
            self.billing_period_count,
            self.billing_cycle,
        );
        (next_start, next_end)
    }
}

/// One priced item on a subscription, active during
/// `[start_date, end_date.unwrap_or(∞))`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionLineItem {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub price_id: Uuid,
    pub price_type: PriceType,
    pub meter_id: Option<Uuid>,
    pub display_name: String,
    pub quantity: Decimal,
    pub currency: String,
    pub billing_period: BillingPeriod,
    pub invoice_cadence: InvoiceCadence,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

impl SubscriptionLineItem {
    /// Whether the item is active anywhere inside `[period_start, period_end)`.
    pub fn overlaps(&self, period_start: DateTime<Utc>, period_end: DateTime<Utc>) -> bool {
        let starts_before_end = self.start_date < period_end;
        let ends_after_start = self.end_date.map(|e| e > period_start).unwrap_or(true);
        starts_before_end && ends_after_start
    }

    /// The active sub-window of the item within the period.
    pub fn active_window(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if !self.overlaps(period_start, period_end) {
            return None;
        }
        let start = self.start_date.max(period_start);
        let end = self.end_date.map(|e| e.min(period_end)).unwrap_or(period_end);
        Some((start, end))
    }

    pub fn is_usage(&self) -> bool {
        self.price_type == PriceType::Usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    fn line_item(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> SubscriptionLineItem {
        SubscriptionLineItem {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            price_id: Uuid::new_v4(),
            price_type: PriceType::Fixed,
            meter_id: None,
            display_name: "base fee".into(),
            quantity: Decimal::ONE,
            currency: "USD".into(),
            billing_period: BillingPeriod::Monthly,
            invoice_cadence: InvoiceCadence::Advance,
            start_date: start,
            end_date: end,
        }
    }

    #[test]
    fn test_line_item_overlap() {
        let ps = utc(2024, 3, 1);
        let pe = utc(2024, 4, 1);

        // Open-ended item started before the period.
        assert!(line_item(utc(2024, 1, 1), None).overlaps(ps, pe));
        // Item ending exactly at period start does not overlap.
        assert!(!line_item(utc(2024, 1, 1), Some(ps)).overlaps(ps, pe));
        // Item starting exactly at period end does not overlap.
        assert!(!line_item(pe, None).overlaps(ps, pe));
        // Item fully inside.
        assert!(line_item(utc(2024, 3, 10), Some(utc(2024, 3, 20))).overlaps(ps, pe));
    }

    #[test]
    fn test_active_window_clips() {
        let ps = utc(2024, 3, 1);
        let pe = utc(2024, 4, 1);
        let item = line_item(utc(2024, 3, 10), Some(utc(2024, 5, 1)));
        assert_eq!(item.active_window(ps, pe), Some((utc(2024, 3, 10), pe)));

        let outside = line_item(utc(2024, 5, 1), None);
        assert_eq!(outside.active_window(ps, pe), None);
    }

    #[test]
    fn test_subscription_validation() {
        let sub = Subscription {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            currency: "USD".into(),
            start_date: utc(2024, 3, 1),
            end_date: None,
            current_period_start: utc(2024, 3, 1),
            current_period_end: utc(2024, 4, 1),
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_anchor: utc(2024, 3, 1),
            billing_cycle: BillingCycle::Anniversary,
            status: SubscriptionStatus::Active,
            pay_in_advance: true,
            line_items: vec![line_item(utc(2024, 3, 1), None)],
            created_at: utc(2024, 3, 1),
        };
        assert!(sub.validate().is_ok());

        let mut inverted = sub.clone();
        inverted.current_period_end = inverted.current_period_start;
        assert!(inverted.validate().is_err());

        let mut mismatched = sub.clone();
        mismatched.line_items[0].currency = "EUR".into();
        assert!(mismatched.validate().is_err());

        // Case-insensitive currency comparison passes.
        let mut lowercase = sub;
        lowercase.line_items[0].currency = "usd".into();
        assert!(lowercase.validate().is_ok());
    }

    #[test]
    fn test_next_period_anniversary() {
        let sub = Subscription {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            currency: "USD".into(),
            start_date: utc(2024, 1, 15),
            end_date: None,
            current_period_start: utc(2024, 3, 15),
            current_period_end: utc(2024, 4, 15),
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_anchor: utc(2024, 1, 15),
            billing_cycle: BillingCycle::Anniversary,
            status: SubscriptionStatus::Active,
            pay_in_advance: true,
            line_items: vec![],
            created_at: utc(2024, 1, 15),
        };
        assert_eq!(sub.next_period(), (utc(2024, 4, 15), utc(2024, 5, 15)));
    }

    #[test]
    fn test_status_predicates() {
        assert!(SubscriptionStatus::Active.is_billable());
        assert!(SubscriptionStatus::PastDue.is_billable());
        assert!(!SubscriptionStatus::Cancelled.is_billable());
        assert!(SubscriptionStatus::IncompleteExpired.is_terminal());
        assert!(!SubscriptionStatus::Paused.is_terminal());
    }
}
