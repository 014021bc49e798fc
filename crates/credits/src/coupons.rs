//! Coupon validation and application.
//!
//! Validation runs twice: once when a coupon is associated with a
//! subscription, and again (plus the cadence rule) every time it is applied
//! to an invoice. Both are pure checks over an entity snapshot and a clock;
//! the redemption counter and the application row are written in a single
//! commit step after validation passes.

use meterflow_core::catalog::{Coupon, CouponApplication, CouponAssociation, CouponCadence, CouponStatus};
use meterflow_core::error::{BillingError, BillingResult};
use meterflow_core::invoice::InvoiceStatus;
use meterflow_core::subscription::{Subscription, SubscriptionStatus};
use meterflow_store::contracts::{
    CouponApplicationRepo, CouponAssociationRepo, CouponRepo, InvoiceRepo, SubscriptionRepo,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Closed taxonomy of coupon failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CouponError {
    #[error("coupon not found")]
    NotFound,
    #[error("coupon is not published")]
    NotPublished,
    #[error("coupon is not redeemable yet")]
    NotActive,
    #[error("coupon has expired")]
    Expired,
    #[error("coupon currency does not match the subscription currency")]
    CurrencyMismatch,
    #[error("coupon redemption limit reached")]
    RedemptionLimitReached,
    #[error("subscription status does not allow coupons")]
    InvalidSubscriptionStatus,
    #[error("coupon cadence cannot apply here")]
    InvalidCadence,
    #[error("once-cadence coupon was already applied to this subscription")]
    OnceCadenceViolation,
    #[error("repeated-cadence coupon is missing duration_in_periods")]
    InvalidRepeatedCadence,
    #[error("repeated-cadence coupon exhausted its duration")]
    RepeatedCadenceLimitReached,
    #[error("database error: {0}")]
    DatabaseError(String),
}

impl CouponError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "coupon_not_found",
            Self::NotPublished => "coupon_not_published",
            Self::NotActive => "coupon_not_active",
            Self::Expired => "coupon_expired",
            Self::CurrencyMismatch => "coupon_currency_mismatch",
            Self::RedemptionLimitReached => "coupon_redemption_limit_reached",
            Self::InvalidSubscriptionStatus => "coupon_invalid_subscription_status",
            Self::InvalidCadence => "coupon_invalid_cadence",
            Self::OnceCadenceViolation => "coupon_once_cadence_violation",
            Self::InvalidRepeatedCadence => "coupon_invalid_repeated_cadence",
            Self::RepeatedCadenceLimitReached => "coupon_repeated_cadence_limit_reached",
            Self::DatabaseError(_) => "coupon_database_error",
        }
    }
}

impl From<CouponError> for BillingError {
    fn from(err: CouponError) -> Self {
        match err {
            CouponError::NotFound => BillingError::not_found("coupon", "unknown"),
            CouponError::DatabaseError(msg) => BillingError::Database(msg),
            CouponError::RedemptionLimitReached | CouponError::RepeatedCadenceLimitReached => {
                BillingError::Conflict(err.to_string())
            }
            other => BillingError::Validation(other.to_string()),
        }
    }
}

/// Association-time validation: status, redemption window, currency,
/// redemption headroom, and subscription liveness.
pub fn validate_for_association(
    coupon: &Coupon,
    subscription: &Subscription,
    now: DateTime<Utc>,
) -> Result<(), CouponError> {
    if coupon.status != CouponStatus::Published {
        return Err(CouponError::NotPublished);
    }
    if let Some(redeem_after) = coupon.redeem_after {
        if now < redeem_after {
            return Err(CouponError::NotActive);
        }
    }
    if let Some(redeem_before) = coupon.redeem_before {
        if now > redeem_before {
            return Err(CouponError::Expired);
        }
    }
    if let Some(currency) = &coupon.currency {
        if !currency.eq_ignore_ascii_case(&subscription.currency) {
            return Err(CouponError::CurrencyMismatch);
        }
    }
    if let Some(max) = coupon.max_redemptions {
        if coupon.total_redemptions >= max {
            return Err(CouponError::RedemptionLimitReached);
        }
    }
    if subscription.status == SubscriptionStatus::Cancelled {
        return Err(CouponError::InvalidSubscriptionStatus);
    }
    Ok(())
}

/// Invoice-time validation: the association rules plus the cadence rule.
/// FOREVER coupons stay valid past their redemption window as long as the
/// association already exists.
pub fn validate_for_invoice(
    coupon: &Coupon,
    subscription: &Subscription,
    prior_applications: u64,
    now: DateTime<Utc>,
) -> Result<(), CouponError> {
    match coupon.cadence {
        CouponCadence::Forever => {
            // Window checks are waived; everything else still holds.
            if coupon.status != CouponStatus::Published {
                return Err(CouponError::NotPublished);
            }
            if subscription.status == SubscriptionStatus::Cancelled {
                return Err(CouponError::InvalidSubscriptionStatus);
            }
            if let Some(currency) = &coupon.currency {
                if !currency.eq_ignore_ascii_case(&subscription.currency) {
                    return Err(CouponError::CurrencyMismatch);
                }
            }
            Ok(())
        }
        CouponCadence::Once => {
            validate_for_association(coupon, subscription, now)?;
            if prior_applications > 0 {
                return Err(CouponError::OnceCadenceViolation);
            }
            Ok(())
        }
        CouponCadence::Repeated => {
            validate_for_association(coupon, subscription, now)?;
            let duration = coupon
                .duration_in_periods
                .ok_or(CouponError::InvalidRepeatedCadence)?;
            if prior_applications >= u64::from(duration) {
                return Err(CouponError::RepeatedCadenceLimitReached);
            }
            Ok(())
        }
    }
}

pub struct CouponService {
    coupons: Arc<dyn CouponRepo>,
    associations: Arc<dyn CouponAssociationRepo>,
    applications: Arc<dyn CouponApplicationRepo>,
    subscriptions: Arc<dyn SubscriptionRepo>,
    invoices: Arc<dyn InvoiceRepo>,
}

impl CouponService {
    pub fn new(
        coupons: Arc<dyn CouponRepo>,
        associations: Arc<dyn CouponAssociationRepo>,
        applications: Arc<dyn CouponApplicationRepo>,
        subscriptions: Arc<dyn SubscriptionRepo>,
        invoices: Arc<dyn InvoiceRepo>,
    ) -> Self {
        Self {
            coupons,
            associations,
            applications,
            subscriptions,
            invoices,
        }
    }

    /// Associate a coupon with a subscription (optionally one line item).
    pub async fn associate(
        &self,
        coupon_id: Uuid,
        subscription_id: Uuid,
        subscription_line_item_id: Option<Uuid>,
    ) -> BillingResult<CouponAssociation> {
        let coupon = self.coupons.get(coupon_id).await?;
        let subscription = self.subscriptions.get(subscription_id).await?;
        validate_for_association(&coupon, &subscription, Utc::now())?;

        let association = self
            .associations
            .create(CouponAssociation {
                id: Uuid::new_v4(),
                coupon_id,
                subscription_id,
                subscription_line_item_id,
                created_at: Utc::now(),
            })
            .await?;
        info!(coupon = %coupon_id, subscription = %subscription_id, "coupon associated");
        Ok(association)
    }

    /// Apply every associated coupon to a draft invoice, discounting its
    /// totals and recording one application row per coupon. Coupons that
    /// fail validation are skipped, not fatal.
    pub async fn apply_to_invoice(&self, invoice_id: Uuid) -> BillingResult<Vec<CouponApplication>> {
        let mut invoice = self.invoices.get(invoice_id).await?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(BillingError::InvalidOperation(format!(
                "coupons only apply to draft invoices, invoice {} is {:?}",
                invoice_id, invoice.status
            )));
        }
        let Some(subscription_id) = invoice.subscription_id else {
            return Err(CouponError::InvalidCadence.into());
        };
        let subscription = self.subscriptions.get(subscription_id).await?;
        let now = Utc::now();

        let mut applied = Vec::new();
        for association in self.associations.get_by_subscription(subscription_id).await? {
            let coupon = self.coupons.get(association.coupon_id).await?;
            let prior = self
                .applications
                .count_by_subscription_and_coupon(subscription_id, coupon.id)
                .await?;
            if let Err(err) = validate_for_invoice(&coupon, &subscription, prior, now) {
                info!(coupon = %coupon.id, code = err.code(), "coupon skipped");
                continue;
            }

            let discounted = coupon.discounted(invoice.amount_due);
            let amount_off = invoice.amount_due - discounted;
            if amount_off.is_zero() {
                continue;
            }

            // The counter increment is the redemption commit point; a
            // concurrent exhaustion surfaces as a conflict and skips.
            match self.coupons.increment_redemptions(coupon.id).await {
                Ok(_) => {}
                Err(BillingError::Conflict(_)) => {
                    info!(coupon = %coupon.id, "redemption limit hit concurrently, skipping");
                    continue;
                }
                Err(other) => return Err(other),
            }

            invoice.amount_due = discounted;
            invoice.amount_remaining = invoice.amount_due - invoice.amount_paid;
            let application = self
                .applications
                .create(CouponApplication {
                    id: Uuid::new_v4(),
                    coupon_id: coupon.id,
                    subscription_id,
                    invoice_id,
                    amount_off,
                    applied_at: now,
                })
                .await?;
            applied.push(application);
        }

        if !applied.is_empty() {
            // Keep the amount identity while the discount shrinks the due
            // amount; line items are left untouched and the delta is carried
            // by the application rows.
            self.invoices.update(invoice).await?;
        }
        Ok(applied)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use meterflow_core::catalog::DiscountType;
    use meterflow_core::period::{BillingCycle, BillingPeriod};
    use rust_decimal::Decimal;

    fn utc(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    fn coupon(cadence: CouponCadence) -> Coupon {
        Coupon {
            id: Uuid::new_v4(),
            name: "TEST".into(),
            currency: Some("USD".into()),
            discount_type: DiscountType::Fixed,
            amount_off: Some(Decimal::from(5)),
            percentage_off: None,
            cadence,
            duration_in_periods: match cadence {
                CouponCadence::Repeated => Some(3),
                _ => None,
            },
            max_redemptions: None,
            total_redemptions: 0,
            redeem_after: None,
            redeem_before: None,
            status: CouponStatus::Published,
            created_at: utc(2024, 1, 1),
        }
    }

    fn subscription() -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            currency: "USD".into(),
            start_date: utc(2024, 1, 1),
            end_date: None,
            current_period_start: utc(2024, 3, 1),
            current_period_end: utc(2024, 4, 1),
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_anchor: utc(2024, 1, 1),
            billing_cycle: BillingCycle::Anniversary,
            status: SubscriptionStatus::Active,
            pay_in_advance: true,
            line_items: vec![],
            created_at: utc(2024, 1, 1),
        }
    }

    #[test]
    fn test_association_checks() {
        let now = utc(2024, 3, 15);
        let sub = subscription();

        assert!(validate_for_association(&coupon(CouponCadence::Once), &sub, now).is_ok());

        let mut draft = coupon(CouponCadence::Once);
        draft.status = CouponStatus::Draft;
        assert_eq!(
            validate_for_association(&draft, &sub, now),
            Err(CouponError::NotPublished)
        );

        let mut not_yet = coupon(CouponCadence::Once);
        not_yet.redeem_after = Some(now + Duration::days(1));
        assert_eq!(
            validate_for_association(&not_yet, &sub, now),
            Err(CouponError::NotActive)
        );

        let mut expired = coupon(CouponCadence::Once);
        expired.redeem_before = Some(now - Duration::days(1));
        assert_eq!(
            validate_for_association(&expired, &sub, now),
            Err(CouponError::Expired)
        );

        let mut eur = coupon(CouponCadence::Once);
        eur.currency = Some("EUR".into());
        assert_eq!(
            validate_for_association(&eur, &sub, now),
            Err(CouponError::CurrencyMismatch)
        );

        let mut exhausted = coupon(CouponCadence::Once);
        exhausted.max_redemptions = Some(2);
        exhausted.total_redemptions = 2;
        assert_eq!(
            validate_for_association(&exhausted, &sub, now),
            Err(CouponError::RedemptionLimitReached)
        );

        let mut cancelled_sub = sub;
        cancelled_sub.status = SubscriptionStatus::Cancelled;
        assert_eq!(
            validate_for_association(&coupon(CouponCadence::Once), &cancelled_sub, now),
            Err(CouponError::InvalidSubscriptionStatus)
        );
    }

    #[test]
    fn test_cadence_rules() {
        let now = utc(2024, 3, 15);
        let sub = subscription();

        // ONCE: valid only with zero prior applications.
        let once = coupon(CouponCadence::Once);
        assert!(validate_for_invoice(&once, &sub, 0, now).is_ok());
        assert_eq!(
            validate_for_invoice(&once, &sub, 1, now),
            Err(CouponError::OnceCadenceViolation)
        );

        // FOREVER: valid even after expiry.
        let mut forever = coupon(CouponCadence::Forever);
        forever.redeem_before = Some(now - Duration::days(30));
        assert!(validate_for_invoice(&forever, &sub, 12, now).is_ok());

        // REPEATED: bounded by duration_in_periods.
        let repeated = coupon(CouponCadence::Repeated);
        assert!(validate_for_invoice(&repeated, &sub, 2, now).is_ok());
        assert_eq!(
            validate_for_invoice(&repeated, &sub, 3, now),
            Err(CouponError::RepeatedCadenceLimitReached)
        );

        let mut malformed = coupon(CouponCadence::Repeated);
        malformed.duration_in_periods = None;
        assert_eq!(
            validate_for_invoice(&malformed, &sub, 0, now),
            Err(CouponError::InvalidRepeatedCadence)
        );
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(CouponError::NotPublished.code(), "coupon_not_published");
        assert_eq!(
            CouponError::RepeatedCadenceLimitReached.code(),
            "coupon_repeated_cadence_limit_reached"
        );
        let billing: BillingError = CouponError::Expired.into();
        assert_eq!(billing.code(), "validation_error");
        let billing: BillingError = CouponError::RedemptionLimitReached.into();
        assert_eq!(billing.code(), "conflict");
    }
}
