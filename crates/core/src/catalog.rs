//! Catalog entities shared by reference across subscriptions: meters,
//! features, entitlements, plans, prices, coupons, and credit grants.

use crate::error::{BillingError, BillingResult};
use crate::period::BillingPeriod;
use crate::types::FilterGroup;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Meters ─────────────────────────────────────────────────────────────────

/// How raw events roll up into a usage quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
    Count,
    Sum,
    Avg,
    CountUnique,
    Max,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterAggregation {
    #[serde(rename = "type")]
    pub agg_type: AggregationType,
    /// Event property the aggregation reads. Required for SUM/AVG/MAX and
    /// COUNT_UNIQUE; ignored for COUNT.
    pub field: Option<String>,
    /// Sub-interval width in seconds. Only meaningful for MAX: when set, the
    /// meter yields one maximum per bucket instead of a scalar.
    pub bucket_size_secs: Option<u64>,
}

/// A meter names an event stream and the aggregation applied to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meter {
    pub id: Uuid,
    pub name: String,
    pub event_name: String,
    pub aggregation: MeterAggregation,
    /// Ordered property filters; an event must satisfy every group.
    pub filters: Vec<FilterGroup>,
    pub created_at: DateTime<Utc>,
}

impl Meter {
    /// A meter is bucketed iff it is a MAX aggregation with a bucket size.
    pub fn is_bucketed(&self) -> bool {
        self.aggregation.agg_type == AggregationType::Max
            && self.aggregation.bucket_size_secs.is_some()
    }
}

// ─── Features & entitlements ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    Metered,
    Boolean,
    Static,
}

/// A product capability, optionally wired to a meter for usage accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: Uuid,
    pub name: String,
    pub feature_type: FeatureType,
    pub meter_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// When the consumed-against-limit counter starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageResetPeriod {
    Daily,
    Weekly,
    Monthly,
    BillingPeriod,
    Never,
}

/// Catalog entities that can own prices, grants, and entitlements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Plan,
    Subscription,
}

/// A plan- or subscription-scoped allowance for a feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub feature_id: Uuid,
    pub feature_type: FeatureType,
    pub is_enabled: bool,
    /// `None` means unlimited.
    pub usage_limit: Option<Decimal>,
    pub usage_reset_period: UsageResetPeriod,
    /// Soft limits report overage without blocking; pricing is identical.
    pub is_soft_limit: bool,
}

// ─── Plans & prices ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceType {
    Fixed,
    Usage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingModel {
    FlatFee,
    Package,
    Tiered,
}

/// Whether a line item bills at the start or the end of its period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceCadence {
    Advance,
    Arrear,
}

/// SLAB prices each tier's slice independently; VOLUME prices the whole
/// quantity at the single tier it lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierMode {
    Slab,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier {
    /// Inclusive upper bound of the tier. `None` marks the final open tier.
    pub up_to: Option<Decimal>,
    pub unit_amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundMode {
    Up,
    Down,
}

/// Reshapes a usage count into package units before pricing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformQuantity {
    pub divide_by: Decimal,
    pub round: RoundMode,
}

/// A priced line-item template attached to a plan or subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Price {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    /// Unit amount for FLAT_FEE, package amount for PACKAGE. Tiered prices
    /// carry their amounts in `tiers`.
    pub amount: Decimal,
    pub currency: String,
    pub price_type: PriceType,
    pub billing_period: BillingPeriod,
    pub billing_period_count: u32,
    pub billing_model: BillingModel,
    pub invoice_cadence: InvoiceCadence,
    pub tier_mode: Option<TierMode>,
    pub tiers: Option<Vec<PriceTier>>,
    pub transform_quantity: Option<TransformQuantity>,
    pub meter_id: Option<Uuid>,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl Price {
    /// Enforce the cross-field invariants the billing engine relies on.
    pub fn validate(&self) -> BillingResult<()> {
        if self.price_type == PriceType::Usage && self.meter_id.is_none() {
            return Err(BillingError::Validation(format!(
                "usage price {} requires a meter",
                self.id
            )));
        }
        if self.billing_period_count == 0 {
            return Err(BillingError::Validation(format!(
                "price {} has zero billing_period_count",
                self.id
            )));
        }
        match self.billing_model {
            BillingModel::Tiered => {
                let tiers = self.tiers.as_deref().unwrap_or_default();
                if tiers.is_empty() {
                    return Err(BillingError::Validation(format!(
                        "tiered price {} has no tiers",
                        self.id
                    )));
                }
                if self.tier_mode.is_none() {
                    return Err(BillingError::Validation(format!(
                        "tiered price {} has no tier_mode",
                        self.id
                    )));
                }
                // All but the last tier must be bounded and strictly increasing;
                // the last must be open.
                let mut prev: Option<Decimal> = None;
                for (i, tier) in tiers.iter().enumerate() {
                    let is_last = i == tiers.len() - 1;
                    match (tier.up_to, is_last) {
                        (None, false) => {
                            return Err(BillingError::Validation(format!(
                                "tiered price {}: only the final tier may be open",
                                self.id
                            )));
                        }
                        (Some(_), true) => {
                            return Err(BillingError::Validation(format!(
                                "tiered price {}: final tier must be open",
                                self.id
                            )));
                        }
                        (Some(up_to), false) => {
                            if let Some(p) = prev {
                                if up_to <= p {
                                    return Err(BillingError::Validation(format!(
                                        "tiered price {}: tiers not sorted by up_to",
                                        self.id
                                    )));
                                }
                            }
                            prev = Some(up_to);
                        }
                        (None, true) => {}
                    }
                }
            }
            BillingModel::Package => {
                let divide_by = self
                    .transform_quantity
                    .as_ref()
                    .map(|t| t.divide_by)
                    .unwrap_or(Decimal::ZERO);
                if divide_by < Decimal::ONE {
                    return Err(BillingError::Validation(format!(
                        "package price {} requires transform_quantity.divide_by >= 1",
                        self.id
                    )));
                }
            }
            BillingModel::FlatFee => {}
        }
        Ok(())
    }
}

// ─── Coupons ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponStatus {
    Draft,
    Published,
    Archived,
}

/// ONCE: one application per subscription. FOREVER: every invoice while
/// associated. REPEATED: the first `duration_in_periods` invoices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CouponCadence {
    Once,
    Forever,
    Repeated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Fixed,
    Percentage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupon {
    pub id: Uuid,
    pub name: String,
    /// When set, the coupon only applies to subscriptions in this currency.
    pub currency: Option<String>,
    pub discount_type: DiscountType,
    pub amount_off: Option<Decimal>,
    pub percentage_off: Option<Decimal>,
    pub cadence: CouponCadence,
    pub duration_in_periods: Option<u32>,
    pub max_redemptions: Option<u64>,
    pub total_redemptions: u64,
    pub redeem_after: Option<DateTime<Utc>>,
    pub redeem_before: Option<DateTime<Utc>>,
    pub status: CouponStatus,
    pub created_at: DateTime<Utc>,
}

impl Coupon {
    pub fn validate(&self) -> BillingResult<()> {
        if self.cadence == CouponCadence::Repeated
            && self.duration_in_periods.unwrap_or(0) < 1
        {
            return Err(BillingError::Validation(format!(
                "repeated coupon {} requires duration_in_periods >= 1",
                self.id
            )));
        }
        match self.discount_type {
            DiscountType::Fixed if self.amount_off.is_none() => {
                Err(BillingError::Validation(format!(
                    "fixed coupon {} requires amount_off",
                    self.id
                )))
            }
            DiscountType::Percentage if self.percentage_off.is_none() => {
                Err(BillingError::Validation(format!(
                    "percentage coupon {} requires percentage_off",
                    self.id
                )))
            }
            _ => Ok(()),
        }
    }

    /// Discounted total for the given invoice amount. Never below zero.
    pub fn discounted(&self, amount: Decimal) -> Decimal {
        let discounted = match self.discount_type {
            DiscountType::Fixed => amount - self.amount_off.unwrap_or(Decimal::ZERO),
            DiscountType::Percentage => {
                let pct = self.percentage_off.unwrap_or(Decimal::ZERO);
                amount - amount * pct / Decimal::from(100)
            }
        };
        discounted.max(Decimal::ZERO)
    }
}

/// Link between a coupon and a subscription (optionally one of its line items).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponAssociation {
    pub id: Uuid,
    pub coupon_id: Uuid,
    pub subscription_id: Uuid,
    pub subscription_line_item_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// One redemption of a coupon against a concrete invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponApplication {
    pub id: Uuid,
    pub coupon_id: Uuid,
    pub subscription_id: Uuid,
    pub invoice_id: Uuid,
    pub amount_off: Decimal,
    pub applied_at: DateTime<Utc>,
}

// ─── Credit grants ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditGrantCadence {
    OneTime,
    Recurring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationType {
    Never,
    BillingCycle,
    Duration,
}

/// Where a grant attaches: every subscription of a plan, or one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum CreditGrantScope {
    Plan { plan_id: Uuid },
    Subscription { subscription_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditGrant {
    pub id: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub scope: CreditGrantScope,
    pub credits: Decimal,
    pub currency: String,
    pub cadence: CreditGrantCadence,
    /// Grant-defined recurrence; when absent, recurring grants follow the
    /// subscription's billing period.
    pub period: Option<BillingPeriod>,
    pub period_count: Option<u32>,
    pub expiration_type: ExpirationType,
    pub expiration_duration_days: Option<i64>,
    pub priority: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage_price(tiers: Option<Vec<PriceTier>>) -> Price {
        Price {
            id: Uuid::new_v4(),
            entity_type: EntityType::Plan,
            entity_id: Uuid::new_v4(),
            amount: Decimal::ZERO,
            currency: "USD".into(),
            price_type: PriceType::Usage,
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_model: BillingModel::Tiered,
            invoice_cadence: InvoiceCadence::Arrear,
            tier_mode: Some(TierMode::Slab),
            tiers,
            transform_quantity: None,
            meter_id: Some(Uuid::new_v4()),
            display_name: "api_calls".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_tiered_price_invariants() {
        let valid = usage_price(Some(vec![
            PriceTier {
                up_to: Some(Decimal::from(1000)),
                unit_amount: Decimal::new(2, 2),
            },
            PriceTier {
                up_to: None,
                unit_amount: Decimal::new(1, 2),
            },
        ]));
        assert!(valid.validate().is_ok());

        // Final tier must be open.
        let closed_final = usage_price(Some(vec![PriceTier {
            up_to: Some(Decimal::from(1000)),
            unit_amount: Decimal::new(2, 2),
        }]));
        assert!(closed_final.validate().is_err());

        // Tiers must be sorted.
        let unsorted = usage_price(Some(vec![
            PriceTier {
                up_to: Some(Decimal::from(1000)),
                unit_amount: Decimal::new(2, 2),
            },
            PriceTier {
                up_to: Some(Decimal::from(500)),
                unit_amount: Decimal::new(1, 2),
            },
            PriceTier {
                up_to: None,
                unit_amount: Decimal::new(1, 2),
            },
        ]));
        assert!(unsorted.validate().is_err());

        let empty = usage_price(Some(vec![]));
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_usage_price_requires_meter() {
        let mut price = usage_price(Some(vec![PriceTier {
            up_to: None,
            unit_amount: Decimal::ONE,
        }]));
        price.meter_id = None;
        assert!(price.validate().is_err());
    }

    #[test]
    fn test_coupon_discount() {
        let fixed = Coupon {
            id: Uuid::new_v4(),
            name: "WELCOME5".into(),
            currency: Some("USD".into()),
            discount_type: DiscountType::Fixed,
            amount_off: Some(Decimal::from(5)),
            percentage_off: None,
            cadence: CouponCadence::Once,
            duration_in_periods: None,
            max_redemptions: None,
            total_redemptions: 0,
            redeem_after: None,
            redeem_before: None,
            status: CouponStatus::Published,
            created_at: Utc::now(),
        };
        assert_eq!(fixed.discounted(Decimal::from(20)), Decimal::from(15));
        // Never below zero.
        assert_eq!(fixed.discounted(Decimal::from(3)), Decimal::ZERO);

        let pct = Coupon {
            discount_type: DiscountType::Percentage,
            amount_off: None,
            percentage_off: Some(Decimal::from(25)),
            ..fixed
        };
        assert_eq!(pct.discounted(Decimal::from(40)), Decimal::from(30));
    }

    #[test]
    fn test_repeated_coupon_requires_duration() {
        let coupon = Coupon {
            id: Uuid::new_v4(),
            name: "REPEAT".into(),
            currency: None,
            discount_type: DiscountType::Percentage,
            amount_off: None,
            percentage_off: Some(Decimal::from(10)),
            cadence: CouponCadence::Repeated,
            duration_in_periods: None,
            max_redemptions: None,
            total_redemptions: 0,
            redeem_after: None,
            redeem_before: None,
            status: CouponStatus::Published,
            created_at: Utc::now(),
        };
        assert!(coupon.validate().is_err());
    }

    #[test]
    fn test_bucketed_meter() {
        let meter = Meter {
            id: Uuid::new_v4(),
            name: "peak concurrency".into(),
            event_name: "concurrency_sample".into(),
            aggregation: MeterAggregation {
                agg_type: AggregationType::Max,
                field: Some("value".into()),
                bucket_size_secs: Some(60),
            },
            filters: vec![],
            created_at: Utc::now(),
        };
        assert!(meter.is_bucketed());

        let scalar = Meter {
            aggregation: MeterAggregation {
                agg_type: AggregationType::Max,
                field: Some("value".into()),
                bucket_size_secs: None,
            },
            ..meter
        };
        assert!(!scalar.is_bucketed());
    }
}
