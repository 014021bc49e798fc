//! Pure price rating: turns a billable quantity into a monetary amount under
//! the price's billing model. All arithmetic stays in `Decimal`; rounding to
//! currency minor units happens only at invoice totals.

use meterflow_core::catalog::{BillingModel, Price, PriceTier, RoundMode, TierMode};
use meterflow_core::error::{BillingError, BillingResult};
use meterflow_store::contracts::UsageResult;
use rust_decimal::{Decimal, RoundingStrategy};

/// Amount owed for `quantity` units under `price`.
pub fn rate_quantity(price: &Price, quantity: Decimal) -> BillingResult<Decimal> {
    if quantity <= Decimal::ZERO {
        return Ok(Decimal::ZERO);
    }
    match price.billing_model {
        BillingModel::FlatFee => Ok(price.amount * quantity),
        BillingModel::Package => rate_package(price, quantity),
        BillingModel::Tiered => {
            let tiers = price.tiers.as_deref().ok_or_else(|| {
                BillingError::Validation(format!("tiered price {} has no tiers", price.id))
            })?;
            match price.tier_mode {
                Some(TierMode::Slab) => Ok(rate_slab(tiers, quantity)),
                Some(TierMode::Volume) => Ok(rate_volume(tiers, quantity)),
                None => Err(BillingError::Validation(format!(
                    "tiered price {} has no tier_mode",
                    price.id
                ))),
            }
        }
    }
}

/// Amount for a usage aggregate. Bucketed results are rated per bucket
/// maximum and summed; the reported quantity is the sum of bucket maxima.
pub fn rate_usage(price: &Price, usage: &UsageResult) -> BillingResult<(Decimal, Decimal)> {
    match usage {
        UsageResult::Scalar(quantity) => {
            Ok((*quantity, rate_quantity(price, *quantity)?))
        }
        UsageResult::Bucketed(buckets) => {
            let mut amount = Decimal::ZERO;
            for bucket_max in buckets {
                amount += rate_quantity(price, *bucket_max)?;
            }
            Ok((buckets.iter().copied().sum(), amount))
        }
    }
}

fn rate_package(price: &Price, quantity: Decimal) -> BillingResult<Decimal> {
    let transform = price.transform_quantity.as_ref().ok_or_else(|| {
        BillingError::Validation(format!(
            "package price {} has no transform_quantity",
            price.id
        ))
    })?;
    let packages = quantity / transform.divide_by;
    let packages = match transform.round {
        RoundMode::Up => packages.round_dp_with_strategy(0, RoundingStrategy::AwayFromZero),
        RoundMode::Down => packages.round_dp_with_strategy(0, RoundingStrategy::ToZero),
    };
    Ok(packages * price.amount)
}

/// Each tier bills its own slice of the quantity; the open final tier
/// absorbs the remainder.
fn rate_slab(tiers: &[PriceTier], quantity: Decimal) -> Decimal {
    let mut amount = Decimal::ZERO;
    let mut remaining = quantity;
    let mut prev_up_to = Decimal::ZERO;
    for tier in tiers {
        if remaining <= Decimal::ZERO {
            break;
        }
        let slice = match tier.up_to {
            Some(up_to) => remaining.min(up_to - prev_up_to),
            None => remaining,
        };
        amount += slice * tier.unit_amount;
        remaining -= slice;
        if let Some(up_to) = tier.up_to {
            prev_up_to = up_to;
        }
    }
    amount
}

/// The whole quantity is billed at the single tier it falls into.
fn rate_volume(tiers: &[PriceTier], quantity: Decimal) -> Decimal {
    for tier in tiers {
        match tier.up_to {
            Some(up_to) if quantity <= up_to => return quantity * tier.unit_amount,
            Some(_) => continue,
            None => return quantity * tier.unit_amount,
        }
    }
    Decimal::ZERO
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use meterflow_core::catalog::{
        EntityType, InvoiceCadence, PriceType, TransformQuantity,
    };
    use meterflow_core::period::BillingPeriod;
    use uuid::Uuid;

    fn base_price(model: BillingModel) -> Price {
        Price {
            id: Uuid::new_v4(),
            entity_type: EntityType::Plan,
            entity_id: Uuid::new_v4(),
            amount: Decimal::ZERO,
            currency: "USD".into(),
            price_type: PriceType::Usage,
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_model: model,
            invoice_cadence: InvoiceCadence::Arrear,
            tier_mode: None,
            tiers: None,
            transform_quantity: None,
            meter_id: Some(Uuid::new_v4()),
            display_name: "usage".into(),
            created_at: Utc::now(),
        }
    }

    fn tiers() -> Vec<PriceTier> {
        vec![
            PriceTier {
                up_to: Some(Decimal::from(1000)),
                unit_amount: Decimal::new(2, 2), // $0.02
            },
            PriceTier {
                up_to: Some(Decimal::from(5000)),
                unit_amount: Decimal::new(1, 2), // $0.01
            },
            PriceTier {
                up_to: None,
                unit_amount: Decimal::new(5, 3), // $0.005
            },
        ]
    }

    #[test]
    fn test_flat_fee() {
        let mut price = base_price(BillingModel::FlatFee);
        price.amount = Decimal::new(250, 2); // $2.50
        assert_eq!(rate_quantity(&price, Decimal::from(4)).unwrap(), Decimal::from(10));
        assert_eq!(rate_quantity(&price, Decimal::ZERO).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_package_rounding() {
        let mut price = base_price(BillingModel::Package);
        price.amount = Decimal::from(5); // $5 per 1000
        price.transform_quantity = Some(TransformQuantity {
            divide_by: Decimal::from(1000),
            round: RoundMode::Up,
        });
        // 1500 units -> 2 packages rounding up.
        assert_eq!(rate_quantity(&price, Decimal::from(1500)).unwrap(), Decimal::from(10));
        // Exactly one package.
        assert_eq!(rate_quantity(&price, Decimal::from(1000)).unwrap(), Decimal::from(5));

        price.transform_quantity = Some(TransformQuantity {
            divide_by: Decimal::from(1000),
            round: RoundMode::Down,
        });
        assert_eq!(rate_quantity(&price, Decimal::from(1500)).unwrap(), Decimal::from(5));
    }

    #[test]
    fn test_slab_walks_tiers() {
        let mut price = base_price(BillingModel::Tiered);
        price.tier_mode = Some(TierMode::Slab);
        price.tiers = Some(tiers());

        // 500 calls all in the first tier at $0.02.
        assert_eq!(rate_quantity(&price, Decimal::from(500)).unwrap(), Decimal::from(10));
        // 2000 calls: 1000 × 0.02 + 1000 × 0.01 = 30.
        assert_eq!(rate_quantity(&price, Decimal::from(2000)).unwrap(), Decimal::from(30));
        // 6000 calls: 1000 × 0.02 + 4000 × 0.01 + 1000 × 0.005 = 65.
        assert_eq!(rate_quantity(&price, Decimal::from(6000)).unwrap(), Decimal::from(65));
    }

    #[test]
    fn test_slab_boundary_exact_up_to() {
        let mut price = base_price(BillingModel::Tiered);
        price.tier_mode = Some(TierMode::Slab);
        price.tiers = Some(tiers());

        // Exactly up_to of tier 1 stays entirely within tier 1.
        assert_eq!(rate_quantity(&price, Decimal::from(1000)).unwrap(), Decimal::from(20));
    }

    #[test]
    fn test_volume_single_tier() {
        let mut price = base_price(BillingModel::Tiered);
        price.tier_mode = Some(TierMode::Volume);
        price.tiers = Some(tiers());

        // 2000 lands in tier 2, all units at $0.01.
        assert_eq!(rate_quantity(&price, Decimal::from(2000)).unwrap(), Decimal::from(20));
        // Boundary stays in the lower tier.
        assert_eq!(rate_quantity(&price, Decimal::from(1000)).unwrap(), Decimal::from(20));
        // Open tier.
        assert_eq!(rate_quantity(&price, Decimal::from(10000)).unwrap(), Decimal::from(50));
    }

    #[test]
    fn test_bucketed_usage_rated_per_bucket() {
        let mut price = base_price(BillingModel::Tiered);
        price.tier_mode = Some(TierMode::Slab);
        price.tiers = Some(tiers());

        // Two buckets of 800 each stay in tier 1 ($0.02) individually,
        // where a scalar 1600 would spill into tier 2.
        let bucketed = UsageResult::Bucketed(vec![Decimal::from(800), Decimal::from(800)]);
        let (quantity, amount) = rate_usage(&price, &bucketed).unwrap();
        assert_eq!(quantity, Decimal::from(1600));
        assert_eq!(amount, Decimal::from(32));

        let scalar = UsageResult::Scalar(Decimal::from(1600));
        let (_, amount) = rate_usage(&price, &scalar).unwrap();
        assert_eq!(amount, Decimal::from(26));

        // One bucket equals the scalar case.
        let single = UsageResult::Bucketed(vec![Decimal::from(700)]);
        let single_scalar = UsageResult::Scalar(Decimal::from(700));
        assert_eq!(
            rate_usage(&price, &single).unwrap(),
            rate_usage(&price, &single_scalar).unwrap()
        );
    }
}
