//! Usage charging: pulls aggregated usage per meter, applies entitlements,
//! and prices the billable remainder.

use crate::pricing;
use meterflow_core::catalog::{Entitlement, EntityType, UsageResetPeriod};
use meterflow_core::error::{BillingError, BillingResult};
use meterflow_core::invoice::InvoiceLineItemRequest;
use meterflow_core::period::reset_buckets;
use meterflow_core::subscription::{Subscription, SubscriptionLineItem};
use meterflow_store::contracts::{
    EntitlementRepo, EventRepo, FeatureRepo, MeterRepo, PriceRepo, UsageQuery, UsageResult,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// What remains billable after the entitlement is applied.
enum Billable {
    /// No allowance: the full aggregate is billed (bucketed pricing
    /// preserved for bucketed meters).
    Full(UsageResult),
    /// An overage quantity left after subtracting the allowance.
    Overage(Decimal),
}

pub struct UsageCharger {
    prices: Arc<dyn PriceRepo>,
    meters: Arc<dyn MeterRepo>,
    features: Arc<dyn FeatureRepo>,
    entitlements: Arc<dyn EntitlementRepo>,
    events: Arc<dyn EventRepo>,
}

impl UsageCharger {
    pub fn new(
        prices: Arc<dyn PriceRepo>,
        meters: Arc<dyn MeterRepo>,
        features: Arc<dyn FeatureRepo>,
        entitlements: Arc<dyn EntitlementRepo>,
        events: Arc<dyn EventRepo>,
    ) -> Self {
        Self {
            prices,
            meters,
            features,
            entitlements,
            events,
        }
    }

    /// Charge all usage line items of the subscription active in the period.
    /// Returns the generated line items and their unrounded total.
    pub async fn calculate_usage_charges(
        &self,
        subscription: &Subscription,
        external_customer_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> BillingResult<(Vec<InvoiceLineItemRequest>, Decimal)> {
        let mut line_items = Vec::new();
        let mut total = Decimal::ZERO;
        for item in subscription.line_items.iter().filter(|i| i.is_usage()) {
            if let Some(line) = self
                .charge_line_item(subscription, item, external_customer_id, period_start, period_end)
                .await?
            {
                total += line.amount;
                line_items.push(line);
            }
        }
        Ok((line_items, total))
    }

    /// Charge a single usage line item. `None` when the item is not active
    /// anywhere inside the period.
    pub async fn charge_line_item(
        &self,
        subscription: &Subscription,
        item: &SubscriptionLineItem,
        external_customer_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> BillingResult<Option<InvoiceLineItemRequest>> {
        let Some((window_start, window_end)) = item.active_window(period_start, period_end) else {
            return Ok(None);
        };

        let price = self.prices.get(item.price_id).await?;
        // A usage price without a meter is a catalog defect; surface the
        // offending line item.
        let meter_id = price.meter_id.ok_or_else(|| {
            BillingError::InvalidOperation(format!(
                "usage line item {} references price {} with no meter",
                item.id, price.id
            ))
        })?;
        let meter = self.meters.get(meter_id).await?;

        let usage = self
            .events
            .get_usage(&UsageQuery {
                meter: meter.clone(),
                external_customer_id: external_customer_id.to_string(),
                period_start: window_start,
                period_end: window_end,
            })
            .await?;

        let entitlement = self.find_entitlement(subscription, meter_id).await?;
        let billable = match &entitlement {
            None => Billable::Full(usage),
            Some(ent) if !ent.is_enabled => Billable::Full(usage),
            Some(ent) => match ent.usage_limit {
                // Unlimited allowance: nothing billable.
                None => Billable::Overage(Decimal::ZERO),
                Some(limit) => {
                    self.overage_for(
                        ent,
                        limit,
                        &usage,
                        subscription,
                        &meter,
                        external_customer_id,
                        window_start,
                        window_end,
                    )
                    .await?
                }
            },
        };

        let (quantity, amount) = match billable {
            Billable::Full(usage) => pricing::rate_usage(&price, &usage)?,
            Billable::Overage(quantity) => (quantity, pricing::rate_quantity(&price, quantity)?),
        };

        debug!(
            line_item = %item.id,
            meter = %meter.id,
            %quantity,
            %amount,
            "usage charge computed"
        );

        Ok(Some(InvoiceLineItemRequest {
            price_id: item.price_id,
            display_name: item.display_name.clone(),
            quantity,
            amount,
            currency: item.currency.clone(),
            period_start,
            period_end,
            usage_reset_period: entitlement.map(|e| e.usage_reset_period),
            is_proration: false,
        }))
    }

    /// Billable overage under a concrete limit, per the reset cadence.
    /// Soft vs hard limits only change downstream enforcement, never the
    /// computed quantity.
    #[allow(clippy::too_many_arguments)]
    async fn overage_for(
        &self,
        entitlement: &Entitlement,
        limit: Decimal,
        usage: &UsageResult,
        subscription: &Subscription,
        meter: &meterflow_core::catalog::Meter,
        external_customer_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> BillingResult<Billable> {
        let overage = match entitlement.usage_reset_period {
            UsageResetPeriod::BillingPeriod => {
                (usage.total() - limit).max(Decimal::ZERO)
            }
            UsageResetPeriod::Daily | UsageResetPeriod::Weekly | UsageResetPeriod::Monthly => {
                let mut total = Decimal::ZERO;
                for (bucket_start, bucket_end) in
                    reset_buckets(entitlement.usage_reset_period, window_start, window_end)
                {
                    let bucket_usage = self
                        .events
                        .get_usage(&UsageQuery {
                            meter: meter.clone(),
                            external_customer_id: external_customer_id.to_string(),
                            period_start: bucket_start,
                            period_end: bucket_end,
                        })
                        .await?;
                    total += (bucket_usage.total() - limit).max(Decimal::ZERO);
                }
                total
            }
            UsageResetPeriod::Never => {
                // Lifetime usage through the end of this window, minus what
                // was already accounted before the window, minus the
                // allowance.
                let lifetime = self
                    .events
                    .get_usage(&UsageQuery {
                        meter: meter.clone(),
                        external_customer_id: external_customer_id.to_string(),
                        period_start: subscription.start_date,
                        period_end: window_end,
                    })
                    .await?
                    .total();
                let before = self
                    .events
                    .get_usage(&UsageQuery {
                        meter: meter.clone(),
                        external_customer_id: external_customer_id.to_string(),
                        period_start: subscription.start_date,
                        period_end: window_start,
                    })
                    .await?
                    .total();
                (lifetime - before - limit).max(Decimal::ZERO)
            }
        };
        Ok(Billable::Overage(overage))
    }

    /// The entitlement governing a meter for this subscription.
    /// Subscription-scoped entitlements shadow plan-scoped ones.
    async fn find_entitlement(
        &self,
        subscription: &Subscription,
        meter_id: Uuid,
    ) -> BillingResult<Option<Entitlement>> {
        let Some(feature) = self.features.get_by_meter(meter_id).await? else {
            return Ok(None);
        };
        let sub_scoped = self
            .entitlements
            .list_by_entity(EntityType::Subscription, subscription.id)
            .await?;
        if let Some(ent) = sub_scoped.into_iter().find(|e| e.feature_id == feature.id) {
            return Ok(Some(ent));
        }
        let plan_scoped = self
            .entitlements
            .list_by_entity(EntityType::Plan, subscription.plan_id)
            .await?;
        Ok(plan_scoped.into_iter().find(|e| e.feature_id == feature.id))
    }
}
