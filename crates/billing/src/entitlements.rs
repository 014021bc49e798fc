//! Entitlement enforcement: answers "may this customer use this feature
//! right now". Pricing treats soft and hard limits identically; enforcement
//! is where they differ, a hard limit blocks access once the allowance in
//! the current reset window is consumed, a soft limit only reports it.

use meterflow_core::catalog::{Entitlement, EntityType, FeatureType, UsageResetPeriod};
use meterflow_core::error::{BillingError, BillingResult};
use meterflow_core::period::reset_buckets;
use meterflow_core::subscription::Subscription;
use meterflow_store::contracts::{
    EntitlementRepo, EventRepo, FeatureRepo, MeterRepo, UsageQuery,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// The verdict for one (subscription, feature) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessDecision {
    pub feature_id: Uuid,
    pub allowed: bool,
    /// Usage consumed in the current reset window (metered features only).
    pub usage: Decimal,
    pub usage_limit: Option<Decimal>,
    /// Remaining allowance; `None` when unlimited or not metered.
    pub remaining: Option<Decimal>,
    pub over_limit: bool,
    pub is_soft_limit: bool,
}

impl AccessDecision {
    fn boolean(feature_id: Uuid, allowed: bool) -> Self {
        Self {
            feature_id,
            allowed,
            usage: Decimal::ZERO,
            usage_limit: None,
            remaining: None,
            over_limit: false,
            is_soft_limit: false,
        }
    }
}

pub struct EntitlementChecker {
    features: Arc<dyn FeatureRepo>,
    entitlements: Arc<dyn EntitlementRepo>,
    meters: Arc<dyn MeterRepo>,
    events: Arc<dyn EventRepo>,
}

impl EntitlementChecker {
    pub fn new(
        features: Arc<dyn FeatureRepo>,
        entitlements: Arc<dyn EntitlementRepo>,
        meters: Arc<dyn MeterRepo>,
        events: Arc<dyn EventRepo>,
    ) -> Self {
        Self {
            features,
            entitlements,
            meters,
            events,
        }
    }

    /// Evaluate access to a feature for the subscription's customer.
    /// Without an entitlement the feature is closed.
    pub async fn check_access(
        &self,
        subscription: &Subscription,
        external_customer_id: &str,
        feature_id: Uuid,
    ) -> BillingResult<AccessDecision> {
        let feature = self.features.get(feature_id).await?;
        let Some(entitlement) = self.find_entitlement(subscription, feature_id).await? else {
            return Ok(AccessDecision::boolean(feature_id, false));
        };
        if !entitlement.is_enabled {
            return Ok(AccessDecision::boolean(feature_id, false));
        }
        match feature.feature_type {
            FeatureType::Boolean | FeatureType::Static => {
                Ok(AccessDecision::boolean(feature_id, true))
            }
            FeatureType::Metered => {
                self.check_metered(subscription, external_customer_id, &feature, &entitlement)
                    .await
            }
        }
    }

    async fn check_metered(
        &self,
        subscription: &Subscription,
        external_customer_id: &str,
        feature: &meterflow_core::catalog::Feature,
        entitlement: &Entitlement,
    ) -> BillingResult<AccessDecision> {
        let meter_id = feature.meter_id.ok_or_else(|| {
            BillingError::InvalidOperation(format!(
                "metered feature {} has no meter",
                feature.id
            ))
        })?;
        let Some(limit) = entitlement.usage_limit else {
            // Unlimited allowance.
            return Ok(AccessDecision {
                feature_id: feature.id,
                allowed: true,
                usage: Decimal::ZERO,
                usage_limit: None,
                remaining: None,
                over_limit: false,
                is_soft_limit: entitlement.is_soft_limit,
            });
        };

        let meter = self.meters.get(meter_id).await?;
        let (window_start, window_end) = self.current_reset_window(subscription, entitlement);
        let usage = self
            .events
            .get_usage(&UsageQuery {
                meter,
                external_customer_id: external_customer_id.to_string(),
                period_start: window_start,
                period_end: window_end,
            })
            .await?
            .total();

        let over_limit = usage >= limit;
        let decision = AccessDecision {
            feature_id: feature.id,
            allowed: !over_limit || entitlement.is_soft_limit,
            usage,
            usage_limit: Some(limit),
            remaining: Some((limit - usage).max(Decimal::ZERO)),
            over_limit,
            is_soft_limit: entitlement.is_soft_limit,
        };
        debug!(
            feature = %feature.id,
            usage = %decision.usage,
            limit = %limit,
            allowed = decision.allowed,
            "entitlement checked"
        );
        Ok(decision)
    }

    /// The reset bucket containing now, clipped to the current period.
    fn current_reset_window(
        &self,
        subscription: &Subscription,
        entitlement: &Entitlement,
    ) -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
        let now = Utc::now();
        match entitlement.usage_reset_period {
            UsageResetPeriod::BillingPeriod => (
                subscription.current_period_start,
                subscription.current_period_end,
            ),
            UsageResetPeriod::Never => (subscription.start_date, subscription.current_period_end),
            reset => reset_buckets(
                reset,
                subscription.current_period_start,
                subscription.current_period_end,
            )
            .into_iter()
            .find(|(start, end)| *start <= now && now < *end)
            .unwrap_or((
                subscription.current_period_start,
                subscription.current_period_end,
            )),
        }
    }

    async fn find_entitlement(
        &self,
        subscription: &Subscription,
        feature_id: Uuid,
    ) -> BillingResult<Option<Entitlement>> {
        let sub_scoped = self
            .entitlements
            .list_by_entity(EntityType::Subscription, subscription.id)
            .await?;
        if let Some(ent) = sub_scoped.into_iter().find(|e| e.feature_id == feature_id) {
            return Ok(Some(ent));
        }
        let plan_scoped = self
            .entitlements
            .list_by_entity(EntityType::Plan, subscription.plan_id)
            .await?;
        Ok(plan_scoped.into_iter().find(|e| e.feature_id == feature_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone};
    use meterflow_core::catalog::{
        AggregationType, Feature, Meter, MeterAggregation,
    };
    use meterflow_core::period::{BillingCycle, BillingPeriod};
    use meterflow_core::subscription::SubscriptionStatus;
    use meterflow_core::types::UsageEvent;
    use meterflow_store::MemoryStore;
    use std::collections::HashMap;

    fn utc(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        checker: EntitlementChecker,
        subscription: Subscription,
        feature: Feature,
    }

    async fn fixture(feature_type: FeatureType) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let checker = EntitlementChecker::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
        );

        let meter = Meter {
            id: Uuid::new_v4(),
            name: "api calls".into(),
            event_name: "api_call".into(),
            aggregation: MeterAggregation {
                agg_type: AggregationType::Count,
                field: None,
                bucket_size_secs: None,
            },
            filters: vec![],
            created_at: Utc::now(),
        };
        MeterRepo::create(&*store, meter.clone()).await.unwrap();

        let feature = Feature {
            id: Uuid::new_v4(),
            name: "api access".into(),
            feature_type,
            meter_id: Some(meter.id),
            created_at: Utc::now(),
        };
        FeatureRepo::create(&*store, feature.clone()).await.unwrap();

        let now = Utc::now();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            currency: "USD".into(),
            start_date: now - Duration::days(10),
            end_date: None,
            current_period_start: now - Duration::days(10),
            current_period_end: now + Duration::days(20),
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_anchor: now - Duration::days(10),
            billing_cycle: BillingCycle::Anniversary,
            status: SubscriptionStatus::Active,
            pay_in_advance: true,
            line_items: vec![],
            created_at: now - Duration::days(10),
        };

        Fixture {
            store,
            checker,
            subscription,
            feature,
        }
    }

    fn entitlement(
        fx: &Fixture,
        limit: Option<Decimal>,
        soft: bool,
    ) -> Entitlement {
        Entitlement {
            id: Uuid::new_v4(),
            entity_type: EntityType::Plan,
            entity_id: fx.subscription.plan_id,
            feature_id: fx.feature.id,
            feature_type: fx.feature.feature_type,
            is_enabled: true,
            usage_limit: limit,
            usage_reset_period: UsageResetPeriod::BillingPeriod,
            is_soft_limit: soft,
        }
    }

    async fn insert_calls(store: &MemoryStore, count: usize) {
        let now = Utc::now();
        for i in 0..count {
            store
                .insert_event(UsageEvent {
                    id: format!("e-{i}"),
                    event_name: "api_call".into(),
                    external_customer_id: "cust-1".into(),
                    properties: HashMap::new(),
                    timestamp: now - Duration::minutes(i as i64 + 1),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_no_entitlement_denies() {
        let fx = fixture(FeatureType::Metered).await;
        let decision = fx
            .checker
            .check_access(&fx.subscription, "cust-1", fx.feature.id)
            .await
            .unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn test_boolean_feature_follows_enabled_flag() {
        let fx = fixture(FeatureType::Boolean).await;
        let mut ent = entitlement(&fx, None, false);
        ent.is_enabled = true;
        EntitlementRepo::create(&*fx.store, ent.clone()).await.unwrap();

        let decision = fx
            .checker
            .check_access(&fx.subscription, "cust-1", fx.feature.id)
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_hard_limit_blocks_at_allowance() {
        let fx = fixture(FeatureType::Metered).await;
        EntitlementRepo::create(&*fx.store, entitlement(&fx, Some(Decimal::from(10)), false))
            .await
            .unwrap();
        insert_calls(&fx.store, 10).await;

        let decision = fx
            .checker
            .check_access(&fx.subscription, "cust-1", fx.feature.id)
            .await
            .unwrap();
        assert_eq!(decision.usage, Decimal::from(10));
        assert!(decision.over_limit);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_soft_limit_reports_but_allows() {
        let fx = fixture(FeatureType::Metered).await;
        EntitlementRepo::create(&*fx.store, entitlement(&fx, Some(Decimal::from(10)), true))
            .await
            .unwrap();
        insert_calls(&fx.store, 25).await;

        let decision = fx
            .checker
            .check_access(&fx.subscription, "cust-1", fx.feature.id)
            .await
            .unwrap();
        assert!(decision.over_limit);
        assert!(decision.allowed);
        assert!(decision.is_soft_limit);
    }

    #[tokio::test]
    async fn test_under_limit_reports_remaining() {
        let fx = fixture(FeatureType::Metered).await;
        EntitlementRepo::create(&*fx.store, entitlement(&fx, Some(Decimal::from(100)), false))
            .await
            .unwrap();
        insert_calls(&fx.store, 30).await;

        let decision = fx
            .checker
            .check_access(&fx.subscription, "cust-1", fx.feature.id)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert!(!decision.over_limit);
        assert_eq!(decision.remaining, Some(Decimal::from(70)));
    }

    #[tokio::test]
    async fn test_unlimited_is_always_allowed() {
        let fx = fixture(FeatureType::Metered).await;
        EntitlementRepo::create(&*fx.store, entitlement(&fx, None, false))
            .await
            .unwrap();
        insert_calls(&fx.store, 1000).await;

        let decision = fx
            .checker
            .check_access(&fx.subscription, "cust-1", fx.feature.id)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.usage_limit, None);
    }
}
