//! Seeds a tenant, a user, DEVELOPMENT and PRODUCTION environments, and a
//! minimal development catalog: one LLM-usage meter, one feature wired to
//! it, three plans, a demo customer, and a Pro subscription starting now.

use meterflow_core::catalog::{
    AggregationType, BillingModel, Entitlement, EntityType, Feature, FeatureType, InvoiceCadence,
    Meter, MeterAggregation, Plan, Price, PriceType, RoundMode, TransformQuantity,
    UsageResetPeriod,
};
use meterflow_core::error::BillingResult;
use meterflow_core::event_bus::{make_message, Channel, MessageSink};
use meterflow_core::period::{add_periods, BillingCycle, BillingPeriod};
use meterflow_core::subscription::{Subscription, SubscriptionLineItem, SubscriptionStatus};
use meterflow_core::types::{Customer, Environment, EnvironmentKind, Tenant, User};
use meterflow_store::contracts::{
    CustomerRepo, EntitlementRepo, FeatureRepo, MeterRepo, PlanRepo, PriceRepo, SubscriptionRepo,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Everything the bootstrap created, for callers to drive demos with.
#[derive(Debug, Clone)]
pub struct SeededEnvironment {
    pub tenant: Tenant,
    pub user: User,
    pub environments: Vec<Environment>,
    pub meter: Meter,
    pub feature: Feature,
    pub entitlement: Entitlement,
    pub plans: Vec<Plan>,
    pub customer: Customer,
    pub subscription: Subscription,
}

pub struct OnboardingBootstrap {
    customers: Arc<dyn CustomerRepo>,
    plans: Arc<dyn PlanRepo>,
    meters: Arc<dyn MeterRepo>,
    features: Arc<dyn FeatureRepo>,
    prices: Arc<dyn PriceRepo>,
    entitlements: Arc<dyn EntitlementRepo>,
    subscriptions: Arc<dyn SubscriptionRepo>,
    sink: Arc<dyn MessageSink>,
}

impl OnboardingBootstrap {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        customers: Arc<dyn CustomerRepo>,
        plans: Arc<dyn PlanRepo>,
        meters: Arc<dyn MeterRepo>,
        features: Arc<dyn FeatureRepo>,
        prices: Arc<dyn PriceRepo>,
        entitlements: Arc<dyn EntitlementRepo>,
        subscriptions: Arc<dyn SubscriptionRepo>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            customers,
            plans,
            meters,
            features,
            prices,
            entitlements,
            subscriptions,
            sink,
        }
    }

    /// Seed the development environment. Safe to run once per fresh store.
    pub async fn bootstrap(&self, tenant_name: &str, user_email: &str) -> BillingResult<SeededEnvironment> {
        let now = Utc::now();
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: tenant_name.to_string(),
            created_at: now,
        };
        let user = User {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            email: user_email.to_string(),
            created_at: now,
        };
        let environments = vec![
            Environment {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                kind: EnvironmentKind::Development,
                name: "development".into(),
            },
            Environment {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                kind: EnvironmentKind::Production,
                name: "production".into(),
            },
        ];
        let development = environments[0].id;

        // One LLM-usage meter summing token counts.
        let meter = self
            .meters
            .create(Meter {
                id: Uuid::new_v4(),
                name: "llm usage".into(),
                event_name: "llm_usage".into(),
                aggregation: MeterAggregation {
                    agg_type: AggregationType::Sum,
                    field: Some("tokens".into()),
                    bucket_size_secs: None,
                },
                filters: vec![],
                created_at: now,
            })
            .await?;

        let feature = self
            .features
            .create(Feature {
                id: Uuid::new_v4(),
                name: "llm inference".into(),
                feature_type: FeatureType::Metered,
                meter_id: Some(meter.id),
                created_at: now,
            })
            .await?;

        // Starter $0, Basic $10, Pro $50: monthly flat fees in advance.
        let mut plans = Vec::new();
        let mut pro_price = None;
        for (name, amount) in [("Starter", 0u32), ("Basic", 10), ("Pro", 50)] {
            let plan = self
                .plans
                .create(Plan {
                    id: Uuid::new_v4(),
                    name: name.into(),
                    description: format!("{name} plan"),
                    created_at: now,
                })
                .await?;
            let price = self
                .prices
                .create(Price {
                    id: Uuid::new_v4(),
                    entity_type: EntityType::Plan,
                    entity_id: plan.id,
                    amount: Decimal::from(amount),
                    currency: "USD".into(),
                    price_type: PriceType::Fixed,
                    billing_period: BillingPeriod::Monthly,
                    billing_period_count: 1,
                    billing_model: BillingModel::FlatFee,
                    invoice_cadence: InvoiceCadence::Advance,
                    tier_mode: None,
                    tiers: None,
                    transform_quantity: None,
                    meter_id: None,
                    display_name: format!("{name} (monthly)"),
                    created_at: now,
                })
                .await?;
            if name == "Pro" {
                pro_price = Some((plan.clone(), price));
            }
            plans.push(plan);
        }
        let (pro_plan, pro_base_price) =
            pro_price.expect("Pro plan is always seeded");

        // Metered token pricing on Pro, billed in arrears per 1K tokens.
        let token_price = self
            .prices
            .create(Price {
                id: Uuid::new_v4(),
                entity_type: EntityType::Plan,
                entity_id: pro_plan.id,
                amount: Decimal::new(10, 2), // $0.10 per 1K tokens
                currency: "USD".into(),
                price_type: PriceType::Usage,
                billing_period: BillingPeriod::Monthly,
                billing_period_count: 1,
                billing_model: BillingModel::Package,
                invoice_cadence: InvoiceCadence::Arrear,
                tier_mode: None,
                tiers: None,
                transform_quantity: Some(TransformQuantity {
                    divide_by: Decimal::from(1000),
                    round: RoundMode::Up,
                }),
                meter_id: Some(meter.id),
                display_name: "llm_tokens".into(),
                created_at: now,
            })
            .await?;

        // Pro includes a soft token allowance; overage bills through the
        // arrear token price.
        let entitlement = self
            .entitlements
            .create(Entitlement {
                id: Uuid::new_v4(),
                entity_type: EntityType::Plan,
                entity_id: pro_plan.id,
                feature_id: feature.id,
                feature_type: FeatureType::Metered,
                is_enabled: true,
                usage_limit: Some(Decimal::from(10_000)),
                usage_reset_period: UsageResetPeriod::BillingPeriod,
                is_soft_limit: true,
            })
            .await?;

        let customer = self
            .customers
            .create(Customer {
                id: Uuid::new_v4(),
                external_id: "demo-customer".into(),
                name: "Demo Customer".into(),
                email: "demo@meterflow.dev".into(),
                tenant_id: tenant.id,
                environment_id: development,
                created_at: now,
            })
            .await?;

        let subscription_id = Uuid::new_v4();
        let period_end = add_periods(now, BillingPeriod::Monthly, 1, 1);
        let line_items = vec![
            SubscriptionLineItem {
                id: Uuid::new_v4(),
                subscription_id,
                price_id: pro_base_price.id,
                price_type: PriceType::Fixed,
                meter_id: None,
                display_name: pro_base_price.display_name.clone(),
                quantity: Decimal::ONE,
                currency: "USD".into(),
                billing_period: BillingPeriod::Monthly,
                invoice_cadence: InvoiceCadence::Advance,
                start_date: now,
                end_date: None,
            },
            SubscriptionLineItem {
                id: Uuid::new_v4(),
                subscription_id,
                price_id: token_price.id,
                price_type: PriceType::Usage,
                meter_id: Some(meter.id),
                display_name: token_price.display_name.clone(),
                quantity: Decimal::ONE,
                currency: "USD".into(),
                billing_period: BillingPeriod::Monthly,
                invoice_cadence: InvoiceCadence::Arrear,
                start_date: now,
                end_date: None,
            },
        ];
        let subscription = self
            .subscriptions
            .create_with_line_items(
                Subscription {
                    id: subscription_id,
                    customer_id: customer.id,
                    plan_id: pro_plan.id,
                    currency: "USD".into(),
                    start_date: now,
                    end_date: None,
                    current_period_start: now,
                    current_period_end: period_end,
                    billing_period: BillingPeriod::Monthly,
                    billing_period_count: 1,
                    billing_anchor: now,
                    billing_cycle: BillingCycle::Anniversary,
                    status: SubscriptionStatus::Active,
                    pay_in_advance: true,
                    line_items: vec![],
                    created_at: now,
                },
                line_items,
            )
            .await?;

        self.sink.publish(make_message(
            Channel::Webhooks,
            "subscription.created",
            serde_json::json!({
                "subscription_id": subscription.id,
                "customer_id": customer.id,
                "plan_id": pro_plan.id,
            }),
        ));

        info!(
            tenant = %tenant.id,
            customer = %customer.id,
            subscription = %subscription.id,
            "development environment seeded: 1 meter, 1 feature, 3 plans, 1 subscription"
        );

        Ok(SeededEnvironment {
            tenant,
            user,
            environments,
            meter,
            feature,
            entitlement,
            plans,
            customer,
            subscription,
        })
    }
}
