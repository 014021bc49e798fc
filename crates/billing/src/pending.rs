//! Feeds the wallet's real-time balance with the cost of usage accrued in
//! the running period but not yet invoiced.

use crate::usage::UsageCharger;
use async_trait::async_trait;
use meterflow_core::error::BillingResult;
use meterflow_store::contracts::{CustomerRepo, SubscriptionRepo};
use meterflow_wallet::PendingUsageSource;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

pub struct SubscriptionUsageSource {
    subscriptions: Arc<dyn SubscriptionRepo>,
    customers: Arc<dyn CustomerRepo>,
    charger: Arc<UsageCharger>,
}

impl SubscriptionUsageSource {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepo>,
        customers: Arc<dyn CustomerRepo>,
        charger: Arc<UsageCharger>,
    ) -> Self {
        Self {
            subscriptions,
            customers,
            charger,
        }
    }
}

#[async_trait]
impl PendingUsageSource for SubscriptionUsageSource {
    async fn current_period_usage(
        &self,
        customer_id: Uuid,
        currency: &str,
    ) -> BillingResult<Decimal> {
        let customer = self.customers.get(customer_id).await?;
        let mut total = Decimal::ZERO;
        for sub in self.subscriptions.list().await? {
            if sub.customer_id != customer_id
                || !sub.currency.eq_ignore_ascii_case(currency)
                || !sub.status.is_billable()
            {
                continue;
            }
            let sub = self.subscriptions.get_with_line_items(sub.id).await?;
            let (_, amount) = self
                .charger
                .calculate_usage_charges(
                    &sub,
                    &customer.external_id,
                    sub.current_period_start,
                    sub.current_period_end,
                )
                .await?;
            total += amount;
        }
        Ok(total)
    }
}
