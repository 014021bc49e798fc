//! Mid-period subscription changes: price swaps, quantity changes, adding
//! and removing line items, and cancellation. Every change computes its
//! proration and applies it under the caller's behavior before the
//! subscription aggregate is rewritten.

use crate::proration::{
    calculate_proration, ProrationAction, ProrationBehavior, ProrationEngine, ProrationParams,
};
use meterflow_core::catalog::Price;
use meterflow_core::error::{BillingError, BillingResult};
use meterflow_core::invoice::Invoice;
use meterflow_core::period::ProrationStrategy;
use meterflow_core::subscription::{Subscription, SubscriptionLineItem, SubscriptionStatus};
use meterflow_store::contracts::{PriceRepo, SubscriptionRepo};
use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct SubscriptionChangeService {
    subscriptions: Arc<dyn SubscriptionRepo>,
    prices: Arc<dyn PriceRepo>,
    engine: Arc<ProrationEngine>,
    strategy: ProrationStrategy,
}

impl SubscriptionChangeService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepo>,
        prices: Arc<dyn PriceRepo>,
        engine: Arc<ProrationEngine>,
        strategy: ProrationStrategy,
    ) -> Self {
        Self {
            subscriptions,
            prices,
            engine,
            strategy,
        }
    }

    /// Swap a line item onto a different price. The old item ends at the
    /// proration date and a successor item starts there.
    pub async fn change_line_item_price(
        &self,
        subscription_id: Uuid,
        line_item_id: Uuid,
        new_price_id: Uuid,
        proration_date: DateTime<Utc>,
        behavior: ProrationBehavior,
    ) -> BillingResult<(Subscription, Option<Invoice>)> {
        let mut subscription = self.billable_subscription(subscription_id).await?;
        let idx = find_item(&subscription, line_item_id)?;
        let old_price = self.prices.get(subscription.line_items[idx].price_id).await?;
        let new_price = self.prices.get(new_price_id).await?;
        if !new_price.currency.eq_ignore_ascii_case(&subscription.currency) {
            return Err(BillingError::Validation(format!(
                "price {} currency {} does not match subscription currency {}",
                new_price.id, new_price.currency, subscription.currency
            )));
        }

        let action = if new_price.amount >= old_price.amount {
            ProrationAction::Upgrade
        } else {
            ProrationAction::Downgrade
        };
        let quantity = subscription.line_items[idx].quantity;
        let result = calculate_proration(&self.params(
            &subscription,
            action,
            &new_price,
            old_price.amount,
            new_price.amount,
            quantity,
            quantity,
            proration_date,
        ))?;
        let invoice = self
            .engine
            .apply_proration(&subscription, &result, behavior)
            .await?;

        subscription.line_items[idx].end_date = Some(proration_date);
        let successor = line_item_from_price(&subscription, &new_price, quantity, proration_date);
        subscription.line_items.push(successor);
        let subscription = self.subscriptions.update(subscription).await?;
        info!(
            subscription = %subscription_id,
            line_item = %line_item_id,
            new_price = %new_price_id,
            ?action,
            net = %result.net_amount,
            "line item price changed"
        );
        Ok((subscription, invoice))
    }

    /// Change a line item's quantity in place.
    pub async fn change_line_item_quantity(
        &self,
        subscription_id: Uuid,
        line_item_id: Uuid,
        new_quantity: Decimal,
        proration_date: DateTime<Utc>,
        behavior: ProrationBehavior,
    ) -> BillingResult<(Subscription, Option<Invoice>)> {
        if new_quantity <= Decimal::ZERO {
            return Err(BillingError::Validation(
                "quantity must be positive".into(),
            ));
        }
        let mut subscription = self.billable_subscription(subscription_id).await?;
        let idx = find_item(&subscription, line_item_id)?;
        let price = self.prices.get(subscription.line_items[idx].price_id).await?;
        let old_quantity = subscription.line_items[idx].quantity;

        let result = calculate_proration(&self.params(
            &subscription,
            ProrationAction::QuantityChange,
            &price,
            price.amount,
            price.amount,
            old_quantity,
            new_quantity,
            proration_date,
        ))?;
        let invoice = self
            .engine
            .apply_proration(&subscription, &result, behavior)
            .await?;

        subscription.line_items[idx].quantity = new_quantity;
        let subscription = self.subscriptions.update(subscription).await?;
        info!(
            subscription = %subscription_id,
            line_item = %line_item_id,
            %old_quantity,
            %new_quantity,
            "line item quantity changed"
        );
        Ok((subscription, invoice))
    }

    /// Attach a new priced item starting at the proration date. Usage
    /// prices prorate nothing; they bill in arrears against actual events.
    pub async fn add_line_item(
        &self,
        subscription_id: Uuid,
        price_id: Uuid,
        quantity: Decimal,
        proration_date: DateTime<Utc>,
        behavior: ProrationBehavior,
    ) -> BillingResult<(Subscription, Option<Invoice>)> {
        let mut subscription = self.billable_subscription(subscription_id).await?;
        let price = self.prices.get(price_id).await?;
        if !price.currency.eq_ignore_ascii_case(&subscription.currency) {
            return Err(BillingError::Validation(format!(
                "price {} currency {} does not match subscription currency {}",
                price.id, price.currency, subscription.currency
            )));
        }

        let result = calculate_proration(&self.params(
            &subscription,
            ProrationAction::AddItem,
            &price,
            Decimal::ZERO,
            price.amount,
            Decimal::ZERO,
            quantity,
            proration_date,
        ))?;
        let invoice = self
            .engine
            .apply_proration(&subscription, &result, behavior)
            .await?;

        let item = line_item_from_price(&subscription, &price, quantity, proration_date);
        subscription.line_items.push(item);
        let subscription = self.subscriptions.update(subscription).await?;
        Ok((subscription, invoice))
    }

    /// End a line item at the proration date.
    pub async fn remove_line_item(
        &self,
        subscription_id: Uuid,
        line_item_id: Uuid,
        proration_date: DateTime<Utc>,
        behavior: ProrationBehavior,
    ) -> BillingResult<(Subscription, Option<Invoice>)> {
        let mut subscription = self.billable_subscription(subscription_id).await?;
        let idx = find_item(&subscription, line_item_id)?;
        let price = self.prices.get(subscription.line_items[idx].price_id).await?;
        let quantity = subscription.line_items[idx].quantity;

        let result = calculate_proration(&self.params(
            &subscription,
            ProrationAction::RemoveItem,
            &price,
            price.amount,
            Decimal::ZERO,
            quantity,
            Decimal::ZERO,
            proration_date,
        ))?;
        let invoice = self
            .engine
            .apply_proration(&subscription, &result, behavior)
            .await?;

        subscription.line_items[idx].end_date = Some(proration_date);
        let subscription = self.subscriptions.update(subscription).await?;
        Ok((subscription, invoice))
    }

    /// Cancel the subscription at the given date. Prepaid plans credit the
    /// unused remainder of every active fixed item.
    pub async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        cancel_date: DateTime<Utc>,
        behavior: ProrationBehavior,
    ) -> BillingResult<Subscription> {
        let mut subscription = self.billable_subscription(subscription_id).await?;

        let active: Vec<SubscriptionLineItem> = subscription
            .line_items
            .iter()
            .filter(|item| {
                !item.is_usage()
                    && item.overlaps(subscription.current_period_start, subscription.current_period_end)
            })
            .cloned()
            .collect();
        for item in &active {
            let price = self.prices.get(item.price_id).await?;
            let result = calculate_proration(&self.params(
                &subscription,
                ProrationAction::Cancel,
                &price,
                price.amount,
                Decimal::ZERO,
                item.quantity,
                Decimal::ZERO,
                cancel_date,
            ))?;
            self.engine
                .apply_proration(&subscription, &result, behavior)
                .await?;
        }

        subscription.status = SubscriptionStatus::Cancelled;
        subscription.end_date = Some(cancel_date);
        for item in &mut subscription.line_items {
            if item.end_date.map(|e| e > cancel_date).unwrap_or(true) {
                item.end_date = Some(cancel_date);
            }
        }
        let subscription = self.subscriptions.update(subscription).await?;
        info!(subscription = %subscription_id, %cancel_date, "subscription cancelled");
        Ok(subscription)
    }

    async fn billable_subscription(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let subscription = self
            .subscriptions
            .get_with_line_items(subscription_id)
            .await?;
        if subscription.status.is_terminal() {
            return Err(BillingError::InvalidOperation(format!(
                "subscription {} is {:?}",
                subscription_id, subscription.status
            )));
        }
        Ok(subscription)
    }

    #[allow(clippy::too_many_arguments)]
    fn params(
        &self,
        subscription: &Subscription,
        action: ProrationAction,
        price: &Price,
        old_price_per_unit: Decimal,
        new_price_per_unit: Decimal,
        old_quantity: Decimal,
        new_quantity: Decimal,
        proration_date: DateTime<Utc>,
    ) -> ProrationParams {
        ProrationParams {
            action,
            price_id: price.id,
            display_name: price.display_name.clone(),
            price_type: price.price_type,
            old_price_per_unit,
            new_price_per_unit,
            old_quantity,
            new_quantity,
            proration_date,
            period_start: subscription.current_period_start,
            period_end: subscription.current_period_end,
            customer_timezone: FixedOffset::east_opt(0).expect("zero offset is valid"),
            strategy: self.strategy,
            plan_pay_in_advance: subscription.pay_in_advance,
            currency: subscription.currency.clone(),
        }
    }
}

fn find_item(subscription: &Subscription, line_item_id: Uuid) -> BillingResult<usize> {
    subscription
        .line_items
        .iter()
        .position(|item| item.id == line_item_id)
        .ok_or_else(|| BillingError::not_found("subscription line item", line_item_id))
}

fn line_item_from_price(
    subscription: &Subscription,
    price: &Price,
    quantity: Decimal,
    start_date: DateTime<Utc>,
) -> SubscriptionLineItem {
    SubscriptionLineItem {
        id: Uuid::new_v4(),
        subscription_id: subscription.id,
        price_id: price.id,
        price_type: price.price_type,
        meter_id: price.meter_id,
        display_name: price.display_name.clone(),
        quantity,
        currency: price.currency.clone(),
        billing_period: price.billing_period,
        invoice_cadence: price.invoice_cadence,
        start_date,
        end_date: None,
    }
}
