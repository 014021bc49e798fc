//! Proration: credit/charge algebra for mid-period subscription changes.
//!
//! `calculate_proration` is pure; `ProrationEngine::apply_proration` wires
//! the result into the next invoice, a standalone one-off invoice, or
//! nothing, per the requested behavior.

use dashmap::DashMap;
use meterflow_core::catalog::PriceType;
use meterflow_core::error::BillingResult;
use meterflow_core::event_bus::{make_message, Channel, MessageSink};
use meterflow_core::invoice::{
    round_currency, BillingReason, Invoice, InvoiceLineItem, InvoiceLineItemRequest,
    InvoiceStatus, InvoiceType, PaymentStatus,
};
use meterflow_core::period::{remaining_fraction, ProrationStrategy};
use meterflow_core::subscription::Subscription;
use meterflow_store::contracts::InvoiceRepo;
use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProrationAction {
    Upgrade,
    Downgrade,
    QuantityChange,
    AddItem,
    RemoveItem,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProrationBehavior {
    /// Attach credit/charge items to the subscription's next invoice.
    CreateProrations,
    /// Compute only; apply nothing.
    None,
    /// Emit a standalone one-off invoice immediately.
    AlwaysInvoice,
}

#[derive(Debug, Clone)]
pub struct ProrationParams {
    pub action: ProrationAction,
    pub price_id: Uuid,
    pub display_name: String,
    pub price_type: PriceType,
    pub old_price_per_unit: Decimal,
    pub new_price_per_unit: Decimal,
    pub old_quantity: Decimal,
    pub new_quantity: Decimal,
    pub proration_date: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub customer_timezone: FixedOffset,
    pub strategy: ProrationStrategy,
    pub plan_pay_in_advance: bool,
    pub currency: String,
}

/// One signed proration amount. Credits are negative.
#[derive(Debug, Clone)]
pub struct ProrationItem {
    pub description: String,
    pub quantity: Decimal,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct ProrationResult {
    pub price_id: Uuid,
    pub currency: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub proration_date: DateTime<Utc>,
    pub credit_items: Vec<ProrationItem>,
    pub charge_items: Vec<ProrationItem>,
    /// Rounded sum of charges and credits. The only rounding in this module.
    pub net_amount: Decimal,
}

impl ProrationResult {
    pub fn is_empty(&self) -> bool {
        self.credit_items.is_empty() && self.charge_items.is_empty()
    }

    /// Invoice line-item drafts, credits first. Amounts stay unrounded so
    /// invoice totals round once.
    pub fn to_line_item_requests(&self) -> Vec<InvoiceLineItemRequest> {
        self.credit_items
            .iter()
            .chain(self.charge_items.iter())
            .map(|item| InvoiceLineItemRequest {
                price_id: self.price_id,
                display_name: item.description.clone(),
                quantity: item.quantity,
                amount: item.amount,
                currency: self.currency.clone(),
                period_start: self.proration_date,
                period_end: self.period_end,
                usage_reset_period: None,
                is_proration: true,
            })
            .collect()
    }
}

/// Compute the credit/charge pair for a mid-period change.
///
/// With `R` the remaining fraction of the period and `F = 1 − R`:
/// changes credit `old × R` and charge `new × R`; when the plan bills in
/// arrears they additionally charge the elapsed `old × F` that no advance
/// invoice ever covered.
pub fn calculate_proration(params: &ProrationParams) -> BillingResult<ProrationResult> {
    let remaining = remaining_fraction(
        params.period_start,
        params.proration_date,
        params.period_end,
        params.strategy,
        params.customer_timezone,
    );
    let elapsed = Decimal::ONE - remaining;

    let old_remaining = params.old_price_per_unit * params.old_quantity * remaining;
    let old_elapsed = params.old_price_per_unit * params.old_quantity * elapsed;
    let new_remaining = params.new_price_per_unit * params.new_quantity * remaining;

    let mut credit_items = Vec::new();
    let mut charge_items = Vec::new();

    match params.action {
        ProrationAction::AddItem => {
            // Usage items bill in arrears against actual events; adding one
            // mid-period prorates nothing.
            if params.price_type != PriceType::Usage && new_remaining != Decimal::ZERO {
                charge_items.push(ProrationItem {
                    description: format!("{} (prorated)", params.display_name),
                    quantity: params.new_quantity,
                    amount: new_remaining,
                });
            }
        }
        ProrationAction::Upgrade
        | ProrationAction::Downgrade
        | ProrationAction::QuantityChange => {
            if params.plan_pay_in_advance && old_remaining != Decimal::ZERO {
                credit_items.push(ProrationItem {
                    description: format!("{} (unused)", params.display_name),
                    quantity: params.old_quantity,
                    amount: -old_remaining,
                });
            }
            if !params.plan_pay_in_advance && old_elapsed != Decimal::ZERO {
                charge_items.push(ProrationItem {
                    description: format!("{} (elapsed)", params.display_name),
                    quantity: params.old_quantity,
                    amount: old_elapsed,
                });
            }
            if new_remaining != Decimal::ZERO {
                charge_items.push(ProrationItem {
                    description: format!("{} (prorated)", params.display_name),
                    quantity: params.new_quantity,
                    amount: new_remaining,
                });
            }
        }
        ProrationAction::RemoveItem | ProrationAction::Cancel => {
            if params.plan_pay_in_advance && old_remaining != Decimal::ZERO {
                credit_items.push(ProrationItem {
                    description: format!("{} (unused)", params.display_name),
                    quantity: params.old_quantity,
                    amount: -old_remaining,
                });
            }
            if params.action == ProrationAction::RemoveItem
                && !params.plan_pay_in_advance
                && old_elapsed != Decimal::ZERO
            {
                charge_items.push(ProrationItem {
                    description: format!("{} (elapsed)", params.display_name),
                    quantity: params.old_quantity,
                    amount: old_elapsed,
                });
            }
        }
    }

    let net: Decimal = charge_items
        .iter()
        .chain(credit_items.iter())
        .map(|i| i.amount)
        .sum();

    debug!(
        action = ?params.action,
        %remaining,
        net = %net,
        "proration computed"
    );

    Ok(ProrationResult {
        price_id: params.price_id,
        currency: params.currency.clone(),
        period_start: params.period_start,
        period_end: params.period_end,
        proration_date: params.proration_date,
        credit_items,
        charge_items,
        net_amount: round_currency(net),
    })
}

/// Proration items waiting to ride on the subscription's next invoice.
#[derive(Default)]
pub struct ProrationQueue {
    pending: DashMap<Uuid, Vec<InvoiceLineItemRequest>>,
}

impl ProrationQueue {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    pub fn push(&self, subscription_id: Uuid, items: Vec<InvoiceLineItemRequest>) {
        self.pending
            .entry(subscription_id)
            .or_default()
            .extend(items);
    }

    /// Non-destructive view, for previews.
    pub fn peek(&self, subscription_id: Uuid) -> Vec<InvoiceLineItemRequest> {
        self.pending
            .get(&subscription_id)
            .map(|items| items.clone())
            .unwrap_or_default()
    }

    /// Drain the pending items, for a real assembly.
    pub fn take(&self, subscription_id: Uuid) -> Vec<InvoiceLineItemRequest> {
        self.pending
            .remove(&subscription_id)
            .map(|(_, items)| items)
            .unwrap_or_default()
    }
}

pub struct ProrationEngine {
    invoices: Arc<dyn InvoiceRepo>,
    queue: Arc<ProrationQueue>,
    sink: Arc<dyn MessageSink>,
}

impl ProrationEngine {
    pub fn new(
        invoices: Arc<dyn InvoiceRepo>,
        queue: Arc<ProrationQueue>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            invoices,
            queue,
            sink,
        }
    }

    /// Apply a computed proration under the requested behavior. Returns the
    /// one-off invoice when `ALWAYS_INVOICE` produced one.
    pub async fn apply_proration(
        &self,
        subscription: &Subscription,
        result: &ProrationResult,
        behavior: ProrationBehavior,
    ) -> BillingResult<Option<Invoice>> {
        if result.is_empty() {
            return Ok(None);
        }
        match behavior {
            ProrationBehavior::None => Ok(None),
            ProrationBehavior::CreateProrations => {
                self.queue
                    .push(subscription.id, result.to_line_item_requests());
                debug!(subscription = %subscription.id, "proration queued for next invoice");
                Ok(None)
            }
            ProrationBehavior::AlwaysInvoice => {
                let invoice = self.emit_one_off(subscription, result).await?;
                Ok(Some(invoice))
            }
        }
    }

    /// Calculate and apply in one step. ANNIVERSARY subscriptions are
    /// period-aligned with their anchor, so there is nothing to prorate.
    pub async fn calculate_and_apply_subscription_proration(
        &self,
        subscription: &Subscription,
        params: &ProrationParams,
        behavior: ProrationBehavior,
    ) -> BillingResult<Option<Invoice>> {
        if subscription.billing_cycle == meterflow_core::period::BillingCycle::Anniversary {
            debug!(subscription = %subscription.id, "anniversary billing, skipping proration");
            return Ok(None);
        }
        let result = calculate_proration(params)?;
        self.apply_proration(subscription, &result, behavior).await
    }

    async fn emit_one_off(
        &self,
        subscription: &Subscription,
        result: &ProrationResult,
    ) -> BillingResult<Invoice> {
        let invoice_id = Uuid::new_v4();
        let line_items: Vec<InvoiceLineItem> = result
            .to_line_item_requests()
            .into_iter()
            .map(|req| InvoiceLineItem {
                id: Uuid::new_v4(),
                invoice_id,
                price_id: req.price_id,
                display_name: req.display_name,
                quantity: req.quantity,
                amount: req.amount,
                currency: req.currency,
                period_start: req.period_start,
                period_end: req.period_end,
                usage_reset_period: None,
                is_proration: true,
            })
            .collect();

        let invoice = Invoice {
            id: invoice_id,
            customer_id: subscription.customer_id,
            subscription_id: Some(subscription.id),
            invoice_number: self.invoices.next_invoice_number().await?,
            invoice_type: InvoiceType::OneOff,
            status: InvoiceStatus::Draft,
            payment_status: PaymentStatus::Pending,
            currency: result.currency.clone(),
            amount_due: result.net_amount,
            amount_paid: Decimal::ZERO,
            amount_remaining: result.net_amount,
            period_start: Some(result.period_start),
            period_end: Some(result.period_end),
            billing_reason: BillingReason::SubscriptionUpdate,
            billing_sequence: self.invoices.next_billing_sequence(subscription.id).await?,
            line_items,
            created_at: Utc::now(),
            finalized_at: None,
            voided_at: None,
        };
        let invoice = self.invoices.create_with_line_items(invoice).await?;
        info!(
            invoice = %invoice.id,
            subscription = %subscription.id,
            amount = %invoice.amount_due,
            "one-off proration invoice created"
        );
        self.sink.publish(make_message(
            Channel::Webhooks,
            "invoice.created",
            serde_json::json!({
                "invoice_id": invoice.id,
                "subscription_id": subscription.id,
                "amount_due": invoice.amount_due,
            }),
        ));
        Ok(invoice)
    }
}
