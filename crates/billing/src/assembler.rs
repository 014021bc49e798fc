//! Invoice assembly at period boundaries: classifies subscription line items
//! by invoice cadence and reference point, deduplicates against existing
//! invoices, and composes a `CreateInvoiceRequest`.

use crate::proration::ProrationQueue;
use crate::usage::UsageCharger;
use dashmap::DashMap;
use meterflow_core::catalog::{InvoiceCadence, PriceType};
use meterflow_core::error::{BillingError, BillingResult};
use meterflow_core::event_bus::{make_message, Channel, MessageSink};
use meterflow_core::invoice::{
    round_currency, BillingReason, CreateInvoiceRequest, Invoice, InvoiceLineItem,
    InvoiceLineItemRequest, InvoiceStatus, InvoiceType, PaymentStatus, ReferencePoint,
};
use meterflow_core::period::{elapsed_fraction, next_billing_date, ProrationStrategy};
use meterflow_core::subscription::{Subscription, SubscriptionLineItem};
use meterflow_store::contracts::{CustomerRepo, InvoiceRepo, PriceRepo, SubscriptionRepo};
use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Deterministic four-way partition of active line items by
/// (cadence × period).
#[derive(Debug, Default)]
pub struct ClassifiedLineItems {
    pub advance_current: Vec<SubscriptionLineItem>,
    pub arrear_current: Vec<SubscriptionLineItem>,
    pub advance_next: Vec<SubscriptionLineItem>,
    pub arrear_next: Vec<SubscriptionLineItem>,
    pub has_usage: bool,
}

/// Partition the subscription's line items around the current period.
/// Items sharing a price but carrying distinct line-item ids stay distinct.
pub fn classify_line_items(
    subscription: &Subscription,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    next_period_start: DateTime<Utc>,
    next_period_end: DateTime<Utc>,
) -> ClassifiedLineItems {
    let mut classified = ClassifiedLineItems::default();
    for item in &subscription.line_items {
        let mut included = false;
        if item.overlaps(period_start, period_end) {
            match item.invoice_cadence {
                InvoiceCadence::Advance => classified.advance_current.push(item.clone()),
                InvoiceCadence::Arrear => classified.arrear_current.push(item.clone()),
            }
            included = true;
        }
        if item.overlaps(next_period_start, next_period_end) {
            match item.invoice_cadence {
                InvoiceCadence::Advance => classified.advance_next.push(item.clone()),
                InvoiceCadence::Arrear => classified.arrear_next.push(item.clone()),
            }
            included = true;
        }
        if included && item.is_usage() {
            classified.has_usage = true;
        }
    }
    classified
}

pub struct InvoiceAssembler {
    subscriptions: Arc<dyn SubscriptionRepo>,
    customers: Arc<dyn CustomerRepo>,
    prices: Arc<dyn PriceRepo>,
    invoices: Arc<dyn InvoiceRepo>,
    charger: Arc<UsageCharger>,
    prorations: Arc<ProrationQueue>,
    sink: Arc<dyn MessageSink>,
    strategy: ProrationStrategy,
    // Serializes assembly per subscription; concurrent assemblers converge
    // on the same deduplicated set.
    assembly_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl InvoiceAssembler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepo>,
        customers: Arc<dyn CustomerRepo>,
        prices: Arc<dyn PriceRepo>,
        invoices: Arc<dyn InvoiceRepo>,
        charger: Arc<UsageCharger>,
        prorations: Arc<ProrationQueue>,
        sink: Arc<dyn MessageSink>,
        strategy: ProrationStrategy,
    ) -> Self {
        Self {
            subscriptions,
            customers,
            prices,
            invoices,
            charger,
            prorations,
            sink,
            strategy,
            assembly_locks: DashMap::new(),
        }
    }

    /// Compose the invoice request for a subscription period at the given
    /// reference point. An empty request (zero amount, no line items) is a
    /// success; callers must not persist it.
    pub async fn prepare_subscription_invoice_request(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        reference_point: ReferencePoint,
    ) -> BillingResult<CreateInvoiceRequest> {
        let lock = self
            .assembly_locks
            .entry(subscription_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let subscription = self
            .subscriptions
            .get_with_line_items(subscription_id)
            .await?;
        let customer = self.customers.get(subscription.customer_id).await?;

        let next_period_start = period_end;
        let next_period_end = next_billing_date(
            period_end,
            subscription.billing_anchor,
            subscription.billing_period,
            subscription.billing_period_count,
            subscription.billing_cycle,
        );

        let classified = classify_line_items(
            &subscription,
            period_start,
            period_end,
            next_period_start,
            next_period_end,
        );

        // (item, period it bills for)
        let mut included: Vec<(&SubscriptionLineItem, DateTime<Utc>, DateTime<Utc>)> = Vec::new();
        match reference_point {
            ReferencePoint::PeriodStart => {
                for item in &classified.advance_current {
                    included.push((item, period_start, period_end));
                }
            }
            ReferencePoint::PeriodEnd | ReferencePoint::Preview => {
                for item in &classified.arrear_current {
                    included.push((item, period_start, period_end));
                }
                for item in &classified.advance_next {
                    included.push((item, next_period_start, next_period_end));
                }
            }
        }

        // Dedup against every non-voided invoice already covering the period.
        let existing = self
            .invoices
            .get_by_period(subscription_id, period_start, period_end)
            .await?;
        let already_invoiced: HashSet<(Uuid, DateTime<Utc>, DateTime<Utc>)> = existing
            .iter()
            .filter(|inv| inv.status != InvoiceStatus::Voided)
            .flat_map(|inv| {
                inv.line_items
                    .iter()
                    .map(|li| (li.price_id, li.period_start, li.period_end))
            })
            .collect();

        let mut line_items: Vec<InvoiceLineItemRequest> = Vec::new();
        for (item, item_period_start, item_period_end) in included {
            if already_invoiced.contains(&(item.price_id, item_period_start, item_period_end)) {
                debug!(line_item = %item.id, "already invoiced, skipping");
                continue;
            }
            match item.price_type {
                PriceType::Fixed => {
                    line_items.push(
                        self.fixed_line_item(item, item_period_start, item_period_end)
                            .await?,
                    );
                }
                PriceType::Usage => {
                    if let Some(line) = self
                        .charger
                        .charge_line_item(
                            &subscription,
                            item,
                            &customer.external_id,
                            item_period_start,
                            item_period_end,
                        )
                        .await?
                    {
                        line_items.push(line);
                    }
                }
            }
        }

        // Pending proration items ride along on real period-end assemblies;
        // previews only look at them.
        match reference_point {
            ReferencePoint::PeriodEnd => {
                line_items.extend(self.prorations.take(subscription_id));
            }
            ReferencePoint::Preview => {
                line_items.extend(self.prorations.peek(subscription_id));
            }
            ReferencePoint::PeriodStart => {}
        }

        let amount_due = round_currency(line_items.iter().map(|li| li.amount).sum());
        let has_usage = classified.has_usage;
        let billing_reason = if reference_point == ReferencePoint::PeriodStart
            && period_start == subscription.start_date
        {
            BillingReason::SubscriptionCreate
        } else {
            BillingReason::SubscriptionCycle
        };

        info!(
            subscription = %subscription_id,
            ?reference_point,
            items = line_items.len(),
            %amount_due,
            "invoice request prepared"
        );

        Ok(CreateInvoiceRequest {
            customer_id: subscription.customer_id,
            subscription_id: Some(subscription_id),
            invoice_type: InvoiceType::Subscription,
            currency: subscription.currency.clone(),
            amount_due,
            period_start: Some(period_start),
            period_end: Some(period_end),
            billing_reason,
            line_items,
            has_usage,
        })
    }

    /// Persist a prepared request as a draft invoice. Empty requests are
    /// rejected; assemble-then-discard is how previews work.
    pub async fn persist_invoice(&self, request: &CreateInvoiceRequest) -> BillingResult<Invoice> {
        if request.is_empty() {
            return Err(BillingError::InvalidOperation(
                "an invoice request with no line items must not be persisted".into(),
            ));
        }
        let invoice_id = Uuid::new_v4();
        let line_items: Vec<InvoiceLineItem> = request
            .line_items
            .iter()
            .map(|req| InvoiceLineItem {
                id: Uuid::new_v4(),
                invoice_id,
                price_id: req.price_id,
                display_name: req.display_name.clone(),
                quantity: req.quantity,
                amount: req.amount,
                currency: req.currency.clone(),
                period_start: req.period_start,
                period_end: req.period_end,
                usage_reset_period: req.usage_reset_period,
                is_proration: req.is_proration,
            })
            .collect();

        let billing_sequence = match request.subscription_id {
            Some(subscription_id) => self.invoices.next_billing_sequence(subscription_id).await?,
            None => 1,
        };
        let invoice = Invoice {
            id: invoice_id,
            customer_id: request.customer_id,
            subscription_id: request.subscription_id,
            invoice_number: self.invoices.next_invoice_number().await?,
            invoice_type: request.invoice_type,
            status: InvoiceStatus::Draft,
            payment_status: PaymentStatus::Pending,
            currency: request.currency.clone(),
            amount_due: request.amount_due,
            amount_paid: Decimal::ZERO,
            amount_remaining: request.amount_due,
            period_start: request.period_start,
            period_end: request.period_end,
            billing_reason: request.billing_reason,
            billing_sequence,
            line_items,
            created_at: Utc::now(),
            finalized_at: None,
            voided_at: None,
        };
        let invoice = self.invoices.create_with_line_items(invoice).await?;
        info!(
            invoice = %invoice.id,
            number = %invoice.invoice_number,
            amount = %invoice.amount_due,
            "invoice persisted"
        );
        self.sink.publish(make_message(
            Channel::Webhooks,
            "invoice.created",
            serde_json::json!({
                "invoice_id": invoice.id,
                "customer_id": invoice.customer_id,
                "amount_due": invoice.amount_due,
                "currency": invoice.currency,
            }),
        ));
        Ok(invoice)
    }

    /// Fixed charge: `amount × quantity × active-fraction of the period`.
    async fn fixed_line_item(
        &self,
        item: &SubscriptionLineItem,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> BillingResult<InvoiceLineItemRequest> {
        let price = self.prices.get(item.price_id).await?;
        let (window_start, window_end) = item
            .active_window(period_start, period_end)
            .unwrap_or((period_start, period_end));
        let utc_offset = FixedOffset::east_opt(0).expect("zero offset is valid");
        let factor = elapsed_fraction(period_start, window_end, period_end, self.strategy, utc_offset)
            - elapsed_fraction(period_start, window_start, period_end, self.strategy, utc_offset);
        let amount = price.amount * item.quantity * factor;
        Ok(InvoiceLineItemRequest {
            price_id: item.price_id,
            display_name: item.display_name.clone(),
            quantity: item.quantity,
            amount,
            currency: item.currency.clone(),
            period_start,
            period_end,
            usage_reset_period: None,
            is_proration: false,
        })
    }
}
