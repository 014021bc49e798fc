//! Invoices, invoice line items, and the assembler's request types.

use crate::catalog::UsageResetPeriod;
use crate::error::{BillingError, BillingResult};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    Subscription,
    OneOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Voided,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Initiated,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingReason {
    SubscriptionCreate,
    SubscriptionCycle,
    SubscriptionUpdate,
    Manual,
}

/// Which cadence/period subsets an assembly run includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferencePoint {
    /// ADVANCE items of the current period.
    PeriodStart,
    /// ARREAR items of the current period plus ADVANCE items of the next.
    PeriodEnd,
    /// Same set as PERIOD_END; the result is never persisted.
    Preview,
}

/// Round a monetary amount to currency minor units with banker's rounding.
/// The only place pricing math leaves full precision.
pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    /// The subscription line item this charge came from.
    pub price_id: Uuid,
    pub display_name: String,
    pub quantity: Decimal,
    pub amount: Decimal,
    pub currency: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Carried on usage charges for auditability.
    pub usage_reset_period: Option<UsageResetPeriod>,
    /// True for proration credit/charge items.
    pub is_proration: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub invoice_number: String,
    pub invoice_type: InvoiceType,
    pub status: InvoiceStatus,
    pub payment_status: PaymentStatus,
    pub currency: String,
    pub amount_due: Decimal,
    pub amount_paid: Decimal,
    pub amount_remaining: Decimal,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub billing_reason: BillingReason,
    pub billing_sequence: u64,
    pub line_items: Vec<InvoiceLineItem>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn validate(&self) -> BillingResult<()> {
        if self.amount_due != self.amount_paid + self.amount_remaining {
            return Err(BillingError::Validation(format!(
                "invoice {}: amount_due {} != amount_paid {} + amount_remaining {}",
                self.id, self.amount_due, self.amount_paid, self.amount_remaining
            )));
        }
        let line_total: Decimal = self.line_items.iter().map(|li| li.amount).sum();
        if round_currency(line_total) != self.amount_due {
            return Err(BillingError::Validation(format!(
                "invoice {}: line items sum to {}, amount_due is {}",
                self.id, line_total, self.amount_due
            )));
        }
        for li in &self.line_items {
            if !li.currency.eq_ignore_ascii_case(&self.currency) {
                return Err(BillingError::Validation(format!(
                    "invoice {}: line item {} currency {} != invoice currency {}",
                    self.id, li.id, li.currency, self.currency
                )));
            }
        }
        Ok(())
    }

    /// Whether this invoice still counts against the customer's balance.
    pub fn is_unpaid(&self) -> bool {
        self.status != InvoiceStatus::Voided
            && matches!(self.payment_status, PaymentStatus::Pending | PaymentStatus::Failed)
    }
}

// ─── Assembler output ───────────────────────────────────────────────────────

/// A not-yet-persisted invoice line item produced by the assembler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLineItemRequest {
    pub price_id: Uuid,
    pub display_name: String,
    pub quantity: Decimal,
    pub amount: Decimal,
    pub currency: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub usage_reset_period: Option<UsageResetPeriod>,
    pub is_proration: bool,
}

/// The assembler's product: everything needed to persist an invoice.
/// `amount_due == 0` with no line items is a valid, empty result that callers
/// must not persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvoiceRequest {
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub invoice_type: InvoiceType,
    pub currency: String,
    pub amount_due: Decimal,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub billing_reason: BillingReason,
    pub line_items: Vec<InvoiceLineItemRequest>,
    /// True iff any included line item is usage-based.
    pub has_usage: bool,
}

impl CreateInvoiceRequest {
    pub fn is_empty(&self) -> bool {
        self.line_items.is_empty()
    }
}
