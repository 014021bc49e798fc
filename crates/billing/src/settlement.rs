//! Invoice finalization and settlement against customer wallets.
//!
//! A DRAFT invoice finalizes into an immutable FINALIZED one; settlement then
//! debits the customer's wallet in the invoice currency for the remaining
//! amount. Settlement is all-or-nothing: a wallet that cannot cover the
//! remainder leaves the invoice FAILED for the dunning path.

use meterflow_core::error::{BillingError, BillingResult};
use meterflow_core::event_bus::{make_message, Channel, MessageSink};
use meterflow_core::idempotency;
use meterflow_core::invoice::{Invoice, InvoiceStatus, PaymentStatus};
use meterflow_core::wallet::Wallet;
use meterflow_store::contracts::{InvoiceRepo, WalletRepo};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct InvoiceSettler {
    invoices: Arc<dyn InvoiceRepo>,
    wallets: Arc<dyn WalletRepo>,
    sink: Arc<dyn MessageSink>,
}

impl InvoiceSettler {
    pub fn new(
        invoices: Arc<dyn InvoiceRepo>,
        wallets: Arc<dyn WalletRepo>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            invoices,
            wallets,
            sink,
        }
    }

    /// DRAFT → FINALIZED. Finalized invoices are immutable except for
    /// payment settlement.
    pub async fn finalize_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let mut invoice = self.invoices.get(invoice_id).await?;
        match invoice.status {
            InvoiceStatus::Draft => {}
            InvoiceStatus::Finalized => {
                return Err(BillingError::InvalidOperation(format!(
                    "invoice {} is already finalized",
                    invoice_id
                )));
            }
            InvoiceStatus::Voided => {
                return Err(BillingError::InvalidOperation(format!(
                    "invoice {} is voided",
                    invoice_id
                )));
            }
        }
        invoice.status = InvoiceStatus::Finalized;
        invoice.finalized_at = Some(Utc::now());
        let invoice = self.invoices.update(invoice).await?;
        info!(invoice = %invoice.id, "invoice finalized");
        self.sink.publish(make_message(
            Channel::Webhooks,
            "invoice.finalized",
            serde_json::json!({
                "invoice_id": invoice.id,
                "amount_due": invoice.amount_due,
            }),
        ));
        Ok(invoice)
    }

    /// DRAFT → VOIDED. Finalized invoices cannot be voided here.
    pub async fn void_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let mut invoice = self.invoices.get(invoice_id).await?;
        if invoice.status != InvoiceStatus::Draft {
            return Err(BillingError::InvalidOperation(format!(
                "only draft invoices can be voided, invoice {} is {:?}",
                invoice_id, invoice.status
            )));
        }
        invoice.status = InvoiceStatus::Voided;
        invoice.voided_at = Some(Utc::now());
        self.invoices.update(invoice).await
    }

    /// Debit the customer's wallet for the invoice remainder. The wallet is
    /// matched case-insensitively on the invoice currency; the debit carries
    /// an invoice-derived idempotency key so a retried settlement never
    /// double-charges.
    pub async fn settle_with_wallet(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let mut invoice = self.invoices.get(invoice_id).await?;
        if invoice.status != InvoiceStatus::Finalized {
            return Err(BillingError::InvalidOperation(format!(
                "invoice {} must be finalized before settlement",
                invoice_id
            )));
        }
        if invoice.payment_status == PaymentStatus::Succeeded
            || invoice.amount_remaining <= Decimal::ZERO
        {
            return Ok(invoice);
        }

        let Some(wallet) = self.find_wallet(&invoice).await? else {
            warn!(invoice = %invoice.id, "no wallet in invoice currency, leaving pending");
            return Ok(invoice);
        };

        invoice.payment_status = PaymentStatus::Initiated;
        let key = idempotency::derive_key(
            "invoice_settlement",
            &[&invoice.id.to_string(), &invoice.billing_sequence.to_string()],
        );
        match self
            .wallets
            .debit(
                wallet.id,
                invoice.amount_remaining,
                &format!("settlement of invoice {}", invoice.invoice_number),
                Some(&key),
            )
            .await
        {
            Ok(_) => {
                invoice.amount_paid += invoice.amount_remaining;
                invoice.amount_remaining = Decimal::ZERO;
                invoice.payment_status = PaymentStatus::Succeeded;
                let invoice = self.invoices.update(invoice).await?;
                info!(invoice = %invoice.id, wallet = %wallet.id, "invoice settled from wallet");
                self.sink.publish(make_message(
                    Channel::Webhooks,
                    "invoice.payment_succeeded",
                    serde_json::json!({
                        "invoice_id": invoice.id,
                        "wallet_id": wallet.id,
                        "amount_paid": invoice.amount_paid,
                    }),
                ));
                Ok(invoice)
            }
            Err(BillingError::InsufficientFunds { .. }) => {
                invoice.payment_status = PaymentStatus::Failed;
                let invoice = self.invoices.update(invoice).await?;
                warn!(invoice = %invoice.id, wallet = %wallet.id, "wallet balance insufficient");
                self.sink.publish(make_message(
                    Channel::Webhooks,
                    "invoice.payment_failed",
                    serde_json::json!({
                        "invoice_id": invoice.id,
                        "wallet_id": wallet.id,
                        "amount_remaining": invoice.amount_remaining,
                    }),
                ));
                Ok(invoice)
            }
            Err(other) => Err(other),
        }
    }

    async fn find_wallet(&self, invoice: &Invoice) -> BillingResult<Option<Wallet>> {
        let wallets = self
            .wallets
            .get_wallets_by_customer(invoice.customer_id)
            .await?;
        Ok(wallets
            .into_iter()
            .filter(|w| w.is_active())
            .find(|w| w.currency.eq_ignore_ascii_case(&invoice.currency)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use meterflow_core::event_bus::capture_sink;
    use meterflow_core::invoice::{BillingReason, InvoiceLineItem, InvoiceType};
    use meterflow_core::wallet::{TopUpRequest, WalletStatus};
    use meterflow_store::MemoryStore;

    fn utc(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    async fn draft_invoice(store: &MemoryStore, customer: Uuid, amount: Decimal) -> Invoice {
        let id = Uuid::new_v4();
        let invoice = Invoice {
            id,
            customer_id: customer,
            subscription_id: None,
            invoice_number: store.next_invoice_number().await.unwrap(),
            invoice_type: InvoiceType::Subscription,
            status: InvoiceStatus::Draft,
            payment_status: PaymentStatus::Pending,
            currency: "USD".into(),
            amount_due: amount,
            amount_paid: Decimal::ZERO,
            amount_remaining: amount,
            period_start: Some(utc(2024, 3, 1)),
            period_end: Some(utc(2024, 4, 1)),
            billing_reason: BillingReason::SubscriptionCycle,
            billing_sequence: 1,
            line_items: vec![InvoiceLineItem {
                id: Uuid::new_v4(),
                invoice_id: id,
                price_id: Uuid::new_v4(),
                display_name: "base fee".into(),
                quantity: Decimal::ONE,
                amount,
                currency: "USD".into(),
                period_start: utc(2024, 3, 1),
                period_end: utc(2024, 4, 1),
                usage_reset_period: None,
                is_proration: false,
            }],
            created_at: utc(2024, 3, 1),
            finalized_at: None,
            voided_at: None,
        };
        store.create_with_line_items(invoice).await.unwrap()
    }

    #[tokio::test]
    async fn test_finalize_then_settle() {
        let store = Arc::new(MemoryStore::new());
        let sink = capture_sink();
        let settler = InvoiceSettler::new(store.clone(), store.clone(), sink.clone());
        let customer = Uuid::new_v4();

        // Fund a wallet whose currency differs only in case.
        let wallet = store
            .create_wallet(Wallet {
                id: Uuid::new_v4(),
                customer_id: customer,
                currency: "usd".into(),
                balance: Decimal::ZERO,
                status: WalletStatus::Active,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .credit(
                wallet.id,
                &TopUpRequest {
                    credits: Decimal::from(100),
                    reason: "grant".into(),
                    expiry: None,
                    priority: None,
                    idempotency_key: None,
                },
            )
            .await
            .unwrap();

        let invoice = draft_invoice(&store, customer, Decimal::from(30)).await;

        // Settlement before finalization is rejected.
        assert!(settler.settle_with_wallet(invoice.id).await.is_err());

        settler.finalize_invoice(invoice.id).await.unwrap();
        let settled = settler.settle_with_wallet(invoice.id).await.unwrap();
        assert_eq!(settled.payment_status, PaymentStatus::Succeeded);
        assert_eq!(settled.amount_paid, Decimal::from(30));
        assert_eq!(settled.amount_remaining, Decimal::ZERO);
        assert_eq!(
            store.get_wallet(wallet.id).await.unwrap().balance,
            Decimal::from(70)
        );
        assert_eq!(sink.count_topic("invoice.finalized"), 1);
        assert_eq!(sink.count_topic("invoice.payment_succeeded"), 1);

        // Settling again is a no-op: the invoice already succeeded.
        let again = settler.settle_with_wallet(invoice.id).await.unwrap();
        assert_eq!(again.amount_paid, Decimal::from(30));
        assert_eq!(
            store.get_wallet(wallet.id).await.unwrap().balance,
            Decimal::from(70)
        );
    }

    #[tokio::test]
    async fn test_insufficient_wallet_marks_failed() {
        let store = Arc::new(MemoryStore::new());
        let sink = capture_sink();
        let settler = InvoiceSettler::new(store.clone(), store.clone(), sink.clone());
        let customer = Uuid::new_v4();

        let wallet = store
            .create_wallet(Wallet {
                id: Uuid::new_v4(),
                customer_id: customer,
                currency: "USD".into(),
                balance: Decimal::ZERO,
                status: WalletStatus::Active,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .credit(
                wallet.id,
                &TopUpRequest {
                    credits: Decimal::from(10),
                    reason: "small grant".into(),
                    expiry: None,
                    priority: None,
                    idempotency_key: None,
                },
            )
            .await
            .unwrap();

        let invoice = draft_invoice(&store, customer, Decimal::from(30)).await;
        settler.finalize_invoice(invoice.id).await.unwrap();
        let settled = settler.settle_with_wallet(invoice.id).await.unwrap();

        assert_eq!(settled.payment_status, PaymentStatus::Failed);
        assert_eq!(settled.amount_remaining, Decimal::from(30));
        // Balance untouched.
        assert_eq!(
            store.get_wallet(wallet.id).await.unwrap().balance,
            Decimal::from(10)
        );
        assert_eq!(sink.count_topic("invoice.payment_failed"), 1);
    }

    #[tokio::test]
    async fn test_finalized_invoice_is_immutable() {
        let store = Arc::new(MemoryStore::new());
        let settler = InvoiceSettler::new(
            store.clone(),
            store.clone(),
            meterflow_core::event_bus::noop_sink(),
        );
        let invoice = draft_invoice(&store, Uuid::new_v4(), Decimal::from(5)).await;

        settler.finalize_invoice(invoice.id).await.unwrap();
        assert!(settler.finalize_invoice(invoice.id).await.is_err());
        assert!(settler.void_invoice(invoice.id).await.is_err());
    }

    #[tokio::test]
    async fn test_void_draft() {
        let store = Arc::new(MemoryStore::new());
        let settler = InvoiceSettler::new(
            store.clone(),
            store.clone(),
            meterflow_core::event_bus::noop_sink(),
        );
        let invoice = draft_invoice(&store, Uuid::new_v4(), Decimal::from(5)).await;
        let voided = settler.void_invoice(invoice.id).await.unwrap();
        assert_eq!(voided.status, InvoiceStatus::Voided);
        assert!(voided.voided_at.is_some());
    }
}
