//! Wallet service: per-(customer, currency) credit balances with idempotent
//! top-ups, termination, and a real-time balance that nets out unpaid
//! invoices and the running period's usage.

use async_trait::async_trait;
use meterflow_core::error::{BillingError, BillingResult};
use meterflow_core::event_bus::{make_message, Channel, MessageSink};
use meterflow_core::wallet::{TopUpRequest, Wallet, WalletBalance, WalletStatus, WalletTransaction};
use meterflow_store::contracts::{InvoiceRepo, WalletRepo};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// The running period's not-yet-invoiced usage cost, consumed through a
/// narrow interface so the wallet stays a leaf of the billing graph.
#[async_trait]
pub trait PendingUsageSource: Send + Sync {
    async fn current_period_usage(
        &self,
        customer_id: Uuid,
        currency: &str,
    ) -> BillingResult<Decimal>;
}

/// Zero pending usage; for tests and deployments without metered pricing.
pub struct NoPendingUsage;

#[async_trait]
impl PendingUsageSource for NoPendingUsage {
    async fn current_period_usage(
        &self,
        _customer_id: Uuid,
        _currency: &str,
    ) -> BillingResult<Decimal> {
        Ok(Decimal::ZERO)
    }
}

pub struct WalletService {
    wallets: Arc<dyn WalletRepo>,
    invoices: Arc<dyn InvoiceRepo>,
    pending_usage: Arc<dyn PendingUsageSource>,
    sink: Arc<dyn MessageSink>,
}

impl WalletService {
    pub fn new(
        wallets: Arc<dyn WalletRepo>,
        invoices: Arc<dyn InvoiceRepo>,
        pending_usage: Arc<dyn PendingUsageSource>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            wallets,
            invoices,
            pending_usage,
            sink,
        }
    }

    /// Create the wallet for (customer, currency). Idempotent: if one
    /// already exists it is returned as-is. Currency case is preserved in
    /// storage; matching is case-insensitive.
    pub async fn create_wallet(&self, customer_id: Uuid, currency: &str) -> BillingResult<Wallet> {
        let wallet = Wallet {
            id: Uuid::new_v4(),
            customer_id,
            currency: currency.to_string(),
            balance: Decimal::ZERO,
            status: WalletStatus::Active,
            created_at: Utc::now(),
        };
        match self.wallets.create_wallet(wallet).await {
            Ok(created) => {
                info!(wallet = %created.id, customer = %customer_id, %currency, "wallet created");
                Ok(created)
            }
            Err(BillingError::Conflict(_)) => self
                .wallets
                .get_wallets_by_customer(customer_id)
                .await?
                .into_iter()
                .find(|w| w.currency.eq_ignore_ascii_case(currency))
                .ok_or_else(|| BillingError::not_found("wallet", currency)),
            Err(other) => Err(other),
        }
    }

    /// Add credits. Duplicate idempotency keys return the first transaction
    /// without a second effect.
    pub async fn top_up_wallet(
        &self,
        wallet_id: Uuid,
        request: &TopUpRequest,
    ) -> BillingResult<WalletTransaction> {
        let tx = self.wallets.credit(wallet_id, request).await?;
        self.sink.publish(make_message(
            Channel::Webhooks,
            "wallet.credited",
            serde_json::json!({
                "wallet_id": wallet_id,
                "transaction_id": tx.id,
                "credits": request.credits,
            }),
        ));
        Ok(tx)
    }

    /// Remove credits; underflow fails with `InsufficientFunds`.
    pub async fn debit_wallet(
        &self,
        wallet_id: Uuid,
        amount: Decimal,
        reason: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<WalletTransaction> {
        let tx = self
            .wallets
            .debit(wallet_id, amount, reason, idempotency_key)
            .await?;
        self.sink.publish(make_message(
            Channel::Webhooks,
            "wallet.debited",
            serde_json::json!({
                "wallet_id": wallet_id,
                "transaction_id": tx.id,
                "amount": amount,
            }),
        ));
        Ok(tx)
    }

    /// Close the wallet, debiting any remaining balance to zero first.
    pub async fn terminate_wallet(&self, wallet_id: Uuid) -> BillingResult<Wallet> {
        let wallet = self.wallets.get_wallet(wallet_id).await?;
        if wallet.status == WalletStatus::Closed {
            return Err(BillingError::InvalidOperation(format!(
                "wallet {} is already closed",
                wallet_id
            )));
        }
        if wallet.balance > Decimal::ZERO {
            self.wallets
                .debit(wallet_id, wallet.balance, "wallet termination", None)
                .await?;
        }
        let wallet = self
            .wallets
            .update_status(wallet_id, WalletStatus::Closed)
            .await?;
        info!(wallet = %wallet_id, "wallet terminated");
        self.sink.publish(make_message(
            Channel::Webhooks,
            "wallet.terminated",
            serde_json::json!({ "wallet_id": wallet_id }),
        ));
        Ok(wallet)
    }

    /// Balance report. Only invoices still awaiting payment in the wallet's
    /// currency (compared case-insensitively) reduce the real-time balance.
    pub async fn get_wallet_balance(&self, wallet_id: Uuid) -> BillingResult<WalletBalance> {
        let wallet = self.wallets.get_wallet(wallet_id).await?;
        let unpaid_invoice_amount: Decimal = self
            .invoices
            .list_unpaid_by_customer(wallet.customer_id)
            .await?
            .iter()
            .filter(|inv| inv.currency.eq_ignore_ascii_case(&wallet.currency))
            .map(|inv| inv.amount_remaining)
            .sum();
        let current_period_usage = self
            .pending_usage
            .current_period_usage(wallet.customer_id, &wallet.currency)
            .await?;
        Ok(WalletBalance {
            wallet_id,
            stored_balance: wallet.balance,
            real_time_balance: wallet.balance - unpaid_invoice_amount - current_period_usage,
            unpaid_invoice_amount,
            current_period_usage,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone};
    use meterflow_core::event_bus::capture_sink;
    use meterflow_core::invoice::{
        BillingReason, Invoice, InvoiceStatus, InvoiceType, PaymentStatus,
    };
    use meterflow_store::contracts::WalletTransactionFilter;
    use meterflow_store::MemoryStore;

    fn utc(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    fn service(store: &Arc<MemoryStore>) -> WalletService {
        WalletService::new(
            store.clone(),
            store.clone(),
            Arc::new(NoPendingUsage),
            capture_sink(),
        )
    }

    fn top_up(credits: Decimal, key: Option<&str>) -> TopUpRequest {
        TopUpRequest {
            credits,
            reason: "top-up".into(),
            expiry: None,
            priority: None,
            idempotency_key: key.map(str::to_string),
        }
    }

    struct FixedUsage(Decimal);

    #[async_trait]
    impl PendingUsageSource for FixedUsage {
        async fn current_period_usage(&self, _c: Uuid, _cur: &str) -> BillingResult<Decimal> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_create_wallet_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        let customer = Uuid::new_v4();

        let first = service.create_wallet(customer, "USD").await.unwrap();
        let second = service.create_wallet(customer, "usd").await.unwrap();
        assert_eq!(first.id, second.id);
        // Stored case is preserved from the first write.
        assert_eq!(second.currency, "USD");
    }

    #[tokio::test]
    async fn test_top_up_then_debit_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        let wallet = service.create_wallet(Uuid::new_v4(), "USD").await.unwrap();

        service
            .top_up_wallet(wallet.id, &top_up(Decimal::from(42), None))
            .await
            .unwrap();
        service
            .debit_wallet(wallet.id, Decimal::from(42), "spend", None)
            .await
            .unwrap();

        let balance = service.get_wallet_balance(wallet.id).await.unwrap();
        assert_eq!(balance.stored_balance, Decimal::ZERO);

        let txs = store
            .list_transactions(WalletTransactionFilter {
                wallet_id: Some(wallet.id),
                transaction_type: None,
            })
            .await
            .unwrap();
        assert_eq!(txs.len(), 2);
    }

    #[tokio::test]
    async fn test_terminate_zeroes_balance_and_closes() {
        let store = Arc::new(MemoryStore::new());
        let service = service(&store);
        let wallet = service.create_wallet(Uuid::new_v4(), "USD").await.unwrap();
        service
            .top_up_wallet(wallet.id, &top_up(Decimal::from(30), None))
            .await
            .unwrap();

        let closed = service.terminate_wallet(wallet.id).await.unwrap();
        assert_eq!(closed.status, WalletStatus::Closed);
        assert_eq!(closed.balance, Decimal::ZERO);

        // The zeroing debit is recorded.
        let txs = store
            .list_transactions(WalletTransactionFilter {
                wallet_id: Some(wallet.id),
                transaction_type: Some(
                    meterflow_core::wallet::WalletTransactionType::Debit,
                ),
            })
            .await
            .unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount, Decimal::from(30));

        // A closed wallet rejects everything.
        assert!(service
            .top_up_wallet(wallet.id, &top_up(Decimal::ONE, None))
            .await
            .is_err());
        assert!(service
            .debit_wallet(wallet.id, Decimal::ONE, "x", None)
            .await
            .is_err());
        assert!(service.terminate_wallet(wallet.id).await.is_err());
    }

    #[tokio::test]
    async fn test_real_time_balance_nets_unpaid_and_usage() {
        let store = Arc::new(MemoryStore::new());
        let customer = Uuid::new_v4();
        let service = WalletService::new(
            store.clone(),
            store.clone(),
            Arc::new(FixedUsage(Decimal::from(7))),
            meterflow_core::event_bus::noop_sink(),
        );
        let wallet = service.create_wallet(customer, "USD").await.unwrap();
        service
            .top_up_wallet(wallet.id, &top_up(Decimal::from(100), None))
            .await
            .unwrap();

        // One pending USD invoice, one succeeded, one pending in EUR: only
        // the first counts.
        for (currency, payment_status, amount) in [
            ("usd", PaymentStatus::Pending, 20),
            ("USD", PaymentStatus::Succeeded, 50),
            ("EUR", PaymentStatus::Failed, 11),
        ] {
            let amount = Decimal::from(amount);
            let paid = if payment_status == PaymentStatus::Succeeded {
                amount
            } else {
                Decimal::ZERO
            };
            store
                .create(Invoice {
                    id: Uuid::new_v4(),
                    customer_id: customer,
                    subscription_id: None,
                    invoice_number: store.next_invoice_number().await.unwrap(),
                    invoice_type: InvoiceType::OneOff,
                    status: InvoiceStatus::Finalized,
                    payment_status,
                    currency: currency.into(),
                    amount_due: amount,
                    amount_paid: paid,
                    amount_remaining: amount - paid,
                    period_start: Some(utc(2024, 3, 1)),
                    period_end: Some(utc(2024, 4, 1)),
                    billing_reason: BillingReason::Manual,
                    billing_sequence: 1,
                    line_items: vec![],
                    created_at: utc(2024, 3, 1),
                    finalized_at: Some(utc(2024, 3, 1)),
                    voided_at: None,
                })
                .await
                .unwrap();
        }

        let balance = service.get_wallet_balance(wallet.id).await.unwrap();
        assert_eq!(balance.stored_balance, Decimal::from(100));
        assert_eq!(balance.unpaid_invoice_amount, Decimal::from(20));
        assert_eq!(balance.current_period_usage, Decimal::from(7));
        // 100 − 20 − 7
        assert_eq!(balance.real_time_balance, Decimal::from(73));
    }
}
