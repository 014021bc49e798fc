//! Period-boundary orchestration: closes a subscription's current period by
//! assembling and settling the period-end invoice, then rolls the
//! subscription into its next period.

use crate::assembler::InvoiceAssembler;
use crate::settlement::InvoiceSettler;
use meterflow_core::error::{BillingError, BillingResult};
use meterflow_core::invoice::{Invoice, ReferencePoint};
use meterflow_core::subscription::Subscription;
use meterflow_credits::CouponService;
use meterflow_store::contracts::SubscriptionRepo;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// What closing one period produced.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub subscription_id: Uuid,
    /// The settled period-end invoice, if anything was billable.
    pub invoice: Option<Invoice>,
    pub new_period_start: DateTime<Utc>,
    pub new_period_end: DateTime<Utc>,
}

pub struct BillingCycleRunner {
    subscriptions: Arc<dyn SubscriptionRepo>,
    assembler: Arc<InvoiceAssembler>,
    settler: Arc<InvoiceSettler>,
    coupons: Arc<CouponService>,
}

impl BillingCycleRunner {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionRepo>,
        assembler: Arc<InvoiceAssembler>,
        settler: Arc<InvoiceSettler>,
        coupons: Arc<CouponService>,
    ) -> Self {
        Self {
            subscriptions,
            assembler,
            settler,
            coupons,
        }
    }

    /// Close the subscription's current period: bill arrears plus the next
    /// period's advance charges, run coupons over the draft, finalize,
    /// settle from the wallet, and advance the period bounds.
    pub async fn close_period(&self, subscription_id: Uuid) -> BillingResult<CycleOutcome> {
        let subscription = self.subscriptions.get(subscription_id).await?;
        if !subscription.status.is_billable() {
            return Err(BillingError::InvalidOperation(format!(
                "subscription {} is {:?}, not billable",
                subscription_id, subscription.status
            )));
        }

        let request = self
            .assembler
            .prepare_subscription_invoice_request(
                subscription_id,
                subscription.current_period_start,
                subscription.current_period_end,
                ReferencePoint::PeriodEnd,
            )
            .await?;

        let invoice = if request.is_empty() {
            info!(subscription = %subscription_id, "nothing billable this period");
            None
        } else {
            let invoice = self.assembler.persist_invoice(&request).await?;
            self.coupons.apply_to_invoice(invoice.id).await?;
            self.settler.finalize_invoice(invoice.id).await?;
            Some(self.settler.settle_with_wallet(invoice.id).await?)
        };

        let rolled = self.roll_period(subscription).await?;
        Ok(CycleOutcome {
            subscription_id,
            invoice,
            new_period_start: rolled.current_period_start,
            new_period_end: rolled.current_period_end,
        })
    }

    /// Close every subscription whose period has elapsed. One failing
    /// subscription does not halt the run.
    pub async fn run_due_cycles(&self, now: DateTime<Utc>) -> BillingResult<Vec<CycleOutcome>> {
        let mut outcomes = Vec::new();
        for subscription in self.subscriptions.list().await? {
            if subscription.current_period_end > now || !subscription.status.is_billable() {
                continue;
            }
            match self.close_period(subscription.id).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    error!(
                        subscription = %subscription.id,
                        error = %err,
                        "period close failed"
                    );
                }
            }
        }
        Ok(outcomes)
    }

    async fn roll_period(&self, subscription: Subscription) -> BillingResult<Subscription> {
        let (next_start, next_end) = subscription.next_period();
        let mut rolled = self
            .subscriptions
            .get_with_line_items(subscription.id)
            .await?;
        rolled.current_period_start = next_start;
        rolled.current_period_end = next_end;
        let rolled = self.subscriptions.update(rolled).await?;
        info!(
            subscription = %rolled.id,
            period_start = %next_start,
            period_end = %next_end,
            "subscription rolled into next period"
        );
        Ok(rolled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::proration::ProrationQueue;
    use crate::usage::UsageCharger;
    use chrono::TimeZone;
    use meterflow_core::catalog::{
        BillingModel, EntityType, InvoiceCadence, Price, PriceType,
    };
    use meterflow_core::event_bus::noop_sink;
    use meterflow_core::invoice::PaymentStatus;
    use meterflow_core::period::{BillingCycle, BillingPeriod, ProrationStrategy};
    use meterflow_core::subscription::{SubscriptionLineItem, SubscriptionStatus};
    use meterflow_core::types::Customer;
    use meterflow_core::wallet::{TopUpRequest, Wallet, WalletStatus};
    use meterflow_store::contracts::{CustomerRepo, PriceRepo, WalletRepo};
    use meterflow_store::MemoryStore;
    use rust_decimal::Decimal;

    fn utc(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).single().unwrap()
    }

    async fn runner_fixture() -> (Arc<MemoryStore>, BillingCycleRunner, Uuid, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let charger = Arc::new(UsageCharger::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
        ));
        let assembler = Arc::new(InvoiceAssembler::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            charger,
            Arc::new(ProrationQueue::new()),
            noop_sink(),
            ProrationStrategy::DayBased,
        ));
        let settler = Arc::new(InvoiceSettler::new(
            store.clone(),
            store.clone(),
            noop_sink(),
        ));
        let coupons = Arc::new(CouponService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
        ));
        let runner = BillingCycleRunner::new(store.clone(), assembler, settler, coupons);

        let customer = Customer {
            id: Uuid::new_v4(),
            external_id: "cust-ext-1".into(),
            name: "Acme".into(),
            email: "billing@acme.test".into(),
            tenant_id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            created_at: utc(2024, 1, 1),
        };
        CustomerRepo::create(&*store, customer.clone()).await.unwrap();

        let plan_id = Uuid::new_v4();
        let price = Price {
            id: Uuid::new_v4(),
            entity_type: EntityType::Plan,
            entity_id: plan_id,
            amount: Decimal::from(20),
            currency: "USD".into(),
            price_type: PriceType::Fixed,
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_model: BillingModel::FlatFee,
            invoice_cadence: InvoiceCadence::Arrear,
            tier_mode: None,
            tiers: None,
            transform_quantity: None,
            meter_id: None,
            display_name: "base fee".into(),
            created_at: utc(2024, 1, 1),
        };
        PriceRepo::create(&*store, price.clone()).await.unwrap();

        let subscription_id = Uuid::new_v4();
        let subscription = Subscription {
            id: subscription_id,
            customer_id: customer.id,
            plan_id,
            currency: "USD".into(),
            start_date: utc(2024, 1, 1),
            end_date: None,
            current_period_start: utc(2024, 3, 1),
            current_period_end: utc(2024, 4, 1),
            billing_period: BillingPeriod::Monthly,
            billing_period_count: 1,
            billing_anchor: utc(2024, 1, 1),
            billing_cycle: BillingCycle::Anniversary,
            status: SubscriptionStatus::Active,
            pay_in_advance: false,
            line_items: vec![],
            created_at: utc(2024, 1, 1),
        };
        let items = vec![SubscriptionLineItem {
            id: Uuid::new_v4(),
            subscription_id,
            price_id: price.id,
            price_type: PriceType::Fixed,
            meter_id: None,
            display_name: "base fee".into(),
            quantity: Decimal::ONE,
            currency: "USD".into(),
            billing_period: BillingPeriod::Monthly,
            invoice_cadence: InvoiceCadence::Arrear,
            start_date: utc(2024, 1, 1),
            end_date: None,
        }];
        SubscriptionRepo::create_with_line_items(&*store, subscription, items)
            .await
            .unwrap();

        (store, runner, subscription_id, customer.id)
    }

    #[tokio::test]
    async fn test_close_period_settles_and_rolls() {
        let (store, runner, subscription_id, customer_id) = runner_fixture().await;

        // Fund the wallet so settlement succeeds.
        let wallet = store
            .create_wallet(Wallet {
                id: Uuid::new_v4(),
                customer_id,
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
                    credits: Decimal::from(100),
                    reason: "grant".into(),
                    expiry: None,
                    priority: None,
                    idempotency_key: None,
                },
            )
            .await
            .unwrap();

        let outcome = runner.close_period(subscription_id).await.unwrap();
        let invoice = outcome.invoice.unwrap();
        assert_eq!(invoice.amount_due, Decimal::from(20));
        assert_eq!(invoice.payment_status, PaymentStatus::Succeeded);
        assert_eq!(outcome.new_period_start, utc(2024, 4, 1));
        assert_eq!(outcome.new_period_end, utc(2024, 5, 1));

        assert_eq!(
            store.get_wallet(wallet.id).await.unwrap().balance,
            Decimal::from(80)
        );

        let rolled = SubscriptionRepo::get(&*store, subscription_id).await.unwrap();
        assert_eq!(rolled.current_period_start, utc(2024, 4, 1));
        assert_eq!(rolled.current_period_end, utc(2024, 5, 1));
    }

    #[tokio::test]
    async fn test_run_due_cycles_skips_future_periods() {
        let (_store, runner, _subscription_id, _customer) = runner_fixture().await;

        // Before the period ends nothing is due.
        let outcomes = runner.run_due_cycles(utc(2024, 3, 20)).await.unwrap();
        assert!(outcomes.is_empty());

        // At the boundary the period closes even without a wallet: the
        // invoice stays pending and the period still rolls.
        let outcomes = runner.run_due_cycles(utc(2024, 4, 1)).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let invoice = outcomes[0].invoice.as_ref().unwrap();
        assert_eq!(invoice.payment_status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancelled_subscription_not_billed() {
        let (store, runner, subscription_id, _customer) = runner_fixture().await;
        let mut sub = SubscriptionRepo::get(&*store, subscription_id).await.unwrap();
        sub.status = SubscriptionStatus::Cancelled;
        SubscriptionRepo::update(&*store, sub).await.unwrap();

        assert!(runner.close_period(subscription_id).await.is_err());
        let outcomes = runner.run_due_cycles(utc(2024, 4, 1)).await.unwrap();
        assert!(outcomes.is_empty());
    }
}
