//! Abstract repository contracts consumed by the billing services. Each is a
//! bundle of CRUD plus the domain-specific queries the core needs; drivers
//! (in-memory here, SQL in production) implement them behind `async_trait`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meterflow_core::catalog::{
    Coupon, CouponApplication, CouponAssociation, CreditGrant, Entitlement, EntityType, Feature,
    Meter, Plan, Price,
};
use meterflow_core::credit::CreditGrantApplication;
use meterflow_core::error::BillingResult;
use meterflow_core::invoice::Invoice;
use meterflow_core::subscription::{Subscription, SubscriptionLineItem};
use meterflow_core::types::{Customer, UsageEvent};
use meterflow_core::wallet::{
    TopUpRequest, Wallet, WalletStatus, WalletTransaction, WalletTransactionType,
};
use rust_decimal::Decimal;
use uuid::Uuid;

// ─── Customers & catalog ────────────────────────────────────────────────────

#[async_trait]
pub trait CustomerRepo: Send + Sync {
    async fn create(&self, customer: Customer) -> BillingResult<Customer>;
    async fn get(&self, id: Uuid) -> BillingResult<Customer>;
    async fn get_by_external_id(&self, tenant_id: Uuid, external_id: &str)
        -> BillingResult<Customer>;
    async fn list(&self) -> BillingResult<Vec<Customer>>;
}

#[async_trait]
pub trait PlanRepo: Send + Sync {
    async fn create(&self, plan: Plan) -> BillingResult<Plan>;
    async fn get(&self, id: Uuid) -> BillingResult<Plan>;
    async fn list(&self) -> BillingResult<Vec<Plan>>;
}

#[async_trait]
pub trait MeterRepo: Send + Sync {
    async fn create(&self, meter: Meter) -> BillingResult<Meter>;
    async fn get(&self, id: Uuid) -> BillingResult<Meter>;
    async fn list(&self) -> BillingResult<Vec<Meter>>;
}

#[async_trait]
pub trait FeatureRepo: Send + Sync {
    async fn create(&self, feature: Feature) -> BillingResult<Feature>;
    async fn get(&self, id: Uuid) -> BillingResult<Feature>;
    async fn list(&self) -> BillingResult<Vec<Feature>>;
    async fn get_by_meter(&self, meter_id: Uuid) -> BillingResult<Option<Feature>>;
}

#[async_trait]
pub trait PriceRepo: Send + Sync {
    async fn create(&self, price: Price) -> BillingResult<Price>;
    async fn get(&self, id: Uuid) -> BillingResult<Price>;
    async fn list_by_entity(&self, entity_type: EntityType, entity_id: Uuid)
        -> BillingResult<Vec<Price>>;
    async fn list(&self) -> BillingResult<Vec<Price>>;
}

#[async_trait]
pub trait EntitlementRepo: Send + Sync {
    async fn create(&self, entitlement: Entitlement) -> BillingResult<Entitlement>;
    async fn get(&self, id: Uuid) -> BillingResult<Entitlement>;
    async fn list_by_entity(&self, entity_type: EntityType, entity_id: Uuid)
        -> BillingResult<Vec<Entitlement>>;
}

// ─── Subscriptions ──────────────────────────────────────────────────────────

#[async_trait]
pub trait SubscriptionRepo: Send + Sync {
    /// Fetch without line items.
    async fn get(&self, id: Uuid) -> BillingResult<Subscription>;
    /// Fetch with line items populated.
    async fn get_with_line_items(&self, id: Uuid) -> BillingResult<Subscription>;
    async fn create(&self, subscription: Subscription) -> BillingResult<Subscription>;
    async fn create_with_line_items(
        &self,
        subscription: Subscription,
        line_items: Vec<SubscriptionLineItem>,
    ) -> BillingResult<Subscription>;
    async fn update(&self, subscription: Subscription) -> BillingResult<Subscription>;
    async fn list(&self) -> BillingResult<Vec<Subscription>>;
}

// ─── Invoices ───────────────────────────────────────────────────────────────

#[async_trait]
pub trait InvoiceRepo: Send + Sync {
    /// Persist the invoice row only.
    async fn create(&self, invoice: Invoice) -> BillingResult<Invoice>;
    /// Persist the invoice together with the line items it carries.
    async fn create_with_line_items(&self, invoice: Invoice) -> BillingResult<Invoice>;
    async fn get(&self, id: Uuid) -> BillingResult<Invoice>;
    async fn update(&self, invoice: Invoice) -> BillingResult<Invoice>;
    /// All invoices for the subscription whose period matches exactly.
    async fn get_by_period(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> BillingResult<Vec<Invoice>>;
    async fn list_unpaid_by_customer(&self, customer_id: Uuid) -> BillingResult<Vec<Invoice>>;
    async fn next_invoice_number(&self) -> BillingResult<String>;
    async fn next_billing_sequence(&self, subscription_id: Uuid) -> BillingResult<u64>;
}

// ─── Wallets ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct WalletTransactionFilter {
    pub wallet_id: Option<Uuid>,
    pub transaction_type: Option<WalletTransactionType>,
}

#[async_trait]
pub trait WalletRepo: Send + Sync {
    /// Enforces one wallet per (customer, currency); a duplicate create is a
    /// conflict carrying the existing wallet's id.
    async fn create_wallet(&self, wallet: Wallet) -> BillingResult<Wallet>;
    async fn get_wallet(&self, id: Uuid) -> BillingResult<Wallet>;
    async fn get_wallets_by_customer(&self, customer_id: Uuid) -> BillingResult<Vec<Wallet>>;
    /// Add credits under the wallet's row lock. A duplicate idempotency key
    /// returns the original transaction without a second effect.
    async fn credit(&self, wallet_id: Uuid, request: &TopUpRequest)
        -> BillingResult<WalletTransaction>;
    /// Remove credits under the wallet's row lock; underflow fails with
    /// `InsufficientFunds` unless negative balances are enabled.
    async fn debit(
        &self,
        wallet_id: Uuid,
        amount: Decimal,
        reason: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<WalletTransaction>;
    async fn update_status(&self, wallet_id: Uuid, status: WalletStatus) -> BillingResult<Wallet>;
    async fn list_transactions(
        &self,
        filter: WalletTransactionFilter,
    ) -> BillingResult<Vec<WalletTransaction>>;
}

// ─── Credit grants ──────────────────────────────────────────────────────────

#[async_trait]
pub trait CreditGrantRepo: Send + Sync {
    async fn create(&self, grant: CreditGrant) -> BillingResult<CreditGrant>;
    async fn get(&self, id: Uuid) -> BillingResult<CreditGrant>;
    async fn list_by_plan(&self, plan_id: Uuid) -> BillingResult<Vec<CreditGrant>>;
    async fn list_by_subscription(&self, subscription_id: Uuid)
        -> BillingResult<Vec<CreditGrant>>;
}

#[async_trait]
pub trait CreditGrantApplicationRepo: Send + Sync {
    /// Insert with a unique constraint on the idempotency key; a duplicate
    /// insert is a conflict the scheduler converts to a no-op.
    async fn create(&self, cga: CreditGrantApplication) -> BillingResult<CreditGrantApplication>;
    async fn get(&self, id: Uuid) -> BillingResult<CreditGrantApplication>;
    async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> BillingResult<Option<CreditGrantApplication>>;
    async fn update(&self, cga: CreditGrantApplication) -> BillingResult<CreditGrantApplication>;
    /// All non-terminal applications due at `now`.
    async fn find_all_scheduled(
        &self,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<CreditGrantApplication>>;
    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<CreditGrantApplication>>;
}

// ─── Coupons ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait CouponRepo: Send + Sync {
    async fn create(&self, coupon: Coupon) -> BillingResult<Coupon>;
    async fn get(&self, id: Uuid) -> BillingResult<Coupon>;
    /// Compare-and-set increment of `total_redemptions`, validated against
    /// `max_redemptions`; overshoot fails with a conflict.
    async fn increment_redemptions(&self, id: Uuid) -> BillingResult<Coupon>;
}

#[async_trait]
pub trait CouponAssociationRepo: Send + Sync {
    /// At most one association per (coupon, subscription, line item).
    async fn create(&self, association: CouponAssociation) -> BillingResult<CouponAssociation>;
    async fn get_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<CouponAssociation>>;
}

#[async_trait]
pub trait CouponApplicationRepo: Send + Sync {
    async fn create(&self, application: CouponApplication) -> BillingResult<CouponApplication>;
    async fn count_by_subscription_and_coupon(
        &self,
        subscription_id: Uuid,
        coupon_id: Uuid,
    ) -> BillingResult<u64>;
}

// ─── Events & usage aggregation ─────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_name: Option<String>,
    pub external_customer_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// One aggregation request against a meter.
#[derive(Debug, Clone)]
pub struct UsageQuery {
    pub meter: Meter,
    pub external_customer_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Aggregation output: a scalar total, or one maximum per bucket for
/// bucketed MAX meters.
#[derive(Debug, Clone, PartialEq)]
pub enum UsageResult {
    Scalar(Decimal),
    Bucketed(Vec<Decimal>),
}

impl UsageResult {
    /// Scalar value, or the sum of bucket maxima.
    pub fn total(&self) -> Decimal {
        match self {
            Self::Scalar(v) => *v,
            Self::Bucketed(buckets) => buckets.iter().copied().sum(),
        }
    }
}

#[async_trait]
pub trait EventRepo: Send + Sync {
    /// Insert an event; a duplicate event id is a silent no-op.
    async fn insert_event(&self, event: UsageEvent) -> BillingResult<()>;
    async fn get_events(&self, filter: EventFilter) -> BillingResult<Vec<UsageEvent>>;
    async fn get_usage(&self, query: &UsageQuery) -> BillingResult<UsageResult>;
    async fn bulk_get_usage(&self, queries: &[UsageQuery]) -> BillingResult<Vec<UsageResult>>;
}
