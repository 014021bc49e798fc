//! In-memory billing store backed by DashMap.
//!
//! Production: replace with PostgreSQL (sqlx) or similar ACID store. This
//! provides the same API surface for development and testing, including the
//! concurrency contracts the services rely on: per-wallet entry locking,
//! a unique index on CGA idempotency keys, and compare-and-set coupon
//! redemption counts.

use crate::contracts::*;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use meterflow_core::catalog::{
    AggregationType, Coupon, CouponApplication, CouponAssociation, CreditGrant, CreditGrantScope,
    Entitlement, EntityType, Feature, Meter, Plan, Price,
};
use meterflow_core::credit::CreditGrantApplication;
use meterflow_core::error::{BillingError, BillingResult};
use meterflow_core::invoice::Invoice;
use meterflow_core::subscription::{Subscription, SubscriptionLineItem};
use meterflow_core::types::{Customer, UsageEvent};
use meterflow_core::wallet::{
    TopUpRequest, Wallet, WalletStatus, WalletTransaction, WalletTransactionType,
};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;
use uuid::Uuid;

/// Thread-safe in-memory store for the whole billing domain.
pub struct MemoryStore {
    customers: DashMap<Uuid, Customer>,
    plans: DashMap<Uuid, Plan>,
    meters: DashMap<Uuid, Meter>,
    features: DashMap<Uuid, Feature>,
    prices: DashMap<Uuid, Price>,
    entitlements: DashMap<Uuid, Entitlement>,
    // Subscriptions: rows and line items kept apart, like their tables.
    subscriptions: DashMap<Uuid, Subscription>,
    subscription_items: DashMap<Uuid, Vec<SubscriptionLineItem>>,
    // Invoices
    invoices: DashMap<Uuid, Invoice>,
    invoice_counter: AtomicU64,
    billing_sequences: DashMap<Uuid, u64>,
    // Wallets: unique per (customer, lowercased currency)
    wallets: DashMap<Uuid, Wallet>,
    wallet_index: DashMap<(Uuid, String), Uuid>,
    wallet_transactions: DashMap<Uuid, Vec<WalletTransaction>>,
    allow_negative_balance: bool,
    // Credit grants
    credit_grants: DashMap<Uuid, CreditGrant>,
    credit_grant_applications: DashMap<Uuid, CreditGrantApplication>,
    cga_key_index: DashMap<String, Uuid>,
    // Coupons
    coupons: DashMap<Uuid, Coupon>,
    coupon_associations: DashMap<Uuid, CouponAssociation>,
    coupon_applications: DashMap<Uuid, CouponApplication>,
    // Raw events, keyed by event id for ingest dedup
    events: DashMap<String, UsageEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("billing store initialized (in-memory, development mode)");
        Self {
            customers: DashMap::new(),
            plans: DashMap::new(),
            meters: DashMap::new(),
            features: DashMap::new(),
            prices: DashMap::new(),
            entitlements: DashMap::new(),
            subscriptions: DashMap::new(),
            subscription_items: DashMap::new(),
            invoices: DashMap::new(),
            invoice_counter: AtomicU64::new(0),
            billing_sequences: DashMap::new(),
            wallets: DashMap::new(),
            wallet_index: DashMap::new(),
            wallet_transactions: DashMap::new(),
            allow_negative_balance: false,
            credit_grants: DashMap::new(),
            credit_grant_applications: DashMap::new(),
            cga_key_index: DashMap::new(),
            coupons: DashMap::new(),
            coupon_associations: DashMap::new(),
            coupon_applications: DashMap::new(),
            events: DashMap::new(),
        }
    }

    /// Allow wallet balances to go negative on debit.
    pub fn with_negative_balances(mut self, allow: bool) -> Self {
        self.allow_negative_balance = allow;
        self
    }
}

// ─── Customers & catalog ────────────────────────────────────────────────────

#[async_trait]
impl CustomerRepo for MemoryStore {
    async fn create(&self, customer: Customer) -> BillingResult<Customer> {
        let duplicate = self.customers.iter().any(|c| {
            c.tenant_id == customer.tenant_id && c.external_id == customer.external_id
        });
        if duplicate {
            return Err(BillingError::Conflict(format!(
                "customer with external id {} already exists in tenant",
                customer.external_id
            )));
        }
        self.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    async fn get(&self, id: Uuid) -> BillingResult<Customer> {
        self.customers
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| BillingError::not_found("customer", id))
    }

    async fn get_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> BillingResult<Customer> {
        self.customers
            .iter()
            .find(|c| c.tenant_id == tenant_id && c.external_id == external_id)
            .map(|c| c.clone())
            .ok_or_else(|| BillingError::not_found("customer", external_id))
    }

    async fn list(&self) -> BillingResult<Vec<Customer>> {
        Ok(self.customers.iter().map(|c| c.clone()).collect())
    }
}

#[async_trait]
impl PlanRepo for MemoryStore {
    async fn create(&self, plan: Plan) -> BillingResult<Plan> {
        self.plans.insert(plan.id, plan.clone());
        Ok(plan)
    }

    async fn get(&self, id: Uuid) -> BillingResult<Plan> {
        self.plans
            .get(&id)
            .map(|p| p.clone())
            .ok_or_else(|| BillingError::not_found("plan", id))
    }

    async fn list(&self) -> BillingResult<Vec<Plan>> {
        Ok(self.plans.iter().map(|p| p.clone()).collect())
    }
}

#[async_trait]
impl MeterRepo for MemoryStore {
    async fn create(&self, meter: Meter) -> BillingResult<Meter> {
        self.meters.insert(meter.id, meter.clone());
        Ok(meter)
    }

    async fn get(&self, id: Uuid) -> BillingResult<Meter> {
        self.meters
            .get(&id)
            .map(|m| m.clone())
            .ok_or_else(|| BillingError::not_found("meter", id))
    }

    async fn list(&self) -> BillingResult<Vec<Meter>> {
        Ok(self.meters.iter().map(|m| m.clone()).collect())
    }
}

#[async_trait]
impl FeatureRepo for MemoryStore {
    async fn create(&self, feature: Feature) -> BillingResult<Feature> {
        self.features.insert(feature.id, feature.clone());
        Ok(feature)
    }

    async fn get(&self, id: Uuid) -> BillingResult<Feature> {
        self.features
            .get(&id)
            .map(|f| f.clone())
            .ok_or_else(|| BillingError::not_found("feature", id))
    }

    async fn list(&self) -> BillingResult<Vec<Feature>> {
        Ok(self.features.iter().map(|f| f.clone()).collect())
    }

    async fn get_by_meter(&self, meter_id: Uuid) -> BillingResult<Option<Feature>> {
        Ok(self
            .features
            .iter()
            .find(|f| f.meter_id == Some(meter_id))
            .map(|f| f.clone()))
    }
}

#[async_trait]
impl PriceRepo for MemoryStore {
    async fn create(&self, price: Price) -> BillingResult<Price> {
        price.validate()?;
        self.prices.insert(price.id, price.clone());
        Ok(price)
    }

    async fn get(&self, id: Uuid) -> BillingResult<Price> {
        self.prices
            .get(&id)
            .map(|p| p.clone())
            .ok_or_else(|| BillingError::not_found("price", id))
    }

    async fn list_by_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> BillingResult<Vec<Price>> {
        Ok(self
            .prices
            .iter()
            .filter(|p| p.entity_type == entity_type && p.entity_id == entity_id)
            .map(|p| p.clone())
            .collect())
    }

    async fn list(&self) -> BillingResult<Vec<Price>> {
        Ok(self.prices.iter().map(|p| p.clone()).collect())
    }
}

#[async_trait]
impl EntitlementRepo for MemoryStore {
    async fn create(&self, entitlement: Entitlement) -> BillingResult<Entitlement> {
        self.entitlements.insert(entitlement.id, entitlement.clone());
        Ok(entitlement)
    }

    async fn get(&self, id: Uuid) -> BillingResult<Entitlement> {
        self.entitlements
            .get(&id)
            .map(|e| e.clone())
            .ok_or_else(|| BillingError::not_found("entitlement", id))
    }

    async fn list_by_entity(
        &self,
        entity_type: EntityType,
        entity_id: Uuid,
    ) -> BillingResult<Vec<Entitlement>> {
        Ok(self
            .entitlements
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .map(|e| e.clone())
            .collect())
    }
}

// ─── Subscriptions ──────────────────────────────────────────────────────────

#[async_trait]
impl SubscriptionRepo for MemoryStore {
    async fn get(&self, id: Uuid) -> BillingResult<Subscription> {
        self.subscriptions
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| BillingError::not_found("subscription", id))
    }

    async fn get_with_line_items(&self, id: Uuid) -> BillingResult<Subscription> {
        let mut sub = SubscriptionRepo::get(self, id).await?;
        sub.line_items = self
            .subscription_items
            .get(&id)
            .map(|items| items.clone())
            .unwrap_or_default();
        Ok(sub)
    }

    async fn create(&self, subscription: Subscription) -> BillingResult<Subscription> {
        subscription.validate()?;
        let mut row = subscription.clone();
        row.line_items = Vec::new();
        self.subscriptions.insert(row.id, row);
        Ok(subscription)
    }

    async fn create_with_line_items(
        &self,
        mut subscription: Subscription,
        line_items: Vec<SubscriptionLineItem>,
    ) -> BillingResult<Subscription> {
        subscription.line_items = line_items.clone();
        subscription.validate()?;
        let mut row = subscription.clone();
        row.line_items = Vec::new();
        self.subscriptions.insert(row.id, row);
        self.subscription_items.insert(subscription.id, line_items);
        Ok(subscription)
    }

    async fn update(&self, subscription: Subscription) -> BillingResult<Subscription> {
        subscription.validate()?;
        if !self.subscriptions.contains_key(&subscription.id) {
            return Err(BillingError::not_found("subscription", subscription.id));
        }
        // Updates persist the full aggregate, row and line items.
        let mut row = subscription.clone();
        row.line_items = Vec::new();
        self.subscriptions.insert(row.id, row);
        self.subscription_items
            .insert(subscription.id, subscription.line_items.clone());
        Ok(subscription)
    }

    async fn list(&self) -> BillingResult<Vec<Subscription>> {
        Ok(self.subscriptions.iter().map(|s| s.clone()).collect())
    }
}

// ─── Invoices ───────────────────────────────────────────────────────────────

#[async_trait]
impl InvoiceRepo for MemoryStore {
    async fn create(&self, mut invoice: Invoice) -> BillingResult<Invoice> {
        invoice.line_items = Vec::new();
        self.invoices.insert(invoice.id, invoice.clone());
        Ok(invoice)
    }

    async fn create_with_line_items(&self, invoice: Invoice) -> BillingResult<Invoice> {
        invoice.validate()?;
        self.invoices.insert(invoice.id, invoice.clone());
        Ok(invoice)
    }

    async fn get(&self, id: Uuid) -> BillingResult<Invoice> {
        self.invoices
            .get(&id)
            .map(|i| i.clone())
            .ok_or_else(|| BillingError::not_found("invoice", id))
    }

    async fn update(&self, invoice: Invoice) -> BillingResult<Invoice> {
        if !self.invoices.contains_key(&invoice.id) {
            return Err(BillingError::not_found("invoice", invoice.id));
        }
        self.invoices.insert(invoice.id, invoice.clone());
        Ok(invoice)
    }

    async fn get_by_period(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> BillingResult<Vec<Invoice>> {
        Ok(self
            .invoices
            .iter()
            .filter(|i| {
                i.subscription_id == Some(subscription_id)
                    && i.period_start == Some(period_start)
                    && i.period_end == Some(period_end)
            })
            .map(|i| i.clone())
            .collect())
    }

    async fn list_unpaid_by_customer(&self, customer_id: Uuid) -> BillingResult<Vec<Invoice>> {
        Ok(self
            .invoices
            .iter()
            .filter(|i| i.customer_id == customer_id && i.is_unpaid())
            .map(|i| i.clone())
            .collect())
    }

    async fn next_invoice_number(&self) -> BillingResult<String> {
        let seq = self.invoice_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        Ok(format!("INV-{:04}{:02}-{:05}", now.year(), now.month(), seq))
    }

    async fn next_billing_sequence(&self, subscription_id: Uuid) -> BillingResult<u64> {
        let mut entry = self.billing_sequences.entry(subscription_id).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }
}

// ─── Wallets ────────────────────────────────────────────────────────────────

impl MemoryStore {
    fn wallet_key(customer_id: Uuid, currency: &str) -> (Uuid, String) {
        (customer_id, currency.to_ascii_lowercase())
    }

    fn find_transaction_by_key(
        &self,
        wallet_id: Uuid,
        key: &str,
    ) -> Option<WalletTransaction> {
        self.wallet_transactions.get(&wallet_id).and_then(|txs| {
            txs.iter()
                .find(|t| t.idempotency_key.as_deref() == Some(key))
                .cloned()
        })
    }
}

#[async_trait]
impl WalletRepo for MemoryStore {
    async fn create_wallet(&self, wallet: Wallet) -> BillingResult<Wallet> {
        let key = Self::wallet_key(wallet.customer_id, &wallet.currency);
        match self.wallet_index.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                Err(BillingError::Conflict(format!(
                    "wallet {} already exists for customer {} in {}",
                    existing.get(),
                    wallet.customer_id,
                    wallet.currency
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(wallet.id);
                self.wallets.insert(wallet.id, wallet.clone());
                Ok(wallet)
            }
        }
    }

    async fn get_wallet(&self, id: Uuid) -> BillingResult<Wallet> {
        self.wallets
            .get(&id)
            .map(|w| w.clone())
            .ok_or_else(|| BillingError::not_found("wallet", id))
    }

    async fn get_wallets_by_customer(&self, customer_id: Uuid) -> BillingResult<Vec<Wallet>> {
        Ok(self
            .wallets
            .iter()
            .filter(|w| w.customer_id == customer_id)
            .map(|w| w.clone())
            .collect())
    }

    async fn credit(
        &self,
        wallet_id: Uuid,
        request: &TopUpRequest,
    ) -> BillingResult<WalletTransaction> {
        if request.credits <= Decimal::ZERO {
            return Err(BillingError::Validation(
                "credit amount must be positive".into(),
            ));
        }
        // Entry lock serializes all mutations of one wallet.
        let mut wallet = self
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| BillingError::not_found("wallet", wallet_id))?;
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = self.find_transaction_by_key(wallet_id, key) {
                return Ok(existing);
            }
        }
        if wallet.status == WalletStatus::Closed {
            return Err(BillingError::InvalidOperation(format!(
                "wallet {} is closed",
                wallet_id
            )));
        }
        wallet.balance += request.credits;
        let tx = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id,
            transaction_type: WalletTransactionType::Credit,
            amount: request.credits,
            reason: request.reason.clone(),
            expiry: request.expiry,
            priority: request.priority,
            idempotency_key: request.idempotency_key.clone(),
            created_at: Utc::now(),
        };
        self.wallet_transactions
            .entry(wallet_id)
            .or_default()
            .push(tx.clone());
        Ok(tx)
    }

    async fn debit(
        &self,
        wallet_id: Uuid,
        amount: Decimal,
        reason: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<WalletTransaction> {
        if amount <= Decimal::ZERO {
            return Err(BillingError::Validation(
                "debit amount must be positive".into(),
            ));
        }
        let mut wallet = self
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| BillingError::not_found("wallet", wallet_id))?;
        if let Some(key) = idempotency_key {
            if let Some(existing) = self.find_transaction_by_key(wallet_id, key) {
                return Ok(existing);
            }
        }
        if wallet.status == WalletStatus::Closed {
            return Err(BillingError::InvalidOperation(format!(
                "wallet {} is closed",
                wallet_id
            )));
        }
        if !self.allow_negative_balance && wallet.balance < amount {
            return Err(BillingError::InsufficientFunds {
                wallet_id,
                balance: wallet.balance,
                attempted: amount,
            });
        }
        wallet.balance -= amount;
        let tx = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id,
            transaction_type: WalletTransactionType::Debit,
            amount,
            reason: reason.to_string(),
            expiry: None,
            priority: None,
            idempotency_key: idempotency_key.map(str::to_string),
            created_at: Utc::now(),
        };
        self.wallet_transactions
            .entry(wallet_id)
            .or_default()
            .push(tx.clone());
        Ok(tx)
    }

    async fn update_status(&self, wallet_id: Uuid, status: WalletStatus) -> BillingResult<Wallet> {
        let mut wallet = self
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| BillingError::not_found("wallet", wallet_id))?;
        wallet.status = status;
        Ok(wallet.clone())
    }

    async fn list_transactions(
        &self,
        filter: WalletTransactionFilter,
    ) -> BillingResult<Vec<WalletTransaction>> {
        let mut out = Vec::new();
        match filter.wallet_id {
            Some(id) => {
                if let Some(txs) = self.wallet_transactions.get(&id) {
                    out.extend(txs.iter().cloned());
                }
            }
            None => {
                for txs in self.wallet_transactions.iter() {
                    out.extend(txs.iter().cloned());
                }
            }
        }
        if let Some(tx_type) = filter.transaction_type {
            out.retain(|t| t.transaction_type == tx_type);
        }
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }
}

// ─── Credit grants ──────────────────────────────────────────────────────────

#[async_trait]
impl CreditGrantRepo for MemoryStore {
    async fn create(&self, grant: CreditGrant) -> BillingResult<CreditGrant> {
        self.credit_grants.insert(grant.id, grant.clone());
        Ok(grant)
    }

    async fn get(&self, id: Uuid) -> BillingResult<CreditGrant> {
        self.credit_grants
            .get(&id)
            .map(|g| g.clone())
            .ok_or_else(|| BillingError::not_found("credit grant", id))
    }

    async fn list_by_plan(&self, plan_id: Uuid) -> BillingResult<Vec<CreditGrant>> {
        Ok(self
            .credit_grants
            .iter()
            .filter(|g| matches!(g.scope, CreditGrantScope::Plan { plan_id: p } if p == plan_id))
            .map(|g| g.clone())
            .collect())
    }

    async fn list_by_subscription(&self, subscription_id: Uuid) -> BillingResult<Vec<CreditGrant>> {
        Ok(self
            .credit_grants
            .iter()
            .filter(|g| {
                matches!(g.scope, CreditGrantScope::Subscription { subscription_id: s } if s == subscription_id)
            })
            .map(|g| g.clone())
            .collect())
    }
}

#[async_trait]
impl CreditGrantApplicationRepo for MemoryStore {
    async fn create(&self, cga: CreditGrantApplication) -> BillingResult<CreditGrantApplication> {
        match self.cga_key_index.entry(cga.idempotency_key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                Err(BillingError::Conflict(format!(
                    "credit grant application {} already exists for idempotency key {}",
                    existing.get(),
                    cga.idempotency_key
                )))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(cga.id);
                self.credit_grant_applications.insert(cga.id, cga.clone());
                Ok(cga)
            }
        }
    }

    async fn get(&self, id: Uuid) -> BillingResult<CreditGrantApplication> {
        self.credit_grant_applications
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| BillingError::not_found("credit grant application", id))
    }

    async fn get_by_idempotency_key(
        &self,
        key: &str,
    ) -> BillingResult<Option<CreditGrantApplication>> {
        Ok(self
            .cga_key_index
            .get(key)
            .and_then(|id| self.credit_grant_applications.get(&*id))
            .map(|c| c.clone()))
    }

    async fn update(&self, cga: CreditGrantApplication) -> BillingResult<CreditGrantApplication> {
        if !self.credit_grant_applications.contains_key(&cga.id) {
            return Err(BillingError::not_found("credit grant application", cga.id));
        }
        self.credit_grant_applications.insert(cga.id, cga.clone());
        Ok(cga)
    }

    async fn find_all_scheduled(
        &self,
        now: DateTime<Utc>,
    ) -> BillingResult<Vec<CreditGrantApplication>> {
        let mut due: Vec<CreditGrantApplication> = self
            .credit_grant_applications
            .iter()
            .filter(|c| c.is_due(now))
            .map(|c| c.clone())
            .collect();
        due.sort_by_key(|c| c.scheduled_for);
        Ok(due)
    }

    async fn list_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<CreditGrantApplication>> {
        let mut out: Vec<CreditGrantApplication> = self
            .credit_grant_applications
            .iter()
            .filter(|c| c.subscription_id == subscription_id)
            .map(|c| c.clone())
            .collect();
        out.sort_by_key(|c| c.period_start);
        Ok(out)
    }
}

// ─── Coupons ────────────────────────────────────────────────────────────────

#[async_trait]
impl CouponRepo for MemoryStore {
    async fn create(&self, coupon: Coupon) -> BillingResult<Coupon> {
        coupon.validate()?;
        self.coupons.insert(coupon.id, coupon.clone());
        Ok(coupon)
    }

    async fn get(&self, id: Uuid) -> BillingResult<Coupon> {
        self.coupons
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| BillingError::not_found("coupon", id))
    }

    async fn increment_redemptions(&self, id: Uuid) -> BillingResult<Coupon> {
        // Entry lock makes the check-and-increment atomic.
        let mut coupon = self
            .coupons
            .get_mut(&id)
            .ok_or_else(|| BillingError::not_found("coupon", id))?;
        if let Some(max) = coupon.max_redemptions {
            if coupon.total_redemptions >= max {
                return Err(BillingError::Conflict(format!(
                    "coupon {} redemption limit {} reached",
                    id, max
                )));
            }
        }
        coupon.total_redemptions += 1;
        Ok(coupon.clone())
    }
}

#[async_trait]
impl CouponAssociationRepo for MemoryStore {
    async fn create(&self, association: CouponAssociation) -> BillingResult<CouponAssociation> {
        let duplicate = self.coupon_associations.iter().any(|a| {
            a.coupon_id == association.coupon_id
                && a.subscription_id == association.subscription_id
                && a.subscription_line_item_id == association.subscription_line_item_id
        });
        if duplicate {
            return Err(BillingError::Conflict(format!(
                "coupon {} already associated with subscription {}",
                association.coupon_id, association.subscription_id
            )));
        }
        self.coupon_associations
            .insert(association.id, association.clone());
        Ok(association)
    }

    async fn get_by_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<CouponAssociation>> {
        Ok(self
            .coupon_associations
            .iter()
            .filter(|a| a.subscription_id == subscription_id)
            .map(|a| a.clone())
            .collect())
    }
}

#[async_trait]
impl CouponApplicationRepo for MemoryStore {
    async fn create(&self, application: CouponApplication) -> BillingResult<CouponApplication> {
        self.coupon_applications
            .insert(application.id, application.clone());
        Ok(application)
    }

    async fn count_by_subscription_and_coupon(
        &self,
        subscription_id: Uuid,
        coupon_id: Uuid,
    ) -> BillingResult<u64> {
        Ok(self
            .coupon_applications
            .iter()
            .filter(|a| a.subscription_id == subscription_id && a.coupon_id == coupon_id)
            .count() as u64)
    }
}

// ─── Events & usage aggregation ─────────────────────────────────────────────

impl MemoryStore {
    fn matching_events(&self, query: &UsageQuery) -> Vec<UsageEvent> {
        let mut events: Vec<UsageEvent> = self
            .events
            .iter()
            .filter(|e| {
                e.event_name == query.meter.event_name
                    && e.external_customer_id == query.external_customer_id
                    && e.timestamp >= query.period_start
                    && e.timestamp < query.period_end
                    && query
                        .meter
                        .filters
                        .iter()
                        .all(|group| group.matches(e.property_str(&group.key)))
            })
            .map(|e| e.clone())
            .collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    fn field_value(event: &UsageEvent, field: Option<&str>) -> Decimal {
        field
            .and_then(|f| event.property_number(f))
            .and_then(Decimal::from_f64)
            .unwrap_or(Decimal::ZERO)
    }

    fn aggregate(query: &UsageQuery, events: &[UsageEvent]) -> UsageResult {
        let agg = &query.meter.aggregation;
        let field = agg.field.as_deref();
        match agg.agg_type {
            AggregationType::Count => UsageResult::Scalar(Decimal::from(events.len() as u64)),
            AggregationType::Sum => UsageResult::Scalar(
                events.iter().map(|e| Self::field_value(e, field)).sum(),
            ),
            AggregationType::Avg => {
                if events.is_empty() {
                    return UsageResult::Scalar(Decimal::ZERO);
                }
                let sum: Decimal = events.iter().map(|e| Self::field_value(e, field)).sum();
                UsageResult::Scalar(sum / Decimal::from(events.len() as u64))
            }
            AggregationType::CountUnique => {
                let distinct: HashSet<String> = events
                    .iter()
                    .filter_map(|e| field.and_then(|f| e.property_str(f)).map(str::to_string))
                    .collect();
                UsageResult::Scalar(Decimal::from(distinct.len() as u64))
            }
            AggregationType::Max => match agg.bucket_size_secs {
                None => UsageResult::Scalar(
                    events
                        .iter()
                        .map(|e| Self::field_value(e, field))
                        .max()
                        .unwrap_or(Decimal::ZERO),
                ),
                Some(bucket_size) => {
                    let mut maxima: BTreeMap<i64, Decimal> = BTreeMap::new();
                    for event in events {
                        let offset = (event.timestamp - query.period_start).num_seconds();
                        let bucket = offset / bucket_size.max(1) as i64;
                        let value = Self::field_value(event, field);
                        maxima
                            .entry(bucket)
                            .and_modify(|m| *m = (*m).max(value))
                            .or_insert(value);
                    }
                    UsageResult::Bucketed(maxima.into_values().collect())
                }
            },
        }
    }
}

#[async_trait]
impl EventRepo for MemoryStore {
    async fn insert_event(&self, event: UsageEvent) -> BillingResult<()> {
        // Duplicate event ids are dropped silently; ingestion is
        // at-least-once and consumers must be idempotent.
        self.events.entry(event.id.clone()).or_insert(event);
        Ok(())
    }

    async fn get_events(&self, filter: EventFilter) -> BillingResult<Vec<UsageEvent>> {
        let mut events: Vec<UsageEvent> = self
            .events
            .iter()
            .filter(|e| {
                filter
                    .event_name
                    .as_deref()
                    .map(|n| e.event_name == n)
                    .unwrap_or(true)
                    && filter
                        .external_customer_id
                        .as_deref()
                        .map(|c| e.external_customer_id == c)
                        .unwrap_or(true)
                    && filter.start.map(|s| e.timestamp >= s).unwrap_or(true)
                    && filter.end.map(|en| e.timestamp < en).unwrap_or(true)
            })
            .map(|e| e.clone())
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn get_usage(&self, query: &UsageQuery) -> BillingResult<UsageResult> {
        let events = self.matching_events(query);
        Ok(Self::aggregate(query, &events))
    }

    async fn bulk_get_usage(&self, queries: &[UsageQuery]) -> BillingResult<Vec<UsageResult>> {
        let mut results = Vec::with_capacity(queries.len());
        for query in queries {
            results.push(self.get_usage(query).await?);
        }
        Ok(results)
    }
}
