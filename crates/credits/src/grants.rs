//! Credit grant scheduling: idempotent application of one-time and recurring
//! grants to subscription wallets, with subscription-state gating, linear
//! backoff retries, and a background sweep over due applications.

use meterflow_core::catalog::{CreditGrant, CreditGrantCadence, ExpirationType};
use meterflow_core::config::CreditGrantConfig;
use meterflow_core::credit::{ApplicationStatus, CreditGrantApplication};
use meterflow_core::error::{BillingError, BillingResult};
use meterflow_core::event_bus::{make_message, Channel, MessageSink};
use meterflow_core::period::{next_anchor_date, next_billing_date};
use meterflow_core::subscription::{Subscription, SubscriptionStatus};
use meterflow_core::wallet::{TopUpRequest, Wallet, WalletStatus};
use meterflow_store::contracts::{
    CreditGrantApplicationRepo, CreditGrantRepo, SubscriptionRepo, WalletRepo,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the subscription's state allows the scheduler to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantAction {
    /// Credit the wallet now.
    Apply,
    /// Leave the application pending; the subscription may recover.
    Defer,
    /// Terminate the application without emitting credit.
    Cancel,
}

/// Gating table. The status enum is closed, so there is no unknown arm; a
/// new status fails compilation here until a decision is made.
pub fn action_for_status(status: SubscriptionStatus) -> GrantAction {
    match status {
        SubscriptionStatus::Active | SubscriptionStatus::Trialing => GrantAction::Apply,
        SubscriptionStatus::PastDue
        | SubscriptionStatus::Unpaid
        | SubscriptionStatus::Incomplete
        | SubscriptionStatus::Paused => GrantAction::Defer,
        SubscriptionStatus::Cancelled | SubscriptionStatus::IncompleteExpired => {
            GrantAction::Cancel
        }
    }
}

/// Outcome counters for one sweep run.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepStats {
    pub processed: usize,
    pub applied: usize,
    pub deferred: usize,
    pub cancelled: usize,
    pub failed: usize,
}

pub struct CreditGrantScheduler {
    grants: Arc<dyn CreditGrantRepo>,
    applications: Arc<dyn CreditGrantApplicationRepo>,
    subscriptions: Arc<dyn SubscriptionRepo>,
    wallets: Arc<dyn WalletRepo>,
    sink: Arc<dyn MessageSink>,
    config: CreditGrantConfig,
}

impl CreditGrantScheduler {
    pub fn new(
        grants: Arc<dyn CreditGrantRepo>,
        applications: Arc<dyn CreditGrantApplicationRepo>,
        subscriptions: Arc<dyn SubscriptionRepo>,
        wallets: Arc<dyn WalletRepo>,
        sink: Arc<dyn MessageSink>,
        config: CreditGrantConfig,
    ) -> Self {
        Self {
            grants,
            applications,
            subscriptions,
            wallets,
            sink,
            config,
        }
    }

    /// Apply a grant to the subscription's current period. Idempotent: a
    /// repeat call for the same (grant, subscription, period) returns the
    /// existing application without a second wallet credit.
    pub async fn apply_credit_grant(
        &self,
        grant: &CreditGrant,
        subscription: &Subscription,
        reason: &str,
    ) -> BillingResult<CreditGrantApplication> {
        let cga = self
            .ensure_application(
                grant,
                subscription.id,
                subscription.current_period_start,
                subscription.current_period_end,
                Utc::now(),
            )
            .await?;
        self.process_application(cga, reason).await
    }

    /// Find or create the CGA row for a period. The unique idempotency-key
    /// index provides optimistic mutual exclusion: losing the insert race
    /// just means adopting the winner's row.
    async fn ensure_application(
        &self,
        grant: &CreditGrant,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        scheduled_for: DateTime<Utc>,
    ) -> BillingResult<CreditGrantApplication> {
        let key = CreditGrantApplication::derive_idempotency_key(
            grant.id,
            subscription_id,
            period_start,
            period_end,
        );
        if let Some(existing) = self.applications.get_by_idempotency_key(&key).await? {
            return Ok(existing);
        }
        let now = Utc::now();
        let cga = CreditGrantApplication {
            id: Uuid::new_v4(),
            grant_id: grant.id,
            subscription_id,
            scheduled_for,
            period_start,
            period_end,
            application_status: ApplicationStatus::Scheduled,
            credits_applied: Decimal::ZERO,
            failure_reason: None,
            next_retry_at: None,
            retry_count: 0,
            idempotency_key: key.clone(),
            created_at: now,
            updated_at: now,
        };
        match self.applications.create(cga).await {
            Ok(created) => Ok(created),
            Err(BillingError::Conflict(_)) => {
                // Someone else inserted concurrently; adopt their row.
                self.applications
                    .get_by_idempotency_key(&key)
                    .await?
                    .ok_or_else(|| BillingError::not_found("credit grant application", key))
            }
            Err(other) => Err(other),
        }
    }

    /// Drive one application through the state machine.
    pub async fn process_application(
        &self,
        mut cga: CreditGrantApplication,
        reason: &str,
    ) -> BillingResult<CreditGrantApplication> {
        if cga.application_status == ApplicationStatus::Applied {
            // Duplicate application is a no-op returning the prior record.
            return Ok(cga);
        }
        let grant = self.grants.get(cga.grant_id).await?;
        let subscription = self.subscriptions.get(cga.subscription_id).await?;

        match action_for_status(subscription.status) {
            GrantAction::Defer => {
                debug!(cga = %cga.id, status = ?subscription.status, "deferring credit grant");
                Ok(cga)
            }
            GrantAction::Cancel => {
                // SCHEDULED and FAILED both step through PENDING first, so
                // the terminal FAILED write below always satisfies the
                // transition guard.
                if cga.application_status.can_transition(ApplicationStatus::Pending) {
                    cga.application_status = ApplicationStatus::Pending;
                }
                if !cga.application_status.can_transition(ApplicationStatus::Failed) {
                    return Err(BillingError::InvalidOperation(format!(
                        "credit grant application {} cannot move from {:?} to failed",
                        cga.id, cga.application_status
                    )));
                }
                cga.application_status = ApplicationStatus::Failed;
                cga.failure_reason = Some(format!(
                    "subscription is {:?}, no further credits",
                    subscription.status
                ));
                cga.next_retry_at = None;
                cga.updated_at = Utc::now();
                info!(cga = %cga.id, "credit grant cancelled by subscription state");
                self.applications.update(cga).await
            }
            GrantAction::Apply => {
                if cga.application_status.can_transition(ApplicationStatus::Pending) {
                    cga.application_status = ApplicationStatus::Pending;
                    cga.updated_at = Utc::now();
                    cga = self.applications.update(cga).await?;
                }
                match self.credit_wallet(&grant, &subscription, &cga, reason).await {
                    Ok(()) => {
                        cga.application_status = ApplicationStatus::Applied;
                        cga.credits_applied = grant.credits;
                        cga.failure_reason = None;
                        cga.next_retry_at = None;
                        cga.updated_at = Utc::now();
                        let cga = self.applications.update(cga).await?;
                        info!(
                            cga = %cga.id,
                            grant = %grant.id,
                            credits = %grant.credits,
                            "credit grant applied"
                        );
                        self.sink.publish(make_message(
                            Channel::Webhooks,
                            "creditgrant.applied",
                            serde_json::json!({
                                "application_id": cga.id,
                                "grant_id": grant.id,
                                "subscription_id": cga.subscription_id,
                                "credits": grant.credits,
                            }),
                        ));
                        if grant.cadence == CreditGrantCadence::Recurring {
                            self.schedule_next(&grant, &subscription, &cga).await?;
                        }
                        Ok(cga)
                    }
                    Err(err) => {
                        warn!(cga = %cga.id, error = %err, "credit grant application failed");
                        cga.application_status = ApplicationStatus::Failed;
                        cga.retry_count += 1;
                        cga.failure_reason = Some(err.to_string());
                        cga.next_retry_at = if cga.retry_count <= self.config.max_retries {
                            Some(
                                Utc::now()
                                    + Duration::seconds(
                                        i64::from(cga.retry_count)
                                            * self.config.retry_base_interval_secs as i64,
                                    ),
                            )
                        } else {
                            None
                        };
                        cga.updated_at = Utc::now();
                        self.applications.update(cga).await
                    }
                }
            }
        }
    }

    /// Top up the wallet matching the subscription currency, creating it if
    /// absent. The CGA id is the wallet-transaction idempotency key, so a
    /// timed-out credit can be retried safely.
    async fn credit_wallet(
        &self,
        grant: &CreditGrant,
        subscription: &Subscription,
        cga: &CreditGrantApplication,
        reason: &str,
    ) -> BillingResult<()> {
        let wallet = self
            .find_or_create_wallet(subscription.customer_id, &subscription.currency)
            .await?;
        let expiry = match grant.expiration_type {
            ExpirationType::Never => None,
            ExpirationType::BillingCycle => Some(subscription.current_period_end),
            ExpirationType::Duration => grant
                .expiration_duration_days
                .map(|days| Utc::now() + Duration::days(days)),
        };
        self.wallets
            .credit(
                wallet.id,
                &TopUpRequest {
                    credits: grant.credits,
                    reason: reason.to_string(),
                    expiry,
                    priority: grant.priority,
                    idempotency_key: Some(cga.id.to_string()),
                },
            )
            .await?;
        Ok(())
    }

    async fn find_or_create_wallet(
        &self,
        customer_id: Uuid,
        currency: &str,
    ) -> BillingResult<Wallet> {
        let existing = self
            .wallets
            .get_wallets_by_customer(customer_id)
            .await?
            .into_iter()
            .find(|w| w.currency.eq_ignore_ascii_case(currency));
        if let Some(wallet) = existing {
            return Ok(wallet);
        }
        let wallet = Wallet {
            id: Uuid::new_v4(),
            customer_id,
            currency: currency.to_string(),
            balance: Decimal::ZERO,
            status: WalletStatus::Active,
            created_at: Utc::now(),
        };
        match self.wallets.create_wallet(wallet).await {
            Ok(created) => Ok(created),
            Err(BillingError::Conflict(_)) => {
                // Raced with another creator; use theirs.
                self.wallets
                    .get_wallets_by_customer(customer_id)
                    .await?
                    .into_iter()
                    .find(|w| w.currency.eq_ignore_ascii_case(currency))
                    .ok_or_else(|| BillingError::not_found("wallet", currency))
            }
            Err(other) => Err(other),
        }
    }

    /// Schedule the next period's application for a recurring grant. The
    /// anchor is the subscription's billing anchor iff the grant recurs on
    /// the subscription's own period; a grant-defined period walks from the
    /// grant's creation timestamp instead.
    async fn schedule_next(
        &self,
        grant: &CreditGrant,
        subscription: &Subscription,
        current: &CreditGrantApplication,
    ) -> BillingResult<()> {
        let next_start = current.period_end;
        let next_end = match grant.period {
            Some(period) if period != subscription.billing_period => next_anchor_date(
                next_start,
                grant.created_at,
                period,
                grant.period_count.unwrap_or(1),
            ),
            Some(period) => next_anchor_date(
                next_start,
                subscription.billing_anchor,
                period,
                grant.period_count.unwrap_or(1),
            ),
            None => next_billing_date(
                next_start,
                subscription.billing_anchor,
                subscription.billing_period,
                subscription.billing_period_count,
                subscription.billing_cycle,
            ),
        };
        let next = self
            .ensure_application(grant, subscription.id, next_start, next_end, next_start)
            .await?;
        debug!(
            cga = %next.id,
            scheduled_for = %next.scheduled_for,
            "next recurring application scheduled"
        );
        Ok(())
    }

    /// One sweep over every due application. A failure on one CGA never
    /// halts the sweep.
    pub async fn process_scheduled_credit_grant_applications(&self) -> BillingResult<SweepStats> {
        let due = self.applications.find_all_scheduled(Utc::now()).await?;
        let mut stats = SweepStats::default();
        for cga in due {
            if cga.application_status == ApplicationStatus::Applied {
                continue;
            }
            stats.processed += 1;
            let before = cga.application_status;
            match self.process_application(cga, "scheduled credit grant").await {
                Ok(after) => match after.application_status {
                    ApplicationStatus::Applied => stats.applied += 1,
                    ApplicationStatus::Failed if after.next_retry_at.is_none() => {
                        stats.cancelled += 1
                    }
                    ApplicationStatus::Failed => stats.failed += 1,
                    _ if after.application_status == before => stats.deferred += 1,
                    _ => {}
                },
                Err(err) => {
                    stats.failed += 1;
                    error!(error = %err, "sweep item failed");
                }
            }
        }
        if stats.processed > 0 {
            info!(
                processed = stats.processed,
                applied = stats.applied,
                deferred = stats.deferred,
                failed = stats.failed,
                "credit grant sweep completed"
            );
        }
        Ok(stats)
    }

    /// Spawn the background sweep loop. Detached from any request context;
    /// flip the watch channel to stop it.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let interval_secs = self.config.sweep_interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.process_scheduled_credit_grant_applications().await {
                            error!(error = %err, "credit grant sweep errored");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("credit grant sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
