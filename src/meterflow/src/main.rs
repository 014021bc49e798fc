//! Meterflow — usage-metered subscription billing engine.
//!
//! Development entry point: seeds a demo tenant, generates synthetic usage,
//! runs the credit-grant sweeper, and walks one subscription through a full
//! billing cycle (advance invoice, usage preview, wallet settlement).

use clap::Parser;
use meterflow_billing::{
    BillingCycleRunner, EntitlementChecker, InvoiceAssembler, InvoiceSettler, ProrationQueue,
    SubscriptionUsageSource, UsageCharger,
};
use meterflow_core::catalog::{CreditGrant, CreditGrantCadence, CreditGrantScope, ExpirationType};
use meterflow_core::config::AppConfig;
use meterflow_core::event_bus::{capture_sink, MessageSink};
use meterflow_core::invoice::ReferencePoint;
use meterflow_credits::{CouponService, CreditGrantScheduler};
use meterflow_onboarding::{EventGenerator, OnboardingBootstrap};
use meterflow_store::contracts::CreditGrantRepo;
use meterflow_store::MemoryStore;
use meterflow_wallet::WalletService;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "meterflow")]
#[command(about = "Usage-metered subscription billing engine")]
#[command(version)]
struct Cli {
    /// Tenant name for the seeded environment
    #[arg(long, default_value = "demo", env = "METERFLOW__TENANT")]
    tenant: String,

    /// Seconds of synthetic event generation
    #[arg(long, default_value_t = 5, env = "METERFLOW__GENERATE_SECONDS")]
    generate_seconds: u64,

    /// Credits granted to the demo wallet before settlement
    #[arg(long, default_value_t = 100)]
    welcome_credits: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meterflow=info".into()),
        )
        .init();

    let cli = Cli::parse();

    info!("Meterflow starting up");

    let config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    // Wiring: one in-memory store behind every repository contract.
    let store = Arc::new(
        MemoryStore::new().with_negative_balances(config.wallet.allow_negative_balance),
    );
    let sink = capture_sink();
    let message_sink: Arc<dyn MessageSink> = sink.clone();

    let charger = Arc::new(UsageCharger::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    let prorations = Arc::new(ProrationQueue::new());
    let assembler = Arc::new(InvoiceAssembler::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        charger.clone(),
        prorations,
        message_sink.clone(),
        config.billing.proration_strategy,
    ));
    let settler = Arc::new(InvoiceSettler::new(
        store.clone(),
        store.clone(),
        message_sink.clone(),
    ));
    let coupons = Arc::new(CouponService::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
    ));
    let cycle_runner = BillingCycleRunner::new(
        store.clone(),
        assembler.clone(),
        settler.clone(),
        coupons,
    );
    let entitlement_checker = EntitlementChecker::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
    );
    let wallet_service = WalletService::new(
        store.clone(),
        store.clone(),
        Arc::new(SubscriptionUsageSource::new(
            store.clone(),
            store.clone(),
            charger.clone(),
        )),
        message_sink.clone(),
    );
    let scheduler = Arc::new(CreditGrantScheduler::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        message_sink.clone(),
        config.credit_grant.clone(),
    ));
    let bootstrap = OnboardingBootstrap::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        message_sink.clone(),
    );
    let generator = EventGenerator::new(
        store.clone(),
        message_sink.clone(),
        config.event_generation.clone(),
    );

    // Background credit-grant sweeper, detached from this flow.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = scheduler.clone().spawn_sweeper(shutdown_rx.clone());

    // 1. Seed the development environment.
    let seeded = bootstrap
        .bootstrap(&cli.tenant, &format!("owner@{}.dev", cli.tenant))
        .await?;

    // 2. Welcome credits through the grant path, landing in the wallet.
    let grant = CreditGrantRepo::create(
        &*store,
        CreditGrant {
            id: Uuid::new_v4(),
            name: "welcome credits".into(),
            scope: CreditGrantScope::Subscription {
                subscription_id: seeded.subscription.id,
            },
            credits: Decimal::from(cli.welcome_credits),
            currency: "USD".into(),
            cadence: CreditGrantCadence::OneTime,
            period: None,
            period_count: None,
            expiration_type: ExpirationType::Never,
            expiration_duration_days: None,
            priority: None,
            created_at: chrono::Utc::now(),
        },
    )
    .await?;
    let cga = scheduler
        .apply_credit_grant(&grant, &seeded.subscription, "welcome credits")
        .await?;
    info!(cga = %cga.id, credits = %cga.credits_applied, "welcome credits applied");

    // 3. Synthetic usage against the seeded meter.
    let request = generator.request_generation(
        &seeded.customer.external_id,
        cli.generate_seconds,
        std::slice::from_ref(&seeded.meter),
    );
    let emitted = generator.run(&request, shutdown_rx.clone()).await?;
    info!(emitted, "synthetic events generated");

    // 4. Advance invoice for the current period, settled from the wallet.
    let invoice_request = assembler
        .prepare_subscription_invoice_request(
            seeded.subscription.id,
            seeded.subscription.current_period_start,
            seeded.subscription.current_period_end,
            ReferencePoint::PeriodStart,
        )
        .await?;
    if invoice_request.is_empty() {
        info!("nothing to invoice at period start");
    } else {
        let invoice = assembler.persist_invoice(&invoice_request).await?;
        settler.finalize_invoice(invoice.id).await?;
        let settled = settler.settle_with_wallet(invoice.id).await?;
        info!(
            invoice = %settled.invoice_number,
            amount_due = %settled.amount_due,
            payment_status = ?settled.payment_status,
            "period-start invoice settled"
        );
    }

    // 5. Preview what period end will look like with the accrued usage.
    let preview = assembler
        .prepare_subscription_invoice_request(
            seeded.subscription.id,
            seeded.subscription.current_period_start,
            seeded.subscription.current_period_end,
            ReferencePoint::Preview,
        )
        .await?;
    for line in &preview.line_items {
        info!(
            item = %line.display_name,
            quantity = %line.quantity,
            amount = %line.amount,
            "preview line item"
        );
    }
    info!(amount_due = %preview.amount_due, "period-end preview");

    // 6. Real-time wallet balance nets the unpaid preview usage.
    let wallets = meterflow_store::contracts::WalletRepo::get_wallets_by_customer(
        &*store,
        seeded.customer.id,
    )
    .await?;
    if let Some(wallet) = wallets.first() {
        let balance = wallet_service.get_wallet_balance(wallet.id).await?;
        info!(
            stored = %balance.stored_balance,
            real_time = %balance.real_time_balance,
            pending_usage = %balance.current_period_usage,
            "wallet balance"
        );
    }

    // 7. Feature gating against the accrued usage.
    let sub = meterflow_store::contracts::SubscriptionRepo::get_with_line_items(
        &*store,
        seeded.subscription.id,
    )
    .await?;
    let decision = entitlement_checker
        .check_access(&sub, &seeded.customer.external_id, seeded.feature.id)
        .await?;
    info!(
        feature = %seeded.feature.name,
        allowed = decision.allowed,
        usage = %decision.usage,
        "entitlement check"
    );

    // 8. Close the period: bill arrears plus the next advance fee, settle,
    //    and roll the subscription forward.
    let outcome = cycle_runner.close_period(seeded.subscription.id).await?;
    if let Some(invoice) = &outcome.invoice {
        info!(
            invoice = %invoice.invoice_number,
            amount_due = %invoice.amount_due,
            payment_status = ?invoice.payment_status,
            "period closed"
        );
    }
    info!(
        period_start = %outcome.new_period_start,
        period_end = %outcome.new_period_end,
        "subscription rolled forward"
    );

    info!(published = sink.count(), "outbound messages published");

    shutdown_tx.send(true).ok();
    sweeper.await.ok();

    info!("Meterflow demo complete");
    Ok(())
}
