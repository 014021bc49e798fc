//! Billing engine — price rating, usage charging with entitlements, invoice
//! assembly at period boundaries, proration for mid-period changes, and
//! invoice settlement against customer wallets.

pub mod assembler;
pub mod changes;
pub mod cycle;
pub mod entitlements;
pub mod pending;
pub mod pricing;
pub mod proration;
pub mod settlement;
pub mod usage;

pub use assembler::InvoiceAssembler;
pub use changes::SubscriptionChangeService;
pub use cycle::BillingCycleRunner;
pub use entitlements::EntitlementChecker;
pub use pending::SubscriptionUsageSource;
pub use proration::{ProrationEngine, ProrationQueue};
pub use settlement::InvoiceSettler;
pub use usage::UsageCharger;
