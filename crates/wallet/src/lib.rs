//! Customer credit wallet service.

pub mod service;

pub use service::{NoPendingUsage, PendingUsageSource, WalletService};
