//! Customer credit wallets and their transaction ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletStatus {
    Active,
    Closed,
}

/// A per-(customer, currency) credit balance. Currency is stored exactly as
/// written; comparisons elsewhere are case-insensitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub currency: String,
    pub balance: Decimal,
    pub status: WalletStatus,
    pub created_at: DateTime<Utc>,
}

impl Wallet {
    pub fn is_active(&self) -> bool {
        self.status == WalletStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletTransactionType {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub transaction_type: WalletTransactionType,
    pub amount: Decimal,
    pub reason: String,
    pub expiry: Option<DateTime<Utc>>,
    pub priority: Option<u32>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Balance report: the stored balance plus the components that reduce what
/// is actually spendable right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletBalance {
    pub wallet_id: Uuid,
    pub stored_balance: Decimal,
    pub real_time_balance: Decimal,
    pub unpaid_invoice_amount: Decimal,
    pub current_period_usage: Decimal,
}

/// Parameters for a wallet top-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopUpRequest {
    pub credits: Decimal,
    pub reason: String,
    pub expiry: Option<DateTime<Utc>>,
    pub priority: Option<u32>,
    pub idempotency_key: Option<String>,
}
