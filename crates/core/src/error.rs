use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

/// Domain error for the billing core. Every variant maps to a stable
/// machine-readable code plus a user-visible hint; internal details stay in
/// the `Display` output and are logged, never returned to API clients.
#[derive(Error, Debug)]
pub enum BillingError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("insufficient funds: wallet {wallet_id} holds {balance}, attempted debit of {attempted}")]
    InsufficientFunds {
        wallet_id: Uuid,
        balance: Decimal,
        attempted: Decimal,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BillingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::Database(_) => "database_error",
            Self::Serialization(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// User-visible hint. Internal variants deliberately say nothing useful.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Validation(_) => "check the request fields and retry",
            Self::NotFound { .. } => "the referenced entity does not exist",
            Self::Conflict(_) => "the operation conflicts with existing state",
            Self::InvalidOperation(_) => "the operation is not allowed in the current state",
            Self::InsufficientFunds { .. } => "the wallet balance does not cover this debit",
            Self::Database(_) => "a storage error occurred, retry later",
            Self::Serialization(_) | Self::Internal(_) => "an internal error occurred",
        }
    }

    /// Whether the caller may retry the operation verbatim.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}
