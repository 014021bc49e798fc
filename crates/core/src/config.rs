use crate::catalog::InvoiceCadence;
use crate::period::ProrationStrategy;
use serde::Deserialize;

/// Root application configuration. Loaded from environment variables with
/// the prefix `METERFLOW__` and nested-section `__` separators.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub credit_grant: CreditGrantConfig,
    #[serde(default)]
    pub event_generation: EventGenerationConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    #[serde(default = "default_invoice_cadence")]
    pub default_invoice_cadence: InvoiceCadence,
    #[serde(default = "default_proration_strategy")]
    pub proration_strategy: ProrationStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditGrantConfig {
    /// Linear backoff unit: retry N waits `N × retry_base_interval_secs`.
    #[serde(default = "default_retry_base_interval_secs")]
    pub retry_base_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventGenerationConfig {
    #[serde(default = "default_rate_per_second")]
    pub rate_per_second: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_allow_negative_balance")]
    pub allow_negative_balance: bool,
}

// Default functions
fn default_invoice_cadence() -> InvoiceCadence {
    InvoiceCadence::Arrear
}
fn default_proration_strategy() -> ProrationStrategy {
    ProrationStrategy::DayBased
}
fn default_retry_base_interval_secs() -> u64 {
    900
}
fn default_max_retries() -> u32 {
    10
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_rate_per_second() -> u32 {
    5
}
fn default_allow_negative_balance() -> bool {
    false
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            default_invoice_cadence: default_invoice_cadence(),
            proration_strategy: default_proration_strategy(),
        }
    }
}

impl Default for CreditGrantConfig {
    fn default() -> Self {
        Self {
            retry_base_interval_secs: default_retry_base_interval_secs(),
            max_retries: default_max_retries(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for EventGenerationConfig {
    fn default() -> Self {
        Self {
            rate_per_second: default_rate_per_second(),
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            allow_negative_balance: default_allow_negative_balance(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("METERFLOW")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.billing.default_invoice_cadence, InvoiceCadence::Arrear);
        assert_eq!(config.billing.proration_strategy, ProrationStrategy::DayBased);
        assert_eq!(config.credit_grant.retry_base_interval_secs, 900);
        assert_eq!(config.credit_grant.max_retries, 10);
        assert_eq!(config.event_generation.rate_per_second, 5);
        assert!(!config.wallet.allow_negative_balance);
    }
}
