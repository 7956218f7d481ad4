use crate::application::actors::payment_reconciler::ReconcilerConfig;
use crate::infrastructure::tron_signer::address_to_hex;
use crate::task_runner::BackoffPolicy;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

/// TRC-20 USDT contract on Tron mainnet
pub const TRC20_USDT_CONTRACT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Process-wide configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub http_bind_addr: String,

    // Orchestrator and sessions
    pub orchestrator_rescan_seconds: u64, // Full tenant rescan interval
    pub signal_cooldown_seconds: u64,     // Minimum gap between two dispatches per tenant
    pub indicator_history_capacity: usize,
    pub feed_reconnect_base_ms: u64,
    pub feed_reconnect_max_ms: u64,
    pub feed_reconnect_max_attempts: u32,
    pub binance_testnet: bool,

    // Payments
    pub payment_poll_seconds: u64,
    pub payment_expiry_minutes: u64,
    pub subscription_extension_days: u64,
    pub payment_amount_usdt: u64,
    pub ledger_max_retries: u32,
    pub ledger_retry_base_ms: u64,
    pub treasury_address: Option<String>,
    pub trongrid_api_url: String,
    pub trongrid_requests_per_second: u32,
    pub usdt_contract: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/tenantbot.db".to_string(),
            http_bind_addr: "127.0.0.1:3000".to_string(),
            orchestrator_rescan_seconds: 30,
            signal_cooldown_seconds: 300,
            indicator_history_capacity: 100,
            feed_reconnect_base_ms: 1000,
            feed_reconnect_max_ms: 30_000,
            feed_reconnect_max_attempts: 5,
            binance_testnet: true,
            payment_poll_seconds: 60,
            payment_expiry_minutes: 30,
            subscription_extension_days: 30,
            payment_amount_usdt: 20,
            ledger_max_retries: 3,
            ledger_retry_base_ms: 500,
            treasury_address: None,
            trongrid_api_url: "https://api.trongrid.io".to_string(),
            trongrid_requests_per_second: 10,
            usdt_contract: TRC20_USDT_CONTRACT.to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> AppConfig {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Invalid values are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> AppConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(url) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            config.database_url = url;
        }
        if let Some(addr) = lookup("HTTP_BIND_ADDR").filter(|v| !v.is_empty()) {
            config.http_bind_addr = addr;
        }

        override_in_range(&lookup, "ORCHESTRATOR_RESCAN_SECONDS", 5..=3600, &mut config.orchestrator_rescan_seconds);
        override_in_range(&lookup, "SIGNAL_COOLDOWN_SECONDS", 1..=86_400, &mut config.signal_cooldown_seconds);
        override_in_range(&lookup, "INDICATOR_HISTORY_CAPACITY", 50..=10_000, &mut config.indicator_history_capacity);
        override_in_range(&lookup, "FEED_RECONNECT_BASE_MS", 10..=60_000, &mut config.feed_reconnect_base_ms);
        override_in_range(&lookup, "FEED_RECONNECT_MAX_MS", 10..=600_000, &mut config.feed_reconnect_max_ms);
        override_in_range(&lookup, "FEED_RECONNECT_MAX_ATTEMPTS", 1..=50, &mut config.feed_reconnect_max_attempts);
        override_in_range(&lookup, "PAYMENT_POLL_SECONDS", 5..=3600, &mut config.payment_poll_seconds);
        override_in_range(&lookup, "PAYMENT_EXPIRY_MINUTES", 1..=1440, &mut config.payment_expiry_minutes);
        override_in_range(&lookup, "SUBSCRIPTION_EXTENSION_DAYS", 1..=366, &mut config.subscription_extension_days);
        override_in_range(&lookup, "PAYMENT_AMOUNT_USDT", 1..=100_000, &mut config.payment_amount_usdt);
        override_in_range(&lookup, "LEDGER_MAX_RETRIES", 0..=10, &mut config.ledger_max_retries);
        override_in_range(&lookup, "LEDGER_RETRY_BASE_MS", 10..=60_000, &mut config.ledger_retry_base_ms);
        override_in_range(&lookup, "TRONGRID_REQUESTS_PER_SECOND", 1..=100, &mut config.trongrid_requests_per_second);

        if let Some(testnet) = lookup("BINANCE_TESTNET") {
            config.binance_testnet = testnet.to_lowercase() == "true" || testnet == "1";
        }

        config.treasury_address = lookup("TREASURY_ADDRESS").filter(|v| !v.is_empty());
        if let Some(url) = lookup("TRONGRID_API_URL").filter(|v| !v.is_empty()) {
            config.trongrid_api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(contract) = lookup("USDT_CONTRACT_ADDRESS").filter(|v| !v.is_empty()) {
            config.usdt_contract = contract;
        }

        config
    }

    /// Cross-field checks that single-value range checks cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed_reconnect_base_ms > self.feed_reconnect_max_ms {
            return Err(ConfigError::Invalid(format!(
                "FEED_RECONNECT_BASE_MS ({}) exceeds FEED_RECONNECT_MAX_MS ({})",
                self.feed_reconnect_base_ms, self.feed_reconnect_max_ms
            )));
        }
        if let Some(address) = &self.treasury_address {
            address_to_hex(address).map_err(|e| {
                ConfigError::Invalid(format!("TREASURY_ADDRESS is not a TRON address: {}", e))
            })?;
        }
        Ok(())
    }

    pub fn feed_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.feed_reconnect_base_ms),
            Duration::from_millis(self.feed_reconnect_max_ms),
            self.feed_reconnect_max_attempts,
        )
    }

    pub fn ledger_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.ledger_retry_base_ms),
            Duration::from_millis(self.ledger_retry_base_ms.saturating_mul(16)),
            self.ledger_max_retries,
        )
    }

    pub fn signal_cooldown(&self) -> Duration {
        Duration::from_secs(self.signal_cooldown_seconds)
    }

    pub fn orchestrator_rescan_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator_rescan_seconds)
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: Duration::from_secs(self.payment_poll_seconds),
            payment_ttl: chrono::Duration::minutes(self.payment_expiry_minutes as i64),
            subscription_extension: chrono::Duration::days(self.subscription_extension_days as i64),
            treasury_address: self.treasury_address.clone(),
            ledger_backoff: self.ledger_backoff(),
        }
    }
}

fn override_in_range<F, T>(lookup: &F, name: &str, range: RangeInclusive<T>, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Display + Copy,
    T::Err: Display,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if range.contains(&value) => *target = value,
        Ok(value) => {
            tracing::warn!(
                "Invalid {} value: {} (must be between {} and {}), using default: {}",
                name,
                value,
                range.start(),
                range.end(),
                target
            );
        }
        Err(e) => {
            tracing::warn!(
                "Failed to parse {} '{}': {}, using default: {}",
                name,
                raw,
                e,
                target
            );
        }
    }
}
