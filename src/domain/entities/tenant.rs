//! Tenant configuration as stored under `tenants/{id}`.
//!
//! The stored shape belongs to the tenant-facing application; this module only
//! reads it, and rewrites the `subscription` block when a payment is credited.
//! Unknown fields are carried through untouched so a full-record write never
//! drops data owned by other writers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const DEFAULT_TIMEFRAME: &str = "15m";
pub const DEFAULT_LEVERAGE: u32 = 10;
pub const DEFAULT_POSITION_SIZE_PERCENT: f64 = 5.0;
pub const DEFAULT_PAIR: &str = "BTCUSDT";
pub const MAX_LEVERAGE: u32 = 125;

const SUPPORTED_TIMEFRAMES: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotSettings {
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_size_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_pairs: Option<Vec<String>>,
}

/// Exchange API key pair for one tenant. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct ApiCredentials {
    pub api_key: String,
    pub secret_key: String,
}

impl ApiCredentials {
    pub fn new(api_key: &str, secret_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.secret_key.trim().is_empty()
    }
}

impl std::fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub tier: SubscriptionTier,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    /// Payment that granted the current period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
}

impl Subscription {
    pub fn is_active_pro(&self, now: DateTime<Utc>) -> bool {
        self.tier == SubscriptionTier::Pro && self.expires_at > now
    }

    /// Pro subscription running `period` from `now`, granted by `payment_id`.
    pub fn pro_from_payment(payment_id: &str, now: DateTime<Utc>, period: Duration) -> Self {
        Subscription {
            tier: SubscriptionTier::Pro,
            expires_at: now + period,
            payment_id: Some(payment_id.to_string()),
        }
    }

    pub fn granted_by(&self, payment_id: &str) -> bool {
        self.payment_id.as_deref() == Some(payment_id)
    }
}

/// Raw record at `tenants/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_settings: Option<BotSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_credentials: Option<ApiCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Validated view of a tenant's bot configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub is_active: bool,
    pub timeframe: String,
    pub leverage: u32,
    pub position_size_percent: f64,
    /// Never empty; upper-cased and de-duplicated in configured order
    pub allowed_pairs: Vec<String>,
    pub credentials: Option<ApiCredentials>,
    pub subscription: Option<Subscription>,
}

impl TenantConfig {
    pub fn from_record(tenant_id: &str, record: &TenantRecord) -> Result<Self, String> {
        let settings = record.bot_settings.clone().unwrap_or_default();

        let timeframe = settings
            .timeframe
            .filter(|tf| !tf.is_empty())
            .unwrap_or_else(|| DEFAULT_TIMEFRAME.to_string());
        if !SUPPORTED_TIMEFRAMES.contains(&timeframe.as_str()) {
            return Err(format!("Unsupported timeframe: {}", timeframe));
        }

        let leverage = settings.leverage.unwrap_or(DEFAULT_LEVERAGE);
        if !(1..=MAX_LEVERAGE).contains(&leverage) {
            return Err(format!(
                "Leverage {} out of range (1..={})",
                leverage, MAX_LEVERAGE
            ));
        }

        let position_size_percent = settings
            .position_size_percent
            .unwrap_or(DEFAULT_POSITION_SIZE_PERCENT);
        if !(position_size_percent > 0.0 && position_size_percent <= 100.0) {
            return Err(format!(
                "Position size {}% out of range (0, 100]",
                position_size_percent
            ));
        }

        let mut allowed_pairs: Vec<String> = Vec::new();
        for pair in settings.allowed_pairs.unwrap_or_default() {
            let pair = pair.trim().to_uppercase();
            if !pair.is_empty() && !allowed_pairs.contains(&pair) {
                allowed_pairs.push(pair);
            }
        }
        if allowed_pairs.is_empty() {
            allowed_pairs.push(DEFAULT_PAIR.to_string());
        }

        Ok(TenantConfig {
            tenant_id: tenant_id.to_string(),
            is_active: settings.is_active,
            timeframe,
            leverage,
            position_size_percent,
            allowed_pairs,
            credentials: record.api_credentials.clone(),
            subscription: record.subscription.clone(),
        })
    }

    /// True when a session built from `other` would behave exactly like one
    /// built from `self`. The subscription block is not part of that.
    pub fn same_session_settings(&self, other: &TenantConfig) -> bool {
        self.tenant_id == other.tenant_id
            && self.is_active == other.is_active
            && self.timeframe == other.timeframe
            && self.leverage == other.leverage
            && self.position_size_percent == other.position_size_percent
            && self.allowed_pairs == other.allowed_pairs
            && self.credentials == other.credentials
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials
            .as_ref()
            .map(ApiCredentials::is_complete)
            .unwrap_or(false)
    }

    /// A session should exist iff the tenant asked for one, can trade, and has paid.
    pub fn should_run(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.has_credentials()
            && self
                .subscription
                .as_ref()
                .map(|s| s.is_active_pro(now))
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pro_record(expires_in: Duration) -> TenantRecord {
        TenantRecord {
            bot_settings: Some(BotSettings {
                is_active: true,
                timeframe: Some("5m".to_string()),
                leverage: Some(20),
                position_size_percent: Some(2.5),
                allowed_pairs: Some(vec!["btcusdt".to_string(), "ETHUSDT".to_string()]),
            }),
            api_credentials: Some(ApiCredentials::new("key", "secret")),
            subscription: Some(Subscription {
                tier: SubscriptionTier::Pro,
                expires_at: Utc::now() + expires_in,
                payment_id: None,
            }),
            extra: Map::new(),
        }
    }

    #[test]
    fn test_parses_store_shape() {
        let raw = json!({
            "botSettings": {
                "isActive": true,
                "timeframe": "1h",
                "leverage": 5,
                "positionSizePercent": 10.0,
                "allowedPairs": ["SOLUSDT"]
            },
            "apiCredentials": { "apiKey": "k", "secretKey": "s" },
            "subscription": { "tier": "pro", "expiresAt": 4102444800000i64 },
            "email": "someone@example.com"
        });
        let record: TenantRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.extra.get("email"), Some(&json!("someone@example.com")));

        let config = TenantConfig::from_record("t1", &record).unwrap();
        assert_eq!(config.timeframe, "1h");
        assert_eq!(config.leverage, 5);
        assert_eq!(config.allowed_pairs, vec!["SOLUSDT".to_string()]);
        assert!(config.should_run(Utc::now()));
    }

    #[test]
    fn test_defaults_applied() {
        let record = TenantRecord {
            bot_settings: Some(BotSettings {
                is_active: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = TenantConfig::from_record("t1", &record).unwrap();
        assert_eq!(config.timeframe, DEFAULT_TIMEFRAME);
        assert_eq!(config.leverage, DEFAULT_LEVERAGE);
        assert_eq!(config.position_size_percent, DEFAULT_POSITION_SIZE_PERCENT);
        assert_eq!(config.allowed_pairs, vec![DEFAULT_PAIR.to_string()]);
    }

    #[test]
    fn test_pairs_normalized_and_deduplicated() {
        let mut record = pro_record(Duration::days(1));
        record.bot_settings.as_mut().unwrap().allowed_pairs = Some(vec![
            "btcusdt".to_string(),
            "BTCUSDT".to_string(),
            " ".to_string(),
        ]);
        let config = TenantConfig::from_record("t1", &record).unwrap();
        assert_eq!(config.allowed_pairs, vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut record = pro_record(Duration::days(1));
        record.bot_settings.as_mut().unwrap().leverage = Some(500);
        assert!(TenantConfig::from_record("t1", &record).is_err());

        let mut record = pro_record(Duration::days(1));
        record.bot_settings.as_mut().unwrap().timeframe = Some("7m".to_string());
        assert!(TenantConfig::from_record("t1", &record).is_err());

        let mut record = pro_record(Duration::days(1));
        record.bot_settings.as_mut().unwrap().position_size_percent = Some(0.0);
        assert!(TenantConfig::from_record("t1", &record).is_err());
    }

    #[test]
    fn test_should_run_requires_every_condition() {
        let now = Utc::now();
        let config = TenantConfig::from_record("t1", &pro_record(Duration::days(1))).unwrap();
        assert!(config.should_run(now));

        let mut inactive = config.clone();
        inactive.is_active = false;
        assert!(!inactive.should_run(now));

        let mut no_keys = config.clone();
        no_keys.credentials = Some(ApiCredentials::new("key", ""));
        assert!(!no_keys.should_run(now));

        let mut free = config.clone();
        free.subscription.as_mut().unwrap().tier = SubscriptionTier::Free;
        assert!(!free.should_run(now));

        let expired = TenantConfig::from_record("t1", &pro_record(-Duration::minutes(1))).unwrap();
        assert!(!expired.should_run(now));
    }

    #[test]
    fn test_paid_period_runs_from_now() {
        let now = Utc::now();
        let subscription = Subscription::pro_from_payment("payment_1", now, Duration::days(30));
        assert_eq!(subscription.tier, SubscriptionTier::Pro);
        assert_eq!(subscription.expires_at, now + Duration::days(30));
        assert!(subscription.granted_by("payment_1"));
        assert!(!subscription.granted_by("payment_2"));

        let raw = serde_json::to_value(&subscription).unwrap();
        assert_eq!(raw["paymentId"], "payment_1");
        let legacy: Subscription =
            serde_json::from_value(json!({"tier": "pro", "expiresAt": 4102444800000i64})).unwrap();
        assert!(!legacy.granted_by("payment_1"));
    }

    #[test]
    fn test_session_settings_ignore_subscription() {
        let config = TenantConfig::from_record("t1", &pro_record(Duration::days(1))).unwrap();

        let mut renewed = config.clone();
        renewed.subscription = Some(Subscription::pro_from_payment(
            "payment_9",
            Utc::now(),
            Duration::days(30),
        ));
        assert!(config.same_session_settings(&renewed));

        let mut rotated = config.clone();
        rotated.credentials = Some(ApiCredentials::new("key", "other-secret"));
        assert!(!config.same_session_settings(&rotated));

        let mut leveraged = config.clone();
        leveraged.leverage = 3;
        assert!(!config.same_session_settings(&leveraged));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = ApiCredentials::new("visible-key", "visible-secret");
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("visible"));
    }
}
