//! Subscription payment requests, stored under `payments/{tenant}`.
//!
//! A record is created `Pending` and moves exactly once to `Completed` or
//! `Expired`. Both transitions take the sweep key out of the record, so a
//! record that has left `Pending` can never hold key material again.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroizing;

/// USDT on TRON uses 6 decimals; ledger amounts are integers in these base units.
pub const USDT_DECIMALS: u32 = 6;

pub fn usdt_to_base_units(usdt: u64) -> u64 {
    usdt * 10u64.pow(USDT_DECIMALS)
}

pub fn base_units_to_usdt(amount: u64) -> f64 {
    amount as f64 / 10f64.powi(USDT_DECIMALS as i32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Expired,
}

/// Private key controlling a deposit address. Zeroed on drop, never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct SweepKey(Zeroizing<String>);

impl SweepKey {
    pub fn new(secret: impl Into<String>) -> Self {
        SweepKey(Zeroizing::new(secret.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Debug for SweepKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SweepKey(<redacted>)")
    }
}

impl Serialize for SweepKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for SweepKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SweepKey::new)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub payment_id: String,
    pub tenant_id: String,
    status: PaymentStatus,
    pub deposit_address: String,
    /// Expected amount in ledger base units
    pub expected_amount: u64,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sweep_key: Option<SweepKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subscription_credited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweep_tx_id: Option<String>,
}

impl PaymentRecord {
    pub fn pending(
        payment_id: impl Into<String>,
        tenant_id: impl Into<String>,
        deposit_address: impl Into<String>,
        expected_amount: u64,
        requested_at: DateTime<Utc>,
        sweep_key: SweepKey,
    ) -> Self {
        Self {
            payment_id: payment_id.into(),
            tenant_id: tenant_id.into(),
            status: PaymentStatus::Pending,
            deposit_address: deposit_address.into(),
            expected_amount,
            requested_at,
            sweep_key: Some(sweep_key),
            received_amount: None,
            completed_at: None,
            expired_at: None,
            subscription_credited: false,
            sweep_tx_id: None,
        }
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn is_pending(&self) -> bool {
        self.status == PaymentStatus::Pending
    }

    pub fn has_sweep_key(&self) -> bool {
        self.sweep_key.is_some()
    }

    /// True once more than `ttl` has passed since the request.
    pub fn is_past_deadline(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.requested_at > ttl
    }

    /// `Pending -> Expired`. Returns false and changes nothing for any other status.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = PaymentStatus::Expired;
        self.expired_at = Some(now);
        self.sweep_key = None;
        true
    }

    /// `Pending -> Completed`, handing the sweep key to the caller.
    ///
    /// Returns `None` and changes nothing unless the record is pending. The
    /// returned key may itself be absent if the record was created without one.
    pub fn complete(&mut self, received: u64, now: DateTime<Utc>) -> Option<Option<SweepKey>> {
        if !self.is_pending() {
            return None;
        }
        self.status = PaymentStatus::Completed;
        self.received_amount = Some(received);
        self.completed_at = Some(now);
        Some(self.sweep_key.take())
    }

    pub fn awaiting_subscription_credit(&self) -> bool {
        self.status == PaymentStatus::Completed && !self.subscription_credited
    }
}

/// What the tenant-facing surface may see about a payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentView {
    pub payment_id: String,
    pub status: PaymentStatus,
    pub address: String,
    pub amount_usdt: f64,
    pub requested_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&PaymentRecord> for PaymentView {
    fn from(record: &PaymentRecord) -> Self {
        Self {
            payment_id: record.payment_id.clone(),
            status: record.status,
            address: record.deposit_address.clone(),
            amount_usdt: base_units_to_usdt(record.expected_amount),
            requested_at: record.requested_at,
            completed_at: record.completed_at,
        }
    }
}
