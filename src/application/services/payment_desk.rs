//! Payment Desk
//!
//! Entry point for subscription upgrades. A request stores a `pending` payment
//! record holding the deposit address and the key that can sweep it; from then on
//! the payment reconciler owns the record.
//!
//! Deposit addresses are generated by the caller (one fresh ledger account per
//! request); the desk never derives keys itself.
//!
//! The desk and the reconciler both rewrite `payments/{tenant}`; they share a
//! [`PaymentWriteLock`] so a check and the write that depends on it are never
//! interleaved with the other side.

use crate::domain::entities::payment::{usdt_to_base_units, PaymentRecord, PaymentView, SweepKey};
use crate::domain::errors::PaymentError;
use crate::domain::repositories::state_store::{paths, StateStore, StateStoreExt};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Serializes read-then-write cycles on payment records.
pub type PaymentWriteLock = Arc<Mutex<()>>;

pub struct PaymentDesk {
    store: Arc<dyn StateStore>,
    write_lock: PaymentWriteLock,
    /// Price of one subscription period, in ledger base units
    amount: u64,
    ttl: chrono::Duration,
}

impl PaymentDesk {
    pub fn new(store: Arc<dyn StateStore>, amount_usdt: u64, ttl: chrono::Duration) -> Self {
        Self {
            store,
            write_lock: PaymentWriteLock::default(),
            amount: usdt_to_base_units(amount_usdt),
            ttl,
        }
    }

    /// Lock to hand to the payment reconciler.
    pub fn write_lock(&self) -> PaymentWriteLock {
        self.write_lock.clone()
    }

    /// Open a pending payment for `tenant_id`.
    ///
    /// Fails with [`PaymentError::AlreadyPending`] while an earlier request is
    /// still inside its payment window, and with [`PaymentError::AwaitingCredit`]
    /// while a confirmed payment has not reached the subscription yet. Other
    /// completed and expired records are replaced.
    pub async fn request_upgrade(
        &self,
        tenant_id: &str,
        deposit_address: &str,
        sweep_key: SweepKey,
    ) -> Result<PaymentView, PaymentError> {
        let path = paths::payment(tenant_id);
        let now = Utc::now();
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.store.read_as::<PaymentRecord>(&path).await? {
            if existing.is_pending() && !existing.is_past_deadline(now, self.ttl) {
                return Err(PaymentError::AlreadyPending(tenant_id.to_string()));
            }
            if existing.awaiting_subscription_credit() {
                return Err(PaymentError::AwaitingCredit(tenant_id.to_string()));
            }
        }

        let record = PaymentRecord::pending(
            new_payment_id(now),
            tenant_id,
            deposit_address,
            self.amount,
            now,
            sweep_key,
        );
        self.store.write_as(&path, &record).await?;

        info!(
            "Payment {} opened for tenant {} at {}",
            record.payment_id, tenant_id, deposit_address
        );
        Ok(PaymentView::from(&record))
    }

    pub async fn status(&self, tenant_id: &str) -> Result<PaymentView, PaymentError> {
        self.store
            .read_as::<PaymentRecord>(&paths::payment(tenant_id))
            .await?
            .map(|record| PaymentView::from(&record))
            .ok_or_else(|| PaymentError::NotFound(tenant_id.to_string()))
    }
}

fn new_payment_id(now: DateTime<Utc>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("payment_{}_{:06}", now.timestamp_millis(), suffix)
}
