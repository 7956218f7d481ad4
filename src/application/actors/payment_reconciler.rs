//! Payment Reconciler Actor
//!
//! Polls `payments/*` on a fixed interval, independent of any bot session.
//! For each pending record it either expires it, leaves it pending, or completes
//! it: the completed record (without its sweep key) is written first, then the
//! tenant's subscription is credited, then the deposit is swept to the treasury
//! with the key still held in memory. The key is wiped whether or not the sweep
//! succeeds.
//!
//! Records are processed one by one and a failure on one never aborts the tick.
//! Every write re-reads the stored record under the payment write lock shared
//! with the payment desk, and is dropped if the record was replaced meanwhile.

use crate::application::services::payment_desk::PaymentWriteLock;
use crate::domain::entities::payment::{base_units_to_usdt, PaymentRecord, PaymentStatus, SweepKey};
use crate::domain::entities::tenant::{Subscription, TenantRecord};
use crate::domain::errors::{ActorError, LedgerError, StoreError};
use crate::domain::repositories::ledger_client::LedgerClient;
use crate::domain::repositories::state_store::{paths, StateStore, StateStoreExt};
use crate::task_runner::{retry_with_backoff, BackoffPolicy};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Channel capacity for reconciler actor messages
const RECONCILER_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub poll_interval: Duration,
    /// Pending records older than this expire
    pub payment_ttl: chrono::Duration,
    /// Pro time granted by one completed payment, counted from confirmation
    pub subscription_extension: chrono::Duration,
    /// Sweeps are skipped when unset
    pub treasury_address: Option<String>,
    pub ledger_backoff: BackoffPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            payment_ttl: chrono::Duration::minutes(30),
            subscription_extension: chrono::Duration::days(30),
            treasury_address: None,
            ledger_backoff: BackoffPolicy::new(
                Duration::from_millis(500),
                Duration::from_secs(8),
                3,
            ),
        }
    }
}

/// Messages that can be sent to the reconciler actor
#[derive(Debug)]
pub enum ReconcilerMessage {
    /// Run a tick immediately
    RunNow { reply: mpsc::Sender<TickReport> },
    GetStats { reply: mpsc::Sender<ReconcilerStats> },
    Shutdown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcilerStats {
    pub ticks: u64,
    pub confirmed: u64,
    pub expired: u64,
    pub credited: u64,
    pub sweeps_completed: u64,
    pub sweep_failures: u64,
    pub record_errors: u64,
    pub last_tick: Option<DateTime<Utc>>,
}

/// Result of one pass over the payment records
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub examined: usize,
    pub still_pending: usize,
    pub confirmed: usize,
    pub expired: usize,
    pub credited: usize,
    /// Records replaced by a new request while being processed
    pub superseded: usize,
    pub errors: usize,
}

/// What happened to a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    StillPending,
    Expired,
    Completed { credited: bool, swept: bool },
    /// A completed record whose subscription credit was retried
    Credited,
    /// Nothing to do
    Settled,
}

#[derive(Debug, thiserror::Error)]
enum RecordError {
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("payment {0} was replaced while being processed")]
    Superseded(String),
}

/// Cloneable handle to the reconciler actor
#[derive(Clone)]
pub struct PaymentReconcilerHandle {
    tx: mpsc::Sender<ReconcilerMessage>,
}

impl PaymentReconcilerHandle {
    pub async fn run_now(&self) -> Result<TickReport, ActorError> {
        let (reply, mut rx) = mpsc::channel(1);
        self.tx.send(ReconcilerMessage::RunNow { reply }).await?;
        rx.recv().await.ok_or(ActorError::NoResponse)
    }

    pub async fn stats(&self) -> Result<ReconcilerStats, ActorError> {
        let (reply, mut rx) = mpsc::channel(1);
        self.tx.send(ReconcilerMessage::GetStats { reply }).await?;
        rx.recv().await.ok_or(ActorError::NoResponse)
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(ReconcilerMessage::Shutdown).await;
    }
}

pub struct PaymentReconciler {
    config: ReconcilerConfig,
    store: Arc<dyn StateStore>,
    ledger: Arc<dyn LedgerClient>,
    write_lock: PaymentWriteLock,
    stats: ReconcilerStats,
}

impl PaymentReconciler {
    pub fn new(
        config: ReconcilerConfig,
        store: Arc<dyn StateStore>,
        ledger: Arc<dyn LedgerClient>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            write_lock: PaymentWriteLock::default(),
            stats: ReconcilerStats::default(),
        }
    }

    /// Share the payment desk's write lock.
    pub fn with_write_lock(mut self, write_lock: PaymentWriteLock) -> Self {
        self.write_lock = write_lock;
        self
    }

    /// Spawn a reconciler with its own write lock.
    pub fn spawn(
        config: ReconcilerConfig,
        store: Arc<dyn StateStore>,
        ledger: Arc<dyn LedgerClient>,
    ) -> PaymentReconcilerHandle {
        Self::new(config, store, ledger).start()
    }

    /// Run the actor. The first tick fires immediately.
    pub fn start(self) -> PaymentReconcilerHandle {
        let (tx, rx) = mpsc::channel(RECONCILER_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            self.run(rx).await;
        });

        info!("PaymentReconciler spawned");
        PaymentReconcilerHandle { tx }
    }

    /// Main actor loop
    async fn run(mut self, mut rx: mpsc::Receiver<ReconcilerMessage>) {
        let period = self.config.poll_interval;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("PaymentReconciler started (every {:?})", period);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(ReconcilerMessage::RunNow { reply }) => {
                        let report = self.tick().await;
                        if let Err(e) = reply.send(report).await {
                            error!("Failed to send RunNow reply: {:?}", e);
                        }
                    }
                    Some(ReconcilerMessage::GetStats { reply }) => {
                        if let Err(e) = reply.send(self.stats.clone()).await {
                            error!("Failed to send GetStats reply: {:?}", e);
                        }
                    }
                    Some(ReconcilerMessage::Shutdown) | None => {
                        info!("PaymentReconciler shutting down");
                        break;
                    }
                },
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One pass over every payment record.
    pub async fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        self.stats.ticks += 1;
        self.stats.last_tick = Some(Utc::now());

        let records = match self.store.list(paths::PAYMENTS).await {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to list payment records: {}", e);
                report.errors += 1;
                self.stats.record_errors += 1;
                return report;
            }
        };

        for (tenant_id, value) in records {
            report.examined += 1;
            match self.process_record(&tenant_id, value).await {
                Ok(PaymentOutcome::StillPending) => report.still_pending += 1,
                Ok(PaymentOutcome::Expired) => report.expired += 1,
                Ok(PaymentOutcome::Completed { credited, .. }) => {
                    report.confirmed += 1;
                    if credited {
                        report.credited += 1;
                    }
                }
                Ok(PaymentOutcome::Credited) => report.credited += 1,
                Ok(PaymentOutcome::Settled) => {}
                Err(RecordError::Superseded(payment_id)) => {
                    info!(
                        "Payment {} for tenant {} was replaced by a new request, left alone",
                        payment_id, tenant_id
                    );
                    report.superseded += 1;
                }
                Err(e) => {
                    warn!("Payment for tenant {} not processed: {}", tenant_id, e);
                    report.errors += 1;
                    self.stats.record_errors += 1;
                }
            }
        }

        if report.confirmed + report.expired + report.errors > 0 {
            info!(
                "Payment tick: {} examined, {} confirmed, {} expired, {} errors",
                report.examined, report.confirmed, report.expired, report.errors
            );
        }
        report
    }

    async fn process_record(
        &mut self,
        tenant_id: &str,
        value: Value,
    ) -> Result<PaymentOutcome, RecordError> {
        let mut record: PaymentRecord =
            serde_json::from_value(value).map_err(|e| StoreError::Serialization {
                path: paths::payment(tenant_id),
                reason: e.to_string(),
            })?;

        if record.awaiting_subscription_credit() {
            self.credit_subscription(tenant_id, &mut record).await?;
            return Ok(PaymentOutcome::Credited);
        }
        if !record.is_pending() {
            return Ok(PaymentOutcome::Settled);
        }

        let now = Utc::now();
        if record.is_past_deadline(now, self.config.payment_ttl) {
            record.expire(now);
            self.commit(tenant_id, &record, PaymentStatus::Pending).await?;
            self.stats.expired += 1;
            info!(
                "Payment {} for tenant {} expired unpaid",
                record.payment_id, tenant_id
            );
            return Ok(PaymentOutcome::Expired);
        }

        let ledger = self.ledger.clone();
        let address = record.deposit_address.clone();
        let balance = retry_with_backoff(
            "ledger balance query",
            &self.config.ledger_backoff,
            LedgerError::is_transient,
            || ledger.balance_of(&address),
        )
        .await?;

        if balance < record.expected_amount {
            debug!(
                "Payment {} for tenant {}: {} of {} received",
                record.payment_id, tenant_id, balance, record.expected_amount
            );
            return Ok(PaymentOutcome::StillPending);
        }

        let Some(sweep_key) = record.complete(balance, now) else {
            return Ok(PaymentOutcome::Settled);
        };

        // The stored record loses its key here; if this write fails the record stays
        // pending with its key and the next tick starts over.
        self.commit(tenant_id, &record, PaymentStatus::Pending).await?;
        self.stats.confirmed += 1;
        info!(
            "Payment {} for tenant {} confirmed: {:.2} USDT",
            record.payment_id,
            tenant_id,
            base_units_to_usdt(balance)
        );

        let credited = match self.credit_subscription(tenant_id, &mut record).await {
            Ok(()) => true,
            Err(e @ RecordError::Superseded(_)) => return Err(e),
            Err(e) => {
                error!(
                    "Subscription credit for tenant {} failed, will retry: {}",
                    tenant_id, e
                );
                false
            }
        };

        let swept = self.sweep(tenant_id, &mut record, sweep_key, balance).await;
        Ok(PaymentOutcome::Completed { credited, swept })
    }

    /// Grant the Pro period bought by `record` and mark the payment as credited.
    ///
    /// The tenant's subscription remembers which payment granted it, so a retry
    /// after a failed payment write does not grant the period twice.
    async fn credit_subscription(
        &mut self,
        tenant_id: &str,
        record: &mut PaymentRecord,
    ) -> Result<(), RecordError> {
        let tenant_path = paths::tenant(tenant_id);
        let mut tenant: TenantRecord = self.store.read_as(&tenant_path).await?.unwrap_or_default();

        let already_granted = tenant
            .subscription
            .as_ref()
            .map(|s| s.granted_by(&record.payment_id))
            .unwrap_or(false);
        if already_granted {
            debug!(
                "Payment {} already granted tenant {} its period",
                record.payment_id, tenant_id
            );
        } else {
            let confirmed_at = record.completed_at.unwrap_or_else(Utc::now);
            let subscription = Subscription::pro_from_payment(
                &record.payment_id,
                confirmed_at,
                self.config.subscription_extension,
            );
            info!(
                "Tenant {} upgraded to pro until {}",
                tenant_id,
                subscription.expires_at.to_rfc3339()
            );
            tenant.subscription = Some(subscription);
            self.store.write_as(&tenant_path, &tenant).await?;
        }

        record.subscription_credited = true;
        self.commit(tenant_id, record, PaymentStatus::Completed).await?;
        self.stats.credited += 1;
        Ok(())
    }

    /// Write `record` if the stored record is still the same payment in the
    /// `expected` status.
    async fn commit(
        &self,
        tenant_id: &str,
        record: &PaymentRecord,
        expected: PaymentStatus,
    ) -> Result<(), RecordError> {
        let path = paths::payment(tenant_id);
        let _guard = self.write_lock.lock().await;

        let stored: Option<PaymentRecord> = self.store.read_as(&path).await?;
        match stored {
            Some(stored) if stored.payment_id == record.payment_id && stored.status() == expected => {
                self.store.write_as(&path, record).await?;
                Ok(())
            }
            _ => Err(RecordError::Superseded(record.payment_id.clone())),
        }
    }

    /// Move the deposit to the treasury. Consumes the key so it is wiped on return.
    async fn sweep(
        &mut self,
        tenant_id: &str,
        record: &mut PaymentRecord,
        sweep_key: Option<SweepKey>,
        amount: u64,
    ) -> bool {
        let Some(key) = sweep_key else {
            warn!(
                "Payment {} for tenant {} has no sweep key; funds stay at {}",
                record.payment_id, tenant_id, record.deposit_address
            );
            self.stats.sweep_failures += 1;
            return false;
        };
        let Some(treasury) = self.config.treasury_address.clone() else {
            warn!(
                "No treasury configured; payment {} for tenant {} left at {}",
                record.payment_id, tenant_id, record.deposit_address
            );
            self.stats.sweep_failures += 1;
            return false;
        };

        let result = self
            .ledger
            .transfer(&record.deposit_address, &key, &treasury, amount)
            .await;
        drop(key);

        match result {
            Ok(tx_id) => {
                info!(
                    "Swept {:.2} USDT for tenant {} to treasury (tx {})",
                    base_units_to_usdt(amount),
                    tenant_id,
                    tx_id
                );
                self.stats.sweeps_completed += 1;
                record.sweep_tx_id = Some(tx_id);
                if let Err(e) = self.commit(tenant_id, record, PaymentStatus::Completed).await {
                    warn!(
                        "Failed to record sweep tx for tenant {}: {}",
                        tenant_id, e
                    );
                }
                true
            }
            Err(e) => {
                error!(
                    "Sweep of payment {} for tenant {} failed, needs manual recovery: {}",
                    record.payment_id, tenant_id, e
                );
                self.stats.sweep_failures += 1;
                false
            }
        }
    }
}
