//! Orchestrator Actor
//!
//! Sole owner of the tenant -> session mapping. All starts and stops happen inside
//! this actor's loop, so two sessions for one tenant can never be live at once.
//!
//! Inputs:
//! - per-record changes from `watch("tenants")`
//! - a periodic full rescan (subscription expiry, missed notifications)
//! - exit notifications from sessions
//! - [`OrchestratorMessage`] commands
//!
//! Stopping never blocks the loop: a stopped session moves to `Stopping` and its
//! slot is only freed once its exit notification arrives.

use crate::application::actors::bot_session::{
    BotSession, BotSessionHandle, SessionExit, SessionSettings,
};
use crate::domain::entities::session::{SessionState, SessionStatusRecord};
use crate::domain::entities::tenant::{TenantConfig, TenantRecord};
use crate::domain::errors::{ActorError, ExchangeError};
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::repositories::market_data_feed::MarketDataFeed;
use crate::domain::repositories::state_store::{paths, RecordChange, StateStore, StateStoreExt};
use crate::domain::services::order_executor::OrderExecutor;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const ORCHESTRATOR_CHANNEL_CAPACITY: usize = 100;
const EXIT_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds a tenant's exchange client from that tenant's own credentials.
pub trait ExchangeClientFactory: Send + Sync {
    fn create(&self, tenant: &TenantConfig) -> Result<Arc<dyn ExchangeClient>, ExchangeError>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub rescan_interval: Duration,
    pub session: SessionSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            rescan_interval: Duration::from_secs(30),
            session: SessionSettings::default(),
        }
    }
}

/// What one reconciliation step did for a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    Started,
    Stopped,
    /// Configuration changed; the running session was stopped and a new one
    /// starts when its exit is observed
    Restarting,
    Unchanged,
    /// Session could not be created (e.g. unusable credentials)
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub started: usize,
    pub stopped: usize,
    pub failed: usize,
}

impl ReconcileReport {
    fn record(&mut self, action: SessionAction) {
        self.examined += 1;
        match action {
            SessionAction::Started => self.started += 1,
            SessionAction::Stopped | SessionAction::Restarting => self.stopped += 1,
            SessionAction::Failed => self.failed += 1,
            SessionAction::Unchanged => {}
        }
    }
}

/// Registry entry as seen from outside
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub tenant_id: String,
    pub state: SessionState,
    pub stopping: bool,
}

/// Messages that can be sent to the orchestrator
#[derive(Debug)]
pub enum OrchestratorMessage {
    /// Re-read every tenant record and reconcile
    ReconcileAll {
        reply: mpsc::Sender<ReconcileReport>,
    },
    /// Re-read one tenant record and reconcile it
    ReconcileTenant {
        tenant_id: String,
        reply: mpsc::Sender<SessionAction>,
    },
    /// List registry entries
    ActiveSessions {
        reply: mpsc::Sender<Vec<SessionSummary>>,
    },
    /// Stop every session and wait for them to exit
    Shutdown { reply: mpsc::Sender<()> },
}

enum SessionSlot {
    Live {
        handle: BotSessionHandle,
        config: TenantConfig,
    },
    Stopping {
        handle: BotSessionHandle,
    },
    /// Not retried until the configuration changes or the tenant is deactivated
    Errored { config: TenantConfig },
}

/// Cloneable handle to the orchestrator actor
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorMessage>,
}

impl OrchestratorHandle {
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, ActorError> {
        let (reply, mut rx) = mpsc::channel(1);
        self.tx.send(OrchestratorMessage::ReconcileAll { reply }).await?;
        rx.recv().await.ok_or(ActorError::NoResponse)
    }

    pub async fn reconcile_tenant(&self, tenant_id: &str) -> Result<SessionAction, ActorError> {
        let (reply, mut rx) = mpsc::channel(1);
        self.tx
            .send(OrchestratorMessage::ReconcileTenant {
                tenant_id: tenant_id.to_string(),
                reply,
            })
            .await?;
        rx.recv().await.ok_or(ActorError::NoResponse)
    }

    pub async fn active_sessions(&self) -> Result<Vec<SessionSummary>, ActorError> {
        let (reply, mut rx) = mpsc::channel(1);
        self.tx.send(OrchestratorMessage::ActiveSessions { reply }).await?;
        rx.recv().await.ok_or(ActorError::NoResponse)
    }

    pub async fn shutdown(&self) -> Result<(), ActorError> {
        let (reply, mut rx) = mpsc::channel(1);
        self.tx.send(OrchestratorMessage::Shutdown { reply }).await?;
        rx.recv().await.ok_or(ActorError::NoResponse)
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn StateStore>,
    feed: Arc<dyn MarketDataFeed>,
    factory: Arc<dyn ExchangeClientFactory>,
    slots: HashMap<String, SessionSlot>,
    exits_tx: mpsc::Sender<SessionExit>,
    next_generation: u64,
}

impl Orchestrator {
    /// Spawn the orchestrator actor.
    ///
    /// Nothing starts until the first rescan tick, which fires immediately.
    pub fn spawn(
        config: OrchestratorConfig,
        store: Arc<dyn StateStore>,
        feed: Arc<dyn MarketDataFeed>,
        factory: Arc<dyn ExchangeClientFactory>,
    ) -> OrchestratorHandle {
        let (tx, rx) = mpsc::channel(ORCHESTRATOR_CHANNEL_CAPACITY);
        let (exits_tx, exits_rx) = mpsc::channel(EXIT_CHANNEL_CAPACITY);

        let actor = Self {
            config,
            store,
            feed,
            factory,
            slots: HashMap::new(),
            exits_tx,
            next_generation: 1,
        };

        tokio::spawn(async move {
            actor.run(rx, exits_rx).await;
        });

        info!("Orchestrator spawned");
        OrchestratorHandle { tx }
    }

    /// Main actor loop
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<OrchestratorMessage>,
        mut exits_rx: mpsc::Receiver<SessionExit>,
    ) {
        let mut changes = match self.store.watch(paths::TENANTS).await {
            Ok(changes) => Some(changes),
            Err(e) => {
                error!("Cannot watch tenant records, relying on rescans only: {}", e);
                None
            }
        };
        let mut rescan = tokio::time::interval(self.config.rescan_interval);
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Orchestrator started (rescan every {:?})",
            self.config.rescan_interval
        );

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(OrchestratorMessage::ReconcileAll { reply }) => {
                        let report = self.reconcile_all().await;
                        if let Err(e) = reply.send(report).await {
                            error!("Failed to send ReconcileAll reply: {:?}", e);
                        }
                    }
                    Some(OrchestratorMessage::ReconcileTenant { tenant_id, reply }) => {
                        let config = self.load_tenant(&tenant_id).await;
                        let action = self.reconcile_tenant(&tenant_id, config);
                        if let Err(e) = reply.send(action).await {
                            error!("Failed to send ReconcileTenant reply: {:?}", e);
                        }
                    }
                    Some(OrchestratorMessage::ActiveSessions { reply }) => {
                        if let Err(e) = reply.send(self.summaries()).await {
                            error!("Failed to send ActiveSessions reply: {:?}", e);
                        }
                    }
                    Some(OrchestratorMessage::Shutdown { reply }) => {
                        self.shutdown_sessions(&mut exits_rx).await;
                        let _ = reply.send(()).await;
                        break;
                    }
                    None => {
                        self.shutdown_sessions(&mut exits_rx).await;
                        break;
                    }
                },

                Some(exit) = exits_rx.recv() => {
                    self.on_session_exit(exit).await;
                }

                change = next_change(&mut changes) => match change {
                    Some(change) => {
                        let config = parse_tenant(&change.id, change.value);
                        self.reconcile_tenant(&change.id, config);
                    }
                    None => {
                        warn!("Tenant change stream closed, relying on rescans only");
                        changes = None;
                    }
                },

                _ = rescan.tick() => {
                    let report = self.reconcile_all().await;
                    if report.started + report.stopped + report.failed > 0 {
                        info!(
                            "Rescan: {} tenants, {} started, {} stopped, {} failed",
                            report.examined, report.started, report.stopped, report.failed
                        );
                    }
                }
            }
        }

        info!("Orchestrator stopped");
    }

    async fn reconcile_all(&mut self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let records = match self.store.list(paths::TENANTS).await {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to list tenants: {}", e);
                return report;
            }
        };

        let mut seen = Vec::with_capacity(records.len());
        for (tenant_id, value) in records {
            let config = parse_tenant(&tenant_id, value);
            report.record(self.reconcile_tenant(&tenant_id, config));
            seen.push(tenant_id);
        }

        // Tenants whose records disappeared
        let orphaned: Vec<String> = self
            .slots
            .keys()
            .filter(|id| !seen.contains(id))
            .cloned()
            .collect();
        for tenant_id in orphaned {
            report.record(self.reconcile_tenant(&tenant_id, None));
        }

        report
    }

    /// Bring one tenant's registry entry in line with its desired state.
    ///
    /// `config` is `None` when the record is missing or unreadable, which counts
    /// as "should not run".
    fn reconcile_tenant(&mut self, tenant_id: &str, config: Option<TenantConfig>) -> SessionAction {
        let now = Utc::now();
        let desired = config.filter(|c| c.should_run(now));

        match (self.slots.remove(tenant_id), desired) {
            (None, None) => SessionAction::Unchanged,

            (None, Some(config)) => self.start_session(config),

            (Some(SessionSlot::Live { handle, config: running }), Some(config)) => {
                if running.same_session_settings(&config) {
                    // Subscription renewals and the like leave the session alone
                    self.slots
                        .insert(tenant_id.to_string(), SessionSlot::Live { handle, config });
                    SessionAction::Unchanged
                } else {
                    info!("Configuration changed for tenant {}, restarting session", tenant_id);
                    handle.stop();
                    self.slots
                        .insert(tenant_id.to_string(), SessionSlot::Stopping { handle });
                    SessionAction::Restarting
                }
            }

            (Some(SessionSlot::Live { handle, .. }), None) => {
                info!("Stopping session for tenant {}", tenant_id);
                handle.stop();
                self.slots
                    .insert(tenant_id.to_string(), SessionSlot::Stopping { handle });
                SessionAction::Stopped
            }

            // Re-evaluated when the exit arrives
            (Some(slot @ SessionSlot::Stopping { .. }), _) => {
                self.slots.insert(tenant_id.to_string(), slot);
                SessionAction::Unchanged
            }

            (Some(SessionSlot::Errored { config: failed }), Some(config)) => {
                if failed.same_session_settings(&config) {
                    self.slots
                        .insert(tenant_id.to_string(), SessionSlot::Errored { config: failed });
                    SessionAction::Unchanged
                } else {
                    info!("Configuration changed for errored tenant {}, retrying", tenant_id);
                    self.start_session(config)
                }
            }

            // Deactivated: forget the error so a later activation starts fresh
            (Some(SessionSlot::Errored { .. }), None) => SessionAction::Unchanged,
        }
    }

    fn start_session(&mut self, config: TenantConfig) -> SessionAction {
        let tenant_id = config.tenant_id.clone();
        let client = match self.factory.create(&config) {
            Ok(client) => client,
            Err(e) => {
                error!("Cannot create exchange client for tenant {}: {}", tenant_id, e);
                self.write_status_detached(
                    &tenant_id,
                    SessionStatusRecord::new(SessionState::Errored, Some(e.to_string())),
                );
                self.slots.insert(tenant_id, SessionSlot::Errored { config });
                return SessionAction::Failed;
            }
        };

        let generation = self.next_generation;
        self.next_generation += 1;

        let handle = BotSession::spawn(
            config.clone(),
            generation,
            self.config.session.clone(),
            OrderExecutor::new(client),
            self.feed.clone(),
            self.store.clone(),
            self.exits_tx.clone(),
        );
        info!(
            "Started session for tenant {} ({} pair(s) at {})",
            tenant_id,
            config.allowed_pairs.len(),
            config.timeframe
        );
        self.slots
            .insert(tenant_id, SessionSlot::Live { handle, config });
        SessionAction::Started
    }

    async fn on_session_exit(&mut self, exit: SessionExit) {
        let tenant_id = exit.tenant_id.clone();
        let slot = match self.slots.remove(&tenant_id) {
            Some(slot) => slot,
            None => {
                debug!("Exit for untracked tenant {} ignored", tenant_id);
                return;
            }
        };

        match slot {
            SessionSlot::Live { handle, config } if handle.generation() == exit.generation => {
                // Ended without being asked to
                warn!(
                    "Session for tenant {} ended as {}: {}",
                    tenant_id,
                    exit.final_state,
                    exit.reason.as_deref().unwrap_or("no reason given")
                );
                if exit.final_state == SessionState::Errored {
                    self.slots.insert(tenant_id, SessionSlot::Errored { config });
                } else {
                    let config = self.load_tenant(&tenant_id).await;
                    self.reconcile_tenant(&tenant_id, config);
                }
            }
            SessionSlot::Stopping { handle } if handle.generation() == exit.generation => {
                debug!("Session for tenant {} stopped", tenant_id);
                // Desired state may have flipped back while it was stopping
                let config = self.load_tenant(&tenant_id).await;
                self.reconcile_tenant(&tenant_id, config);
            }
            other => {
                debug!("Stale exit for tenant {} ignored", tenant_id);
                self.slots.insert(tenant_id, other);
            }
        }
    }

    async fn shutdown_sessions(&mut self, exits_rx: &mut mpsc::Receiver<SessionExit>) {
        let mut waiting = 0usize;
        for slot in self.slots.values() {
            match slot {
                SessionSlot::Live { handle, .. } | SessionSlot::Stopping { handle } => {
                    handle.stop();
                    waiting += 1;
                }
                SessionSlot::Errored { .. } => {}
            }
        }
        info!("Stopping {} session(s)", waiting);

        let drained = timeout(SHUTDOWN_TIMEOUT, async {
            while waiting > 0 {
                match exits_rx.recv().await {
                    Some(exit) => {
                        debug!("Session for tenant {} exited during shutdown", exit.tenant_id);
                        waiting -= 1;
                    }
                    None => break,
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("Timed out waiting for sessions to stop");
        }
        self.slots.clear();
    }

    fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .slots
            .iter()
            .map(|(tenant_id, slot)| match slot {
                SessionSlot::Live { handle, .. } => SessionSummary {
                    tenant_id: tenant_id.clone(),
                    state: handle.state(),
                    stopping: false,
                },
                SessionSlot::Stopping { handle } => SessionSummary {
                    tenant_id: tenant_id.clone(),
                    state: handle.state(),
                    stopping: true,
                },
                SessionSlot::Errored { .. } => SessionSummary {
                    tenant_id: tenant_id.clone(),
                    state: SessionState::Errored,
                    stopping: false,
                },
            })
            .collect();
        summaries.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        summaries
    }

    async fn load_tenant(&self, tenant_id: &str) -> Option<TenantConfig> {
        match self.store.read(&paths::tenant(tenant_id)).await {
            Ok(Some(value)) => parse_tenant(tenant_id, value),
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read tenant {}: {}", tenant_id, e);
                None
            }
        }
    }

    /// Status writes from the actor loop must not wait on the store.
    fn write_status_detached(&self, tenant_id: &str, record: SessionStatusRecord) {
        let store = self.store.clone();
        let path = paths::session(tenant_id);
        tokio::spawn(async move {
            if let Err(e) = store.write_as(&path, &record).await {
                warn!("Failed to write {}: {}", path, e);
            }
        });
    }
}

fn parse_tenant(tenant_id: &str, value: Value) -> Option<TenantConfig> {
    let record: TenantRecord = match serde_json::from_value(value) {
        Ok(record) => record,
        Err(e) => {
            warn!("Unreadable record for tenant {}: {}", tenant_id, e);
            return None;
        }
    };
    match TenantConfig::from_record(tenant_id, &record) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("Invalid bot settings for tenant {}: {}", tenant_id, e);
            None
        }
    }
}

async fn next_change(changes: &mut Option<mpsc::Receiver<RecordChange>>) -> Option<RecordChange> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
