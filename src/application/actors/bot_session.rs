//! Bot Session Actor
//!
//! One task per active tenant. The session checks the tenant's exchange
//! credentials, opens market data subscriptions for every allowed pair, feeds
//! closed candles into its own indicator engine and dispatches at most one order
//! per cooldown window.
//!
//! Lifecycle: `Connecting -> Streaming <-> Signaling`, ending in `Stopped` (stop
//! requested) or `Errored` (credentials refused, market data lost). Every
//! transition is written to `sessions/{tenant}` so the tenant-facing side can show
//! it. When the task ends it reports a [`SessionExit`] to the orchestrator.

use crate::application::actors::market_data_client::{MarketDataClient, MarketDataEvent};
use crate::domain::entities::candle::CandleEvent;
use crate::domain::entities::session::{SessionState, SessionStats, SessionStatusRecord};
use crate::domain::entities::tenant::TenantConfig;
use crate::domain::entities::trade::{PositionSizing, TradeRecord, TradeResult, TradeSignal};
use crate::domain::errors::{ActorError, ErrorKind, ExchangeError};
use crate::domain::repositories::market_data_feed::MarketDataFeed;
use crate::domain::repositories::state_store::{paths, StateStore, StateStoreExt};
use crate::domain::services::indicators::{IndicatorEngine, IndicatorSnapshot};
use crate::domain::services::order_executor::OrderExecutor;
use crate::task_runner::BackoffPolicy;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const SESSION_CHANNEL_CAPACITY: usize = 32;

/// Session-wide knobs that do not come from the tenant record
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub cooldown: Duration,
    pub history_capacity: usize,
    pub feed_backoff: BackoffPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            history_capacity: 100,
            feed_backoff: BackoffPolicy::default(),
        }
    }
}

/// Sent to the orchestrator when a session task ends
#[derive(Debug, Clone, PartialEq)]
pub struct SessionExit {
    pub tenant_id: String,
    /// Distinguishes successive sessions of the same tenant
    pub generation: u64,
    pub final_state: SessionState,
    pub reason: Option<String>,
}

/// Point-in-time view of a running session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub tenant_id: String,
    pub state: SessionState,
    pub stats: SessionStats,
    pub open_subscriptions: usize,
    pub tracked_symbols: Vec<String>,
    pub last_dispatch_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
enum SessionMessage {
    GetSnapshot {
        reply: mpsc::Sender<SessionSnapshot>,
    },
}

/// Cloneable handle to a running session
#[derive(Clone)]
pub struct BotSessionHandle {
    tenant_id: String,
    generation: u64,
    tx: mpsc::Sender<SessionMessage>,
    state: watch::Receiver<SessionState>,
    stop: Arc<watch::Sender<bool>>,
}

impl BotSessionHandle {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Ask the session to stop. Never blocks; the exit is reported asynchronously.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, ActorError> {
        let (reply, mut rx) = mpsc::channel(1);
        self.tx.send(SessionMessage::GetSnapshot { reply }).await?;
        rx.recv().await.ok_or(ActorError::NoResponse)
    }

    /// Wait until the session reaches a terminal state.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return *state.borrow();
            }
        }
    }
}

struct DispatchOutcome {
    signal: TradeSignal,
    snapshot: IndicatorSnapshot,
    result: Result<TradeResult, ExchangeError>,
}

/// How the main loop ended
enum Termination {
    Stopped,
    Errored(String),
}

pub struct BotSession {
    tenant: TenantConfig,
    generation: u64,
    settings: SessionSettings,
    executor: Arc<OrderExecutor>,
    feed: Arc<dyn MarketDataFeed>,
    store: Arc<dyn StateStore>,
    engine: IndicatorEngine,
    stats: SessionStats,
    state_tx: watch::Sender<SessionState>,
    last_dispatch: Option<Instant>,
    last_dispatch_at: Option<DateTime<Utc>>,
    dispatch_in_flight: bool,
    pending_subscriptions: HashSet<String>,
}

impl BotSession {
    /// Spawn a session task for `tenant`.
    ///
    /// # Arguments
    /// * `generation` - Identifier echoed back in the [`SessionExit`]
    /// * `exits` - Where the exit notification is sent
    pub fn spawn(
        tenant: TenantConfig,
        generation: u64,
        settings: SessionSettings,
        executor: OrderExecutor,
        feed: Arc<dyn MarketDataFeed>,
        store: Arc<dyn StateStore>,
        exits: mpsc::Sender<SessionExit>,
    ) -> BotSessionHandle {
        let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SessionState::Stopped);
        let (stop_tx, stop_rx) = watch::channel(false);
        let tenant_id = tenant.tenant_id.clone();

        let session = Self {
            engine: IndicatorEngine::new(settings.history_capacity),
            pending_subscriptions: tenant.allowed_pairs.iter().cloned().collect(),
            tenant,
            generation,
            settings,
            executor: Arc::new(executor),
            feed,
            store,
            stats: SessionStats::default(),
            state_tx,
            last_dispatch: None,
            last_dispatch_at: None,
            dispatch_in_flight: false,
        };

        tokio::spawn(session.run(rx, stop_rx, exits));

        info!("BotSession spawned for tenant: {}", tenant_id);
        BotSessionHandle {
            tenant_id,
            generation,
            tx,
            state: state_rx,
            stop: Arc::new(stop_tx),
        }
    }

    /// Main session loop
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<SessionMessage>,
        mut stop: watch::Receiver<bool>,
        exits: mpsc::Sender<SessionExit>,
    ) {
        let tenant_id = self.tenant.tenant_id.clone();
        self.transition(SessionState::Connecting, None).await;

        let termination = match self.check_credentials(&mut stop).await {
            Some(termination) => termination,
            None => self.stream(&mut rx, &mut stop).await,
        };

        self.engine.clear();
        let (final_state, reason) = match termination {
            Termination::Stopped => (SessionState::Stopped, None),
            Termination::Errored(reason) => {
                error!("Session for tenant {} errored: {}", tenant_id, reason);
                (SessionState::Errored, Some(reason))
            }
        };
        self.transition(final_state, reason.clone()).await;

        info!(
            "BotSession for tenant {} finished as {} ({} candles, {} trades dispatched)",
            tenant_id, final_state, self.stats.candles_processed, self.stats.trades_dispatched
        );

        let exit = SessionExit {
            tenant_id,
            generation: self.generation,
            final_state,
            reason,
        };
        if exits.send(exit).await.is_err() {
            debug!("Orchestrator gone before session exit was reported");
        }
    }

    /// Connection test at session start. `None` means the session may proceed.
    async fn check_credentials(&mut self, stop: &mut watch::Receiver<bool>) -> Option<Termination> {
        let executor = self.executor.clone();
        let result = tokio::select! {
            _ = wait_for_stop(stop) => return Some(Termination::Stopped),
            result = executor.test_connection() => result,
        };

        match result {
            Ok(true) => None,
            Ok(false) => Some(Termination::Errored(format!(
                "Connection test against {} failed",
                executor.exchange_name()
            ))),
            Err(e) => Some(Termination::Errored(format!(
                "Exchange rejected credentials: {}",
                e
            ))),
        }
    }

    async fn stream(
        &mut self,
        rx: &mut mpsc::Receiver<SessionMessage>,
        stop: &mut watch::Receiver<bool>,
    ) -> Termination {
        let (market, mut events) = MarketDataClient::start(
            self.feed.clone(),
            &self.tenant.allowed_pairs,
            &self.tenant.timeframe,
            self.settings.feed_backoff.clone(),
        );
        let (dispatch_tx, mut dispatch_rx) = mpsc::channel::<DispatchOutcome>(1);

        let termination = loop {
            tokio::select! {
                _ = wait_for_stop(stop) => break Termination::Stopped,

                msg = rx.recv() => match msg {
                    Some(SessionMessage::GetSnapshot { reply }) => {
                        let snapshot = self.snapshot(&market);
                        if let Err(e) = reply.send(snapshot).await {
                            error!("Failed to send GetSnapshot reply: {:?}", e);
                        }
                    }
                    // Every handle dropped: nobody can stop us any more
                    None => break Termination::Stopped,
                },

                event = events.recv() => match event {
                    Some(MarketDataEvent::Subscribed { symbol }) => {
                        self.pending_subscriptions.remove(&symbol);
                        if self.pending_subscriptions.is_empty()
                            && self.current_state() == SessionState::Connecting
                        {
                            self.transition(SessionState::Streaming, None).await;
                        }
                    }
                    Some(MarketDataEvent::Candle(candle)) => {
                        self.on_candle(candle, &dispatch_tx);
                    }
                    Some(MarketDataEvent::Disconnected { symbol, reason }) => {
                        break Termination::Errored(format!(
                            "Market data for {} lost: {}",
                            symbol, reason
                        ));
                    }
                    None => break Termination::Errored("Market data stream closed".to_string()),
                },

                Some(outcome) = dispatch_rx.recv() => {
                    if let Some(termination) = self.on_dispatch_complete(outcome).await {
                        break termination;
                    }
                }
            }
        };

        // An order still in flight finishes on its own task; its outcome is dropped here.
        drop(dispatch_rx);
        drop(events);
        market.shutdown().await;
        termination
    }

    fn on_candle(&mut self, candle: CandleEvent, dispatch_tx: &mpsc::Sender<DispatchOutcome>) {
        self.stats.candles_processed += 1;
        let Some(snapshot) = self.engine.update(&candle.symbol, candle.close) else {
            return;
        };
        let Some(direction) = snapshot.signal() else {
            return;
        };
        self.stats.signals_seen += 1;

        if self.current_state() != SessionState::Streaming || self.dispatch_in_flight {
            self.stats.signals_suppressed += 1;
            return;
        }
        if let Some(last) = self.last_dispatch {
            if last.elapsed() < self.settings.cooldown {
                self.stats.signals_suppressed += 1;
                debug!(
                    "Tenant {}: {:?} signal on {} suppressed by cooldown",
                    self.tenant.tenant_id, direction, candle.symbol
                );
                return;
            }
        }

        let signal = TradeSignal::market(
            &candle.symbol,
            direction,
            PositionSizing {
                position_size_percent: self.tenant.position_size_percent,
                leverage: self.tenant.leverage,
                reference_price: snapshot.price,
            },
        );
        info!(
            "Tenant {}: dispatching {:?} on {} at {:.2} (ema9={:.2} ema21={:.2} ema50={:.2})",
            self.tenant.tenant_id,
            direction,
            candle.symbol,
            snapshot.price,
            snapshot.ema9,
            snapshot.ema21,
            snapshot.ema50
        );

        // The cooldown window opens at dispatch time so a slow order cannot let a second one through.
        self.last_dispatch = Some(Instant::now());
        self.last_dispatch_at = Some(Utc::now());
        self.dispatch_in_flight = true;
        self.stats.trades_dispatched += 1;
        self.set_state(SessionState::Signaling);

        let executor = self.executor.clone();
        let dispatch_tx = dispatch_tx.clone();
        tokio::spawn(async move {
            let result = executor.execute(&signal).await;
            let _ = dispatch_tx
                .send(DispatchOutcome {
                    signal,
                    snapshot,
                    result,
                })
                .await;
        });
    }

    async fn on_dispatch_complete(&mut self, outcome: DispatchOutcome) -> Option<Termination> {
        self.dispatch_in_flight = false;
        let tenant_id = self.tenant.tenant_id.clone();

        let result = match outcome.result {
            Ok(result) => result,
            Err(e) if e.kind() == ErrorKind::Credential => {
                return Some(Termination::Errored(format!(
                    "Exchange rejected credentials: {}",
                    e
                )));
            }
            Err(e) => {
                warn!("Tenant {}: order dispatch failed: {}", tenant_id, e);
                TradeResult::from(e)
            }
        };

        if result.success {
            info!(
                "Tenant {}: order placed on {} (order_id={})",
                tenant_id,
                outcome.signal.symbol,
                result.order_id.as_deref().unwrap_or("-")
            );
        } else {
            self.stats.trades_failed += 1;
            warn!(
                "Tenant {}: order on {} failed: {}",
                tenant_id,
                outcome.signal.symbol,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }

        let record = TradeRecord::new(&tenant_id, outcome.signal, result, outcome.snapshot);
        let path = paths::trade(&tenant_id, &record.id);
        if let Err(e) = self.store.write_as(&path, &record).await {
            error!("Tenant {}: failed to persist trade {}: {}", tenant_id, record.id, e);
        }

        self.set_state(SessionState::Streaming);
        None
    }

    fn snapshot(&self, market: &MarketDataClient) -> SessionSnapshot {
        let mut stats = self.stats.clone();
        stats.partial_candles_dropped = market.partial_candles_dropped();
        SessionSnapshot {
            tenant_id: self.tenant.tenant_id.clone(),
            state: self.current_state(),
            stats,
            open_subscriptions: market.open_subscriptions(),
            tracked_symbols: self.engine.tracked_symbols(),
            last_dispatch_at: self.last_dispatch_at,
        }
    }

    fn current_state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Streaming and Signaling alternate per order; they are not persisted.
    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    async fn transition(&self, state: SessionState, message: Option<String>) {
        debug!("Tenant {} session -> {}", self.tenant.tenant_id, state);
        self.set_state(state);

        let record = SessionStatusRecord::new(state, message);
        let path = paths::session(&self.tenant.tenant_id);
        if let Err(e) = self.store.write_as(&path, &record).await {
            warn!(
                "Failed to write session status for tenant {}: {}",
                self.tenant.tenant_id, e
            );
        }
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            // Every handle dropped
            return;
        }
    }
}
