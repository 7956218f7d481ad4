use super::mocks::{
    eventually, eventually_async, rising_candles, tenant_config, MockExchange, MockFeed,
};
use crate::application::actors::bot_session::{
    BotSession, BotSessionHandle, SessionExit, SessionSettings, SessionSnapshot,
};
use crate::domain::entities::candle::CandleEvent;
use crate::domain::entities::session::{SessionState, SessionStatusRecord};
use crate::domain::entities::trade::TradeRecord;
use crate::domain::errors::ExchangeError;
use crate::domain::repositories::state_store::{paths, StateStore, StateStoreExt};
use crate::domain::services::order_executor::OrderExecutor;
use crate::infrastructure::memory_store::InMemoryStateStore;
use crate::task_runner::BackoffPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const TENANT: &str = "tenant-1";

struct Harness {
    handle: BotSessionHandle,
    exchange: Arc<MockExchange>,
    feed: Arc<MockFeed>,
    store: Arc<InMemoryStateStore>,
    exits: mpsc::Receiver<SessionExit>,
}

fn settings() -> SessionSettings {
    SessionSettings {
        cooldown: Duration::from_secs(300),
        history_capacity: 100,
        feed_backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 2),
    }
}

fn spawn_with(exchange: MockExchange, feed: MockFeed, pairs: &[&str]) -> Harness {
    let exchange = Arc::new(exchange);
    let feed = Arc::new(feed);
    let store = Arc::new(InMemoryStateStore::new());
    let (exits_tx, exits) = mpsc::channel(4);

    let handle = BotSession::spawn(
        tenant_config(TENANT, pairs),
        7,
        settings(),
        OrderExecutor::new(exchange.clone()),
        feed.clone(),
        store.clone(),
        exits_tx,
    );

    Harness {
        handle,
        exchange,
        feed,
        store,
        exits,
    }
}

fn spawn_session(pairs: &[&str]) -> Harness {
    spawn_with(MockExchange::new(), MockFeed::new(), pairs)
}

async fn wait_for_state(handle: &BotSessionHandle, wanted: SessionState) {
    let mut states = handle.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *states.borrow_and_update() != wanted {
            if states.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session never reached {}", wanted));
    assert_eq!(handle.state(), wanted);
}

async fn wait_for_candles(handle: &BotSessionHandle, count: u64) -> SessionSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = handle.snapshot().await.unwrap();
        if snapshot.stats.candles_processed >= count {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {} of {} candles processed",
            snapshot.stats.candles_processed,
            count
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn trades(store: &InMemoryStateStore) -> Vec<TradeRecord> {
    store
        .list(&paths::trades(TENANT))
        .await
        .unwrap()
        .into_iter()
        .map(|(_, value)| serde_json::from_value(value).unwrap())
        .collect()
}

async fn status(store: &InMemoryStateStore) -> SessionStatusRecord {
    store
        .read_as(&paths::session(TENANT))
        .await
        .unwrap()
        .expect("session status written")
}

async fn next_exit(exits: &mut mpsc::Receiver<SessionExit>) -> SessionExit {
    tokio::time::timeout(Duration::from_secs(5), exits.recv())
        .await
        .expect("no session exit within 5s")
        .expect("exit channel closed")
}

#[tokio::test(start_paused = true)]
async fn test_session_reaches_streaming_once_every_pair_is_subscribed() {
    let h = spawn_session(&["BTCUSDT", "ETHUSDT"]);

    wait_for_state(&h.handle, SessionState::Streaming).await;
    assert_eq!(h.feed.open_subscriptions(), 2);
    assert_eq!(status(&h.store).await.state, SessionState::Streaming);

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.tenant_id, TENANT);
    assert_eq!(snapshot.open_subscriptions, 2);

    h.handle.stop();
    h.handle.wait_terminal().await;
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_allows_one_order_per_window() {
    let h = spawn_session(&["BTCUSDT"]);
    wait_for_state(&h.handle, SessionState::Streaming).await;

    // 150 closed candles: signals on the last 100
    for candle in rising_candles("BTCUSDT", 150) {
        h.feed.push(candle).await;
    }
    let snapshot = wait_for_candles(&h.handle, 150).await;

    assert_eq!(snapshot.stats.signals_seen, 100);
    assert_eq!(snapshot.stats.trades_dispatched, 1);
    assert_eq!(snapshot.stats.signals_suppressed, 99);
    assert!(snapshot.last_dispatch_at.is_some());

    eventually_async("trade recorded", || async { trades(&h.store).await.len() == 1 }).await;
    assert_eq!(h.exchange.order_count(), 1);
    let trade = &trades(&h.store).await[0];
    assert!(trade.result.success);
    assert_eq!(trade.signal.symbol, "BTCUSDT");
    assert!(trade.id.starts_with("trade_"));

    // Once the window has passed the next signal goes through
    tokio::time::advance(Duration::from_secs(301)).await;
    h.feed
        .push(CandleEvent::closed("BTCUSDT", "15m", 150 * 60_000, 151 * 60_000 - 1, 250.0))
        .await;
    eventually("second order", || h.exchange.order_count() == 2).await;

    h.handle.stop();
    h.handle.wait_terminal().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_signal_before_fifty_closed_candles() {
    let h = spawn_session(&["BTCUSDT"]);
    wait_for_state(&h.handle, SessionState::Streaming).await;

    for candle in rising_candles("BTCUSDT", 49) {
        h.feed.push(candle).await;
    }
    let snapshot = wait_for_candles(&h.handle, 49).await;
    assert_eq!(snapshot.stats.signals_seen, 0);
    assert_eq!(snapshot.tracked_symbols, vec!["BTCUSDT".to_string()]);
    assert_eq!(h.exchange.order_count(), 0);

    h.handle.stop();
    h.handle.wait_terminal().await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_credentials_error_the_session_before_subscribing() {
    let exchange = MockExchange::new();
    exchange.set_balance_error(Some(ExchangeError::Authentication("Invalid API-key".into())));
    let mut h = spawn_with(exchange, MockFeed::new(), &["BTCUSDT"]);

    assert_eq!(h.handle.wait_terminal().await, SessionState::Errored);
    let exit = next_exit(&mut h.exits).await;
    assert_eq!(exit.tenant_id, TENANT);
    assert_eq!(exit.generation, 7);
    assert_eq!(exit.final_state, SessionState::Errored);
    assert!(exit.reason.unwrap().contains("Invalid API-key"));

    let status = status(&h.store).await;
    assert_eq!(status.state, SessionState::Errored);
    assert!(status.message.is_some());
    assert_eq!(h.feed.subscribe_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_exchange_errors_the_session() {
    let exchange = MockExchange::new();
    exchange.set_ping(false);
    let mut h = spawn_with(exchange, MockFeed::new(), &["BTCUSDT"]);

    assert_eq!(h.handle.wait_terminal().await, SessionState::Errored);
    let exit = next_exit(&mut h.exits).await;
    assert!(exit.reason.unwrap().contains("Connection test"));
}

#[tokio::test(start_paused = true)]
async fn test_credential_error_during_dispatch_errors_the_session() {
    let h = spawn_session(&["BTCUSDT"]);
    wait_for_state(&h.handle, SessionState::Streaming).await;
    h.exchange
        .set_order_error(Some(ExchangeError::Authentication("key revoked".into())));

    for candle in rising_candles("BTCUSDT", 50) {
        h.feed.push(candle).await;
    }

    assert_eq!(h.handle.wait_terminal().await, SessionState::Errored);
    assert_eq!(h.feed.open_subscriptions(), 0);
    assert!(trades(&h.store).await.is_empty());
    assert!(status(&h.store).await.message.unwrap().contains("key revoked"));
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_is_recorded_as_failed_trade() {
    let h = spawn_session(&["BTCUSDT"]);
    wait_for_state(&h.handle, SessionState::Streaming).await;
    h.exchange
        .set_order_error(Some(ExchangeError::Network("connection reset".into())));

    for candle in rising_candles("BTCUSDT", 50) {
        h.feed.push(candle).await;
    }

    eventually_async("failed trade recorded", || async { trades(&h.store).await.len() == 1 }).await;
    let trade = &trades(&h.store).await[0];
    assert!(!trade.result.success);
    assert!(trade.result.error.as_deref().unwrap().contains("connection reset"));

    wait_for_state(&h.handle, SessionState::Streaming).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.stats.trades_failed, 1);

    h.handle.stop();
    assert_eq!(h.handle.wait_terminal().await, SessionState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_order_keeps_streaming() {
    let h = spawn_session(&["BTCUSDT"]);
    wait_for_state(&h.handle, SessionState::Streaming).await;
    h.exchange
        .set_order_error(Some(ExchangeError::Rejected("Margin is insufficient.".into())));

    for candle in rising_candles("BTCUSDT", 50) {
        h.feed.push(candle).await;
    }

    eventually_async("rejected trade recorded", || async { trades(&h.store).await.len() == 1 }).await;
    assert!(!trades(&h.store).await[0].result.success);
    wait_for_state(&h.handle, SessionState::Streaming).await;

    h.handle.stop();
    h.handle.wait_terminal().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_releases_subscriptions_and_reports_exit() {
    let mut h = spawn_session(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
    wait_for_state(&h.handle, SessionState::Streaming).await;
    assert_eq!(h.feed.open_subscriptions(), 3);

    h.handle.stop();
    assert_eq!(h.handle.wait_terminal().await, SessionState::Stopped);

    let exit = next_exit(&mut h.exits).await;
    assert_eq!(exit.final_state, SessionState::Stopped);
    assert_eq!(exit.reason, None);
    assert_eq!(h.feed.open_subscriptions(), 0);
    assert_eq!(status(&h.store).await.state, SessionState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_dispatch_discards_the_outcome() {
    let mut h = spawn_session(&["BTCUSDT"]);
    wait_for_state(&h.handle, SessionState::Streaming).await;
    h.exchange.set_order_delay(Duration::from_secs(2));

    for candle in rising_candles("BTCUSDT", 50) {
        h.feed.push(candle).await;
    }
    wait_for_state(&h.handle, SessionState::Signaling).await;

    h.handle.stop();
    assert_eq!(h.handle.wait_terminal().await, SessionState::Stopped);
    next_exit(&mut h.exits).await;

    // The order itself still completes
    eventually("order placed", || h.exchange.order_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(trades(&h.store).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lost_market_data_errors_the_session() {
    let feed = MockFeed::new();
    feed.reject_symbol("ETHUSDT");
    let mut h = spawn_with(MockExchange::new(), feed, &["BTCUSDT", "ETHUSDT"]);

    assert_eq!(h.handle.wait_terminal().await, SessionState::Errored);
    let exit = next_exit(&mut h.exits).await;
    assert!(exit.reason.unwrap().contains("ETHUSDT"));
    assert_eq!(h.feed.open_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_partial_candles_do_not_feed_indicators() {
    let h = spawn_session(&["BTCUSDT"]);
    wait_for_state(&h.handle, SessionState::Streaming).await;

    for i in 0..60 {
        h.feed
            .push(CandleEvent::partial("BTCUSDT", "15m", 0, 59_999, 100.0 + i as f64))
            .await;
    }
    h.feed
        .push(CandleEvent::closed("BTCUSDT", "15m", 0, 59_999, 160.0))
        .await;

    let snapshot = wait_for_candles(&h.handle, 1).await;
    assert_eq!(snapshot.stats.candles_processed, 1);
    assert_eq!(snapshot.stats.partial_candles_dropped, 60);
    assert_eq!(snapshot.stats.signals_seen, 0);
    assert_eq!(h.exchange.order_count(), 0);

    h.handle.stop();
    h.handle.wait_terminal().await;
}
