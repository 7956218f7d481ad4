//! Market Data Client
//!
//! Owns the kline subscriptions of one bot session. Each symbol gets its own pump
//! task that subscribes to the feed, forwards closed candles in arrival order and
//! reconnects with exponential backoff when the transport fails. Partial candles
//! never leave this module.
//!
//! Cancellation goes through a `watch` channel: `shutdown()` flips it, every pump
//! unsubscribes its live handle and exits, and `shutdown()` returns only after all
//! pumps are gone.

use crate::domain::entities::candle::CandleEvent;
use crate::domain::repositories::market_data_feed::{FeedSubscription, MarketDataFeed};
use crate::task_runner::BackoffPolicy;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events delivered to the owning session
#[derive(Debug, Clone, PartialEq)]
pub enum MarketDataEvent {
    /// First successful subscription for a symbol
    Subscribed { symbol: String },
    /// A closed candle
    Candle(CandleEvent),
    /// Reconnect attempts for a symbol are exhausted; its pump has exited
    Disconnected { symbol: String, reason: String },
}

#[derive(Debug, Default)]
struct PumpCounters {
    open_subscriptions: AtomicUsize,
    partial_dropped: AtomicU64,
    reconnects: AtomicU64,
}

pub struct MarketDataClient {
    cancel: watch::Sender<bool>,
    pumps: Vec<JoinHandle<()>>,
    counters: Arc<PumpCounters>,
}

impl MarketDataClient {
    /// Spawn one pump per symbol.
    ///
    /// # Returns
    /// The client and the receiving end of its event stream
    pub fn start(
        feed: Arc<dyn MarketDataFeed>,
        symbols: &[String],
        timeframe: &str,
        policy: BackoffPolicy,
    ) -> (Self, mpsc::Receiver<MarketDataEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let counters = Arc::new(PumpCounters::default());

        let pumps = symbols
            .iter()
            .map(|symbol| {
                let pump = SymbolPump {
                    feed: feed.clone(),
                    symbol: symbol.clone(),
                    timeframe: timeframe.to_string(),
                    policy: policy.clone(),
                    events: events_tx.clone(),
                    cancel: cancel_rx.clone(),
                    counters: counters.clone(),
                };
                tokio::spawn(pump.run())
            })
            .collect();

        debug!(
            "MarketDataClient started for {} symbol(s) at {}",
            symbols.len(),
            timeframe
        );

        (
            Self {
                cancel: cancel_tx,
                pumps,
                counters,
            },
            events_rx,
        )
    }

    /// Feed subscriptions currently held open by the pumps
    pub fn open_subscriptions(&self) -> usize {
        self.counters.open_subscriptions.load(Ordering::SeqCst)
    }

    pub fn partial_candles_dropped(&self) -> u64 {
        self.counters.partial_dropped.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.counters.reconnects.load(Ordering::Relaxed)
    }

    /// Cancel every pump and wait until each has released its subscription.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        for pump in self.pumps {
            if let Err(e) = pump.await {
                error!("Market data pump ended abnormally: {}", e);
            }
        }
        debug!(
            "MarketDataClient stopped ({} subscription(s) left open)",
            self.counters.open_subscriptions.load(Ordering::SeqCst)
        );
    }
}

enum StreamEnd {
    Cancelled,
    Failed(String),
}

struct SymbolPump {
    feed: Arc<dyn MarketDataFeed>,
    symbol: String,
    timeframe: String,
    policy: BackoffPolicy,
    events: mpsc::Sender<MarketDataEvent>,
    cancel: watch::Receiver<bool>,
    counters: Arc<PumpCounters>,
}

impl SymbolPump {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        let mut announced = false;

        loop {
            if *self.cancel.borrow() {
                return;
            }

            let subscribed = tokio::select! {
                _ = self.cancel.changed() => return,
                result = self.feed.subscribe(&self.symbol, &self.timeframe) => result,
            };

            let reason = match subscribed {
                Ok(subscription) => {
                    attempt = 0;
                    self.counters.open_subscriptions.fetch_add(1, Ordering::SeqCst);

                    if !announced {
                        announced = true;
                        info!("Subscribed to {}@{}", self.symbol, self.timeframe);
                        let event = MarketDataEvent::Subscribed {
                            symbol: self.symbol.clone(),
                        };
                        if !self.deliver(event).await {
                            self.release(subscription).await;
                            return;
                        }
                    } else {
                        info!("Resubscribed to {}@{}", self.symbol, self.timeframe);
                    }

                    let (end, subscription) = self.forward(subscription).await;
                    self.release(subscription).await;
                    match end {
                        StreamEnd::Cancelled => return,
                        StreamEnd::Failed(reason) => reason,
                    }
                }
                Err(e) if !e.is_transient() => {
                    error!("Subscription for {} rejected: {}", self.symbol, e);
                    self.disconnect(e.to_string()).await;
                    return;
                }
                Err(e) => e.to_string(),
            };

            attempt += 1;
            if attempt > self.policy.max_retries {
                error!(
                    "Giving up on {}@{} after {} reconnect attempts: {}",
                    self.symbol, self.timeframe, self.policy.max_retries, reason
                );
                self.disconnect(reason).await;
                return;
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                "{}@{} stream failed ({}), reconnecting in {:?} (attempt {}/{})",
                self.symbol, self.timeframe, reason, delay, attempt, self.policy.max_retries
            );
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            if !self.wait(delay).await {
                return;
            }
        }
    }

    /// Pump candles until the stream fails or the pump is cancelled.
    async fn forward(&mut self, mut subscription: FeedSubscription) -> (StreamEnd, FeedSubscription) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.changed() => None,
                item = subscription.events.recv() => Some(item),
            };
            let Some(item) = next else {
                return (StreamEnd::Cancelled, subscription);
            };

            match item {
                Some(Ok(candle)) if candle.is_closed => {
                    if !self.deliver(MarketDataEvent::Candle(candle)).await {
                        return (StreamEnd::Cancelled, subscription);
                    }
                }
                Some(Ok(_)) => {
                    self.counters.partial_dropped.fetch_add(1, Ordering::Relaxed);
                }
                Some(Err(e)) => return (StreamEnd::Failed(e.to_string()), subscription),
                None => {
                    return (
                        StreamEnd::Failed("stream closed by feed".to_string()),
                        subscription,
                    )
                }
            }
        }
    }

    /// Send an event unless the pump is cancelled or the session has gone away.
    async fn deliver(&mut self, event: MarketDataEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.changed() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    async fn release(&self, subscription: FeedSubscription) {
        self.feed.unsubscribe(&subscription.handle).await;
        self.counters.open_subscriptions.fetch_sub(1, Ordering::SeqCst);
    }

    async fn disconnect(&self, reason: String) {
        let _ = self
            .events
            .send(MarketDataEvent::Disconnected {
                symbol: self.symbol.clone(),
                reason,
            })
            .await;
    }

    /// Sleep for `delay`; false if cancelled first.
    async fn wait(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
