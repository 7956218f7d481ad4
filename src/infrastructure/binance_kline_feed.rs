//! Binance kline websocket feed
//!
//! One websocket connection per subscription on the raw stream endpoint
//! `{base}/{symbol}@kline_{timeframe}`. Every kline update is forwarded, closed
//! or not.

use crate::domain::entities::candle::CandleEvent;
use crate::domain::errors::FeedError;
use crate::domain::repositories::market_data_feed::{
    FeedSubscription, MarketDataFeed, SubscriptionHandle,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

const FUTURES_STREAM_BASE: &str = "wss://fstream.binance.com/ws";
const FUTURES_TESTNET_STREAM_BASE: &str = "wss://stream.binancefuture.com/ws";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIPTION_BUFFER: usize = 256;

const SUPPORTED_INTERVALS: &[&str] = &[
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

#[derive(Debug, Deserialize)]
struct KlineMessage {
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

/// Parse one text frame.
///
/// # Returns
/// `Ok(None)` for frames that are not kline events
pub(crate) fn parse_kline(text: &str) -> Result<Option<CandleEvent>, FeedError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| FeedError::Stream(format!("invalid frame: {}", e)))?;
    if value.get("e").and_then(|e| e.as_str()) != Some("kline") {
        return Ok(None);
    }

    let message: KlineMessage = serde_json::from_value(value)
        .map_err(|e| FeedError::Stream(format!("invalid kline payload: {}", e)))?;

    let k = message.kline;
    let close = k
        .close
        .parse::<f64>()
        .map_err(|_| FeedError::Stream(format!("invalid close price: {}", k.close)))?;

    Ok(Some(CandleEvent {
        symbol: k.symbol,
        timeframe: k.interval,
        open_time: k.open_time,
        close_time: k.close_time,
        close,
        is_closed: k.is_closed,
    }))
}

pub struct BinanceKlineFeed {
    base_url: String,
    next_id: AtomicU64,
    readers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl BinanceKlineFeed {
    pub fn new(testnet: bool) -> Self {
        let base = if testnet {
            FUTURES_TESTNET_STREAM_BASE
        } else {
            FUTURES_STREAM_BASE
        };
        Self::with_base_url(base)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            next_id: AtomicU64::new(1),
            readers: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn stream_url(&self, symbol: &str, timeframe: &str) -> String {
        format!(
            "{}/{}@kline_{}",
            self.base_url,
            symbol.to_lowercase(),
            timeframe
        )
    }

    pub async fn active_connections(&self) -> usize {
        self.readers.lock().await.len()
    }
}

fn validate(symbol: &str, timeframe: &str) -> Result<(), FeedError> {
    let invalid = |reason: &str| FeedError::InvalidSubscription {
        symbol: symbol.to_string(),
        timeframe: timeframe.to_string(),
        reason: reason.to_string(),
    };
    if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid("symbol must be non-empty and alphanumeric"));
    }
    if !SUPPORTED_INTERVALS.contains(&timeframe) {
        return Err(invalid("unsupported kline interval"));
    }
    Ok(())
}

#[async_trait]
impl MarketDataFeed for BinanceKlineFeed {
    async fn subscribe(&self, symbol: &str, timeframe: &str) -> Result<FeedSubscription, FeedError> {
        validate(symbol, timeframe)?;
        let url = self.stream_url(symbol, timeframe);

        let (ws_stream, _) = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return Err(FeedError::ConnectionFailed(e.to_string())),
            Err(_) => {
                return Err(FeedError::ConnectionFailed(format!(
                    "connect timed out after {:?}",
                    CONNECT_TIMEOUT
                )))
            }
        };
        info!("Kline stream connected: {}", url);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let reader = tokio::spawn(async move {
            let (_write, mut read) = ws_stream.split();
            while let Some(message) = read.next().await {
                let item = match message {
                    Ok(Message::Text(text)) => match parse_kline(&text) {
                        Ok(Some(candle)) => Ok(candle),
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("Dropping kline frame: {}", e);
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!("Kline stream closed by server: {:?}", frame);
                        break;
                    }
                    // Pings are answered by tungstenite while reading
                    Ok(_) => continue,
                    Err(e) => Err(FeedError::Stream(e.to_string())),
                };

                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    break;
                }
            }
        });

        self.readers.lock().await.insert(id, reader);

        Ok(FeedSubscription {
            handle: SubscriptionHandle {
                id,
                symbol: symbol.to_string(),
                timeframe: timeframe.to_string(),
            },
            events: rx,
        })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if let Some(reader) = self.readers.lock().await.remove(&handle.id) {
            reader.abort();
            debug!(
                "Closed kline stream {}@{} (#{})",
                handle.symbol, handle.timeframe, handle.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOSED_KLINE: &str = r#"{
        "e": "kline", "E": 1638747660000, "s": "BTCUSDT",
        "k": {
            "t": 1638747600000, "T": 1638747659999, "s": "BTCUSDT", "i": "1m",
            "f": 100, "L": 200, "o": "0.0010", "c": "57012.50", "h": "0.0025",
            "l": "0.0015", "v": "1000", "n": 100, "x": true, "q": "1.0000",
            "V": "500", "Q": "0.500", "B": "123456"
        }
    }"#;

    #[test]
    fn test_parse_closed_kline() {
        let candle = parse_kline(CLOSED_KLINE).unwrap().unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.timeframe, "1m");
        assert_eq!(candle.open_time, 1638747600000);
        assert_eq!(candle.close_time, 1638747659999);
        assert_eq!(candle.close, 57012.50);
        assert!(candle.is_closed);
    }

    #[test]
    fn test_parse_partial_kline() {
        let partial = CLOSED_KLINE.replace("\"x\": true", "\"x\": false");
        let candle = parse_kline(&partial).unwrap().unwrap();
        assert!(!candle.is_closed);
    }

    #[test]
    fn test_non_kline_frames_ignored() {
        assert_eq!(parse_kline(r#"{"result":null,"id":1}"#).unwrap(), None);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(parse_kline("not json").is_err());
        let bad_price = CLOSED_KLINE.replace("57012.50", "abc");
        assert!(parse_kline(&bad_price).is_err());
    }

    #[test]
    fn test_stream_url() {
        let feed = BinanceKlineFeed::new(false);
        assert_eq!(
            feed.stream_url("BTCUSDT", "15m"),
            "wss://fstream.binance.com/ws/btcusdt@kline_15m"
        );
    }

    #[tokio::test]
    async fn test_invalid_subscription_is_not_transient() {
        let feed = BinanceKlineFeed::new(true);
        let err = feed.subscribe("BTCUSDT", "7m").await.err().unwrap();
        assert!(!err.is_transient());
        let err = feed.subscribe("BTC/USDT", "1m").await.err().unwrap();
        assert!(!err.is_transient());
    }
}
