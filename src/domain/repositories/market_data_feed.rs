//! Market Data Feed Trait
//!
//! Raw kline subscriptions. A feed delivers every update it receives, including
//! in-progress bars; filtering to closed bars happens in the market data client.

use crate::domain::entities::candle::CandleEvent;
use crate::domain::errors::FeedError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Identifies one live subscription on a feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub symbol: String,
    pub timeframe: String,
}

/// A live subscription. The channel closes when the transport goes away;
/// transport problems are delivered in-band as `Err` items first.
pub struct FeedSubscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::Receiver<Result<CandleEvent, FeedError>>,
}

#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    async fn subscribe(&self, symbol: &str, timeframe: &str) -> Result<FeedSubscription, FeedError>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle);
}
