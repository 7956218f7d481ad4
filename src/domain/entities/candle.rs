use serde::{Deserialize, Serialize};

/// One kline update from the market data feed.
///
/// Feeds push the in-progress bar repeatedly; only events with `is_closed` set
/// describe a finished bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleEvent {
    pub symbol: String,
    pub timeframe: String,
    /// Bar open time, unix millis
    pub open_time: i64,
    /// Bar close time, unix millis
    pub close_time: i64,
    pub close: f64,
    pub is_closed: bool,
}

impl CandleEvent {
    pub fn closed(symbol: &str, timeframe: &str, open_time: i64, close_time: i64, close: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            open_time,
            close_time,
            close,
            is_closed: true,
        }
    }

    pub fn partial(symbol: &str, timeframe: &str, open_time: i64, close_time: i64, close: f64) -> Self {
        Self {
            is_closed: false,
            ..Self::closed(symbol, timeframe, open_time, close_time, close)
        }
    }
}
