use crate::domain::entities::order::{OrderSide, OrderType};
use crate::domain::services::indicators::IndicatorSnapshot;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    pub fn side(&self) -> OrderSide {
        match self {
            TradeDirection::Long => OrderSide::Buy,
            TradeDirection::Short => OrderSide::Sell,
        }
    }
}

/// How a signal should be sized into an order quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSizing {
    /// Share of the available quote balance committed as margin, in percent
    pub position_size_percent: f64,
    pub leverage: u32,
    /// Price the signal was generated at
    pub reference_price: f64,
}

/// Immutable trade intent produced from an indicator snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    pub direction: TradeDirection,
    pub order_type: OrderType,
    pub sizing: PositionSizing,
    pub created_at: DateTime<Utc>,
}

impl TradeSignal {
    pub fn market(symbol: &str, direction: TradeDirection, sizing: PositionSizing) -> Self {
        Self {
            symbol: symbol.to_string(),
            direction,
            order_type: OrderType::Market,
            sizing,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one dispatch to the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TradeResult {
    pub fn filled(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only trade history entry, stored under `trades/{tenant}/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub tenant_id: String,
    pub signal: TradeSignal,
    pub result: TradeResult,
    pub snapshot: IndicatorSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl TradeRecord {
    pub fn new(
        tenant_id: &str,
        signal: TradeSignal,
        result: TradeResult,
        snapshot: IndicatorSnapshot,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_trade_id(now),
            tenant_id: tenant_id.to_string(),
            signal,
            result,
            snapshot,
            timestamp: now,
        }
    }
}

fn new_trade_id(now: DateTime<Utc>) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("trade_{}_{}", now.timestamp_millis(), suffix)
}
