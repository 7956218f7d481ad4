use crate::domain::value_objects::{price::Price, quantity::Quantity};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// A fully sized order ready to hand to an exchange adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub price: Option<Price>,
}

impl OrderRequest {
    pub fn new(
        symbol: impl Into<String>,
        side: OrderSide,
        order_type: OrderType,
        quantity: Quantity,
        price: Option<Price>,
    ) -> Result<Self, String> {
        if quantity.is_zero() {
            return Err("Order quantity must be greater than zero".to_string());
        }
        if order_type == OrderType::Limit && price.is_none() {
            return Err("Limit orders must have a price".to_string());
        }

        Ok(OrderRequest {
            symbol: symbol.into(),
            side,
            order_type,
            quantity,
            price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_new_market_buy() {
        let order = OrderRequest::new(
            "BTCUSDT",
            OrderSide::Buy,
            OrderType::Market,
            Quantity::new(0.001).unwrap(),
            None,
        )
        .unwrap();
        assert_eq!(order.symbol, "BTCUSDT");
        assert_eq!(order.side.to_string(), "BUY");
        assert_eq!(order.order_type.to_string(), "MARKET");
    }

    #[test]
    fn test_limit_order_requires_price() {
        let result = OrderRequest::new(
            "BTCUSDT",
            OrderSide::Sell,
            OrderType::Limit,
            Quantity::new(1.0).unwrap(),
            None,
        );
        assert_eq!(result.unwrap_err(), "Limit orders must have a price");
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let result = OrderRequest::new(
            "BTCUSDT",
            OrderSide::Buy,
            OrderType::Market,
            Quantity::new(0.0).unwrap(),
            None,
        );
        assert!(result.is_err());
    }
}
