//! Account balance and open position as reported by an exchange

use serde::{Deserialize, Serialize};

/// Per-asset wallet balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    /// Balance usable for new orders
    pub available: f64,
    /// Wallet balance including margin in use
    pub total: f64,
}

impl Balance {
    pub fn new(asset: impl Into<String>, available: f64, total: f64) -> Result<Self, String> {
        if available < 0.0 || total < 0.0 {
            return Err("Balances must be non-negative".to_string());
        }
        Ok(Self {
            asset: asset.into(),
            available,
            total,
        })
    }
}

/// An open derivatives position. `amount` is signed: positive long, negative short.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub symbol: String,
    pub amount: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub unrealized_pnl: f64,
}

impl OpenPosition {
    pub fn is_long(&self) -> bool {
        self.amount > 0.0
    }

    pub fn is_short(&self) -> bool {
        self.amount < 0.0
    }
}

/// Find the available balance for `asset`, or zero when the venue does not list it.
pub fn available_for(balances: &[Balance], asset: &str) -> f64 {
    balances
        .iter()
        .find(|b| b.asset.eq_ignore_ascii_case(asset))
        .map(|b| b.available)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_negative_rejected() {
        assert!(Balance::new("USDT", -1.0, 10.0).is_err());
        assert!(Balance::new("USDT", 5.0, 10.0).is_ok());
    }

    #[test]
    fn test_available_for() {
        let balances = vec![
            Balance::new("BNB", 1.0, 1.0).unwrap(),
            Balance::new("USDT", 250.0, 300.0).unwrap(),
        ];
        assert_eq!(available_for(&balances, "usdt"), 250.0);
        assert_eq!(available_for(&balances, "BUSD"), 0.0);
    }

    #[test]
    fn test_position_direction() {
        let position = OpenPosition {
            symbol: "ETHUSDT".to_string(),
            amount: -0.5,
            entry_price: 3000.0,
            leverage: 10,
            unrealized_pnl: 12.0,
        };
        assert!(position.is_short());
        assert!(!position.is_long());
    }
}
