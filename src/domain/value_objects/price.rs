use serde::{Deserialize, Serialize};

/// Strictly positive, finite price as quoted by a venue.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Price(f64);

impl Price {
    pub fn new(value: f64) -> Result<Self, String> {
        if !value.is_finite() {
            return Err("Price must be finite".to_string());
        }
        if value <= 0.0 {
            return Err("Price must be positive".to_string());
        }
        Ok(Price(value))
    }

    /// Parse a decimal string as sent by exchanges (`"64123.50"`).
    pub fn parse(raw: &str) -> Result<Self, String> {
        let value = raw
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("Invalid price '{}': {}", raw, e))?;
        Price::new(value)
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Price {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Price::new(value)
    }
}

impl From<Price> for f64 {
    fn from(price: Price) -> Self {
        price.0
    }
}
