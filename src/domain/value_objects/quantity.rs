use serde::{Deserialize, Serialize};

/// Order quantity in base-asset units.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Quantity(f64);

impl Quantity {
    pub fn new(value: f64) -> Result<Self, String> {
        if !value.is_finite() {
            return Err("Quantity must be finite".to_string());
        }
        if value < 0.0 {
            return Err("Quantity must be non-negative".to_string());
        }
        Ok(Quantity(value))
    }

    /// Round down to the venue's lot step, so an order never exceeds the sized amount.
    pub fn floor_to_step(&self, step: f64) -> Result<Quantity, String> {
        if !(step.is_finite() && step > 0.0) {
            return Err("Step must be positive".to_string());
        }
        // Nudge by a tiny epsilon so 0.3 / 0.1 does not floor to 2.
        let steps = (self.0 / step + 1e-9).floor();
        Quantity::new(steps * step)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0.0
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl TryFrom<f64> for Quantity {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Quantity::new(value)
    }
}

impl From<Quantity> for f64 {
    fn from(quantity: Quantity) -> Self {
        quantity.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_new_valid() {
        let qty = Quantity::new(100.0);
        assert!(qty.is_ok());
        assert_eq!(qty.unwrap().value(), 100.0);
    }

    #[test]
    fn test_quantity_new_negative() {
        let qty = Quantity::new(-1.0);
        assert_eq!(qty.unwrap_err(), "Quantity must be non-negative");
    }

    #[test]
    fn test_floor_to_step() {
        let qty = Quantity::new(0.01567).unwrap();
        let floored = qty.floor_to_step(0.001).unwrap();
        assert!((floored.value() - 0.015).abs() < 1e-12);

        let exact = Quantity::new(0.3).unwrap().floor_to_step(0.1).unwrap();
        assert!((exact.value() - 0.3).abs() < 1e-12);

        let tiny = Quantity::new(0.0004).unwrap().floor_to_step(0.001).unwrap();
        assert!(tiny.is_zero());
    }
}
