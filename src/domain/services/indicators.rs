use crate::domain::entities::trade::TradeDirection;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

pub const FAST_PERIOD: usize = 9;
pub const MEDIUM_PERIOD: usize = 21;
pub const SLOW_PERIOD: usize = 50;
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

pub struct EMA {
    pub period: usize,
}

impl EMA {
    pub fn new(period: usize) -> Self {
        EMA { period }
    }

    /// Final EMA over `values`: seeded with the simple average of the first
    /// `period` samples, then folded forward from index `period`.
    pub fn calculate_on_values(&self, values: &[f64]) -> Option<f64> {
        if self.period == 0 || values.len() < self.period {
            return None;
        }
        let k = 2.0 / (self.period as f64 + 1.0);

        let seed = values[..self.period].iter().sum::<f64>() / self.period as f64;
        let ema = values
            .iter()
            .skip(self.period)
            .fold(seed, |prev, &price| price * k + prev * (1.0 - k));

        Some(ema)
    }
}

/// EMA readings for one symbol after a closed candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub ema9: f64,
    pub ema21: f64,
    pub ema50: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl IndicatorSnapshot {
    /// Trend-following rule. Ties on either comparison give no signal.
    pub fn signal(&self) -> Option<TradeDirection> {
        if self.price > self.ema50 && self.ema9 > self.ema21 {
            Some(TradeDirection::Long)
        } else if self.price < self.ema50 && self.ema9 < self.ema21 {
            Some(TradeDirection::Short)
        } else {
            None
        }
    }
}

/// Bounded close-price history for a single symbol.
#[derive(Debug, Clone)]
pub struct IndicatorState {
    history: VecDeque<f64>,
    capacity: usize,
}

impl IndicatorState {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, price: f64) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(price);
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn snapshot(&self) -> Option<IndicatorSnapshot> {
        if self.history.len() < SLOW_PERIOD {
            return None;
        }
        let window: Vec<f64> = self.history.iter().copied().collect();
        let price = *window.last()?;

        Some(IndicatorSnapshot {
            ema9: EMA::new(FAST_PERIOD).calculate_on_values(&window)?,
            ema21: EMA::new(MEDIUM_PERIOD).calculate_on_values(&window)?,
            ema50: EMA::new(SLOW_PERIOD).calculate_on_values(&window)?,
            price,
            timestamp: Utc::now(),
        })
    }
}

/// Per-symbol indicator state for one session. Pure computation, no I/O.
#[derive(Debug)]
pub struct IndicatorEngine {
    states: HashMap<String, IndicatorState>,
    capacity: usize,
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl IndicatorEngine {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: HashMap::new(),
            capacity: capacity.max(SLOW_PERIOD),
        }
    }

    /// Append a closed-candle price and return a snapshot once enough history exists.
    pub fn update(&mut self, symbol: &str, price: f64) -> Option<IndicatorSnapshot> {
        let capacity = self.capacity;
        let state = self
            .states
            .entry(symbol.to_string())
            .or_insert_with(|| IndicatorState::new(capacity));
        state.push(price);
        state.snapshot()
    }

    pub fn history_len(&self, symbol: &str) -> usize {
        self.states.get(symbol).map(|s| s.len()).unwrap_or(0)
    }

    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.states.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot(ema9: f64, ema21: f64, ema50: f64, price: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            ema9,
            ema21,
            ema50,
            price,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_ema_seed_is_simple_average() {
        let ema = EMA::new(3);
        assert_eq!(ema.calculate_on_values(&[1.0, 2.0, 3.0]), Some(2.0));
        assert_eq!(ema.calculate_on_values(&[1.0, 2.0]), None);
    }

    #[test]
    fn test_ema_recurrence() {
        // k = 0.5, seed = 2.0, then 4*0.5 + 2*0.5 = 3.0, then 7*0.5 + 3*0.5 = 5.0
        let ema = EMA::new(3);
        assert_eq!(ema.calculate_on_values(&[1.0, 2.0, 3.0, 4.0, 7.0]), Some(5.0));
    }

    #[test]
    fn test_ema_of_constant_series() {
        let values = vec![42.0; 80];
        let ema = EMA::new(21).calculate_on_values(&values).unwrap();
        assert!((ema - 42.0).abs() < 1e-9);
    }

    #[test]
    fn test_signal_rule() {
        assert_eq!(
            snapshot(30.0, 25.0, 20.0, 31.0).signal(),
            Some(TradeDirection::Long)
        );
        assert_eq!(
            snapshot(20.0, 25.0, 30.0, 19.0).signal(),
            Some(TradeDirection::Short)
        );
        assert_eq!(snapshot(25.0, 25.0, 25.0, 25.0).signal(), None);
    }

    #[test]
    fn test_signal_requires_both_conditions() {
        // Above the slow average but fast below medium
        assert_eq!(snapshot(20.0, 25.0, 20.0, 31.0).signal(), None);
        // Price equal to the slow average
        assert_eq!(snapshot(30.0, 25.0, 20.0, 20.0).signal(), None);
    }

    #[test]
    fn test_no_snapshot_below_slow_period() {
        let mut engine = IndicatorEngine::default();
        for i in 0..49 {
            assert!(engine.update("BTCUSDT", 100.0 + i as f64).is_none());
        }
        assert!(engine.update("BTCUSDT", 150.0).is_some());
    }

    #[test]
    fn test_symbols_are_independent() {
        let mut engine = IndicatorEngine::default();
        for i in 0..50 {
            engine.update("BTCUSDT", 100.0 + i as f64);
        }
        assert!(engine.update("ETHUSDT", 3000.0).is_none());
        assert_eq!(engine.history_len("ETHUSDT"), 1);
        assert_eq!(engine.tracked_symbols(), vec!["BTCUSDT", "ETHUSDT"]);
    }

    #[test]
    fn test_history_is_bounded_fifo() {
        let mut engine = IndicatorEngine::new(DEFAULT_HISTORY_CAPACITY);
        for i in 0..250 {
            engine.update("BTCUSDT", i as f64 + 1.0);
        }
        assert_eq!(engine.history_len("BTCUSDT"), DEFAULT_HISTORY_CAPACITY);

        // Only the last 100 prices (151..=250) remain in the window
        let window: Vec<f64> = (151..=250).map(|v| v as f64).collect();
        let expected = EMA::new(SLOW_PERIOD).calculate_on_values(&window).unwrap();
        let snap = engine.update("BTCUSDT", 251.0).unwrap();
        let window: Vec<f64> = (152..=251).map(|v| v as f64).collect();
        assert_eq!(
            snap.ema50,
            EMA::new(SLOW_PERIOD).calculate_on_values(&window).unwrap()
        );
        assert!(snap.ema50 > expected);
    }

    #[test]
    fn test_rising_market_signals_long() {
        let mut engine = IndicatorEngine::default();
        let mut last = None;
        for i in 0..60 {
            last = engine.update("BTCUSDT", 100.0 + i as f64);
        }
        assert_eq!(last.unwrap().signal(), Some(TradeDirection::Long));
    }

    #[test]
    fn test_clear_discards_state() {
        let mut engine = IndicatorEngine::default();
        engine.update("BTCUSDT", 1.0);
        engine.clear();
        assert!(engine.tracked_symbols().is_empty());
        assert_eq!(engine.history_len("BTCUSDT"), 0);
    }

    proptest! {
        #[test]
        fn prop_replay_is_deterministic(prices in prop::collection::vec(1.0f64..100_000.0, 50..200)) {
            let mut a = IndicatorEngine::default();
            let mut b = IndicatorEngine::default();
            let mut last_a = None;
            let mut last_b = None;
            for price in &prices {
                last_a = a.update("BTCUSDT", *price);
                last_b = b.update("BTCUSDT", *price);
            }
            let (sa, sb) = (last_a.unwrap(), last_b.unwrap());
            prop_assert_eq!(sa.ema9.to_bits(), sb.ema9.to_bits());
            prop_assert_eq!(sa.ema21.to_bits(), sb.ema21.to_bits());
            prop_assert_eq!(sa.ema50.to_bits(), sb.ema50.to_bits());
        }

        #[test]
        fn prop_short_history_yields_nothing(prices in prop::collection::vec(1.0f64..100_000.0, 0..50)) {
            let mut engine = IndicatorEngine::default();
            for price in &prices {
                prop_assert!(engine.update("BTCUSDT", *price).is_none());
            }
        }
    }
}
