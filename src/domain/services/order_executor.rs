//! OrderExecutor service - turns trade signals into sized exchange orders

use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::entities::balance::{available_for, Balance, OpenPosition};
use crate::domain::entities::order::OrderRequest;
use crate::domain::entities::trade::{TradeResult, TradeSignal};
use crate::domain::errors::{ErrorKind, ExchangeError};
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeResult};
use crate::domain::value_objects::quantity::Quantity;

/// Margin asset for USDⓈ-M contracts
pub const QUOTE_ASSET: &str = "USDT";

/// Lot step applied to every computed quantity
pub const QUANTITY_STEP: f64 = 0.001;

/// Order executor bound to one tenant's exchange client.
///
/// Every call is independent; the executor keeps no state between calls and
/// does not look at existing positions before acting on a signal.
pub struct OrderExecutor {
    client: Arc<dyn ExchangeClient>,
}

impl OrderExecutor {
    pub fn new(client: Arc<dyn ExchangeClient>) -> Self {
        Self { client }
    }

    pub fn exchange_name(&self) -> &str {
        self.client.name()
    }

    /// Check reachability and that the credentials are accepted.
    ///
    /// # Returns
    /// * `Ok(true)` - the venue answered an authenticated request
    /// * `Ok(false)` - the venue is unreachable or misbehaving
    /// * `Err(_)` - the credentials were refused
    pub async fn test_connection(&self) -> ExchangeResult<bool> {
        if !self.client.ping().await {
            warn!("{} ping failed", self.client.name());
            return Ok(false);
        }
        match self.client.get_balance().await {
            Ok(_) => Ok(true),
            Err(e) if e.is_credential() => Err(e),
            Err(e) => {
                warn!("{} balance check failed: {}", self.client.name(), e);
                Ok(false)
            }
        }
    }

    pub async fn get_balance(&self) -> ExchangeResult<Vec<Balance>> {
        self.client.get_balance().await
    }

    pub async fn get_open_positions(&self) -> ExchangeResult<Vec<OpenPosition>> {
        self.client.get_positions().await
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        self.client.cancel_order(symbol, order_id).await
    }

    /// Size and place an order for `signal`.
    ///
    /// Venue rejections and unusable sizing come back as a failed [`TradeResult`].
    /// Only transport and credential failures are returned as `Err`.
    pub async fn execute(&self, signal: &TradeSignal) -> ExchangeResult<TradeResult> {
        let balances = self.client.get_balance().await?;
        let available = available_for(&balances, QUOTE_ASSET);

        let order = match build_order(signal, available) {
            Ok(order) => order,
            Err(reason) => {
                debug!("Skipping {} order: {}", signal.symbol, reason);
                return Ok(TradeResult::failed(reason));
            }
        };

        match self.client.place_order(&order).await {
            Ok(order_id) => Ok(TradeResult::filled(order_id)),
            Err(e) if e.kind() == ErrorKind::Rejected => Ok(TradeResult::failed(e.to_string())),
            Err(e) => Err(e),
        }
    }
}

/// Notional = available margin x size% x leverage, converted to base units.
pub fn calculate_quantity(signal: &TradeSignal, available_quote: f64) -> Result<Quantity, String> {
    let sizing = &signal.sizing;
    if !(sizing.reference_price.is_finite() && sizing.reference_price > 0.0) {
        return Err(format!(
            "Invalid reference price {} for {}",
            sizing.reference_price, signal.symbol
        ));
    }
    let notional =
        available_quote * (sizing.position_size_percent / 100.0) * sizing.leverage as f64;
    Quantity::new(notional / sizing.reference_price)?.floor_to_step(QUANTITY_STEP)
}

fn build_order(signal: &TradeSignal, available_quote: f64) -> Result<OrderRequest, String> {
    let quantity = calculate_quantity(signal, available_quote)?;
    if quantity.is_zero() {
        return Err(format!(
            "Insufficient {} balance ({:.2}) to size a {} order",
            QUOTE_ASSET, available_quote, signal.symbol
        ));
    }
    OrderRequest::new(
        signal.symbol.clone(),
        signal.direction.side(),
        signal.order_type,
        quantity,
        None,
    )
}

impl From<ExchangeError> for TradeResult {
    fn from(error: ExchangeError) -> Self {
        TradeResult::failed(error.to_string())
    }
}
