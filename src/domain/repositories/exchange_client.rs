//! Exchange Client Trait
//!
//! Common interface over a derivatives venue. One instance is built per tenant
//! from that tenant's own credentials; instances are never shared across tenants.

use crate::domain::entities::balance::{Balance, OpenPosition};
use crate::domain::entities::order::OrderRequest;
use crate::domain::errors::ExchangeError;
use async_trait::async_trait;

/// Common result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Get the name of this exchange
    fn name(&self) -> &str;

    /// Cheap unauthenticated reachability check
    async fn ping(&self) -> bool;

    /// Wallet balances per asset
    async fn get_balance(&self) -> ExchangeResult<Vec<Balance>>;

    /// Positions with a non-zero amount
    async fn get_positions(&self) -> ExchangeResult<Vec<OpenPosition>>;

    /// Place an order
    ///
    /// # Returns
    /// The exchange-assigned order ID
    async fn place_order(&self, order: &OrderRequest) -> ExchangeResult<String>;

    /// Cancel an open order
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;
}
