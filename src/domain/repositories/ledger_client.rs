//! Ledger Client Trait
//!
//! Settlement ledger used for subscription payments: balance lookups on deposit
//! addresses and transfers out of them.

use crate::domain::entities::payment::SweepKey;
use crate::domain::errors::LedgerError;
use async_trait::async_trait;

pub type LedgerResult<T> = Result<T, LedgerError>;

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Token balance of `address`, in ledger base units
    async fn balance_of(&self, address: &str) -> LedgerResult<u64>;

    /// Move `amount` base units from the address controlled by `from_key` to `to_address`.
    ///
    /// # Returns
    /// The ledger transaction id
    async fn transfer(
        &self,
        from_address: &str,
        from_key: &SweepKey,
        to_address: &str,
        amount: u64,
    ) -> LedgerResult<String>;
}
