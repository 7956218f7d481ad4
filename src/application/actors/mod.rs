pub mod bot_session;
pub mod market_data_client;
pub mod orchestrator;
pub mod payment_reconciler;

#[cfg(test)]
pub mod tests;

pub use bot_session::{BotSession, BotSessionHandle, SessionExit, SessionSettings};
pub use market_data_client::{MarketDataClient, MarketDataEvent};
pub use orchestrator::{ExchangeClientFactory, Orchestrator, OrchestratorConfig, OrchestratorHandle};
pub use payment_reconciler::{PaymentReconciler, PaymentReconcilerHandle, ReconcilerConfig};
