pub mod exchange_client;
pub mod ledger_client;
pub mod market_data_feed;
pub mod state_store;
