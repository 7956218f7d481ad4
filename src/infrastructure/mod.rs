pub mod binance_client;
pub mod binance_kline_feed;
pub mod credential_cipher;
pub mod exchange_client_factory;
pub mod memory_store;
pub mod tron_signer;
pub mod trongrid_ledger;
