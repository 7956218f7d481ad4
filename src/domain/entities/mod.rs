pub mod balance;
pub mod candle;
pub mod order;
pub mod payment;
pub mod session;
pub mod tenant;
pub mod trade;
