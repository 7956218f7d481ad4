pub mod indicators;
pub mod order_executor;
