pub mod payment_desk;
