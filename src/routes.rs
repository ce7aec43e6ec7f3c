pub mod checkout;
pub mod health;
pub mod webhook;
