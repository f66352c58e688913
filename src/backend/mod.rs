pub mod endpoint;
pub mod health;
