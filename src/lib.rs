pub mod backend;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod telemetry;
