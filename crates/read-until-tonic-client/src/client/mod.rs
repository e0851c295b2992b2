pub mod analysis;
pub mod config;
pub mod telemetry;
pub mod transport;
