pub mod config;
pub mod dead_letter;
pub mod events;
pub mod metrics;
pub mod metrics_consts;
pub mod store;
pub mod telemetry;
pub mod test_utils;
