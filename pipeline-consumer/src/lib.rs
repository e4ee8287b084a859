pub mod config;
pub mod consumer;
pub mod error;
pub mod processor;
pub mod rate;
pub mod source;
