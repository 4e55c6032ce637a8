pub mod broker;
pub mod config;
pub mod consumer;
pub mod queue;
pub mod redis;
pub mod shutdown;
pub mod status;
pub mod types;
pub mod units;
