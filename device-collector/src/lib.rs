pub mod config;
pub mod consumer;
pub mod dedup;
pub mod error;
pub mod health;
pub mod ingestor;
pub mod metrics;
pub mod metrics_consts;
pub mod publisher;
pub mod quarantine;
pub mod retry;
pub mod server;
pub mod sinks;
pub mod storage;
pub mod test_utils;
pub mod types;
pub mod validation;
