pub mod checksum;
pub mod config;
pub mod constants;
pub mod detector;
pub mod error;
pub mod fetcher;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod parser;
pub mod server;
pub mod storage;
pub mod types;
pub mod upserter;

pub use error::{Result, WatchError};
