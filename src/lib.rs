pub mod converter;
pub mod metrics;
pub mod models;
pub mod parser;
pub mod poller;
pub mod storage;
pub mod transformer;
pub mod utils;
