pub mod common;
pub mod contract;
pub mod errors;
pub mod logs;
