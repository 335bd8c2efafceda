pub mod aggregation;
pub mod config;
pub mod counters;
pub mod errors;
pub mod hooks;
pub mod init;
pub mod lease;
pub mod logging;
pub mod store;
