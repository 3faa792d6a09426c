pub mod config;
pub mod device;
pub mod error;
pub mod hub;
pub mod mqtt;
