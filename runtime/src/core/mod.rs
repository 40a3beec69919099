//! Runtime-wide infrastructure: configuration, constants, shutdown

pub mod config;
pub mod constants;
pub mod shutdown;
