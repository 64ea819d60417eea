//! HTTP host for the Hive workspace runtime.

pub mod admin;
pub mod config;
pub mod hooks;
pub mod server;
pub mod telemetry;
