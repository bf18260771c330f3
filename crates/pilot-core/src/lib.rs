//! Shared types and configuration for the pilot orchestration daemon.

pub mod config;
pub mod types;

pub use config::Config;
pub use types::*;
