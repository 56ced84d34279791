//! Subcommand implementations

pub mod check_config;
pub mod dlq;
pub mod run;
pub mod state;
