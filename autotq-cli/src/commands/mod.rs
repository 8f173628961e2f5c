//! Subcommand implementations.

pub mod flash;
pub mod info;
pub mod monitor;
pub mod provision;
pub mod run;
pub mod transfer;
