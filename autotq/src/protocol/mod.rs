//! Wire protocol implementations.

pub mod crc;
pub mod wire;

// Re-export common types
pub use wire::{Command, CompletionKind, CrcStatus, StatusReport, normalize_version};
