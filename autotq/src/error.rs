//! Error types for autotq.

use std::io;
use thiserror::Error;

/// Result type for autotq operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for autotq operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// JSON encode/decode error on the wire protocol.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Port open failure or failed liveness probe after opening.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// No candidate serial port found.
    #[error("No AutoTQ device found")]
    DeviceNotFound,

    /// Device never acknowledged a `download_file` command.
    #[error("Device not ready for transfer of '{0}'")]
    ReadyTimeout(String),

    /// Device acknowledged neither completion nor abort within the window.
    #[error("No completion response for '{0}'")]
    CompletionTimeout(String),

    /// Device explicitly aborted a transfer.
    #[error("Transfer of '{filename}' aborted by device: {reason}")]
    Aborted {
        /// File being transferred when the device aborted.
        filename: String,
        /// Device-supplied abort reason.
        reason: String,
    },

    /// Device reported an explicit CRC failure after a transfer.
    #[error("CRC check failed for '{0}'")]
    ChecksumMismatch(String),

    /// A post-condition check failed (version mismatch, missing files).
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Repeated I2C faults signaling a missing battery.
    #[error("Hardware fault: {0}")]
    HardwareFault(String),

    /// Generic response wait expired.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Backend registration write or read-back failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// External flashing tool reported failure.
    #[error("Flash tool error: {0}")]
    FlashTool(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
