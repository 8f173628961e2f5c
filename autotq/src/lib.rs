//! # autotq
//!
//! Library for programming and provisioning AutoTQ devices over serial.
//!
//! The crate covers the whole factory path:
//!
//! - USB port detection with VID/PID classification
//! - newline-delimited JSON wire protocol with CRC32-checked chunked
//!   binary file transfer
//! - device sessions (status, file manifest, measurement, sleep)
//! - firmware flashing through an external `esptool` invocation
//! - backend registration boundary
//! - the multi-device production state machine and orchestrator
//!
//! ## Example
//!
//! ```rust,no_run
//! use autotq::{
//!     session::{DeviceSession, SessionConfig},
//!     transfer::{self, SpeedProfile},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = autotq::device::auto_detect_port()?;
//!     let mut session = DeviceSession::connect(&port.name, &SessionConfig::default())?;
//!
//!     let data = std::fs::read("inflating.wav")?;
//!     transfer::push_file(
//!         &mut session,
//!         "inflating.wav",
//!         &data,
//!         SpeedProfile::Normal,
//!         &mut |sent, total| println!("{sent}/{total}"),
//!     )?;
//!
//!     session.disconnect();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod backend;
pub mod device;
pub mod error;
pub mod firmware;
pub mod port;
pub mod production;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
pub use {
    backend::{Backend, PcbRecord, StageLabel, TestKind},
    device::{auto_detect_port, detect_autotq_ports, detect_ports, DetectedPort, UsbBridge},
    error::{Error, Result},
    firmware::{EsptoolFlasher, FirmwareFlasher, FirmwareImage},
    port::{NativePort, Port, SerialConfig},
    production::{DeviceStatus, DeviceTask, Orchestrator, SessionLog, WorkerDeps},
    protocol::{Command, StatusReport},
    session::{DeviceChannel, DeviceSession, SessionConfig},
    transfer::{AudioLibrary, SpeedProfile, REQUIRED_AUDIO_FILES},
    transport::SerialTransport,
};
