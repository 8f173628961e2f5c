//! Multi-device production: per-device state machine, battery fault
//! handling, worker pipeline, orchestration, and the session CSV log.

pub mod fault;
pub mod log;
pub mod orchestrator;
pub mod task;
pub mod worker;

pub use fault::{FaultConfig, FaultDetector};
pub use log::SessionLog;
pub use orchestrator::{
    AutotqPortScanner, Orchestrator, PortScanner, SessionStats, Snapshot, POLL_INTERVAL,
};
pub use task::{DeviceStatus, DeviceTask, ForceAction, StepOutcome, StepOutcomes};
pub use worker::{
    run_device, DeviceConnector, FirmwarePlan, SessionConnector, WorkerDeps, WorkerOutcome,
};
