//! Per-device production task state.
//!
//! A `DeviceTask` is the single source of truth for one device's progress
//! through the pipeline. It lives behind an `Arc<Mutex<..>>` shared between
//! the worker thread that drives the device and the orchestrator/dashboard
//! that render it, and it serializes to the JSON snapshot the dashboard
//! consumes.

use {
    serde::Serialize,
    std::time::{Duration, Instant},
};

/// Lifecycle state of one device task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Port seen, worker not started yet.
    Detected,
    /// esptool is writing firmware.
    Flashing,
    /// Opening the protocol session.
    Connecting,
    /// Reading status / enumerating files.
    Checking,
    /// Talking to the backend.
    Registering,
    /// Streaming audio files.
    Transferring,
    /// Re-enumerating to confirm all required files landed.
    Verifying,
    /// All steps done.
    Completed,
    /// Terminal failure.
    Failed,
    /// Unplugged before reaching a terminal state.
    Removed,
    /// Paused: battery must be connected before work can continue.
    NeedsBattery,
    /// Paused and the port is currently absent; waiting for a replug.
    WaitingRetry,
}

impl DeviceStatus {
    /// Terminal states never transition again (except through a manual
    /// force action).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Removed)
    }

    /// Paused states keep the task alive in the pending set.
    #[must_use]
    pub fn is_paused(self) -> bool {
        matches!(self, Self::NeedsBattery | Self::WaitingRetry)
    }

    /// Short human label for the dashboard.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Flashing => "flashing",
            Self::Connecting => "connecting",
            Self::Checking => "checking",
            Self::Registering => "registering",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Removed => "removed",
            Self::NeedsBattery => "needs battery",
            Self::WaitingRetry => "waiting for replug",
        }
    }
}

/// Outcome of one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Not reached yet.
    #[default]
    Pending,
    /// Deliberately not performed (already satisfied, or not configured).
    Skipped,
    /// Performed and succeeded.
    Done,
    /// Performed and failed.
    Failed,
}

/// Per-step outcomes recorded on the task.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StepOutcomes {
    /// Firmware flash step.
    pub firmware: StepOutcome,
    /// Backend registration step.
    pub backend: StepOutcome,
    /// Audio transfer + verification step.
    pub audio: StepOutcome,
}

/// Manual override requested through the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceAction {
    /// Re-flash firmware even if the running version matches.
    Flash,
    /// Re-run the audio transfer, skipping the firmware step.
    Transfer,
}

/// Everything known about one device's trip through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceTask {
    /// Serial port the device is attached to.
    pub port: String,
    /// Stable per-session number, assigned in detection order.
    pub device_number: u32,
    /// Current lifecycle state.
    pub status: DeviceStatus,
    /// One-line progress message for the dashboard.
    pub message: String,
    /// Overall progress, 0..=100.
    pub progress: u8,
    /// Running firmware version, once read.
    pub fw_version: Option<String>,
    /// Hardware revision, once read.
    pub hw_version: Option<String>,
    /// MAC address, once read.
    pub mac: Option<String>,
    /// Battery state of charge, percent, once read.
    pub battery_soc: Option<f64>,
    /// Backend record id, once registered.
    pub pcb_id: Option<u64>,
    /// Files pushed during this task.
    pub files_transferred: u32,
    /// Files already present and skipped.
    pub files_skipped: u32,
    /// Required file count.
    pub files_total: u32,
    /// Accumulated error messages, newest last.
    pub errors: Vec<String>,
    /// The operator must do something before this task can proceed.
    pub needs_user_action: bool,
    /// What the operator must do.
    pub user_action_message: Option<String>,
    /// Firmware was flashed during this task's lifetime. Survives a battery
    /// pause, so a resumed worker never reflashes.
    pub firmware_flashed: bool,
    /// This worker run resumed a battery-paused task.
    pub resumed_from_battery: bool,
    /// Pending manual override, consumed by the next worker run.
    pub force_action: Option<ForceAction>,
    /// Per-step outcomes.
    pub steps: StepOutcomes,
    #[serde(skip)]
    started_at: Instant,
    #[serde(skip)]
    finished_at: Option<Instant>,
}

impl DeviceTask {
    /// New task for a freshly detected port.
    #[must_use]
    pub fn new(port: &str, device_number: u32) -> Self {
        Self {
            port: port.to_string(),
            device_number,
            status: DeviceStatus::Detected,
            message: "detected".to_string(),
            progress: 0,
            fw_version: None,
            hw_version: None,
            mac: None,
            battery_soc: None,
            pcb_id: None,
            files_transferred: 0,
            files_skipped: 0,
            files_total: 0,
            errors: Vec::new(),
            needs_user_action: false,
            user_action_message: None,
            firmware_flashed: false,
            resumed_from_battery: false,
            force_action: None,
            steps: StepOutcomes::default(),
            started_at: Instant::now(),
            finished_at: None,
        }
    }

    /// Move to a new state with a dashboard message. `Removed` is sticky: a
    /// worker outliving an unplug cannot resurrect the task.
    pub fn set_status(&mut self, status: DeviceStatus, message: impl Into<String>) {
        if self.status == DeviceStatus::Removed {
            return;
        }
        self.status = status;
        self.message = message.into();
        if status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(Instant::now());
        }
        if !status.is_paused() {
            self.needs_user_action = false;
            self.user_action_message = None;
        }
    }

    /// Record an error without changing state.
    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    /// Pause for a battery, with the operator instruction.
    pub fn pause_for_battery(&mut self, message: impl Into<String>) {
        if self.status == DeviceStatus::Removed {
            return;
        }
        let message = message.into();
        self.status = DeviceStatus::NeedsBattery;
        self.needs_user_action = true;
        self.user_action_message = Some(message.clone());
        self.message = message;
    }

    /// Wall time this task has been (or was) in flight.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.finished_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.started_at)
    }

    /// Last recorded error, for the CSV log.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.errors.last().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_paused_classification() {
        assert!(DeviceStatus::Completed.is_terminal());
        assert!(DeviceStatus::Failed.is_terminal());
        assert!(DeviceStatus::Removed.is_terminal());
        assert!(!DeviceStatus::Transferring.is_terminal());
        assert!(DeviceStatus::NeedsBattery.is_paused());
        assert!(DeviceStatus::WaitingRetry.is_paused());
        assert!(!DeviceStatus::Completed.is_paused());
    }

    #[test]
    fn battery_pause_sets_user_action() {
        let mut task = DeviceTask::new("/dev/ttyACM0", 1);
        task.pause_for_battery("connect a battery and replug");
        assert_eq!(task.status, DeviceStatus::NeedsBattery);
        assert!(task.needs_user_action);
        assert!(task.user_action_message.is_some());

        // Resuming clears the operator flag.
        task.set_status(DeviceStatus::Connecting, "resuming");
        assert!(!task.needs_user_action);
        assert!(task.user_action_message.is_none());
    }

    #[test]
    fn terminal_state_freezes_duration() {
        let mut task = DeviceTask::new("/dev/ttyACM0", 1);
        task.set_status(DeviceStatus::Completed, "done");
        let first = task.duration();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(task.duration(), first);
    }

    #[test]
    fn removed_is_sticky() {
        let mut task = DeviceTask::new("/dev/ttyACM0", 1);
        task.set_status(DeviceStatus::Removed, "unplugged");
        task.set_status(DeviceStatus::Completed, "late worker write");
        assert_eq!(task.status, DeviceStatus::Removed);
        task.pause_for_battery("late pause");
        assert_eq!(task.status, DeviceStatus::Removed);
    }

    #[test]
    fn snapshot_serializes_snake_case() {
        let task = DeviceTask::new("/dev/ttyACM0", 3);
        let v = serde_json::to_value(&task).unwrap();
        assert_eq!(v["status"], "detected");
        assert_eq!(v["device_number"], 3);
        assert_eq!(v["steps"]["firmware"], "pending");
    }
}
