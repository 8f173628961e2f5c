//! The per-device production pipeline.
//!
//! One worker drives one device through the whole sequence: connect, read
//! identity, flash firmware if needed, register with the backend, push
//! missing audio files, verify the manifest. The pipeline is strictly
//! sequential per device; parallelism across devices lives in the
//! orchestrator.
//!
//! Three ways out: `Completed`, `Failed`, or `PausedForBattery`. A battery
//! pause is not terminal; the orchestrator parks the task and respawns a
//! worker when the port reappears.

use {
    super::{
        fault::{FaultConfig, FaultDetector},
        task::{DeviceStatus, DeviceTask, ForceAction, StepOutcome},
    },
    crate::{
        backend::{register_device, Backend, StageLabel},
        error::Result,
        firmware::{FirmwareFlasher, FirmwareImage},
        protocol::normalize_version,
        session::{read_status, DeviceChannel, DeviceSession, SessionConfig},
        transfer::{self, AudioLibrary, SpeedProfile},
    },
    log::{debug, info, warn},
    std::{
        sync::{Arc, Mutex},
        thread,
        time::Duration,
    },
};

/// Connect attempts for the initial session.
pub const CONNECT_ATTEMPTS: usize = 3;

/// Connect attempts after a flash, while the device reboots.
pub const RECONNECT_ATTEMPTS: usize = 5;

/// Attempts per audio file.
pub const TRANSFER_ATTEMPTS: usize = 3;

/// Pause between retries.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

const BATTERY_MESSAGE: &str = "connect a battery, then unplug and replug the device";

/// Opens protocol sessions. The seam that lets tests run the pipeline
/// against scripted channels.
pub trait DeviceConnector: Send + Sync {
    /// Open a session on `port`.
    fn connect(&self, port: &str) -> Result<Box<dyn DeviceChannel>>;
}

/// Connector backed by real serial sessions.
pub struct SessionConnector {
    /// Session parameters applied to every connect.
    pub config: SessionConfig,
}

impl DeviceConnector for SessionConnector {
    fn connect(&self, port: &str) -> Result<Box<dyn DeviceChannel>> {
        Ok(Box::new(DeviceSession::connect(port, &self.config)?))
    }
}

/// Firmware to flash and the tool that flashes it.
pub struct FirmwarePlan {
    /// Image selected for this session.
    pub image: FirmwareImage,
    /// Flashing implementation.
    pub flasher: Arc<dyn FirmwareFlasher>,
}

/// Everything a worker needs, shared across all workers of a session.
pub struct WorkerDeps {
    /// Session opener.
    pub connector: Arc<dyn DeviceConnector>,
    /// Firmware step; `None` disables flashing entirely.
    pub firmware: Option<FirmwarePlan>,
    /// Backend; `None` marks the registration step skipped.
    pub backend: Option<Arc<dyn Backend>>,
    /// Audio files to push.
    pub audio: Arc<AudioLibrary>,
    /// Transfer pacing.
    pub speed: SpeedProfile,
    /// Stage label for backend records.
    pub stage: StageLabel,
    /// Missing-battery signature.
    pub fault: FaultConfig,
}

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Every step done or deliberately skipped.
    Completed,
    /// Terminal failure with the deciding error.
    Failed(String),
    /// Battery fault detected; the task is parked for a replug.
    PausedForBattery,
}

enum Halt {
    Battery,
    Fatal(String),
}

/// Drive one device through the pipeline. Updates `task` as it goes and
/// leaves it in a terminal or paused state matching the returned outcome.
pub fn run_device(task: &Arc<Mutex<DeviceTask>>, deps: &WorkerDeps) -> WorkerOutcome {
    let (port, force) = {
        let mut t = task.lock().unwrap();
        (t.port.clone(), t.force_action.take())
    };

    match pipeline(task, deps, &port, force) {
        Ok(()) => {
            let mut t = task.lock().unwrap();
            t.progress = 100;
            t.set_status(DeviceStatus::Completed, "completed");
            info!("{port}: production completed");
            WorkerOutcome::Completed
        },
        Err(Halt::Battery) => {
            task.lock().unwrap().pause_for_battery(BATTERY_MESSAGE);
            warn!("{port}: battery fault, pausing until replug");
            WorkerOutcome::PausedForBattery
        },
        Err(Halt::Fatal(error)) => {
            let mut t = task.lock().unwrap();
            t.add_error(error.clone());
            t.set_status(DeviceStatus::Failed, error.clone());
            warn!("{port}: production failed: {error}");
            WorkerOutcome::Failed(error)
        },
    }
}

fn pipeline(
    task: &Arc<Mutex<DeviceTask>>,
    deps: &WorkerDeps,
    port: &str,
    force: Option<ForceAction>,
) -> std::result::Result<(), Halt> {
    let mut detector = FaultDetector::new(deps.fault.clone());
    let mut cursor = 0u64;

    set(task, DeviceStatus::Connecting, "connecting", 2);
    let mut channel = connect_with_retries(deps, port, CONNECT_ATTEMPTS)?;

    set(task, DeviceStatus::Checking, "reading device status", 8);
    let report = match read_status(channel.as_mut()) {
        Ok(report) => report,
        Err(e) => {
            if scan_faults(channel.as_ref(), &mut cursor, &mut detector) {
                channel.close();
                return Err(Halt::Battery);
            }
            return Err(Halt::Fatal(format!("status read failed: {e}")));
        },
    };
    if scan_faults(channel.as_ref(), &mut cursor, &mut detector) {
        channel.close();
        return Err(Halt::Battery);
    }
    {
        let mut t = task.lock().unwrap();
        t.mac = report.mac.clone();
        t.fw_version = report.fw_version.clone();
        t.hw_version = report.hw_version.clone();
        t.battery_soc = report.battery_soc;
    }

    channel = firmware_step(task, deps, port, force, channel, &report.fw_version)?;
    // A fresh channel means a fresh sequence space.
    cursor = 0;
    detector.reset();

    backend_step(task, deps);

    let required = deps.audio.names();
    set(task, DeviceStatus::Checking, "enumerating files", 38);
    let present = transfer::list_device_files(channel.as_mut()).map_err(|e| {
        if scan_faults(channel.as_ref(), &mut cursor, &mut detector) {
            Halt::Battery
        } else {
            Halt::Fatal(format!("file enumeration failed: {e}"))
        }
    })?;
    let missing = transfer::missing_files(&required, &present);
    {
        let mut t = task.lock().unwrap();
        t.files_total = required.len() as u32;
        t.files_skipped = (required.len() - missing.len()) as u32;
    }
    debug!(
        "{port}: {} of {} required files already present",
        required.len() - missing.len(),
        required.len()
    );

    transfer_step(task, deps, port, channel.as_mut(), &missing, &mut cursor, &mut detector)?;

    set(task, DeviceStatus::Verifying, "verifying file manifest", 97);
    if let Err(e) = transfer::verify_required_files(channel.as_mut(), &required) {
        task.lock().unwrap().steps.audio = StepOutcome::Failed;
        return Err(Halt::Fatal(e.to_string()));
    }
    task.lock().unwrap().steps.audio = StepOutcome::Done;

    channel.close();
    Ok(())
}

fn set(task: &Arc<Mutex<DeviceTask>>, status: DeviceStatus, message: &str, progress: u8) {
    let mut t = task.lock().unwrap();
    t.set_status(status, message);
    t.progress = t.progress.max(progress);
}

/// Drain new replies into the fault detector. Returns `true` when the
/// missing-battery signature is complete.
fn scan_faults(channel: &dyn DeviceChannel, cursor: &mut u64, detector: &mut FaultDetector) -> bool {
    let replies = channel.replies_since(*cursor);
    if let Some(last) = replies.last() {
        *cursor = last.seq;
    }
    detector.observe_all(&replies)
}

fn connect_with_retries(
    deps: &WorkerDeps,
    port: &str,
    attempts: usize,
) -> std::result::Result<Box<dyn DeviceChannel>, Halt> {
    let mut last = String::new();
    for attempt in 1..=attempts {
        match deps.connector.connect(port) {
            Ok(channel) => return Ok(channel),
            Err(e) => {
                warn!("{port}: connect attempt {attempt}/{attempts} failed: {e}");
                last = e.to_string();
                if attempt < attempts {
                    thread::sleep(RETRY_DELAY * attempt as u32);
                }
            },
        }
    }
    Err(Halt::Fatal(format!(
        "could not connect after {attempts} attempts: {last}"
    )))
}

/// Flash if needed and reconnect. Consumes the current channel when a flash
/// happens (esptool needs the port to itself) and returns the channel to
/// keep using.
fn firmware_step(
    task: &Arc<Mutex<DeviceTask>>,
    deps: &WorkerDeps,
    port: &str,
    force: Option<ForceAction>,
    mut channel: Box<dyn DeviceChannel>,
    running_version: &Option<String>,
) -> std::result::Result<Box<dyn DeviceChannel>, Halt> {
    let Some(plan) = &deps.firmware else {
        task.lock().unwrap().steps.firmware = StepOutcome::Skipped;
        return Ok(channel);
    };
    if force == Some(ForceAction::Transfer) {
        task.lock().unwrap().steps.firmware = StepOutcome::Skipped;
        return Ok(channel);
    }

    let force_flash = force == Some(ForceAction::Flash);
    let already_flashed = task.lock().unwrap().firmware_flashed;
    if already_flashed && !force_flash {
        debug!("{port}: firmware already flashed in this task, skipping");
        task.lock().unwrap().steps.firmware = StepOutcome::Skipped;
        return Ok(channel);
    }
    let up_to_date = running_version
        .as_deref()
        .is_some_and(|v| normalize_version(v) == plan.image.version);
    if up_to_date && !force_flash {
        info!(
            "{port}: firmware {} already running, skipping flash",
            plan.image.version
        );
        task.lock().unwrap().steps.firmware = StepOutcome::Skipped;
        return Ok(channel);
    }

    set(
        task,
        DeviceStatus::Flashing,
        &format!("flashing firmware {}", plan.image.version),
        12,
    );
    channel.close();
    drop(channel);

    if let Err(e) = plan.flasher.flash(port, &plan.image) {
        task.lock().unwrap().steps.firmware = StepOutcome::Failed;
        return Err(Halt::Fatal(e.to_string()));
    }
    task.lock().unwrap().firmware_flashed = true;

    set(task, DeviceStatus::Connecting, "reconnecting after flash", 25);
    let mut channel = connect_with_retries(deps, port, RECONNECT_ATTEMPTS)?;

    // Independent confirmation that the new image actually runs. A version
    // mismatch here is a distinct failure from the tool reporting an error.
    let report = read_status(channel.as_mut())
        .map_err(|e| Halt::Fatal(format!("status read after flash failed: {e}")))?;
    let running = report.fw_version.as_deref().map(normalize_version);
    if running != Some(plan.image.version.as_str()) {
        task.lock().unwrap().steps.firmware = StepOutcome::Failed;
        return Err(Halt::Fatal(format!(
            "firmware version mismatch after flash: expected {}, device reports {}",
            plan.image.version,
            running.unwrap_or("nothing")
        )));
    }
    {
        let mut t = task.lock().unwrap();
        t.fw_version = report.fw_version.clone();
        t.steps.firmware = StepOutcome::Done;
        t.progress = t.progress.max(30);
    }
    Ok(channel)
}

/// Register with the backend. Failure degrades the run instead of ending
/// it: the device still gets its files, the step is just marked failed.
fn backend_step(task: &Arc<Mutex<DeviceTask>>, deps: &WorkerDeps) {
    let Some(backend) = &deps.backend else {
        task.lock().unwrap().steps.backend = StepOutcome::Skipped;
        return;
    };
    set(task, DeviceStatus::Registering, "registering with backend", 32);

    let (port, mac, fw, hw) = {
        let t = task.lock().unwrap();
        (
            t.port.clone(),
            t.mac.clone(),
            t.fw_version.clone(),
            t.hw_version.clone(),
        )
    };
    let Some(mac) = mac else {
        warn!("{port}: no MAC address, cannot register");
        let mut t = task.lock().unwrap();
        t.steps.backend = StepOutcome::Failed;
        t.add_error("registration skipped: device reported no MAC address");
        return;
    };

    match register_device(backend.as_ref(), &mac, fw.as_deref(), hw.as_deref(), deps.stage) {
        Ok(record) => {
            info!("{port}: registered as pcb {}", record.id);
            let mut t = task.lock().unwrap();
            t.pcb_id = Some(record.id);
            t.steps.backend = StepOutcome::Done;
        },
        Err(e) => {
            warn!("{port}: registration failed: {e}");
            let mut t = task.lock().unwrap();
            t.steps.backend = StepOutcome::Failed;
            t.add_error(format!("registration failed: {e}"));
        },
    }
}

fn transfer_step(
    task: &Arc<Mutex<DeviceTask>>,
    deps: &WorkerDeps,
    port: &str,
    channel: &mut dyn DeviceChannel,
    missing: &[String],
    cursor: &mut u64,
    detector: &mut FaultDetector,
) -> std::result::Result<(), Halt> {
    if missing.is_empty() {
        set(task, DeviceStatus::Transferring, "all files already present", 95);
        return Ok(());
    }

    let total = missing.len();
    for (index, name) in missing.iter().enumerate() {
        let data = deps
            .audio
            .get(name)
            .ok_or_else(|| Halt::Fatal(format!("audio library has no payload for {name}")))?;
        set(
            task,
            DeviceStatus::Transferring,
            &format!("sending {name} ({}/{total})", index + 1),
            40,
        );

        let mut done = false;
        for attempt in 1..=TRANSFER_ATTEMPTS {
            let progress_task = Arc::clone(task);
            let result = transfer::push_file(channel, name, data, deps.speed, &mut |sent, size| {
                let frac = if size == 0 { 1.0 } else { sent as f64 / size as f64 };
                let overall = 40.0 + 55.0 * ((index as f64 + frac) / total as f64);
                let mut t = progress_task.lock().unwrap();
                t.progress = t.progress.max(overall as u8);
            });
            match result {
                Ok(()) => {
                    task.lock().unwrap().files_transferred += 1;
                    done = true;
                    break;
                },
                Err(e) => {
                    warn!("{port}: {name} attempt {attempt}/{TRANSFER_ATTEMPTS} failed: {e}");
                    task.lock()
                        .unwrap()
                        .add_error(format!("{name} attempt {attempt}: {e}"));
                    if scan_faults(channel, cursor, detector) {
                        channel.close();
                        return Err(Halt::Battery);
                    }
                    if attempt < TRANSFER_ATTEMPTS {
                        thread::sleep(RETRY_DELAY);
                    }
                },
            }
        }
        if !done {
            task.lock().unwrap().steps.audio = StepOutcome::Failed;
            return Err(Halt::Fatal(format!(
                "transfer of {name} failed after {TRANSFER_ATTEMPTS} attempts"
            )));
        }
    }
    Ok(())
}
