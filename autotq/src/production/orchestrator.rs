//! Multi-device orchestration: port polling, worker lifecycle, session
//! bookkeeping.
//!
//! The orchestrator polls for ports once a second and diffs the result
//! against what it already knows. A new port spawns a worker thread; a
//! parked (battery-paused) port that reappears respawns one that resumes
//! where it left off; an unplugged non-terminal device is marked removed
//! and archived. All shared structure sits behind one coarse mutex, with
//! per-task mutexes for the state the dashboard renders.

use {
    super::{
        log::SessionLog,
        task::{DeviceStatus, DeviceTask, ForceAction, StepOutcome},
        worker::{run_device, WorkerDeps, WorkerOutcome},
    },
    crate::error::{Error, Result},
    log::{debug, info, warn},
    serde::Serialize,
    std::{
        collections::{HashMap, HashSet},
        sync::{Arc, Mutex},
        thread,
        time::Duration,
    },
};

/// Port scan cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Source of currently attached candidate ports.
pub trait PortScanner: Send + Sync {
    /// Port names present right now.
    fn scan(&self) -> Vec<String>;
}

/// Scanner over the real serial bus, filtered to ports that look like
/// AutoTQ devices.
pub struct AutotqPortScanner;

impl PortScanner for AutotqPortScanner {
    fn scan(&self) -> Vec<String> {
        crate::device::detect_autotq_ports()
            .into_iter()
            .map(|p| p.name)
            .collect()
    }
}

/// Session counters for the dashboard footer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    /// Devices that reached `Completed`.
    pub programmed: u64,
    /// Devices that reached `Failed`.
    pub failed: u64,
    /// Completion wall times, seconds, for the running average.
    pub completion_secs: Vec<u64>,
}

impl SessionStats {
    fn record(&mut self, task: &DeviceTask) {
        match task.status {
            DeviceStatus::Completed => {
                self.programmed += 1;
                self.completion_secs.push(task.duration().as_secs());
            },
            DeviceStatus::Failed => self.failed += 1,
            _ => {},
        }
    }

    /// Mean completion time across successful devices.
    #[must_use]
    pub fn average_completion(&self) -> Option<Duration> {
        if self.completion_secs.is_empty() {
            return None;
        }
        let total: u64 = self.completion_secs.iter().sum();
        Some(Duration::from_secs(total / self.completion_secs.len() as u64))
    }
}

/// Point-in-time copy of the whole session, serializable for the
/// dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Tasks with a live worker.
    pub active: Vec<DeviceTask>,
    /// Parked tasks waiting for a replug or a forced re-run.
    pub pending: Vec<DeviceTask>,
    /// Archived terminal tasks, oldest first.
    pub history: Vec<DeviceTask>,
    /// Session counters.
    pub stats: SessionStats,
}

struct ActiveEntry {
    task: Arc<Mutex<DeviceTask>>,
    generation: u64,
}

#[derive(Default)]
struct Shared {
    active: HashMap<String, ActiveEntry>,
    pending: HashMap<String, Arc<Mutex<DeviceTask>>>,
    history: Vec<Arc<Mutex<DeviceTask>>>,
    stats: SessionStats,
    next_device_number: u32,
    generation: u64,
}

type TerminalHook = Arc<dyn Fn(&DeviceTask) + Send + Sync>;

/// Drives a whole production session.
pub struct Orchestrator {
    shared: Arc<Mutex<Shared>>,
    deps: Arc<WorkerDeps>,
    scanner: Arc<dyn PortScanner>,
    log: Option<Arc<Mutex<SessionLog>>>,
    on_terminal: Option<TerminalHook>,
}

impl Orchestrator {
    /// New orchestrator over the given worker dependencies and scanner.
    #[must_use]
    pub fn new(deps: WorkerDeps, scanner: Arc<dyn PortScanner>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            deps: Arc::new(deps),
            scanner,
            log: None,
            on_terminal: None,
        }
    }

    /// Record terminal outcomes to a CSV session log.
    #[must_use]
    pub fn with_log(mut self, log: SessionLog) -> Self {
        self.log = Some(Arc::new(Mutex::new(log)));
        self
    }

    /// Invoke `hook` for every task reaching a terminal state (bell cues,
    /// notifications).
    #[must_use]
    pub fn on_terminal<F>(mut self, hook: F) -> Self
    where
        F: Fn(&DeviceTask) + Send + Sync + 'static,
    {
        self.on_terminal = Some(Arc::new(hook));
        self
    }

    /// One scan/diff/spawn cycle.
    pub fn poll_once(&self) {
        let ports: HashSet<String> = self.scanner.scan().into_iter().collect();
        let mut shared = self.shared.lock().unwrap();

        // Unplugged while a worker was running: archive as removed. The
        // worker thread notices on its own through I/O errors; its late
        // status writes are ignored because Removed is sticky, and its
        // completion handler finds its entry gone.
        let unplugged: Vec<String> = shared
            .active
            .keys()
            .filter(|p| !ports.contains(*p))
            .cloned()
            .collect();
        for port in unplugged {
            if let Some(entry) = shared.active.remove(&port) {
                let status = {
                    let mut t = entry.task.lock().unwrap();
                    if !t.status.is_terminal() {
                        t.set_status(DeviceStatus::Removed, "unplugged");
                    }
                    t.status
                };
                info!("{port}: unplugged ({})", status.label());
                self.finalize(&mut shared, &entry.task);
            }
        }

        // Parked tasks whose port is gone wait for the replug.
        for (port, task) in &shared.pending {
            if !ports.contains(port) {
                let mut t = task.lock().unwrap();
                if t.status == DeviceStatus::NeedsBattery {
                    t.set_status(DeviceStatus::WaitingRetry, "unplugged, waiting for replug");
                    // Replugging is the action; keep the operator flag up.
                    t.needs_user_action = true;
                }
            }
        }

        if crate::is_interrupt_requested() {
            return;
        }

        for port in &ports {
            if shared.active.contains_key(port) {
                continue;
            }
            let task = if let Some(task) = shared.pending.remove(port) {
                {
                    let mut t = task.lock().unwrap();
                    if t.status.is_paused() {
                        t.resumed_from_battery = true;
                        t.set_status(DeviceStatus::Connecting, "resuming after battery");
                    } else {
                        t.set_status(DeviceStatus::Connecting, "re-running");
                    }
                }
                info!("{port}: reappeared, resuming task");
                task
            } else {
                shared.next_device_number += 1;
                let number = shared.next_device_number;
                info!("{port}: new device #{number}");
                Arc::new(Mutex::new(DeviceTask::new(port, number)))
            };
            self.spawn_worker(&mut shared, port, task);
        }
    }

    fn spawn_worker(&self, shared: &mut Shared, port: &str, task: Arc<Mutex<DeviceTask>>) {
        shared.generation += 1;
        let generation = shared.generation;
        shared.active.insert(
            port.to_string(),
            ActiveEntry {
                task: Arc::clone(&task),
                generation,
            },
        );

        let shared_handle = Arc::clone(&self.shared);
        let deps = Arc::clone(&self.deps);
        let log = self.log.clone();
        let on_terminal = self.on_terminal.clone();
        let port = port.to_string();

        thread::spawn(move || {
            let outcome = run_device(&task, &deps);

            let mut shared = shared_handle.lock().unwrap();
            let owned = shared
                .active
                .get(&port)
                .is_some_and(|entry| entry.generation == generation);
            if !owned {
                // The orchestrator already archived this task (unplug) or
                // handed the port to a newer worker.
                debug!("{port}: stale worker finished, outcome discarded");
                return;
            }
            shared.active.remove(&port);

            match outcome {
                WorkerOutcome::PausedForBattery => {
                    shared.pending.insert(port, task);
                },
                WorkerOutcome::Completed | WorkerOutcome::Failed(_) => {
                    shared.stats.record(&task.lock().unwrap());
                    shared.history.push(Arc::clone(&task));
                    drop(shared);

                    let snapshot = task.lock().unwrap().clone();
                    if let Some(log) = &log {
                        if let Err(e) = log.lock().unwrap().append(&snapshot) {
                            warn!("session log write failed: {e}");
                        }
                    }
                    if let Some(hook) = &on_terminal {
                        hook(&snapshot);
                    }
                },
            }
        });
    }

    fn finalize(&self, shared: &mut Shared, task: &Arc<Mutex<DeviceTask>>) {
        shared.stats.record(&task.lock().unwrap());
        shared.history.push(Arc::clone(task));

        let snapshot = task.lock().unwrap().clone();
        if let Some(log) = &self.log {
            if let Err(e) = log.lock().unwrap().append(&snapshot) {
                warn!("session log write failed: {e}");
            }
        }
        if let Some(hook) = &self.on_terminal {
            hook(&snapshot);
        }
    }

    /// Poll until the process interrupt fires, then wait for in-flight
    /// workers to drain.
    pub fn run(&self) {
        info!("production loop started");
        while !crate::is_interrupt_requested() {
            self.poll_once();
            thread::sleep(POLL_INTERVAL);
        }
        info!("interrupt received, waiting for active workers");
        self.wait_idle(Duration::from_secs(30));
    }

    /// Block until no workers are active, up to `timeout`.
    pub fn wait_idle(&self, timeout: Duration) {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if self.shared.lock().unwrap().active.is_empty() {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        warn!("workers still active after {timeout:?}");
    }

    /// Copy of the whole session state for rendering.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let shared = self.shared.lock().unwrap();
        let collect = |tasks: &mut dyn Iterator<Item = &Arc<Mutex<DeviceTask>>>| {
            tasks.map(|t| t.lock().unwrap().clone()).collect::<Vec<_>>()
        };
        let mut active = collect(&mut shared.active.values().map(|e| &e.task));
        active.sort_by_key(|t| t.device_number);
        let mut pending = collect(&mut shared.pending.values());
        pending.sort_by_key(|t| t.device_number);
        let history = collect(&mut shared.history.iter());
        Snapshot {
            active,
            pending,
            history,
            stats: shared.stats.clone(),
        }
    }

    /// Manually force a device back into the pipeline. Only allowed when no
    /// worker is running for the port and the task last ended in
    /// `Completed`, `Failed`, or `Detected`. The next poll re-runs it.
    pub fn force_action(&self, port: &str, action: ForceAction) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.active.contains_key(port) {
            return Err(Error::Config(format!(
                "{port}: a worker is still running, cannot force"
            )));
        }

        let position = shared
            .history
            .iter()
            .rposition(|t| {
                let t = t.lock().unwrap();
                t.port == port
                    && matches!(
                        t.status,
                        DeviceStatus::Completed | DeviceStatus::Failed | DeviceStatus::Detected
                    )
            })
            .ok_or_else(|| {
                Error::Config(format!("{port}: no forceable task for this port"))
            })?;
        let task = shared.history.remove(position);

        {
            let mut t = task.lock().unwrap();
            match action {
                ForceAction::Flash => {
                    t.firmware_flashed = false;
                    t.steps.firmware = StepOutcome::Pending;
                },
                ForceAction::Transfer => {
                    t.steps.audio = StepOutcome::Pending;
                    t.files_transferred = 0;
                    t.files_skipped = 0;
                },
            }
            t.force_action = Some(action);
            t.errors.clear();
            t.progress = 0;
            t.set_status(DeviceStatus::Detected, "forced re-run queued");
        }
        info!("{port}: forced {action:?} queued");
        shared.pending.insert(port.to_string(), task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StageLabel;
    use crate::production::fault::FaultConfig;
    use crate::production::worker::{DeviceConnector, WorkerDeps};
    use crate::protocol::wire::Command;
    use crate::session::testing::ScriptedChannel;
    use crate::session::DeviceChannel;
    use crate::transfer::{AudioFile, AudioLibrary, SpeedProfile};
    use crate::transport::ReplyPayload;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct FakeScanner {
        ports: Mutex<Vec<String>>,
    }

    impl FakeScanner {
        fn new(ports: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                ports: Mutex::new(ports.iter().map(|s| s.to_string()).collect()),
            })
        }

        fn set(&self, ports: &[&str]) {
            *self.ports.lock().unwrap() = ports.iter().map(|s| s.to_string()).collect();
        }
    }

    impl PortScanner for FakeScanner {
        fn scan(&self) -> Vec<String> {
            self.ports.lock().unwrap().clone()
        }
    }

    fn healthy_channel(port: &str) -> ScriptedChannel {
        let mut files = vec!["inflating.wav".to_string()];
        ScriptedChannel::new(port, move |cmd| match cmd {
            Command::GetStatus => vec![ReplyPayload::Json(json!({
                "mac": "AA:BB:CC:DD:EE:FF",
                "fw_version": "1.2.3"
            }))],
            Command::ListFiles => vec![ReplyPayload::Json(json!({
                "response": "file_list",
                "files": files
            }))],
            Command::DownloadFile { filename, .. } => {
                files.push(filename.clone());
                vec![
                    ReplyPayload::Json(json!({"response": "binary_transfer_ready"})),
                    ReplyPayload::Json(
                        json!({"response": "binary_transfer_complete", "crc_check": "passed"}),
                    ),
                ]
            },
            _ => vec![],
        })
    }

    fn battery_fault_channel(port: &str) -> ScriptedChannel {
        ScriptedChannel::new(port, |cmd| match cmd {
            Command::GetStatus | Command::WifiGetMac => vec![
                ReplyPayload::Text("i2cWriteReadNonStop returned Error -1".to_string()),
                ReplyPayload::Text("i2cWriteReadNonStop returned Error -1".to_string()),
                ReplyPayload::Text("i2cWriteReadNonStop returned Error -1".to_string()),
            ],
            _ => vec![],
        })
    }

    struct FnConnector<F>(Mutex<F>);

    impl<F> DeviceConnector for FnConnector<F>
    where
        F: FnMut(&str) -> crate::error::Result<Box<dyn DeviceChannel>> + Send,
    {
        fn connect(&self, port: &str) -> crate::error::Result<Box<dyn DeviceChannel>> {
            (self.0.lock().unwrap())(port)
        }
    }

    fn deps_with<F>(connect: F) -> WorkerDeps
    where
        F: FnMut(&str) -> crate::error::Result<Box<dyn DeviceChannel>> + Send + 'static,
    {
        WorkerDeps {
            connector: Arc::new(FnConnector(Mutex::new(connect))),
            firmware: None,
            backend: None,
            audio: Arc::new(AudioLibrary::from_memory(vec![AudioFile {
                name: "inflating.wav".to_string(),
                data: vec![0x42; 200],
            }])),
            speed: SpeedProfile::Ludicrous,
            stage: StageLabel::Factory,
            fault: FaultConfig::default(),
        }
    }

    fn wait_until(orch: &Orchestrator, what: &str, pred: impl Fn(&Snapshot) -> bool) -> Snapshot {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let snapshot = orch.snapshot();
            if pred(&snapshot) {
                return snapshot;
            }
            assert!(Instant::now() < deadline, "timed out waiting for: {what}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn detected_port_runs_to_completion() {
        let scanner = FakeScanner::new(&["/dev/ttyACM0"]);
        let orch = Orchestrator::new(
            deps_with(|port| Ok(Box::new(healthy_channel(port)))),
            scanner,
        );

        orch.poll_once();
        let snapshot = wait_until(&orch, "task in history", |s| s.history.len() == 1);
        assert_eq!(snapshot.history[0].status, DeviceStatus::Completed);
        assert_eq!(snapshot.stats.programmed, 1);
        assert_eq!(snapshot.stats.failed, 0);
        assert!(snapshot.active.is_empty());
    }

    #[test]
    fn repolling_does_not_double_spawn() {
        let spawned = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&spawned);
        let scanner = FakeScanner::new(&["/dev/ttyACM0"]);
        let orch = Orchestrator::new(
            deps_with(move |port| {
                counter.fetch_add(1, Ordering::SeqCst);
                // Hold the worker alive across several polls.
                thread::sleep(Duration::from_millis(300));
                Ok(Box::new(healthy_channel(port)))
            }),
            scanner,
        );

        orch.poll_once();
        orch.poll_once();
        orch.poll_once();
        wait_until(&orch, "single task finished", |s| s.history.len() == 1);
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn battery_round_trip_resumes_on_replug() {
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connects);
        let scanner = FakeScanner::new(&["/dev/ttyACM0"]);
        let orch = Orchestrator::new(
            deps_with(move |port| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    // No battery on the first plug-in.
                    Ok(Box::new(battery_fault_channel(port)))
                } else {
                    Ok(Box::new(healthy_channel(port)))
                }
            }),
            Arc::clone(&scanner) as Arc<dyn PortScanner>,
        );

        orch.poll_once();
        let snapshot = wait_until(&orch, "task parked for battery", |s| s.pending.len() == 1);
        assert_eq!(snapshot.pending[0].status, DeviceStatus::NeedsBattery);
        assert!(snapshot.pending[0].needs_user_action);

        // Operator unplugs to fit the battery.
        scanner.set(&[]);
        orch.poll_once();
        let snapshot = wait_until(&orch, "waiting for replug", |s| {
            s.pending
                .first()
                .is_some_and(|t| t.status == DeviceStatus::WaitingRetry)
        });
        assert_eq!(snapshot.history.len(), 0);

        // Replug resumes the same task.
        scanner.set(&["/dev/ttyACM0"]);
        orch.poll_once();
        let snapshot = wait_until(&orch, "resumed task completed", |s| s.history.len() == 1);
        let task = &snapshot.history[0];
        assert_eq!(task.status, DeviceStatus::Completed);
        assert!(task.resumed_from_battery);
        assert_eq!(task.device_number, 1);
        assert_eq!(snapshot.stats.programmed, 1);
    }

    #[test]
    fn unplug_mid_run_archives_as_removed() {
        let scanner = FakeScanner::new(&["/dev/ttyACM0"]);
        let orch = Orchestrator::new(
            deps_with(|port| {
                thread::sleep(Duration::from_millis(300));
                Ok(Box::new(healthy_channel(port)))
            }),
            Arc::clone(&scanner) as Arc<dyn PortScanner>,
        );

        orch.poll_once();
        scanner.set(&[]);
        orch.poll_once();

        let snapshot = wait_until(&orch, "removed task archived", |s| s.history.len() == 1);
        assert_eq!(snapshot.history[0].status, DeviceStatus::Removed);
        // The stale worker finishing later must not resurrect the task.
        thread::sleep(Duration::from_millis(400));
        let snapshot = orch.snapshot();
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(snapshot.history[0].status, DeviceStatus::Removed);
    }

    #[test]
    fn terminal_hook_and_log_fire_on_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = SessionLog::create(dir.path()).expect("log");
        let log_path = log.path().to_path_buf();
        let cues = Arc::new(AtomicUsize::new(0));
        let cue_counter = Arc::clone(&cues);

        let scanner = FakeScanner::new(&["/dev/ttyACM0"]);
        let orch = Orchestrator::new(
            deps_with(|port| Ok(Box::new(healthy_channel(port)))),
            scanner,
        )
        .with_log(log)
        .on_terminal(move |task| {
            assert!(task.status.is_terminal());
            cue_counter.fetch_add(1, Ordering::SeqCst);
        });

        orch.poll_once();
        wait_until(&orch, "completion", |s| s.history.len() == 1);
        assert_eq!(cues.load(Ordering::SeqCst), 1);

        let contents = std::fs::read_to_string(&log_path).expect("read log");
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("completed"));
    }

    #[test]
    fn force_action_requeues_a_finished_task() {
        let scanner = FakeScanner::new(&["/dev/ttyACM0"]);
        let orch = Orchestrator::new(
            deps_with(|port| Ok(Box::new(healthy_channel(port)))),
            Arc::clone(&scanner) as Arc<dyn PortScanner>,
        );

        orch.poll_once();
        wait_until(&orch, "first run", |s| s.history.len() == 1);

        orch.force_action("/dev/ttyACM0", ForceAction::Transfer)
            .expect("force");
        let snapshot = orch.snapshot();
        assert!(snapshot.history.is_empty());
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.pending[0].status, DeviceStatus::Detected);

        orch.poll_once();
        let snapshot = wait_until(&orch, "forced re-run", |s| s.history.len() == 1);
        assert_eq!(snapshot.history[0].status, DeviceStatus::Completed);
        assert_eq!(snapshot.stats.programmed, 2);
    }

    #[test]
    fn force_action_is_refused_while_a_worker_runs() {
        let scanner = FakeScanner::new(&["/dev/ttyACM0"]);
        let orch = Orchestrator::new(
            deps_with(|port| {
                thread::sleep(Duration::from_millis(300));
                Ok(Box::new(healthy_channel(port)))
            }),
            scanner,
        );

        orch.poll_once();
        let result = orch.force_action("/dev/ttyACM0", ForceAction::Flash);
        assert!(matches!(result, Err(Error::Config(_))));
        wait_until(&orch, "worker drained", |s| s.active.is_empty());
    }

    #[test]
    fn force_action_on_unknown_port_is_an_error() {
        let scanner = FakeScanner::new(&[]);
        let orch = Orchestrator::new(
            deps_with(|port| Ok(Box::new(healthy_channel(port)))),
            scanner,
        );
        let result = orch.force_action("/dev/ttyUSB9", ForceAction::Flash);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn average_completion_time() {
        let mut stats = SessionStats::default();
        assert!(stats.average_completion().is_none());
        stats.completion_secs = vec![10, 20];
        assert_eq!(stats.average_completion(), Some(Duration::from_secs(15)));
    }
}
