//! Per-session CSV log of terminal task outcomes.
//!
//! One file per production session, named after its start time, one row per
//! device reaching a terminal state. The file is append-only and flushed
//! per row so a crash never loses completed devices.

use {
    super::task::{DeviceTask, StepOutcome},
    crate::error::Result,
    log::info,
    std::{
        fs::{File, OpenOptions},
        io::Write,
        path::{Path, PathBuf},
        time::{SystemTime, UNIX_EPOCH},
    },
};

const HEADER: &str = "timestamp,port,mac,pcb_id,firmware,status,firmware_step,backend_step,audio_step,duration_secs,error\n";

/// Append-only CSV log for one production session.
pub struct SessionLog {
    path: PathBuf,
    file: File,
}

impl SessionLog {
    /// Create `session_log_YYYYMMDD_HHMMSS.csv` in `dir` and write the
    /// header row.
    pub fn create(dir: &Path) -> Result<Self> {
        let now = Timestamp::now();
        let path = dir.join(format!(
            "session_log_{:04}{:02}{:02}_{:02}{:02}{:02}.csv",
            now.year, now.month, now.day, now.hour, now.minute, now.second
        ));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(HEADER.as_bytes())?;
        file.flush()?;
        info!("session log: {}", path.display());
        Ok(Self { path, file })
    }

    /// Path to the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one terminal task as a CSV row.
    pub fn append(&mut self, task: &DeviceTask) -> Result<()> {
        let now = Timestamp::now();
        let row = format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            now,
            csv_field(&task.port),
            csv_field(task.mac.as_deref().unwrap_or("")),
            task.pcb_id.map(|id| id.to_string()).unwrap_or_default(),
            csv_field(task.fw_version.as_deref().unwrap_or("")),
            task.status.label(),
            step_label(task.steps.firmware),
            step_label(task.steps.backend),
            step_label(task.steps.audio),
            task.duration().as_secs(),
            csv_field(task.last_error().unwrap_or("")),
        );
        self.file.write_all(row.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

fn step_label(outcome: StepOutcome) -> &'static str {
    match outcome {
        StepOutcome::Pending => "pending",
        StepOutcome::Skipped => "skipped",
        StepOutcome::Done => "done",
        StepOutcome::Failed => "failed",
    }
}

/// Quote a field when it contains CSV metacharacters.
fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Broken-down UTC wall time.
struct Timestamp {
    year: i64,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
}

impl Timestamp {
    fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        Self::from_unix(secs)
    }

    fn from_unix(secs: i64) -> Self {
        let days = secs.div_euclid(86_400);
        let tod = secs.rem_euclid(86_400) as u32;
        let (year, month, day) = civil_from_days(days);
        Self {
            year,
            month,
            day,
            hour: tod / 3600,
            minute: (tod / 60) % 60,
            second: tod % 60,
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}
