//! Typed messages for the newline-delimited JSON protocol.
//!
//! Commands serialize to single-line objects tagged with a `command` field.
//! Responses are free-form JSON objects; the firmware has no sequence
//! numbers, so replies are classified structurally by the helpers below and
//! correlated by the transport's monotonic receive marker.

use serde::Serialize;
use serde_json::Value;

/// A host-to-device command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Request the device's status/identity block.
    GetStatus,
    /// Request the device's MAC address. Fallback identification for
    /// firmware builds whose status reply omits the MAC.
    WifiGetMac,
    /// Request the device's stored file manifest.
    ListFiles,
    /// Announce an incoming binary file. Never carries payload; raw chunk
    /// bytes follow only after the device acknowledges readiness.
    DownloadFile {
        /// Target filename on the device filesystem.
        filename: String,
        /// Total file size in bytes.
        size: u32,
        /// Chunk size the sender will use.
        chunk_size: u32,
        /// CRC32 over the whole file, computed before any bytes flow.
        crc32: u32,
    },
    /// Run a pump/valve measurement sequence and report sensor frames.
    MeasureSequence {
        /// Settle time before sampling, in milliseconds.
        settle_ms: u32,
        /// Pump-on duration, in milliseconds.
        pump_ms: u32,
        /// Valve-open duration, in milliseconds.
        valve_ms: u32,
    },
    /// Put the device into low-power sleep.
    Shutdown {
        /// Delay before sleeping, in seconds.
        seconds: u32,
        /// Defer the shutdown until USB power is removed.
        defer_until_usb_unplug: bool,
    },
}

/// CRC status reported on `binary_transfer_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcStatus {
    /// Device verified the CRC and it matched.
    Passed,
    /// Device verified the CRC and it did not match.
    Failed,
    /// Device did not report a CRC status. Deployed firmware frequently
    /// omits the field; receipt of the completion message is then taken as
    /// success.
    Unreported,
}

/// Terminal transfer signal extracted from a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionKind {
    /// `binary_transfer_complete` with its CRC verdict.
    Complete(CrcStatus),
    /// `binary_transfer_aborted` with the device-supplied reason.
    Aborted(String),
}

fn response_field(value: &Value) -> Option<&str> {
    value.get("response").and_then(Value::as_str)
}

/// Check whether a reply is the `binary_transfer_ready` acknowledgement.
#[must_use]
pub fn is_transfer_ready(value: &Value) -> bool {
    response_field(value) == Some("binary_transfer_ready")
}

/// Classify a reply as a terminal transfer signal, if it is one.
#[must_use]
pub fn transfer_completion(value: &Value) -> Option<CompletionKind> {
    match response_field(value)? {
        "binary_transfer_complete" => {
            let crc = match value.get("crc_check").and_then(Value::as_str) {
                Some("passed") => CrcStatus::Passed,
                Some("failed") => CrcStatus::Failed,
                _ => CrcStatus::Unreported,
            };
            Some(CompletionKind::Complete(crc))
        },
        "binary_transfer_aborted" => {
            let reason = value
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            Some(CompletionKind::Aborted(reason))
        },
        _ => None,
    }
}

/// Extract a file manifest from a `file_list` reply.
#[must_use]
pub fn parse_file_list(value: &Value) -> Option<Vec<String>> {
    if response_field(value) != Some("file_list") && value.get("files").is_none() {
        return None;
    }
    let files = value.get("files")?.as_array()?;
    Some(
        files
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

/// Device identity and health as reported by `get_status`.
///
/// Field names vary across firmware versions (`mac` vs `mac_address`,
/// `fw_version` vs `version`), so extraction tries each spelling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    /// MAC address, the device's backend identity key.
    pub mac: Option<String>,
    /// Running firmware version.
    pub fw_version: Option<String>,
    /// Hardware revision.
    pub hw_version: Option<String>,
    /// Battery state of charge, percent.
    pub battery_soc: Option<f64>,
}

impl StatusReport {
    /// Extract a status report from a reply. Returns `None` when the reply
    /// carries none of the known identity fields.
    #[must_use]
    pub fn from_reply(value: &Value) -> Option<Self> {
        let mac = value
            .get("mac")
            .or_else(|| value.get("mac_address"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let fw_version = value
            .get("fw_version")
            .or_else(|| value.get("version"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let hw_version = value
            .get("hw_version")
            .and_then(Value::as_str)
            .map(str::to_string);
        let battery_soc = value.get("battery_soc").and_then(Value::as_f64);

        if mac.is_none() && fw_version.is_none() && hw_version.is_none() && battery_soc.is_none() {
            return None;
        }

        Some(Self {
            mac,
            fw_version,
            hw_version,
            battery_soc,
        })
    }

    /// Merge another report into this one, filling only missing fields.
    pub fn merge(&mut self, other: Self) {
        if self.mac.is_none() {
            self.mac = other.mac;
        }
        if self.fw_version.is_none() {
            self.fw_version = other.fw_version;
        }
        if self.hw_version.is_none() {
            self.hw_version = other.hw_version;
        }
        if self.battery_soc.is_none() {
            self.battery_soc = other.battery_soc;
        }
    }
}

/// Normalize a firmware version string for comparison by stripping a
/// leading `v`/`V` prefix and surrounding whitespace.
#[must_use]
pub fn normalize_version(version: &str) -> &str {
    let trimmed = version.trim();
    trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed)
}
