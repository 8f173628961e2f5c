//! Registration boundary toward the production backend.
//!
//! The backend itself is an external service; this module only defines the
//! trait the production pipeline calls and the record types it exchanges.
//! Registration is deliberately two operations: an upsert *and* an
//! independent read-back, and it only counts as successful when both
//! succeed. The production layer treats a missing backend as a skipped
//! step, never as a failure.

use {
    crate::error::{Error, Result},
    log::debug,
    serde::{Deserialize, Serialize},
};

/// Production stage a record is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageLabel {
    /// Initial factory programming.
    Factory,
    /// Re-test after the thermal chamber.
    PostThermal,
}

impl StageLabel {
    /// Label as the backend schema spells it.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Factory => "factory",
            Self::PostThermal => "post_thermal",
        }
    }
}

/// Measurement categories attached to a PCB record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    /// Pump pressure ramp.
    Pump,
    /// Valve bleed-down.
    Valve,
    /// Idle current draw.
    DeviceIdle,
    /// Power rail check.
    Power,
}

/// A registered PCB as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcbRecord {
    /// Backend identifier.
    pub id: u64,
    /// Device MAC address, the identity key.
    pub mac: String,
    /// Firmware version recorded at registration time.
    pub fw_version: Option<String>,
    /// Hardware revision recorded at registration time.
    pub hw_version: Option<String>,
    /// Stage the record was filed under.
    pub stage: StageLabel,
    /// Whether the upsert created the record (false on re-registration).
    pub is_new: bool,
}

/// Backend operations the production pipeline needs.
pub trait Backend: Send + Sync {
    /// Create or update the PCB record for `mac`. Idempotent upsert.
    fn ensure_pcb(
        &self,
        mac: &str,
        fw_version: Option<&str>,
        hw_version: Option<&str>,
        stage: StageLabel,
    ) -> Result<PcbRecord>;

    /// Fetch a record by id. Used as the independent read-back.
    fn fetch_pcb(&self, id: u64) -> Result<PcbRecord>;
}

/// Register a device: upsert, then read the record back through a separate
/// call. Returns the read-back record.
pub fn register_device(
    backend: &dyn Backend,
    mac: &str,
    fw_version: Option<&str>,
    hw_version: Option<&str>,
    stage: StageLabel,
) -> Result<PcbRecord> {
    let upserted = backend.ensure_pcb(mac, fw_version, hw_version, stage)?;
    debug!(
        "backend upsert for {mac}: pcb {} ({})",
        upserted.id,
        if upserted.is_new { "new" } else { "existing" }
    );
    let fetched = backend.fetch_pcb(upserted.id)?;
    if fetched.mac != mac {
        return Err(Error::Backend(format!(
            "read-back mismatch: pcb {} carries mac {}, expected {mac}",
            fetched.id, fetched.mac
        )));
    }
    Ok(fetched)
}
