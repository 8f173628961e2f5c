//! Missing-battery fault detection.
//!
//! Devices on USB power alone cannot drive the pump board; its I2C
//! peripherals fail and the firmware spams characteristic error lines. The
//! detector watches the diagnostic stream for those lines and for explicit
//! command rejections, and trips once the evidence is conclusive.

use {
    crate::transport::{Reply, ReplyPayload},
    log::debug,
    serde_json::Value,
};

/// Tunable fault signature. Defaults match the deployed firmware's log
/// wording; both the substrings and the threshold can be overridden from
/// configuration when firmware wording changes.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    /// Diagnostic-line substrings that count as I2C failure evidence.
    pub substrings: Vec<String>,
    /// Number of matching lines before the detector trips.
    pub threshold: usize,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            substrings: vec![
                "i2cWriteReadNonStop returned Error".to_string(),
                "Wire.cpp".to_string(),
            ],
            threshold: 3,
        }
    }
}

/// Accumulating detector over one device's reply stream.
#[derive(Debug, Clone)]
pub struct FaultDetector {
    config: FaultConfig,
    hits: usize,
    rejected: bool,
}

impl FaultDetector {
    /// Detector with the given signature.
    #[must_use]
    pub fn new(config: FaultConfig) -> Self {
        Self {
            config,
            hits: 0,
            rejected: false,
        }
    }

    /// Feed one reply. Returns `true` once the detector is tripped.
    pub fn observe(&mut self, reply: &Reply) -> bool {
        match &reply.payload {
            ReplyPayload::Text(line) => {
                if self
                    .config
                    .substrings
                    .iter()
                    .any(|needle| line.contains(needle.as_str()))
                {
                    self.hits += 1;
                    debug!("fault evidence {}/{}: {line}", self.hits, self.config.threshold);
                }
            },
            ReplyPayload::Json(value) => {
                if is_rejection(value) {
                    debug!("device rejected a command: {value}");
                    self.rejected = true;
                }
            },
        }
        self.tripped()
    }

    /// Feed a batch of replies.
    pub fn observe_all(&mut self, replies: &[Reply]) -> bool {
        for reply in replies {
            self.observe(reply);
        }
        self.tripped()
    }

    /// Whether enough evidence has accumulated.
    #[must_use]
    pub fn tripped(&self) -> bool {
        self.rejected || self.hits >= self.config.threshold
    }

    /// Clear accumulated evidence, e.g. after a battery was connected.
    pub fn reset(&mut self) {
        self.hits = 0;
        self.rejected = false;
    }
}

impl Default for FaultDetector {
    fn default() -> Self {
        Self::new(FaultConfig::default())
    }
}

/// An explicit device-side rejection: `response == "error"` with a message
/// mentioning rejection. Firmware sends this when it refuses to run a
/// command without battery power.
fn is_rejection(value: &Value) -> bool {
    value.get("response").and_then(Value::as_str) == Some("error")
        && value
            .get("message")
            .and_then(Value::as_str)
            .is_some_and(|m| m.contains("rejected"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(seq: u64, line: &str) -> Reply {
        Reply {
            seq,
            payload: ReplyPayload::Text(line.to_string()),
        }
    }

    #[test]
    fn three_i2c_lines_trip_the_detector() {
        let mut detector = FaultDetector::default();
        assert!(!detector.observe(&text(1, "[  1202][E][Wire.cpp:513] requestFrom()")));
        assert!(!detector.observe(&text(2, "i2cWriteReadNonStop returned Error -1")));
        assert!(detector.observe(&text(3, "i2cWriteReadNonStop returned Error -1")));
        assert!(detector.tripped());
    }

    #[test]
    fn two_lines_are_not_enough() {
        let mut detector = FaultDetector::default();
        detector.observe(&text(1, "i2cWriteReadNonStop returned Error -1"));
        detector.observe(&text(2, "i2cWriteReadNonStop returned Error -1"));
        assert!(!detector.tripped());
    }

    #[test]
    fn unrelated_lines_are_ignored() {
        let mut detector = FaultDetector::default();
        for seq in 0..10 {
            detector.observe(&text(seq, "boot: chip revision v0.2"));
        }
        assert!(!detector.tripped());
    }

    #[test]
    fn explicit_rejection_trips_immediately() {
        let mut detector = FaultDetector::default();
        let reply = Reply {
            seq: 1,
            payload: ReplyPayload::Json(json!({
                "response": "error",
                "message": "command rejected: battery not present"
            })),
        };
        assert!(detector.observe(&reply));
    }

    #[test]
    fn non_rejection_errors_do_not_trip() {
        let mut detector = FaultDetector::default();
        let reply = Reply {
            seq: 1,
            payload: ReplyPayload::Json(json!({
                "response": "error",
                "message": "unknown command"
            })),
        };
        assert!(!detector.observe(&reply));
    }

    #[test]
    fn reset_clears_evidence() {
        let mut detector = FaultDetector::default();
        for seq in 0..3 {
            detector.observe(&text(seq, "Wire.cpp timeout"));
        }
        assert!(detector.tripped());
        detector.reset();
        assert!(!detector.tripped());
    }

    #[test]
    fn custom_signature_is_honored() {
        let mut detector = FaultDetector::new(FaultConfig {
            substrings: vec!["PMIC fault".to_string()],
            threshold: 1,
        });
        assert!(detector.observe(&text(1, "PMIC fault: undervoltage")));
    }
}
