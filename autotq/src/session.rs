//! Device session: connection lifecycle and command/response exchange.
//!
//! `DeviceSession` wraps a [`SerialTransport`] with device semantics: open,
//! stabilize, prove liveness, then exchange commands. The [`DeviceChannel`]
//! trait is the seam the transfer protocol and production pipeline are
//! written against, so tests drive them with a scripted channel instead of
//! real hardware.

use {
    crate::{
        error::{Error, Result},
        port::SerialConfig,
        protocol::wire::{Command, StatusReport},
        transport::{Reply, SerialTransport},
    },
    log::{debug, info},
    serde_json::Value,
    std::{thread, time::Duration},
};

/// Wait for the `get_status` liveness probe during connect.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait for a status reply.
const STATUS_TIMEOUT: Duration = Duration::from_secs(3);

/// Session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Baud rate (device firmware runs the CDC/UART at 115200).
    pub baud_rate: u32,
    /// Serial read/write timeout.
    pub io_timeout: Duration,
    /// Settle delay after opening the port. Commands sent while the device
    /// is still enumerating/booting are silently dropped by the firmware.
    pub stabilize: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115200,
            io_timeout: Duration::from_secs(5),
            stabilize: Duration::from_secs(2),
        }
    }
}

/// Command/response channel to one device.
///
/// The correlation discipline: take [`mark`](DeviceChannel::mark) *before*
/// sending, then only accept replies received after that marker. Replies
/// buffered from a previous exchange can never satisfy a later wait.
pub trait DeviceChannel: Send {
    /// The serial port this channel is bound to.
    fn port_name(&self) -> &str;

    /// Send one protocol command.
    fn send(&mut self, command: &Command) -> Result<()>;

    /// Write raw payload bytes inside an active transfer window.
    fn write_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Marker for "everything received so far".
    fn mark(&self) -> u64;

    /// Block up to `timeout` for a JSON reply after `since` matching
    /// `predicate`.
    fn wait_json(
        &self,
        since: u64,
        timeout: Duration,
        predicate: &dyn Fn(&Value) -> bool,
    ) -> Option<Value>;

    /// All replies (JSON and diagnostic text) received after `since`.
    fn replies_since(&self, since: u64) -> Vec<Reply>;

    /// Release the underlying connection. Idempotent.
    fn close(&mut self);
}

/// Read a device's identity block over any channel, falling back to
/// `wifi_get_mac` when the status reply omits the MAC.
pub fn read_status(channel: &mut dyn DeviceChannel) -> Result<StatusReport> {
    let since = channel.mark();
    channel.send(&Command::GetStatus)?;
    let mut report = channel
        .wait_json(since, STATUS_TIMEOUT, &|v| {
            StatusReport::from_reply(v).is_some()
        })
        .and_then(|v| StatusReport::from_reply(&v))
        .ok_or_else(|| Error::Timeout("no status reply".to_string()))?;

    if report.mac.is_none() {
        let since = channel.mark();
        channel.send(&Command::WifiGetMac)?;
        if let Some(reply) = channel.wait_json(since, STATUS_TIMEOUT, &|v| {
            v.get("mac").and_then(Value::as_str).is_some()
        }) {
            report.merge(StatusReport {
                mac: reply
                    .get("mac")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                ..Default::default()
            });
        }
    }

    Ok(report)
}

/// A live connection to one AutoTQ device.
pub struct DeviceSession {
    transport: SerialTransport,
}

impl DeviceSession {
    /// Open the port, wait out the stabilization delay, then prove the
    /// device is alive: any well-formed JSON reply to `get_status` within a
    /// few seconds counts, because firmware versions differ in which status
    /// fields they populate.
    pub fn connect(port_name: &str, config: &SessionConfig) -> Result<Self> {
        let serial = SerialConfig::new(port_name, config.baud_rate).with_timeout(config.io_timeout);
        let transport = SerialTransport::open(&serial)?;
        debug!("{port_name}: opened, stabilizing for {:?}", config.stabilize);
        thread::sleep(config.stabilize);

        let mut session = Self { transport };
        let since = session.transport.mark();
        session.transport.write_command(&Command::GetStatus)?;
        if session
            .transport
            .wait_json(since, LIVENESS_TIMEOUT, &|_| true)
            .is_none()
        {
            session.transport.close();
            return Err(Error::Connection(format!(
                "{port_name}: no response to liveness probe"
            )));
        }

        info!("{port_name}: device session established");
        Ok(session)
    }

    /// Wrap an existing transport without the open/stabilize/probe steps.
    #[must_use]
    pub fn from_transport(transport: SerialTransport) -> Self {
        Self { transport }
    }

    /// Read the device's identity block, falling back to `wifi_get_mac`
    /// when the status reply omits the MAC.
    pub fn status(&mut self) -> Result<StatusReport> {
        read_status(self)
    }

    /// Run a measurement sequence and return the raw sensor report.
    pub fn measure_sequence(&mut self, settle_ms: u32, pump_ms: u32, valve_ms: u32) -> Result<Value> {
        let since = self.transport.mark();
        self.transport.write_command(&Command::MeasureSequence {
            settle_ms,
            pump_ms,
            valve_ms,
        })?;
        // The sequence itself takes settle + pump + valve, plus flash/report
        // time on the device side.
        let budget = Duration::from_millis(u64::from(settle_ms + pump_ms + valve_ms))
            + Duration::from_secs(5);
        self.transport
            .wait_json(since, budget, &|v| {
                v.get("command").and_then(Value::as_str) == Some("measure_sequence")
            })
            .ok_or_else(|| Error::Timeout("no measurement report".to_string()))
    }

    /// Put the device to sleep. Fire-and-forget: sleeping firmware does not
    /// reply.
    pub fn sleep_device(&mut self, seconds: u32, defer_until_usb_unplug: bool) -> Result<()> {
        self.transport.write_command(&Command::Shutdown {
            seconds,
            defer_until_usb_unplug,
        })
    }

    /// Close the transport and release the port.
    pub fn disconnect(&mut self) {
        self.transport.close();
    }
}

impl DeviceChannel for DeviceSession {
    fn port_name(&self) -> &str {
        self.transport.port_name()
    }

    fn send(&mut self, command: &Command) -> Result<()> {
        self.transport.write_command(command)
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.transport.write_raw(data)
    }

    fn mark(&self) -> u64 {
        self.transport.mark()
    }

    fn wait_json(
        &self,
        since: u64,
        timeout: Duration,
        predicate: &dyn Fn(&Value) -> bool,
    ) -> Option<Value> {
        self.transport.wait_json(since, timeout, predicate)
    }

    fn replies_since(&self, since: u64) -> Vec<Reply> {
        self.transport.replies_since(since)
    }

    fn close(&mut self) {
        self.transport.close();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockPort;
    use std::sync::Arc;

    fn session_with_script(script: &[u8]) -> (DeviceSession, MockPort) {
        let (writer, reader) = MockPort::pair(script);
        let probe = MockPort {
            read_buf: Arc::clone(&writer.read_buf),
            write_buf: Arc::clone(&writer.write_buf),
            name: "mock".to_string(),
        };
        let transport = SerialTransport::from_ports(Box::new(writer), Box::new(reader), "mock");
        (DeviceSession::from_transport(transport), probe)
    }

    #[test]
    fn status_reads_identity_fields() {
        let (mut session, _probe) = session_with_script(
            b"{\"mac\":\"AA:BB:CC:DD:EE:FF\",\"fw_version\":\"v1.2.3\",\"battery_soc\":91.0}\n",
        );
        let report = session.status().expect("status");
        assert_eq!(report.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(report.fw_version.as_deref(), Some("v1.2.3"));
        session.disconnect();
    }

    #[test]
    fn status_falls_back_to_wifi_get_mac() {
        let (mut session, probe) = session_with_script(b"{\"fw_version\":\"1.0.0\"}\n");

        // The MAC reply arrives only after the fallback command is sent.
        let feeder = std::thread::spawn({
            let read_buf = Arc::clone(&probe.read_buf);
            let write_buf = Arc::clone(&probe.write_buf);
            move || {
                let deadline = std::time::Instant::now() + Duration::from_secs(2);
                loop {
                    let asked = String::from_utf8_lossy(&write_buf.lock().unwrap())
                        .contains("wifi_get_mac");
                    if asked {
                        read_buf
                            .lock()
                            .unwrap()
                            .extend(b"{\"mac\":\"11:22:33:44:55:66\"}\n".iter().copied());
                        return;
                    }
                    assert!(std::time::Instant::now() < deadline, "fallback never sent");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        });

        let report = session.status().expect("status");
        feeder.join().expect("feeder");
        assert_eq!(report.mac.as_deref(), Some("11:22:33:44:55:66"));
        assert_eq!(report.fw_version.as_deref(), Some("1.0.0"));
        session.disconnect();
    }

    #[test]
    fn status_times_out_without_reply() {
        let (mut session, _probe) = session_with_script(b"");
        let result = session.status();
        assert!(matches!(result, Err(Error::Timeout(_))));
        session.disconnect();
    }

    #[test]
    fn sleep_device_writes_shutdown_command() {
        let (mut session, probe) = session_with_script(b"");
        session.sleep_device(5, true).expect("send");
        let written = String::from_utf8_lossy(&probe.written()).to_string();
        assert!(written.contains("\"command\":\"shutdown\""));
        assert!(written.contains("\"defer_until_usb_unplug\":true"));
        session.disconnect();
    }
}
