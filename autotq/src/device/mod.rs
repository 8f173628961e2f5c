//! Device discovery and USB bridge classification.
//!
//! AutoTQ production units enumerate either as the ESP32-S3's native USB
//! CDC interface or behind one of the usual USB-to-UART bridges, depending
//! on the PCB revision.

use crate::error::{Error, Result};
use log::{debug, info, trace};

/// Known USB bridge/device kinds seen on AutoTQ hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbBridge {
    /// Espressif ESP32-S3 native USB CDC.
    Esp32S3,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// Arduino-branded CDC device.
    Arduino,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs.
const KNOWN_USB_DEVICES: &[(u16, &[u16], UsbBridge)] = &[
    (0x303A, &[0x1001, 0x0002], UsbBridge::Esp32S3),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], UsbBridge::Cp210x),
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        UsbBridge::Ch340,
    ),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        UsbBridge::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], UsbBridge::Prolific),
    (0x2341, &[], UsbBridge::Arduino),
];

impl UsbBridge {
    /// Classify a VID/PID combination.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Get a human-readable name for the bridge kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Esp32S3 => "ESP32-S3",
            Self::Cp210x => "CP210x",
            Self::Ch340 => "CH340/CH341",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Arduino => "Arduino",
            Self::Unknown => "Unknown",
        }
    }

    /// Check if this is a known/expected bridge kind.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Check if this bridge kind should be preferred during auto-selection.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Esp32S3 | Self::Cp210x)
    }
}

/// Discovered serial endpoint information.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Endpoint name/path (e.g., "/dev/ttyACM0" or "COM3").
    pub name: String,
    /// Classified bridge kind.
    pub device: UsbBridge,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Check if this endpoint is likely an AutoTQ unit.
    pub fn is_likely_autotq(&self) -> bool {
        self.device.is_known()
    }
}

/// Detect all available serial endpoints with metadata.
pub fn detect_ports() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort {
                    name: port_info.port_name.clone(),
                    device: UsbBridge::Unknown,
                    vid: None,
                    pid: None,
                    manufacturer: None,
                    product: None,
                    serial: None,
                };

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.manufacturer = usb_info.manufacturer;
                    detected.product = usb_info.product;
                    detected.serial = usb_info.serial_number;
                    detected.device = UsbBridge::from_vid_pid(usb_info.vid, usb_info.pid);

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, Device: {:?})",
                        port_info.port_name, usb_info.vid, usb_info.pid, detected.device
                    );
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Detect endpoints that are likely AutoTQ units.
pub fn detect_autotq_ports() -> Vec<DetectedPort> {
    detect_ports()
        .into_iter()
        .filter(DetectedPort::is_likely_autotq)
        .collect()
}

/// Auto-detect a single AutoTQ endpoint.
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();

    if let Some(port) = ports.iter().find(|p| p.device == UsbBridge::Esp32S3) {
        info!("Auto-detected ESP32-S3 native USB device: {}", port.name);
        return Ok(port.clone());
    }

    if let Some(port) = ports.iter().find(|p| p.device.is_high_priority()) {
        info!(
            "Auto-detected {} USB-UART bridge: {}",
            port.device.name(),
            port.name
        );
        return Ok(port.clone());
    }

    if let Some(port) = ports.iter().find(|p| p.device.is_known()) {
        info!(
            "Auto-detected {} USB-UART bridge: {}",
            port.device.name(),
            port.name
        );
        return Ok(port.clone());
    }

    if let Some(port) = ports.into_iter().next() {
        info!("Using first available port: {}", port.name);
        return Ok(port);
    }

    Err(Error::DeviceNotFound)
}

/// Format a list of detected endpoints for display.
pub fn format_port_list(ports: &[DetectedPort]) -> Vec<String> {
    let mut result = Vec::new();

    for port in ports {
        let device_info = if port.device.is_known() {
            format!(" [{}]", port.device.name())
        } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" [VID:{vid:04X} PID:{pid:04X}]")
        } else {
            String::new()
        };

        let product_info = port
            .product
            .as_ref()
            .map(|p| format!(" - {p}"))
            .unwrap_or_default();

        result.push(format!("{}{}{}", port.name, device_info, product_info));
    }

    result
}
