//! Interactive serial port selection.
//!
//! Resolution order: explicit `--port`, configured port, then detection.
//! A single recognized device is auto-selected; multiple candidates open a
//! dialoguer prompt unless `--non-interactive` is set.

use {
    crate::{config::Config, CliError},
    anyhow::Result,
    autotq::device::{detect_ports, DetectedPort, UsbBridge},
    console::style,
    dialoguer::{theme::ColorfulTheme, Error as DialoguerError, Select},
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Offer all ports, not just recognized bridges.
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if ambiguous).
    pub non_interactive: bool,
}

impl SerialOptions {
    /// Options derived from the global CLI arguments.
    pub fn from_cli(cli: &crate::Cli) -> Self {
        Self {
            port: cli.port.clone(),
            list_all_ports: cli.list_all_ports,
            non_interactive: cli.non_interactive,
        }
    }
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<DetectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = detect_ports();
    if ports.is_empty() {
        return Err(usage_err("no serial ports found; is the device plugged in?"));
    }

    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| p.is_likely_autotq())
        .cloned()
        .collect();

    // Candidate set: recognized bridges first unless the user asks for all.
    let candidates: Vec<DetectedPort> = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    if options.non_interactive {
        return select_non_interactive(candidates);
    }

    match candidates.len().cmp(&1) {
        Ordering::Equal => {
            let port = candidates
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("candidate list changed underneath us"))?;
            info!("Auto-selected port: {} [{}]", port.name, port.device.name());
            Ok(port)
        },
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates)
        },
        Ordering::Less => Err(usage_err("no serial ports available")),
    }
}

fn select_non_interactive(candidates: Vec<DetectedPort>) -> Result<DetectedPort> {
    // Must be deterministic and never prompt. Ambiguity is a usage error.
    match candidates.len().cmp(&1) {
        Ordering::Equal => candidates
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("candidate list changed underneath us")),
        Ordering::Greater => Err(usage_err(
            "multiple candidate ports; pass --port to disambiguate",
        )),
        Ordering::Less => Err(usage_err("no serial ports available")),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(CliError::Usage(
            "interactive port selection needs a terminal; pass --port or --non-interactive"
                .to_string(),
        )
        .into())
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("port selection cancelled".to_string()).into()
            } else {
                CliError::Usage("port selection prompt failed".to_string()).into()
            }
        },
    }
}

/// Find a port by name, falling back to a placeholder when the user names a
/// port detection did not see.
fn find_port_by_name(name: &str) -> DetectedPort {
    let ports = detect_ports();

    if let Some(port) = ports.iter().find(|p| p.name == name) {
        return port.clone();
    }

    // Case-insensitive match (Windows COM ports).
    if let Some(port) = ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)) {
        return port.clone();
    }

    DetectedPort {
        name: name.to_string(),
        device: UsbBridge::Unknown,
        vid: None,
        pid: None,
        manufacturer: None,
        product: None,
        serial: None,
    }
}

/// Interactive port selection.
fn select_port_interactive(mut ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    eprintln!(
        "{} detected {} serial ports",
        style("i").blue(),
        ports.len()
    );

    // Recognized bridges first.
    ports.sort_by_key(|p| !p.is_likely_autotq());

    let labels: Vec<String> = ports
        .iter()
        .map(|port| {
            let name = if port.is_likely_autotq() {
                style(&port.name).bold().to_string()
            } else {
                port.name.clone()
            };

            let device_info = if port.device.is_known() {
                format!(" [{}]", style(port.device.name()).yellow())
            } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
                format!(" ({vid:04X}:{pid:04X})")
            } else {
                String::new()
            };

            let product = port
                .product
                .as_ref()
                .map(|p| format!(" - {}", style(p).dim()))
                .unwrap_or_default();

            format!("{name}{device_info}{product}")
        })
        .collect();

    // Truncate labels so narrow terminals don't wrap the selection list.
    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = labels
        .into_iter()
        .map(|n| console::truncate_str(&n, max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .ok_or_else(|| anyhow::anyhow!("invalid port index: {index}")),
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unknown_port(name: &str) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            device: UsbBridge::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    #[test]
    fn serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.list_all_ports);
        assert!(!options.non_interactive);
    }

    #[test]
    fn non_interactive_single_port_is_selected() {
        let selected = select_non_interactive(vec![unknown_port("/dev/ttyUSB0")]).unwrap();
        assert_eq!(selected.name, "/dev/ttyUSB0");
    }

    #[test]
    fn non_interactive_multiple_ports_is_usage_error() {
        let result = select_non_interactive(vec![
            unknown_port("/dev/ttyUSB0"),
            unknown_port("/dev/ttyUSB1"),
        ]);
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn non_interactive_no_ports_is_usage_error() {
        let result = select_non_interactive(vec![]);
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Usage(_))
        ));
    }

    #[test]
    fn explicit_port_bypasses_detection() {
        let options = SerialOptions {
            port: Some("/dev/ttyFAKE9".to_string()),
            ..Default::default()
        };
        let selected = select_serial_port(&options, &Config::default()).unwrap();
        assert_eq!(selected.name, "/dev/ttyFAKE9");
    }

    #[test]
    fn configured_port_is_used_when_cli_omits_one() {
        let mut config = Config::default();
        config.connection.serial = Some("/dev/ttyCFG0".to_string());

        let selected = select_serial_port(&SerialOptions::default(), &config).unwrap();
        assert_eq!(selected.name, "/dev/ttyCFG0");
    }
}
