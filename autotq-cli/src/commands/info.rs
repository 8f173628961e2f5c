//! `autotq info`: read and print one device's identity block.

use {
    crate::{
        config::Config,
        serial::{select_serial_port, SerialOptions},
        session_config, Cli,
    },
    anyhow::{Context, Result},
    autotq::{session::DeviceSession, transfer},
    console::style,
};

pub fn run(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let port = select_serial_port(&SerialOptions::from_cli(cli), config)?;

    let mut session = DeviceSession::connect(&port.name, &session_config(cli, config))
        .with_context(|| format!("could not open a session on {}", port.name))?;

    let report = session.status().context("status read failed")?;
    let files = transfer::list_device_files(&mut session).unwrap_or_default();
    session.disconnect();

    let required: Vec<String> = transfer::REQUIRED_AUDIO_FILES
        .iter()
        .map(ToString::to_string)
        .collect();
    let missing = transfer::missing_files(&required, &files);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "port": port.name,
                "mac": report.mac,
                "fw_version": report.fw_version,
                "hw_version": report.hw_version,
                "battery_soc": report.battery_soc,
                "files": files,
                "missing_files": missing,
            }))?
        );
        return Ok(());
    }

    println!("{}", style(format!("Device on {}", port.name)).bold());
    print_field("MAC", report.mac.as_deref());
    print_field("Firmware", report.fw_version.as_deref());
    print_field("Hardware", report.hw_version.as_deref());
    if let Some(soc) = report.battery_soc {
        println!("  Battery:   {soc:.0}%");
    }

    println!("  Files:     {} on device", files.len());
    if missing.is_empty() {
        println!("  Audio:     {} complete", style("✓").green());
    } else {
        println!(
            "  Audio:     {} missing {}",
            style("✗").red(),
            missing.join(", ")
        );
    }

    Ok(())
}

fn print_field(label: &str, value: Option<&str>) {
    println!("  {:<10} {}", format!("{label}:"), value.unwrap_or("(unknown)"));
}
