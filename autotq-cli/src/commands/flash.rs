//! `autotq flash`: flash firmware to one device.

use {
    crate::{
        config::Config,
        default_flasher, select_firmware,
        serial::{select_serial_port, SerialOptions},
        session_config, Cli,
    },
    anyhow::{Context, Result},
    autotq::{
        firmware::FirmwareFlasher,
        protocol::normalize_version,
        session::DeviceSession,
    },
    console::style,
    log::{info, warn},
    std::{path::Path, time::Duration},
};

/// Reconnect attempts while the device reboots after a flash.
const VERIFY_ATTEMPTS: usize = 5;

pub fn run(
    cli: &Cli,
    config: &Config,
    image: Option<&Path>,
    force: bool,
    flash_baud: u32,
    offset: &str,
) -> Result<()> {
    let image = select_firmware(&crate::firmware_dir(cli, config), image)?;
    let port = select_serial_port(&SerialOptions::from_cli(cli), config)?;

    // Read the running version first; an up-to-date device is left alone.
    let session_cfg = session_config(cli, config);
    let running = match DeviceSession::connect(&port.name, &session_cfg) {
        Ok(mut session) => {
            let version = session.status().ok().and_then(|r| r.fw_version);
            session.disconnect();
            version
        },
        Err(e) => {
            warn!("{}: no protocol session before flash ({e})", port.name);
            None
        },
    };

    if !force {
        if let Some(running) = &running {
            if normalize_version(running) == normalize_version(&image.version) {
                println!(
                    "{} firmware {} already running on {}, use --force to reflash",
                    style("✓").green(),
                    image.version,
                    port.name
                );
                return Ok(());
            }
        }
    }

    info!(
        "{}: flashing {} (running: {})",
        port.name,
        image.version,
        running.as_deref().unwrap_or("unknown")
    );
    let flasher = default_flasher(flash_baud, offset);
    flasher.flash(&port.name, &image)?;

    // Confirm the new version once the device reboots.
    let mut confirmed = None;
    for attempt in 1..=VERIFY_ATTEMPTS {
        std::thread::sleep(Duration::from_secs(attempt as u64));
        match DeviceSession::connect(&port.name, &session_cfg) {
            Ok(mut session) => {
                confirmed = session.status().ok().and_then(|r| r.fw_version);
                session.disconnect();
                break;
            },
            Err(e) => info!("{}: reconnect attempt {attempt} failed: {e}", port.name),
        }
    }

    match confirmed {
        Some(version) if normalize_version(&version) == normalize_version(&image.version) => {
            println!(
                "{} flashed and confirmed {} on {}",
                style("✓").green(),
                version,
                port.name
            );
            Ok(())
        },
        Some(version) => anyhow::bail!(
            "device reports {version} after flashing {}",
            image.version
        ),
        None => {
            // The flash itself succeeded; some boards need a manual replug
            // before the CDC interface comes back.
            warn!(
                "{}: flash completed but the device did not reconnect for verification",
                port.name
            );
            println!(
                "{} flashed {} on {} (unverified, replug the device)",
                style("!").yellow(),
                image.version,
                port.name
            );
            Ok(())
        },
    }
}
