//! `autotq provision`: run the full production pipeline against one device.

use {
    crate::{
        config::Config,
        default_flasher, select_firmware,
        serial::{select_serial_port, SerialOptions},
        session_config, Cli,
    },
    anyhow::Result,
    autotq::{
        firmware::{DEFAULT_FLASH_BAUD, DEFAULT_FLASH_OFFSET},
        production::{run_device, DeviceTask, FirmwarePlan, SessionConnector, WorkerDeps, WorkerOutcome},
        transfer::{AudioLibrary, SpeedProfile, REQUIRED_AUDIO_FILES},
    },
    console::style,
    log::warn,
    std::sync::{Arc, Mutex},
};

pub fn run(cli: &Cli, config: &Config, no_flash: bool) -> Result<()> {
    let port = select_serial_port(&SerialOptions::from_cli(cli), config)?;
    let deps = build_deps(cli, config, no_flash)?;

    let task = Arc::new(Mutex::new(DeviceTask::new(&port.name, 1)));
    let outcome = run_device(&task, &deps);

    let task = task.lock().unwrap();
    match outcome {
        WorkerOutcome::Completed => {
            println!(
                "{} {} provisioned: fw {} mac {} ({} pushed, {} skipped)",
                style("✓").green(),
                port.name,
                task.fw_version.as_deref().unwrap_or("unknown"),
                task.mac.as_deref().unwrap_or("unknown"),
                task.files_transferred,
                task.files_skipped
            );
            Ok(())
        },
        WorkerOutcome::PausedForBattery => {
            println!(
                "{} {}: {}",
                style("!").yellow(),
                port.name,
                task.user_action_message
                    .as_deref()
                    .unwrap_or("battery required")
            );
            println!("re-run `autotq provision` after replugging");
            anyhow::bail!("device needs a battery")
        },
        WorkerOutcome::Failed(error) => {
            for line in &task.errors {
                warn!("{}: {line}", port.name);
            }
            anyhow::bail!("provisioning failed: {error}")
        },
    }
}

/// Worker dependencies for single-device and session commands.
pub fn build_deps(cli: &Cli, config: &Config, no_flash: bool) -> Result<WorkerDeps> {
    let audio_dir = crate::audio_dir(cli, config);
    let library = AudioLibrary::load(&audio_dir, &REQUIRED_AUDIO_FILES)?;

    let firmware = if no_flash {
        None
    } else {
        match select_firmware(&crate::firmware_dir(cli, config), None) {
            Ok(image) => Some(FirmwarePlan {
                image,
                flasher: Arc::new(default_flasher(DEFAULT_FLASH_BAUD, DEFAULT_FLASH_OFFSET)),
            }),
            Err(e) => {
                warn!("no firmware image available, skipping the flash step: {e}");
                None
            },
        }
    };

    Ok(WorkerDeps {
        connector: Arc::new(SessionConnector {
            config: session_config(cli, config),
        }),
        firmware,
        backend: None,
        audio: Arc::new(library),
        speed: SpeedProfile::from(cli.speed),
        stage: config.stage(),
        fault: config.fault_config(),
    })
}
