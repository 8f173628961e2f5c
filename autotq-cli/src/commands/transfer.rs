//! `autotq transfer`: push audio files to one device.

use {
    crate::{
        config::Config,
        serial::{select_serial_port, SerialOptions},
        session_config, use_fancy_output, Cli, CliError,
    },
    anyhow::{Context, Result},
    autotq::{
        session::DeviceSession,
        transfer::{self, AudioLibrary, SpeedProfile},
    },
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    log::info,
    std::time::Instant,
};

pub fn run(cli: &Cli, config: &Config, files: &[String], all: bool) -> Result<()> {
    let audio_dir = crate::audio_dir(cli, config);

    let required: Vec<&str> = if files.is_empty() {
        transfer::REQUIRED_AUDIO_FILES.to_vec()
    } else {
        files.iter().map(String::as_str).collect()
    };
    let library = AudioLibrary::load(&audio_dir, &required)
        .with_context(|| format!("loading audio files from {}", audio_dir.display()))?;

    let port = select_serial_port(&SerialOptions::from_cli(cli), config)?;
    let mut session = DeviceSession::connect(&port.name, &session_config(cli, config))
        .with_context(|| format!("could not open a session on {}", port.name))?;

    let wanted = library.names();
    let to_push: Vec<String> = if all {
        wanted
    } else {
        let present = transfer::list_device_files(&mut session).context("file enumeration failed")?;
        let missing = transfer::missing_files(&wanted, &present);
        let skipped = wanted.len() - missing.len();
        if skipped > 0 {
            info!("{skipped} file(s) already on the device, skipping");
        }
        missing
    };

    if to_push.is_empty() {
        session.disconnect();
        println!("{} all files already present", style("✓").green());
        return Ok(());
    }

    let speed = SpeedProfile::from(cli.speed);
    for name in &to_push {
        let data = library
            .get(name)
            .ok_or_else(|| CliError::Usage(format!("{name} not found in {}", audio_dir.display())))?;
        push_with_progress(&mut session, name, data, speed)?;
    }

    let names: Vec<String> = to_push.clone();
    transfer::verify_required_files(&mut session, &names).context("post-transfer verification")?;
    session.disconnect();

    println!(
        "{} pushed {} file(s) to {}",
        style("✓").green(),
        to_push.len(),
        port.name
    );
    Ok(())
}

/// Push files to every detected device at once, one thread per port.
pub fn run_bulk(cli: &Cli, config: &Config, files: &[String], all: bool) -> Result<()> {
    let audio_dir = crate::audio_dir(cli, config);

    let required: Vec<&str> = if files.is_empty() {
        transfer::REQUIRED_AUDIO_FILES.to_vec()
    } else {
        files.iter().map(String::as_str).collect()
    };
    let library = std::sync::Arc::new(
        AudioLibrary::load(&audio_dir, &required)
            .with_context(|| format!("loading audio files from {}", audio_dir.display()))?,
    );

    let ports = autotq::device::detect_autotq_ports();
    if ports.is_empty() {
        return Err(CliError::Usage("no AutoTQ devices detected".to_string()).into());
    }
    info!("bulk transfer to {} device(s)", ports.len());

    let session_cfg = session_config(cli, config);
    let speed = SpeedProfile::from(cli.speed);

    let handles: Vec<_> = ports
        .into_iter()
        .map(|port| {
            let library = std::sync::Arc::clone(&library);
            let session_cfg = session_cfg.clone();
            std::thread::spawn(move || -> (String, anyhow::Result<usize>) {
                let result = bulk_one(&port.name, &session_cfg, &library, speed, all);
                (port.name, result)
            })
        })
        .collect();

    let mut failures = 0usize;
    for handle in handles {
        let (port, result) = handle
            .join()
            .unwrap_or_else(|_| ("<panicked>".to_string(), Err(anyhow::anyhow!("worker panicked"))));
        match result {
            Ok(pushed) => println!("{} {port}: {pushed} file(s) pushed", style("✓").green()),
            Err(e) => {
                failures += 1;
                eprintln!("{} {port}: {e:#}", style("✗").red());
            },
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} device(s) failed");
    }
    Ok(())
}

fn bulk_one(
    port: &str,
    session_cfg: &autotq::session::SessionConfig,
    library: &AudioLibrary,
    speed: SpeedProfile,
    all: bool,
) -> anyhow::Result<usize> {
    let mut session = DeviceSession::connect(port, session_cfg)?;

    let wanted = library.names();
    let to_push: Vec<String> = if all {
        wanted
    } else {
        let present = transfer::list_device_files(&mut session)?;
        transfer::missing_files(&wanted, &present)
    };

    for name in &to_push {
        let data = library
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("{name} missing from the audio library"))?;
        info!("{port}: pushing {name} ({} bytes)", data.len());
        transfer::push_file(&mut session, name, data, speed, &mut |_, _| {})?;
    }

    if !to_push.is_empty() {
        transfer::verify_required_files(&mut session, &to_push)?;
    }
    session.disconnect();
    Ok(to_push.len())
}

/// Push one file, rendering a progress bar on a TTY.
pub fn push_with_progress(
    session: &mut DeviceSession,
    name: &str,
    data: &[u8],
    speed: SpeedProfile,
) -> Result<()> {
    let bar = if use_fancy_output() {
        let bar = ProgressBar::new(data.len() as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )?
            .progress_chars("#>-"),
        );
        bar.set_message(name.to_string());
        Some(bar)
    } else {
        info!("pushing {name} ({} bytes)", data.len());
        None
    };

    let started = Instant::now();
    let result = transfer::push_file(session, name, data, speed, &mut |sent, _total| {
        if let Some(bar) = &bar {
            bar.set_position(sent as u64);
        }
    });

    match result {
        Ok(()) => {
            let bps = transfer::throughput_bps(data.len(), started.elapsed());
            if let Some(bar) = bar {
                bar.finish_with_message(format!("{name} done ({:.1} KiB/s)", bps / 1024.0));
            } else {
                info!("{name} done ({:.1} KiB/s)", bps / 1024.0);
            }
            Ok(())
        },
        Err(e) => {
            if let Some(bar) = bar {
                bar.abandon_with_message(format!("{name} failed"));
            }
            Err(e).with_context(|| format!("transfer of {name} failed"))
        },
    }
}
