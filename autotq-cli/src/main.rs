//! AutoTQ factory command-line tool.
//!
//! Single-device commands (`info`, `flash`, `transfer`, `provision`) operate
//! on one port, selected explicitly or interactively. `run` starts the
//! multi-device production session and keeps going until interrupted.

use {
    anyhow::Result,
    autotq::{
        device,
        firmware::{EsptoolFlasher, FirmwareImage, DEFAULT_FLASH_BAUD, DEFAULT_FLASH_OFFSET},
        session::SessionConfig,
        transfer::SpeedProfile,
    },
    clap::{CommandFactory, Parser, Subcommand, ValueEnum},
    clap_complete::Shell,
    log::debug,
    std::{
        io::IsTerminal,
        path::PathBuf,
        process,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, LazyLock,
        },
        time::Duration,
    },
};

mod commands;
mod config;
mod serial;

use config::Config;

/// Whether stderr is a terminal, cached once.
static STDERR_IS_TTY: LazyLock<bool> = LazyLock::new(|| std::io::stderr().is_terminal());

/// Fancy output (colors, spinners) only on a TTY without `NO_COLOR`.
fn use_fancy_output() -> bool {
    *STDERR_IS_TTY && std::env::var_os("NO_COLOR").is_none()
}

/// CLI error classes, mapped to exit codes.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Bad invocation or unusable environment. Exit code 2.
    #[error("{0}")]
    Usage(String),
    /// User cancelled an interactive prompt. Exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_CANCELLED: i32 = 130;

/// Transfer pacing, as exposed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Speed {
    /// 1 KiB chunks, conservative pacing.
    Normal,
    /// 2 KiB chunks.
    Fast,
    /// 4 KiB chunks.
    Ultra,
    /// 8 KiB chunks, no inter-piece delay.
    Ludicrous,
}

impl From<Speed> for SpeedProfile {
    fn from(speed: Speed) -> Self {
        match speed {
            Speed::Normal => Self::Normal,
            Speed::Fast => Self::Fast,
            Speed::Ultra => Self::Ultra,
            Speed::Ludicrous => Self::Ludicrous,
        }
    }
}

/// AutoTQ factory production tool.
#[derive(Debug, Parser)]
#[command(
    name = "autotq",
    version,
    about = "Program and provision AutoTQ devices",
    long_about = "Flash firmware, push audio files, and run multi-device \
                  production sessions for AutoTQ hardware over USB serial."
)]
pub struct Cli {
    /// Serial port (e.g. /dev/ttyACM0 or COM3). Auto-detected when omitted.
    #[arg(short, long, global = true, env = "AUTOTQ_PORT")]
    pub port: Option<String>,

    /// Baud rate for the device protocol.
    #[arg(short, long, global = true, env = "AUTOTQ_BAUD", default_value_t = 115200)]
    pub baud: u32,

    /// Transfer speed profile.
    #[arg(long, global = true, env = "AUTOTQ_SPEED", value_enum, default_value_t = Speed::Normal)]
    pub speed: Speed,

    /// Directory holding the required audio files.
    #[arg(long, global = true, env = "AUTOTQ_AUDIO_DIR", default_value = "audio_files")]
    pub audio_dir: PathBuf,

    /// Directory holding firmware images (and optional manifest.json).
    #[arg(long, global = true, env = "AUTOTQ_FIRMWARE_DIR", default_value = "firmware")]
    pub firmware_dir: PathBuf,

    /// Never prompt; fail instead of asking.
    #[arg(long, global = true)]
    pub non_interactive: bool,

    /// Offer every serial port during selection, not just recognized ones.
    #[arg(long, global = true)]
    pub list_all_ports: bool,

    /// Config file path (defaults to ./autotq.toml, then the user config dir).
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v: debug, -vv: trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only print warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List detected serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Read and print device identity and battery state.
    Info {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Push audio files to one device.
    Transfer {
        /// Specific files to push (defaults to the required set).
        files: Vec<String>,
        /// Push all files even if the device already has them.
        #[arg(long)]
        all: bool,
    },

    /// Push audio files to every detected device in parallel.
    BulkTransfer {
        /// Specific files to push (defaults to the required set).
        files: Vec<String>,
        /// Push all files even if devices already have them.
        #[arg(long)]
        all: bool,
    },

    /// Flash firmware to one device.
    Flash {
        /// Image path. Defaults to the newest image in the firmware directory.
        #[arg(long, value_name = "FILE")]
        image: Option<PathBuf>,
        /// Flash even if the running version already matches.
        #[arg(long)]
        force: bool,
        /// Baud rate for the esptool transfer.
        #[arg(long, default_value_t = DEFAULT_FLASH_BAUD)]
        flash_baud: u32,
        /// Flash offset for the application image.
        #[arg(long, default_value = DEFAULT_FLASH_OFFSET)]
        offset: String,
    },

    /// Fully prepare one device: flash, register, push audio, verify.
    Provision {
        /// Skip the firmware step.
        #[arg(long)]
        no_flash: bool,
    },

    /// Run a multi-device production session until interrupted.
    Run {
        /// Directory for the session CSV log.
        #[arg(long, default_value = "logs")]
        log_dir: PathBuf,
        /// Skip the firmware step for every device.
        #[arg(long)]
        no_flash: bool,
        /// Disable the terminal bell on completion/failure.
        #[arg(long)]
        no_bell: bool,
    },

    /// Attach a raw serial monitor to one device.
    Monitor {
        /// Baud rate for the monitor.
        #[arg(long, default_value_t = 115200)]
        monitor_baud: u32,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Target shell.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    init_logging(&cli);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        autotq::set_interrupt_checker(move || flag.load(Ordering::Relaxed));
    }
    let ctrlc_flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || {
        ctrlc_flag.store(true, Ordering::Relaxed);
        eprintln!("\ninterrupt received, finishing up");
    }) {
        debug!("could not install Ctrl-C handler: {e}");
    }

    match dispatch(&cli) {
        Ok(()) => 0,
        Err(e) => {
            if let Some(cli_err) = e.downcast_ref::<CliError>() {
                eprintln!("error: {cli_err}");
                return match cli_err {
                    CliError::Usage(_) => EXIT_USAGE,
                    CliError::Cancelled(_) => EXIT_CANCELLED,
                };
            }
            eprintln!("error: {e:#}");
            EXIT_FAILURE
        },
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    builder.format_target(cli.verbose >= 2);
    if cli.verbose >= 2 {
        builder.format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis));
    } else {
        builder.format_timestamp(None);
    }
    builder.init();
}

fn dispatch(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::ListPorts { json } => cmd_list_ports(*json),
        Commands::Info { json } => commands::info::run(cli, &config, *json),
        Commands::Transfer { files, all } => commands::transfer::run(cli, &config, files, *all),
        Commands::BulkTransfer { files, all } => {
            commands::transfer::run_bulk(cli, &config, files, *all)
        },
        Commands::Flash {
            image,
            force,
            flash_baud,
            offset,
        } => commands::flash::run(cli, &config, image.as_deref(), *force, *flash_baud, offset),
        Commands::Provision { no_flash } => commands::provision::run(cli, &config, *no_flash),
        Commands::Run {
            log_dir,
            no_flash,
            no_bell,
        } => commands::run::run(cli, &config, log_dir, *no_flash, *no_bell),
        Commands::Monitor { monitor_baud } => commands::monitor::run(cli, &config, *monitor_baud),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        },
    }
}

fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = device::detect_ports();

    if json {
        let entries: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": p.device.name(),
                    "known": p.device.is_known(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    println!("Detected {} port(s):", ports.len());
    for line in device::format_port_list(&ports) {
        println!("  {line}");
    }
    Ok(())
}

fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "autotq", &mut std::io::stdout());
}

/// Session parameters derived from the global CLI arguments and config.
pub fn session_config(cli: &Cli, config: &Config) -> SessionConfig {
    SessionConfig {
        baud_rate: config.effective_baud(cli.baud),
        ..SessionConfig::default()
    }
}

/// Firmware image selection shared by `flash`, `provision`, and `run`.
pub fn select_firmware(
    firmware_dir: &std::path::Path,
    explicit: Option<&std::path::Path>,
) -> Result<FirmwareImage> {
    if let Some(path) = explicit {
        let version = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .ok_or_else(|| CliError::Usage(format!("unreadable image path: {}", path.display())))?;
        return Ok(FirmwareImage {
            version,
            path: path.to_path_buf(),
            chip: autotq::firmware::DEFAULT_CHIP.to_string(),
        });
    }
    Ok(FirmwareImage::discover(firmware_dir)?)
}

/// Firmware directory after applying the config override.
pub fn firmware_dir(cli: &Cli, config: &Config) -> PathBuf {
    config
        .firmware_dir
        .clone()
        .unwrap_or_else(|| cli.firmware_dir.clone())
}

/// Audio directory after applying the config override.
pub fn audio_dir(cli: &Cli, config: &Config) -> PathBuf {
    config
        .audio_dir
        .clone()
        .unwrap_or_else(|| cli.audio_dir.clone())
}

/// Default esptool invocation for the configured flash settings.
pub fn default_flasher(flash_baud: u32, offset: &str) -> EsptoolFlasher {
    EsptoolFlasher {
        esptool: PathBuf::from("esptool"),
        baud: flash_baud,
        offset: offset.to_string(),
    }
}

/// Sleep in short slices so Ctrl-C stays responsive. Returns `true` when
/// interrupted.
pub fn interruptible_sleep(total: Duration) -> bool {
    let slice = Duration::from_millis(100);
    let mut remaining = total;
    while !remaining.is_zero() {
        if autotq::is_interrupt_requested() {
            return true;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    autotq::is_interrupt_requested()
}
