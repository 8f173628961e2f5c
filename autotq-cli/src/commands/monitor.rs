//! `autotq monitor`: raw serial monitor for watching device log output.

use {
    crate::{
        config::Config,
        serial::{select_serial_port, SerialOptions},
        Cli,
    },
    anyhow::{Context, Result},
    log::info,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

pub fn run(cli: &Cli, config: &Config, monitor_baud: u32) -> Result<()> {
    let port = select_serial_port(&SerialOptions::from_cli(cli), config)?;

    let mut serial = serialport::new(&port.name, monitor_baud)
        .timeout(Duration::from_millis(100))
        .open()
        .with_context(|| format!("could not open {} at {monitor_baud} baud", port.name))?;

    info!("monitoring {} at {monitor_baud} baud (Ctrl-C to exit)", port.name);

    let stdout = std::io::stdout();
    let mut buffer = [0u8; 1024];
    loop {
        if autotq::is_interrupt_requested() {
            break;
        }
        match serial.read(&mut buffer) {
            Ok(0) => {},
            Ok(n) => {
                let mut out = stdout.lock();
                out.write_all(&buffer[..n])?;
                out.flush()?;
            },
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e).context("serial read failed"),
        }
    }

    info!("monitor stopped");
    Ok(())
}
