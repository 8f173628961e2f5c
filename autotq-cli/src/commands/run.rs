//! `autotq run`: the multi-device production session.
//!
//! Polls for devices, spawns workers through the orchestrator, and redraws
//! a status dashboard once a second. Ctrl-C stops new work and waits for
//! running workers to finish.

use {
    crate::{commands::provision::build_deps, config::Config, interruptible_sleep, use_fancy_output, Cli},
    anyhow::{Context, Result},
    autotq::production::{
        AutotqPortScanner, DeviceStatus, DeviceTask, Orchestrator, SessionLog, Snapshot,
        POLL_INTERVAL,
    },
    console::{style, Term},
    log::info,
    std::{path::Path, sync::Arc, time::Duration},
};

/// How long to wait for in-flight workers after an interrupt.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub fn run(cli: &Cli, config: &Config, log_dir: &Path, no_flash: bool, no_bell: bool) -> Result<()> {
    let deps = build_deps(cli, config, no_flash)?;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let log = SessionLog::create(log_dir)?;
    info!("session log: {}", log.path().display());

    let mut orchestrator = Orchestrator::new(deps, Arc::new(AutotqPortScanner)).with_log(log);
    if !no_bell && use_fancy_output() {
        orchestrator = orchestrator.on_terminal(|task| {
            // One bell for success, two for failure.
            let cues = if task.status == DeviceStatus::Failed { 2 } else { 1 };
            for _ in 0..cues {
                eprint!("\x07");
            }
        });
    }

    let term = Term::stderr();
    let fancy = use_fancy_output();
    if fancy {
        term.hide_cursor().ok();
    }
    println!("production session started, plug in devices (Ctrl-C to stop)");

    loop {
        orchestrator.poll_once();
        if fancy {
            render(&term, &orchestrator.snapshot());
        }
        if interruptible_sleep(POLL_INTERVAL) {
            break;
        }
    }

    if fancy {
        term.show_cursor().ok();
    }
    info!("waiting up to {}s for running workers", DRAIN_TIMEOUT.as_secs());
    orchestrator.wait_idle(DRAIN_TIMEOUT);

    let snapshot = orchestrator.snapshot();
    print_summary(&snapshot);
    Ok(())
}

fn render(term: &Term, snapshot: &Snapshot) {
    let mut lines = Vec::new();

    lines.push(format!(
        "{}  programmed {}  failed {}  avg {}",
        style("AutoTQ production").bold(),
        style(snapshot.stats.programmed).green(),
        style(snapshot.stats.failed).red(),
        snapshot
            .stats
            .average_completion()
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "-".to_string()),
    ));
    lines.push(String::new());

    if snapshot.active.is_empty() && snapshot.pending.is_empty() {
        lines.push("waiting for devices...".to_string());
    }

    for task in snapshot.active.iter().chain(&snapshot.pending) {
        lines.push(task_line(task));
        if task.needs_user_action {
            if let Some(action) = &task.user_action_message {
                lines.push(format!("      {} {}", style("action:").yellow().bold(), action));
            }
        }
    }

    if !snapshot.history.is_empty() {
        lines.push(String::new());
        lines.push(style("recent:").dim().to_string());
        // Newest five, newest first.
        for task in snapshot.history.iter().rev().take(5) {
            lines.push(format!("  {}", style(task_line(task)).dim()));
        }
    }

    term.clear_screen().ok();
    for line in lines {
        term.write_line(&line).ok();
    }
}

fn task_line(task: &DeviceTask) -> String {
    let status = match task.status {
        DeviceStatus::Completed => style(task.status.label()).green(),
        DeviceStatus::Failed | DeviceStatus::Removed => style(task.status.label()).red(),
        DeviceStatus::NeedsBattery | DeviceStatus::WaitingRetry => {
            style(task.status.label()).yellow()
        },
        _ => style(task.status.label()).cyan(),
    };

    format!(
        "  #{:<3} {:<16} {:<18} {} {:>3}%  {}",
        task.device_number,
        task.port,
        status,
        progress_bar(task.progress),
        task.progress,
        task.message,
    )
}

fn progress_bar(progress: u8) -> String {
    const WIDTH: usize = 20;
    let filled = (usize::from(progress.min(100)) * WIDTH) / 100;
    let mut bar = String::with_capacity(WIDTH + 2);
    bar.push('[');
    for i in 0..WIDTH {
        bar.push(if i < filled { '#' } else { '-' });
    }
    bar.push(']');
    bar
}

fn print_summary(snapshot: &Snapshot) {
    println!();
    println!("{}", style("session summary").bold());
    println!("  programmed: {}", snapshot.stats.programmed);
    println!("  failed:     {}", snapshot.stats.failed);
    if let Some(avg) = snapshot.stats.average_completion() {
        println!("  avg time:   {}s", avg.as_secs());
    }
    for task in &snapshot.history {
        let marker = match task.status {
            DeviceStatus::Completed => style("✓").green(),
            _ => style("✗").red(),
        };
        println!(
            "  {marker} #{} {} {} ({})",
            task.device_number,
            task.port,
            task.status.label(),
            task.last_error().unwrap_or("ok"),
        );
    }
}
