use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::config::SupervisorConfig;
use crate::core::supervisor::Supervisor;
use crate::core::terminal::{self, GuideSection, print_warn};
use crate::logging;
use crate::platform::{NativePlatform, Platform};

const PID_FILE: &str = "botwarden.pid";

pub(crate) fn run_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("run")
}

/// Pid of a live supervisor for this data directory, if any.
pub(crate) fn supervisor_pid(data_dir: &Path) -> Option<u32> {
    let pid = std::fs::read_to_string(run_dir(data_dir).join(PID_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()?;
    NativePlatform::is_alive(pid).then_some(pid)
}

pub async fn run_supervisor(data_dir: &Path) -> Result<()> {
    let run_dir = run_dir(data_dir);
    std::fs::create_dir_all(&run_dir)?;
    NativePlatform::restrict_dir_permissions(data_dir);

    if let Some(pid) = supervisor_pid(data_dir) {
        print_warn(&format!(
            "A supervisor is already running for {} (PID {}).",
            data_dir.display(),
            pid
        ));
        return Ok(());
    }

    logging::init_tracing(Some(&run_dir));
    let config = SupervisorConfig::load(data_dir).await?;
    info!(
        "Starting botwarden (bots in {}, database {})",
        config.bots_root.display(),
        config.database.display()
    );
    let supervisor = Supervisor::from_config(config)?;

    let pid_file = run_dir.join(PID_FILE);
    std::fs::write(&pid_file, std::process::id().to_string())?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    let result = supervisor.run(shutdown).await;
    std::fs::remove_file(&pid_file).ok();
    if result.is_ok() {
        terminal::print_goodbye();
    }
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

pub async fn supervisor_status(data_dir: &Path) -> Result<()> {
    match supervisor_pid(data_dir) {
        Some(pid) => GuideSection::new("Supervisor Status")
            .status(
                "Supervisor",
                &format!(
                    "{} (PID {})",
                    style("RUNNING").green().bold(),
                    style(pid).dim()
                ),
            )
            .status("Data", &data_dir.display().to_string())
            .print(),
        None => GuideSection::new("Supervisor Status")
            .status("Supervisor", &style("STOPPED").red().bold().to_string())
            .blank()
            .info(&format!(
                "Run {} to start it.",
                style("botwarden run").cyan().bold()
            ))
            .print(),
    }
    println!();
    Ok(())
}
