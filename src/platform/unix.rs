use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::{Platform, resolve_data_dir};

pub struct NativePlatform;

fn signal_group(pid: u32, sig: Signal) -> std::io::Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    match signal::killpg(Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        // Not a group leader (adopted orphan): fall back to the single process.
        Err(Errno::EPERM) => match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e)),
        },
        Err(e) => Err(std::io::Error::from(e)),
    }
}

impl Platform for NativePlatform {
    fn isolate_process_group(cmd: &mut tokio::process::Command) {
        cmd.process_group(0);
    }

    fn terminate(pid: u32) -> std::io::Result<()> {
        signal_group(pid, Signal::SIGTERM)
    }

    fn force_kill(pid: u32) -> std::io::Result<()> {
        signal_group(pid, Signal::SIGKILL)
    }

    fn is_alive(pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match signal::kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn restrict_dir_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700));
    }

    fn restrict_file_permissions(path: &Path) {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".botwarden"),
        )
    }
}
