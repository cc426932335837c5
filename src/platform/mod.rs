use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Configure a bot command so the child leads its own process group,
    /// letting signals reach any helpers it forks.
    fn isolate_process_group(cmd: &mut tokio::process::Command);

    /// Ask the process group led by `pid` to terminate (SIGTERM on Unix).
    /// A group that no longer exists is not an error.
    fn terminate(pid: u32) -> std::io::Result<()>;

    /// Forcefully kill the process group led by `pid` (SIGKILL on Unix).
    fn force_kill(pid: u32) -> std::io::Result<()>;

    /// Whether a process with this pid currently exists.
    fn is_alive(pid: u32) -> bool;

    /// Set restrictive *directory* permissions (0o700 on Unix).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix).
    fn restrict_file_permissions(path: &Path);

    /// Root data directory for botwarden (`~/.botwarden` on Unix).
    fn data_dir() -> PathBuf;
}

/// Honour `BOTWARDEN_DATA_DIR` before falling back to the platform default.
fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var_os("BOTWARDEN_DATA_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;
