mod tail;

pub use tail::LogTail;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

pub const LOG_DIR: &str = "logs";
pub const STDOUT_LOG: &str = "bot.out.log";
pub const STDERR_LOG: &str = "bot.err.log";

/// Bytes shown by the log viewer when no explicit limit is given.
pub const DEFAULT_VIEW_BYTES: u64 = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogPaths {
    pub fn for_workdir(workdir: &Path) -> Self {
        let dir = workdir.join(LOG_DIR);
        Self {
            stdout: dir.join(STDOUT_LOG),
            stderr: dir.join(STDERR_LOG),
        }
    }

    pub fn get(&self, stream: LogStream) -> &Path {
        match stream {
            LogStream::Stdout => &self.stdout,
            LogStream::Stderr => &self.stderr,
        }
    }
}

/// Byte lengths of both log files at one instant. Marks where one run's
/// output begins or ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOffsets {
    pub stdout: u64,
    pub stderr: u64,
}

impl LogOffsets {
    pub fn measure(paths: &LogPaths) -> std::io::Result<Self> {
        Ok(Self {
            stdout: current_len(&paths.stdout)?,
            stderr: current_len(&paths.stderr)?,
        })
    }

    pub fn get(&self, stream: LogStream) -> u64 {
        match stream {
            LogStream::Stdout => self.stdout,
            LogStream::Stderr => self.stderr,
        }
    }
}

/// Open a log sink for appending, creating it and its directory if needed.
pub fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Current length of a log file, zero when it does not exist yet.
pub fn current_len(path: &Path) -> std::io::Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Last `max_bytes` of a log file decoded lossily, for display.
pub fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(max_bytes);
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut buf)?;
    let text = String::from_utf8_lossy(&buf);
    // Drop the partial first line when we started mid-file.
    if start > 0
        && let Some(idx) = text.find('\n')
    {
        return Ok(text[idx + 1..].to_string());
    }
    Ok(text.into_owned())
}

/// Truncate both log files. Only ever called on an explicit operator request.
pub fn clear(paths: &LogPaths) -> std::io::Result<()> {
    for path in [&paths.stdout, &paths.stderr] {
        if path.exists() {
            OpenOptions::new().write(true).truncate(true).open(path)?;
        }
    }
    Ok(())
}
