use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

use crate::core::logs;

/// Supervisor log file inside `<data_dir>/run/`.
pub const SUPERVISOR_LOG: &str = "botwarden.log";

/// Writes every formatted record to stdout and, when available, to the
/// supervisor's own append-only log file.
#[derive(Clone)]
pub(crate) struct TeeMakeWriter {
    file: Option<Arc<Mutex<File>>>,
    suppress_stdout: bool,
}

impl TeeMakeWriter {
    pub(crate) fn new(file: Option<File>, suppress_stdout: bool) -> Self {
        Self {
            file: file.map(|f| Arc::new(Mutex::new(f))),
            suppress_stdout,
        }
    }
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: self.file.clone(),
            suppress_stdout: self.suppress_stdout,
        }
    }
}

pub(crate) struct TeeWriter {
    file: Option<Arc<Mutex<File>>>,
    suppress_stdout: bool,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Best effort; stdout still gets the record.
            let _ = file.write_all(buf);
        }
        if !self.suppress_stdout {
            std::io::stdout().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = &self.file {
            let _ = file
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .flush();
        }
        if !self.suppress_stdout {
            std::io::stdout().flush()?;
        }
        Ok(())
    }
}

/// Level from `BOTWARDEN_LOG` (`trace`..`error`), INFO otherwise.
pub(crate) fn level_from_env() -> Level {
    std::env::var("BOTWARDEN_LOG")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(Level::INFO)
}

/// Install the global subscriber. `run_dir` receives the supervisor log.
pub(crate) fn init_tracing(run_dir: Option<&Path>) {
    let file = run_dir.and_then(|dir| logs::open_append(&dir.join(SUPERVISOR_LOG)).ok());
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level_from_env())
        .with_writer(TeeMakeWriter::new(file, false))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
