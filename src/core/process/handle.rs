use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;

/// How a bot process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// The exit could not be observed (waiting on the child failed).
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("killed by signal {}", signal),
            (None, None) => "exit status unknown".to_string(),
        }
    }
}

/// Controller-side view of one spawned child.
///
/// The child itself is owned by its reaper task; the handle only carries the
/// pid, the run generation and a watch on the exit.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    pub generation: u64,
    stop_requested: Arc<AtomicBool>,
    exit: watch::Receiver<Option<ExitReport>>,
}

impl ProcessHandle {
    pub fn new(
        pid: u32,
        generation: u64,
        stop_requested: Arc<AtomicBool>,
        exit: watch::Receiver<Option<ExitReport>>,
    ) -> Self {
        Self {
            pid,
            generation,
            stop_requested,
            exit,
        }
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// The exit, if the reaper has already observed it.
    pub fn try_exit(&self) -> Option<ExitReport> {
        self.exit.borrow().clone()
    }

    /// Wait up to `limit` for the process to exit.
    pub async fn wait_exit(&self, limit: Duration) -> Option<ExitReport> {
        let mut rx = self.exit.clone();
        match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
            Ok(Ok(report)) => report.clone(),
            // Sender gone without a report: the reaper died, treat as exited.
            Ok(Err(_)) => Some(self.try_exit().unwrap_or_else(ExitReport::unknown)),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_prefers_the_exit_code() {
        let clean = ExitReport {
            code: Some(0),
            signal: None,
        };
        assert!(clean.is_clean());
        assert_eq!(clean.describe(), "exit code 0");

        let killed = ExitReport {
            code: None,
            signal: Some(9),
        };
        assert!(!killed.is_clean());
        assert_eq!(killed.describe(), "killed by signal 9");
    }

    #[tokio::test]
    async fn wait_exit_returns_once_the_reaper_reports() {
        let (tx, rx) = watch::channel(None);
        let handle = ProcessHandle::new(1, 0, Arc::new(AtomicBool::new(false)), rx);
        assert_eq!(handle.wait_exit(Duration::from_millis(10)).await, None);

        tx.send_replace(Some(ExitReport {
            code: Some(3),
            signal: None,
        }));
        let report = handle.wait_exit(Duration::from_millis(10)).await.unwrap();
        assert_eq!(report.code, Some(3));
        assert_eq!(handle.try_exit(), Some(report));
    }
}
