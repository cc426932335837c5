use std::path::PathBuf;
use std::time::Duration;

use crate::core::bot::{BotId, BotStatus};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("bot {0} not found")]
    NotFound(BotId),

    #[error("no bot named '{0}'")]
    UnknownBot(String),

    #[error("a bot named '{0}' already exists")]
    DuplicateName(String),

    #[error("no entry point (main.py or k.py) in {}", workdir.display())]
    NoEntryPoint { workdir: PathBuf },

    #[error("failed to spawn '{interpreter}' for bot '{bot}': {source}")]
    Spawn {
        bot: String,
        interpreter: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process {pid} did not exit within {waited:?} even after SIGKILL")]
    StopTimeout { pid: u32, waited: Duration },

    #[error("source update failed for '{bot}': {reason}")]
    Update { bot: String, reason: String },

    #[error("alert delivery failed: {reason}")]
    AlertDelivery { transient: bool, reason: String },

    #[error("status {status} with pid {pid:?} violates the pid invariant")]
    InvalidStatus { status: BotStatus, pid: Option<u32> },

    #[error("status cannot go from {from} to {to}")]
    InvalidTransition { from: BotStatus, to: BotStatus },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Whether a failed alert delivery is worth one immediate retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SupervisorError::AlertDelivery { transient: true, .. })
    }
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
