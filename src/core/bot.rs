use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::core::logs::LogPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BotId(pub i64);

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl BotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BotStatus::Stopped => "stopped",
            BotStatus::Starting => "starting",
            BotStatus::Running => "running",
            BotStatus::Stopping => "stopping",
            BotStatus::Crashed => "crashed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "stopped" => Some(BotStatus::Stopped),
            "starting" => Some(BotStatus::Starting),
            "running" => Some(BotStatus::Running),
            "stopping" => Some(BotStatus::Stopping),
            "crashed" => Some(BotStatus::Crashed),
            _ => None,
        }
    }

    /// Statuses that own an OS process, and therefore a pid.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            BotStatus::Starting | BotStatus::Running | BotStatus::Stopping
        )
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status moves the registry accepts. Re-asserting the current status is always allowed.
pub fn can_transition(from: BotStatus, to: BotStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        BotStatus::Stopped => matches!(to, BotStatus::Starting),
        BotStatus::Starting => matches!(
            to,
            BotStatus::Running | BotStatus::Stopping | BotStatus::Stopped | BotStatus::Crashed
        ),
        BotStatus::Running => matches!(
            to,
            BotStatus::Stopping | BotStatus::Stopped | BotStatus::Crashed
        ),
        BotStatus::Stopping => matches!(to, BotStatus::Stopped | BotStatus::Crashed),
        BotStatus::Crashed => matches!(to, BotStatus::Starting | BotStatus::Stopped),
    }
}

/// One managed bot as persisted in the registry.
#[derive(Debug, Clone)]
pub struct Bot {
    pub id: BotId,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub workdir: PathBuf,
    pub token: Option<String>,
    pub env: BTreeMap<String, String>,
    pub db_url: Option<String>,
    pub enabled: bool,
    pub status: BotStatus,
    pub pid: Option<u32>,
    pub last_commit: Option<String>,
    pub last_exit: Option<String>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_stopped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Bot {
    pub fn log_paths(&self) -> LogPaths {
        LogPaths::for_workdir(&self.workdir)
    }

    /// Variables the supervisor injects on top of `.env` and the inherited environment.
    pub fn process_env(&self) -> BTreeMap<String, String> {
        let mut vars = self.env.clone();
        if let Some(token) = &self.token
            && !vars.contains_key("BOT_TOKEN")
        {
            vars.insert("BOT_TOKEN".to_string(), token.clone());
        }
        if let Some(db_url) = &self.db_url
            && !vars.contains_key("DATABASE_URL")
        {
            vars.insert("DATABASE_URL".to_string(), db_url.clone());
        }
        vars
    }
}

/// Creation request coming from the UI layer (or the CLI standing in for it).
#[derive(Debug, Clone)]
pub struct NewBot {
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub token: Option<String>,
    pub env: BTreeMap<String, String>,
    pub db_url: Option<String>,
    pub enabled: bool,
}

impl NewBot {
    pub fn new(name: impl Into<String>, repo_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repo_url: repo_url.into(),
            branch: "master".to_string(),
            token: None,
            env: BTreeMap::new(),
            db_url: None,
            enabled: true,
        }
    }
}

/// Names become directory components, so only a conservative charset is accepted.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_follow_the_state_machine() {
        let path = [
            (BotStatus::Stopped, BotStatus::Starting),
            (BotStatus::Starting, BotStatus::Running),
            (BotStatus::Running, BotStatus::Stopping),
            (BotStatus::Stopping, BotStatus::Stopped),
        ];
        for (from, to) in path {
            assert!(can_transition(from, to), "{from} -> {to} should be allowed");
        }
        assert!(can_transition(BotStatus::Running, BotStatus::Crashed));
        assert!(can_transition(BotStatus::Crashed, BotStatus::Starting));
        assert!(!can_transition(BotStatus::Stopped, BotStatus::Running));
        assert!(!can_transition(BotStatus::Crashed, BotStatus::Running));
    }

    #[test]
    fn status_round_trips_through_its_column_value() {
        for status in [
            BotStatus::Stopped,
            BotStatus::Starting,
            BotStatus::Running,
            BotStatus::Stopping,
            BotStatus::Crashed,
        ] {
            assert_eq!(BotStatus::from_status(status.as_str()), Some(status));
        }
        assert_eq!(BotStatus::from_status("errored"), None);
    }

    #[test]
    fn process_env_adds_token_and_database_url_without_overriding() {
        let mut bot = NewBot::new("alpha", "https://example.com/alpha.git");
        bot.env.insert("BOT_TOKEN".into(), "from-env".into());
        let bot = Bot {
            id: BotId(1),
            name: bot.name,
            repo_url: bot.repo_url,
            branch: bot.branch,
            workdir: PathBuf::from("bots/alpha"),
            token: Some("from-record".into()),
            env: bot.env,
            db_url: Some("postgres://db".into()),
            enabled: true,
            status: BotStatus::Stopped,
            pid: None,
            last_commit: None,
            last_exit: None,
            last_started_at: None,
            last_stopped_at: None,
            created_at: Utc::now(),
        };
        let env = bot.process_env();
        assert_eq!(env["BOT_TOKEN"], "from-env");
        assert_eq!(env["DATABASE_URL"], "postgres://db");
    }

    #[test]
    fn names_must_be_safe_path_components() {
        assert!(is_valid_name("alpha-bot_2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("../etc"));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name(".hidden"));
    }
}
