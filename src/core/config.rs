use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const CONFIG_FILE: &str = "botwarden.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Directory holding one working directory per bot. Relative paths are
    /// resolved against the data directory.
    #[serde(default = "default_bots_root")]
    pub bots_root: PathBuf,

    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Start every enabled bot when the supervisor boots.
    #[serde(default = "default_true")]
    pub autostart: bool,

    /// Stop all bots when the supervisor itself shuts down.
    #[serde(default = "default_true")]
    pub stop_bots_on_exit: bool,

    #[serde(default = "default_intent_poll_ms")]
    pub intent_poll_ms: u64,

    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Command used to run a bot's entry point.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// How long SIGKILL gets to reap a process before the stop is reported as timed out.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// A freshly spawned process must survive this long to count as running.
    #[serde(default = "default_startup_probe_ms")]
    pub startup_probe_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    #[serde(default = "default_true")]
    pub scan_stdout: bool,

    /// Case-insensitive regular expressions that mark a line as a failure.
    #[serde(default = "default_signatures")]
    pub signatures: Vec<String>,

    /// Trailing lines of a matching batch included in the alert.
    #[serde(default = "default_excerpt_lines")]
    pub excerpt_lines: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Six-field cron expression evaluated in local time.
    #[serde(default = "default_update_cron")]
    pub cron: String,

    #[serde(default = "default_update_timeout_secs")]
    pub update_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default)]
    pub telegram_token: Option<String>,

    #[serde(default)]
    pub chat_id: Option<i64>,

    #[serde(default = "default_alert_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub retry_transient: bool,
}

fn default_true() -> bool {
    true
}
fn default_bots_root() -> PathBuf {
    PathBuf::from("bots")
}
fn default_database() -> PathBuf {
    PathBuf::from("botwarden.db")
}
fn default_intent_poll_ms() -> u64 {
    500
}
fn default_interpreter() -> String {
    "python3".to_string()
}
fn default_stop_timeout_secs() -> u64 {
    10
}
fn default_kill_grace_secs() -> u64 {
    5
}
fn default_startup_probe_ms() -> u64 {
    300
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_debounce_secs() -> u64 {
    300
}
fn default_signatures() -> Vec<String> {
    vec![
        r"\b(error|exception|traceback)\b".to_string(),
        r"\bfatal\b".to_string(),
        r"\bcritical\b".to_string(),
    ]
}
fn default_excerpt_lines() -> usize {
    15
}
fn default_update_cron() -> String {
    "0 0 0 * * *".to_string()
}
fn default_update_timeout_secs() -> u64 {
    300
}
fn default_alert_timeout_secs() -> u64 {
    10
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            stop_timeout_secs: default_stop_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            startup_probe_ms: default_startup_probe_ms(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            debounce_secs: default_debounce_secs(),
            scan_stdout: true,
            signatures: default_signatures(),
            excerpt_lines: default_excerpt_lines(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: default_update_cron(),
            update_timeout_secs: default_update_timeout_secs(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            telegram_token: None,
            chat_id: None,
            timeout_secs: default_alert_timeout_secs(),
            retry_transient: true,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            bots_root: default_bots_root(),
            database: default_database(),
            autostart: true,
            stop_bots_on_exit: true,
            intent_poll_ms: default_intent_poll_ms(),
            process: ProcessConfig::default(),
            monitor: MonitorConfig::default(),
            scheduler: SchedulerConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl ProcessConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
    pub fn startup_probe(&self) -> Duration {
        Duration::from_millis(self.startup_probe_ms)
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
}

impl SchedulerConfig {
    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }
}

impl AlertConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SupervisorConfig {
    /// Read `botwarden.toml` from the data directory (defaults if absent),
    /// apply environment overrides and resolve relative paths.
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let config_path = data_dir.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            toml::from_str::<SupervisorConfig>(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            info!("No {} found, using defaults.", CONFIG_FILE);
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.resolve_paths(data_dir);
        Ok(config)
    }

    /// Global alert credentials may come from the environment instead of the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("ALERT_BOT_TOKEN").filter(|t| !t.trim().is_empty()) {
            self.alerts.telegram_token = Some(token);
        }
        if let Some(chat_id) = lookup("ALERT_CHAT_ID").filter(|c| !c.trim().is_empty()) {
            let parsed = chat_id
                .trim()
                .parse()
                .with_context(|| format!("ALERT_CHAT_ID '{}' is not a chat id", chat_id))?;
            self.alerts.chat_id = Some(parsed);
        }
        Ok(())
    }

    pub fn resolve_paths(&mut self, data_dir: &Path) {
        if self.bots_root.is_relative() {
            self.bots_root = data_dir.join(&self.bots_root);
        }
        if self.database.is_relative() {
            self.database = data_dir.join(&self.database);
        }
    }
}
