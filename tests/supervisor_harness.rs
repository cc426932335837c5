#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use botwarden::core::alerts::{AlertDispatcher, AlertSink};
use botwarden::core::config::{MonitorConfig, SchedulerConfig};
use botwarden::core::monitor::ErrorMonitor;
use botwarden::core::process::{ProcessController, ProcessSettings};
use botwarden::core::registry::BotRegistry;
use botwarden::core::scheduler::UpdateScheduler;
use botwarden::core::updater::{SourceUpdater, UpdateOutcome};
use botwarden::{Bot, BotId, NewBot, SupervisorError, SupervisorResult};

pub type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Bot script that stays up until signalled.
pub const IDLE_SCRIPT: &str = "sleep 30\n";

/// Alert endpoint that keeps every rendered message.
#[derive(Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn deliver(&self, text: &str) -> SupervisorResult<()> {
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Updater that succeeds for every bot except the ones listed as broken.
pub struct FakeUpdater {
    broken: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl FakeUpdater {
    pub fn failing_for(names: &[&str]) -> Self {
        Self {
            broken: names.iter().map(|n| n.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceUpdater for FakeUpdater {
    async fn update(&self, bot: &Bot) -> SupervisorResult<UpdateOutcome> {
        self.calls.lock().unwrap().push(bot.name.clone());
        if self.broken.contains(&bot.name) {
            return Err(SupervisorError::Update {
                bot: bot.name.clone(),
                reason: "fatal: could not read from remote repository".into(),
            });
        }
        Ok(UpdateOutcome {
            previous: Some("1111111".into()),
            current: Some("2222222".into()),
        })
    }
}

/// A registry, controller and scheduler over a temporary bots root, with
/// `sh` standing in for the Python interpreter.
pub struct Fleet {
    dir: tempfile::TempDir,
    pub registry: Arc<BotRegistry>,
    pub controller: ProcessController,
    pub scheduler: UpdateScheduler,
    pub updater: Arc<FakeUpdater>,
    pub sink: Arc<RecordingSink>,
    pub dispatcher: AlertDispatcher,
}

impl Fleet {
    pub fn new(updater: FakeUpdater) -> TestResult<Self> {
        let dir = tempfile::tempdir()?;
        let registry = Arc::new(BotRegistry::open(
            &dir.path().join("botwarden.db"),
            dir.path().join("bots"),
        )?);
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = AlertDispatcher::new(Some(sink.clone()), Duration::from_secs(2), true);
        let controller = ProcessController::new(
            registry.clone(),
            ProcessSettings {
                interpreter: "sh".into(),
                stop_timeout: Duration::from_secs(5),
                kill_grace: Duration::from_secs(2),
                startup_probe: Duration::from_millis(150),
            },
            dispatcher.clone(),
        );
        let updater = Arc::new(updater);
        let scheduler = UpdateScheduler::new(
            controller.clone(),
            updater.clone(),
            dispatcher.clone(),
            &SchedulerConfig::default(),
        )?;
        Ok(Self {
            dir,
            registry,
            controller,
            scheduler,
            updater,
            sink,
            dispatcher,
        })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Register a bot and drop `files` into its working directory.
    pub async fn add_bot(&self, name: &str, files: &[(&str, &str)]) -> TestResult<BotId> {
        let bot = self
            .registry
            .create(NewBot::new(name, format!("https://example.com/{}.git", name)))
            .await?;
        std::fs::create_dir_all(&bot.workdir)?;
        for (file, content) in files {
            std::fs::write(bot.workdir.join(file), content)?;
        }
        Ok(bot.id)
    }

    /// Run an error monitor over this fleet until the returned guard is shut down.
    pub fn spawn_monitor(&self, config: &MonitorConfig) -> TestResult<MonitorGuard> {
        let monitor = ErrorMonitor::new(
            self.registry.clone(),
            self.dispatcher.clone(),
            config,
            self.controller.subscribe(),
        )?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.run(cancel.clone()));
        Ok(MonitorGuard { cancel, task })
    }

    /// Poll until at least `count` alerts arrived or `limit` passed.
    pub async fn wait_for_alerts(&self, count: usize, limit: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let messages = self.sink.messages();
            if messages.len() >= count || tokio::time::Instant::now() >= deadline {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub struct MonitorGuard {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorGuard {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

pub fn fast_monitor() -> MonitorConfig {
    MonitorConfig {
        poll_interval_ms: 20,
        ..MonitorConfig::default()
    }
}
