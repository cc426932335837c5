use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::bot::BotId;
use crate::core::process::{ProcessController, StartOutcome};
use crate::core::scheduler::UpdateScheduler;

/// A lifecycle request queued by the CLI (or any other front end) for the
/// running supervisor to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Stop,
    Restart,
    UpdateAll,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Start => "start",
            Intent::Stop => "stop",
            Intent::Restart => "restart",
            Intent::UpdateAll => "update_all",
        }
    }

    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "start" => Some(Intent::Start),
            "stop" => Some(Intent::Stop),
            "restart" => Some(Intent::Restart),
            "update_all" => Some(Intent::UpdateAll),
            _ => None,
        }
    }

    pub fn targets_bot(self) -> bool {
        !matches!(self, Intent::UpdateAll)
    }
}

/// Drains the intent table on a short poll and executes each request.
///
/// Intents for one bot run sequentially in submission order; different bots
/// proceed in parallel.
pub struct IntentPump {
    controller: ProcessController,
    scheduler: UpdateScheduler,
    poll: Duration,
}

impl IntentPump {
    pub fn new(controller: ProcessController, scheduler: UpdateScheduler, poll: Duration) -> Self {
        Self {
            controller,
            scheduler,
            poll,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Intent pump polling every {:?}", self.poll);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll) => {
                    self.drain().await;
                }
            }
        }
        debug!("Intent pump stopped");
    }

    /// Take every queued intent and dispatch it. Returns how many were taken.
    pub async fn drain(&self) -> usize {
        let intents = match self.controller.registry().take_intents().await {
            Ok(intents) => intents,
            Err(e) => {
                warn!("Failed to read queued intents: {}", e);
                return 0;
            }
        };
        let taken = intents.len();

        let mut per_bot: BTreeMap<BotId, Vec<Intent>> = BTreeMap::new();
        let mut update_all = false;
        for (bot, intent) in intents {
            match (bot, intent.targets_bot()) {
                (_, false) => update_all = true,
                (Some(id), true) => per_bot.entry(id).or_default().push(intent),
                (None, true) => warn!("Ignoring '{}' intent without a bot", intent.as_str()),
            }
        }

        if update_all {
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move {
                info!("Running update cycle on request");
                match scheduler.run_cycle().await {
                    Some(report) => info!("Requested update cycle finished: {}", report.summary()),
                    None => info!("Requested update cycle dropped: one is already running"),
                }
            });
        }

        for (id, queue) in per_bot {
            let controller = self.controller.clone();
            tokio::spawn(async move {
                for intent in queue {
                    execute(&controller, id, intent).await;
                }
            });
        }
        taken
    }
}

async fn execute(controller: &ProcessController, id: BotId, intent: Intent) {
    let timeout = controller.settings().stop_timeout;
    let result = match intent {
        Intent::Start => controller.start(id).await.map(describe_start),
        Intent::Restart => controller.restart(id, timeout).await.map(describe_start),
        Intent::Stop => controller
            .stop(id, timeout)
            .await
            .map(|outcome| format!("{:?}", outcome)),
        Intent::UpdateAll => return,
    };
    match result {
        Ok(summary) => info!("Intent {} for bot {}: {}", intent.as_str(), id, summary),
        Err(e) => warn!("Intent {} for bot {} failed: {}", intent.as_str(), id, e),
    }
}

fn describe_start(outcome: StartOutcome) -> String {
    match outcome {
        StartOutcome::Started { pid } => format!("started with pid {}", pid),
        StartOutcome::AlreadyRunning { status, pid } => {
            format!("already {} with pid {}", status, pid)
        }
        StartOutcome::ExitedDuringStartup { pid, exit } => {
            format!("pid {} exited during startup ({})", pid, exit.describe())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alerts::AlertDispatcher;
    use crate::core::bot::{Bot, BotStatus, NewBot};
    use crate::core::config::SchedulerConfig;
    use crate::core::error::SupervisorResult;
    use crate::core::process::ProcessSettings;
    use crate::core::registry::BotRegistry;
    use crate::core::updater::{SourceUpdater, UpdateOutcome};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct CountingUpdater(std::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl SourceUpdater for CountingUpdater {
        async fn update(&self, bot: &Bot) -> SupervisorResult<UpdateOutcome> {
            self.0.lock().unwrap().push(bot.name.clone());
            Ok(UpdateOutcome {
                previous: None,
                current: Some("abc123".into()),
            })
        }
    }

    async fn add_bot(registry: &BotRegistry, name: &str) -> BotId {
        let mut new = NewBot::new(name, format!("https://example.com/{}.git", name));
        new.enabled = false;
        let bot = registry.create(new).await.unwrap();
        std::fs::create_dir_all(&bot.workdir).unwrap();
        std::fs::write(bot.workdir.join("main.py"), "sleep 30\n").unwrap();
        bot.id
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drain_runs_bot_intents_in_order_and_one_update_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(BotRegistry::open_in_memory(dir.path().join("bots")).unwrap());
        let controller = ProcessController::new(
            registry.clone(),
            ProcessSettings {
                interpreter: "sh".into(),
                stop_timeout: Duration::from_secs(5),
                kill_grace: Duration::from_secs(2),
                startup_probe: Duration::from_millis(100),
            },
            AlertDispatcher::disabled(),
        );
        let updater = Arc::new(CountingUpdater(std::sync::Mutex::new(Vec::new())));
        let scheduler = UpdateScheduler::new(
            controller.clone(),
            updater.clone(),
            AlertDispatcher::disabled(),
            &SchedulerConfig::default(),
        )
        .unwrap();
        let alpha = add_bot(&registry, "alpha").await;
        add_bot(&registry, "beta").await;

        registry.push_intent(Some(alpha), Intent::Start).await.unwrap();
        registry.push_intent(Some(alpha), Intent::Stop).await.unwrap();
        registry.push_intent(None, Intent::UpdateAll).await.unwrap();
        registry.push_intent(None, Intent::UpdateAll).await.unwrap();

        let pump = IntentPump::new(controller.clone(), scheduler.clone(), Duration::from_secs(1));
        assert_eq!(pump.drain().await, 4);
        assert_eq!(pump.drain().await, 0);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let bot = registry.get(alpha).await.unwrap();
            let cycle_done = !scheduler.state().await.cycle_running
                && !updater.0.lock().unwrap().is_empty();
            if bot.status == BotStatus::Stopped && bot.last_exit.is_some() && cycle_done {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "intents never settled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let bot = registry.get(alpha).await.unwrap();
        assert_eq!(bot.status, BotStatus::Stopped);
        assert_eq!(bot.pid, None);
        assert!(bot.last_exit.unwrap().starts_with("stopped on request"));
        assert_eq!(controller.pid(alpha), None);

        let calls = updater.0.lock().unwrap().clone();
        assert_eq!(calls.iter().filter(|name| *name == "beta").count(), 1);
        assert!(calls.iter().filter(|name| *name == "alpha").count() <= 1);
    }

    #[test]
    fn actions_round_trip_through_their_column_value() {
        for intent in [
            Intent::Start,
            Intent::Stop,
            Intent::Restart,
            Intent::UpdateAll,
        ] {
            assert_eq!(Intent::from_action(intent.as_str()), Some(intent));
        }
        assert_eq!(Intent::from_action("reboot"), None);
        assert!(!Intent::UpdateAll.targets_bot());
        assert!(Intent::Stop.targets_bot());
    }
}
