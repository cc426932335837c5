use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::alerts::AlertDispatcher;
use crate::core::config::SupervisorConfig;
use crate::core::intents::IntentPump;
use crate::core::lifecycle::{LifecycleManager, Service};
use crate::core::monitor::ErrorMonitor;
use crate::core::process::{ProcessController, ProcessSettings, StartOutcome};
use crate::core::registry::BotRegistry;
use crate::core::scheduler::UpdateScheduler;
use crate::core::updater::{GitUpdater, SourceUpdater};

/// Wires the registry, controller, monitor, scheduler and intent pump into
/// one running supervisor.
pub struct Supervisor {
    config: SupervisorConfig,
    controller: ProcessController,
    scheduler: UpdateScheduler,
    monitor: ErrorMonitor,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        registry: Arc<BotRegistry>,
        dispatcher: AlertDispatcher,
        updater: Arc<dyn SourceUpdater>,
    ) -> Result<Self> {
        let controller = ProcessController::new(
            registry.clone(),
            ProcessSettings::from(&config.process),
            dispatcher.clone(),
        );
        // Subscribe before anything can start a bot.
        let monitor = ErrorMonitor::new(
            registry,
            dispatcher.clone(),
            &config.monitor,
            controller.subscribe(),
        )?;
        let scheduler =
            UpdateScheduler::new(controller.clone(), updater, dispatcher, &config.scheduler)?;
        Ok(Self {
            config,
            controller,
            scheduler,
            monitor,
        })
    }

    /// Production wiring: SQLite registry, Telegram alerts, git updates.
    pub fn from_config(config: SupervisorConfig) -> Result<Self> {
        let registry = BotRegistry::open(&config.database, config.bots_root.clone())
            .with_context(|| format!("Failed to open {}", config.database.display()))?;
        let dispatcher = AlertDispatcher::from_config(&config.alerts);
        let updater = Arc::new(GitUpdater::new(config.scheduler.update_timeout()));
        Self::new(config, Arc::new(registry), dispatcher, updater)
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Supervisor {
            config,
            controller,
            scheduler,
            monitor,
        } = self;

        let recovered = controller.recover().await?;
        if recovered > 0 {
            warn!("Reset {} bot(s) left running by a previous supervisor", recovered);
        }

        let mut lifecycle = LifecycleManager::new();
        lifecycle.attach(Arc::new(Mutex::new(Service::new(
            "error monitor",
            move |cancel| monitor.run(cancel),
        ))));
        if config.scheduler.enabled {
            let timer = scheduler.clone();
            lifecycle.attach(Arc::new(Mutex::new(Service::new(
                "update scheduler",
                move |cancel| timer.run(cancel),
            ))));
        } else {
            info!("Scheduled updates disabled");
        }
        let pump = IntentPump::new(
            controller.clone(),
            scheduler.clone(),
            Duration::from_millis(config.intent_poll_ms),
        );
        lifecycle.attach(Arc::new(Mutex::new(Service::new(
            "intent pump",
            move |cancel| pump.run(cancel),
        ))));
        lifecycle.start().await?;

        if config.autostart {
            let started = autostart(&controller).await;
            info!("Autostart launched {} bot(s)", started);
        }

        info!("Supervisor running. Press Ctrl+C to stop.");
        shutdown.cancelled().await;
        info!("Shutting down supervisor...");

        lifecycle.shutdown().await?;
        if config.stop_bots_on_exit {
            controller.stop_all().await;
        }
        Ok(())
    }
}

/// Start every enabled bot. Failures are logged per bot.
async fn autostart(controller: &ProcessController) -> usize {
    let bots = match controller.registry().list().await {
        Ok(bots) => bots,
        Err(e) => {
            warn!("Autostart could not list bots: {}", e);
            return 0;
        }
    };
    let mut started = 0;
    for bot in bots.into_iter().filter(|b| b.enabled) {
        match controller.start(bot.id).await {
            Ok(StartOutcome::Started { pid }) => {
                info!("Autostarted {} (pid {})", bot.name, pid);
                started += 1;
            }
            Ok(StartOutcome::AlreadyRunning { .. }) => {}
            Ok(StartOutcome::ExitedDuringStartup { exit, .. }) => {
                warn!("{} exited during autostart ({})", bot.name, exit.describe())
            }
            Err(e) => warn!("Autostart of {} failed: {}", bot.name, e),
        }
    }
    started
}
