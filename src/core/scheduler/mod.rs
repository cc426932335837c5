use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use cron::Schedule;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::alerts::{Alert, AlertDispatcher, AlertKind};
use crate::core::bot::{Bot, BotId};
use crate::core::config::SchedulerConfig;
use crate::core::error::{SupervisorError, SupervisorResult};
use crate::core::process::{ProcessController, StartOutcome};
use crate::core::updater::SourceUpdater;

/// Longest single sleep while waiting for the next fire, so clock jumps
/// (suspend, DST, manual changes) are noticed.
const MAX_NAP: Duration = Duration::from_secs(60);

/// Process-wide scheduler state, guarded by one lock.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    pub next_fire: Option<DateTime<Local>>,
    pub in_progress: HashSet<BotId>,
    /// Set while a cycle runs; a second request is dropped instead of overlapping.
    pub cycle_running: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub updated: Vec<String>,
    pub restarted: Vec<String>,
    /// Bots whose lease was held by a manual operation.
    pub skipped: Vec<String>,
    pub failures: Vec<(String, String)>,
}

impl CycleReport {
    pub fn summary(&self) -> String {
        let mut text = format!(
            "{} updated, {} restarted, {} skipped, {} failed",
            self.updated.len(),
            self.restarted.len(),
            self.skipped.len(),
            self.failures.len()
        );
        for (bot, reason) in &self.failures {
            text.push_str(&format!("\n- {}: {}", bot, reason));
        }
        if !self.skipped.is_empty() {
            text.push_str(&format!("\nskipped (busy): {}", self.skipped.join(", ")));
        }
        text
    }
}

struct Inner {
    controller: ProcessController,
    updater: Arc<dyn SourceUpdater>,
    dispatcher: AlertDispatcher,
    schedule: Schedule,
    update_timeout: Duration,
    state: Mutex<SchedulerState>,
}

/// Daily update-and-restart cycle over every registered bot.
#[derive(Clone)]
pub struct UpdateScheduler {
    inner: Arc<Inner>,
}

impl UpdateScheduler {
    pub fn new(
        controller: ProcessController,
        updater: Arc<dyn SourceUpdater>,
        dispatcher: AlertDispatcher,
        config: &SchedulerConfig,
    ) -> SupervisorResult<Self> {
        let schedule = Schedule::from_str(&config.cron).map_err(|e| {
            SupervisorError::Config(format!("bad update cron '{}': {}", config.cron, e))
        })?;
        Ok(Self {
            inner: Arc::new(Inner {
                controller,
                updater,
                dispatcher,
                schedule,
                update_timeout: config.update_timeout(),
                state: Mutex::new(SchedulerState::default()),
            }),
        })
    }

    pub fn next_fire_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.inner.schedule.after(after).next()
    }

    pub async fn state(&self) -> SchedulerState {
        self.inner.state.lock().await.clone()
    }

    /// Timer loop; fires `run_cycle` at every scheduled local time until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let Some(next) = self.next_fire_after(&Local::now()) else {
                warn!("Update schedule has no upcoming fire time; timer stopped");
                return;
            };
            self.inner.state.lock().await.next_fire = Some(next);
            info!("Next update cycle at {}", next.format("%Y-%m-%d %H:%M:%S %Z"));

            loop {
                let remaining = (next - Local::now()).to_std().unwrap_or_default();
                if remaining.is_zero() {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(remaining.min(MAX_NAP)) => {}
                }
            }

            // A cycle in progress is allowed to finish; it holds bot leases.
            match self.run_cycle().await {
                Some(report) => info!("Update cycle finished: {}", report.summary()),
                None => info!("Scheduled update cycle skipped: one is already running"),
            }
        }
    }

    /// One full cycle: update then restart each bot, isolated per bot, with a
    /// single aggregated alert when anything failed.
    ///
    /// Returns `None` without doing anything if another cycle is in flight.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        {
            let mut state = self.inner.state.lock().await;
            if state.cycle_running {
                return None;
            }
            state.cycle_running = true;
        }
        let report = self.cycle().await;
        self.inner.state.lock().await.cycle_running = false;
        Some(report)
    }

    async fn cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let registry = self.inner.controller.registry();
        let bots = match registry.list().await {
            Ok(bots) => bots,
            Err(e) => {
                error!("Update cycle could not list bots: {}", e);
                report
                    .failures
                    .push(("registry".to_string(), e.to_string()));
                self.alert(&report).await;
                return report;
            }
        };
        info!("Update cycle starting for {} bot(s)", bots.len());

        for bot in bots {
            let Some(lease) = registry.try_lock(bot.id) else {
                info!("Skipping {}: a lifecycle operation is in flight", bot.name);
                report.skipped.push(bot.name);
                continue;
            };
            self.inner.state.lock().await.in_progress.insert(bot.id);

            self.update_one(&bot, &mut report).await;

            if bot.enabled || bot.status.is_live() {
                let timeout = self.inner.controller.settings().stop_timeout;
                match self.inner.controller.restart_locked(&lease, timeout).await {
                    Ok(StartOutcome::ExitedDuringStartup { exit, .. }) => report.failures.push((
                        bot.name.clone(),
                        format!("exited during startup ({})", exit.describe()),
                    )),
                    Ok(_) => report.restarted.push(bot.name.clone()),
                    Err(e) => {
                        warn!("Restart of {} failed: {}", bot.name, e);
                        report
                            .failures
                            .push((bot.name.clone(), format!("restart failed: {}", e)));
                    }
                }
            }

            self.inner.state.lock().await.in_progress.remove(&bot.id);
            drop(lease);
        }

        if !report.failures.is_empty() {
            self.alert(&report).await;
        }
        report
    }

    async fn update_one(&self, bot: &Bot, report: &mut CycleReport) {
        let result =
            tokio::time::timeout(self.inner.update_timeout, self.inner.updater.update(bot)).await;
        match result {
            Ok(Ok(outcome)) => {
                if let Err(e) = self
                    .inner
                    .controller
                    .registry()
                    .set_last_commit(bot.id, outcome.current.as_deref())
                    .await
                {
                    warn!("Could not record commit of {}: {}", bot.name, e);
                }
                report.updated.push(bot.name.clone());
            }
            Ok(Err(e)) => {
                warn!("Update of {} failed, keeping old code: {}", bot.name, e);
                report.failures.push((bot.name.clone(), e.to_string()));
            }
            Err(_) => {
                warn!(
                    "Update of {} timed out after {:?}",
                    bot.name, self.inner.update_timeout
                );
                report.failures.push((
                    bot.name.clone(),
                    format!("update timed out after {:?}", self.inner.update_timeout),
                ));
            }
        }
    }

    async fn alert(&self, report: &CycleReport) {
        self.inner
            .dispatcher
            .dispatch(Alert::fleet(AlertKind::UpdateCycle, report.summary()))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bot::NewBot;
    use crate::core::process::ProcessSettings;
    use crate::core::registry::BotRegistry;
    use crate::core::updater::UpdateOutcome;
    use async_trait::async_trait;
    use chrono::{TimeZone, Timelike};

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

    struct SlowUpdater(std::sync::Mutex<usize>);

    #[async_trait]
    impl SourceUpdater for SlowUpdater {
        async fn update(&self, _bot: &Bot) -> SupervisorResult<UpdateOutcome> {
            *self.0.lock().unwrap() += 1;
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(UpdateOutcome {
                previous: None,
                current: None,
            })
        }
    }

    async fn scheduler(
        dir: &tempfile::TempDir,
    ) -> (UpdateScheduler, Arc<CountingUpdater>, ProcessController) {
        let registry = Arc::new(BotRegistry::open_in_memory(dir.path().join("bots")).unwrap());
        let controller = ProcessController::new(
            registry,
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
        (scheduler, updater, controller)
    }

    #[tokio::test]
    async fn default_schedule_fires_at_local_midnight() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _, _) = scheduler(&dir).await;
        let noon = Local.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let next = scheduler.next_fire_after(&noon).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (0, 0, 0));
        assert!(next > noon);
        assert!(next - noon <= chrono::Duration::hours(25));
    }

    #[tokio::test]
    async fn bad_cron_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_, updater, controller) = scheduler(&dir).await;
        let config = SchedulerConfig {
            cron: "every night".into(),
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            UpdateScheduler::new(controller, updater, AlertDispatcher::disabled(), &config),
            Err(SupervisorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn busy_bots_are_skipped_and_others_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, updater, controller) = scheduler(&dir).await;
        let registry = controller.registry().clone();
        let mut ids = Vec::new();
        for name in ["alpha", "beta"] {
            let bot = registry
                .create(NewBot::new(name, format!("https://example.com/{}.git", name)))
                .await
                .unwrap();
            std::fs::create_dir_all(&bot.workdir).unwrap();
            std::fs::write(bot.workdir.join("main.py"), "sleep 30\n").unwrap();
            ids.push(bot.id);
        }

        let held = registry.lock(ids[1]).await;
        let report = scheduler.run_cycle().await.unwrap();
        drop(held);

        assert_eq!(report.skipped, vec!["beta".to_string()]);
        assert_eq!(report.restarted, vec!["alpha".to_string()]);
        assert!(report.failures.is_empty());
        assert_eq!(*updater.0.lock().unwrap(), vec!["alpha".to_string()]);
        assert!(scheduler.state().await.in_progress.is_empty());

        let alpha = registry.get(ids[0]).await.unwrap();
        assert_eq!(alpha.last_commit.as_deref(), Some("abc123"));
        assert!(controller.pid(ids[0]).is_some());
        controller.stop_all().await;
    }

    #[tokio::test]
    async fn disabled_stopped_bots_are_updated_but_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, updater, controller) = scheduler(&dir).await;
        let mut new = NewBot::new("idle", "https://example.com/idle.git");
        new.enabled = false;
        let bot = controller.registry().create(new).await.unwrap();

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.updated, vec!["idle".to_string()]);
        assert!(report.restarted.is_empty());
        assert!(report.failures.is_empty());
        assert_eq!(updater.0.lock().unwrap().len(), 1);
        assert_eq!(controller.pid(bot.id), None);
    }

    #[tokio::test]
    async fn overlapping_cycle_requests_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, controller) = scheduler(&dir).await;
        let mut new = NewBot::new("idle", "https://example.com/idle.git");
        new.enabled = false;
        controller.registry().create(new).await.unwrap();
        let updater = Arc::new(SlowUpdater(std::sync::Mutex::new(0)));
        let scheduler = UpdateScheduler::new(
            controller,
            updater.clone(),
            AlertDispatcher::disabled(),
            &SchedulerConfig::default(),
        )
        .unwrap();

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_cycle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.state().await.cycle_running);
        assert!(scheduler.run_cycle().await.is_none());

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.updated, vec!["idle".to_string()]);
        assert_eq!(*updater.0.lock().unwrap(), 1);
        assert!(!scheduler.state().await.cycle_running);

        assert!(scheduler.run_cycle().await.is_some());
        assert_eq!(*updater.0.lock().unwrap(), 2);
    }

    #[test]
    fn summary_lists_each_failure() {
        let report = CycleReport {
            updated: vec!["alpha".into(), "gamma".into()],
            restarted: vec!["alpha".into(), "beta".into(), "gamma".into()],
            skipped: vec![],
            failures: vec![("beta".into(), "git pull failed".into())],
        };
        let summary = report.summary();
        assert!(summary.starts_with("2 updated, 3 restarted, 0 skipped, 1 failed"));
        assert!(summary.contains("- beta: git pull failed"));
    }
}
