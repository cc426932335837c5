mod handle;

pub use handle::{ExitReport, ProcessHandle};

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::core::alerts::{Alert, AlertDispatcher, AlertKind};
use crate::core::bot::{Bot, BotId, BotStatus};
use crate::core::config::ProcessConfig;
use crate::core::error::{SupervisorError, SupervisorResult};
use crate::core::logs::{self, LogOffsets, LogPaths};
use crate::core::registry::{BotLease, BotRegistry};
use crate::platform::{NativePlatform, Platform};

/// Entry points tried in order when a bot is started.
pub const ENTRY_POINTS: [&str; 2] = ["main.py", "k.py"];

/// Bytes of stderr attached to a crash alert.
const CRASH_EXCERPT_BYTES: u64 = 800;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    pub interpreter: String,
    pub stop_timeout: Duration,
    pub kill_grace: Duration,
    pub startup_probe: Duration,
}

impl From<&ProcessConfig> for ProcessSettings {
    fn from(config: &ProcessConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            stop_timeout: config.stop_timeout(),
            kill_grace: config.kill_grace(),
            startup_probe: config.startup_probe(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// A live process was already tracked; nothing was spawned.
    AlreadyRunning { status: BotStatus, pid: u32 },
    /// The process died before surviving the startup probe. Its exit has
    /// already been recorded.
    ExitedDuringStartup { pid: u32, exit: ExitReport },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    Stopped,
    ForceKilled,
}

/// Lifecycle notifications for log consumers.
#[derive(Debug, Clone)]
pub enum BotEvent {
    Started {
        id: BotId,
        name: String,
        paths: LogPaths,
        /// Log lengths at spawn; this run's output starts here.
        offsets: LogOffsets,
    },
    Exited {
        id: BotId,
        /// Log lengths once the process was gone, if they could be read.
        ends: Option<LogOffsets>,
    },
}

/// Pick `main.py`, falling back to `k.py`.
pub fn resolve_entry_point(workdir: &Path) -> SupervisorResult<PathBuf> {
    ENTRY_POINTS
        .iter()
        .map(|name| workdir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| SupervisorError::NoEntryPoint {
            workdir: workdir.to_path_buf(),
        })
}

/// Variables layered over the inherited environment: `.env` first, then the
/// bot's own settings.
pub fn build_env(bot: &Bot) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    let dotenv = bot.workdir.join(".env");
    if dotenv.is_file() {
        match dotenvy::from_path_iter(&dotenv) {
            Ok(iter) => {
                for item in iter {
                    match item {
                        Ok((key, value)) => {
                            vars.insert(key, value);
                        }
                        Err(e) => warn!("Skipping bad line in {}: {}", dotenv.display(), e),
                    }
                }
            }
            Err(e) => warn!("Could not read {}: {}", dotenv.display(), e),
        }
    }
    vars.extend(bot.process_env());
    vars
}

struct Inner {
    registry: Arc<BotRegistry>,
    settings: ProcessSettings,
    dispatcher: AlertDispatcher,
    handles: std::sync::Mutex<HashMap<BotId, ProcessHandle>>,
    events: broadcast::Sender<BotEvent>,
    generation: AtomicU64,
}

/// Owns the OS process of every running bot.
///
/// All public operations take the bot's lease first; the `*_locked` variants
/// are for callers (the update scheduler) that already hold it.
#[derive(Clone)]
pub struct ProcessController {
    inner: Arc<Inner>,
}

impl ProcessController {
    pub fn new(
        registry: Arc<BotRegistry>,
        settings: ProcessSettings,
        dispatcher: AlertDispatcher,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                registry,
                settings,
                dispatcher,
                handles: std::sync::Mutex::new(HashMap::new()),
                events,
                generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<BotRegistry> {
        &self.inner.registry
    }

    pub fn settings(&self) -> &ProcessSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.inner.events.subscribe()
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, HashMap<BotId, ProcessHandle>> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tracked(&self, id: BotId) -> Option<ProcessHandle> {
        self.handles().get(&id).cloned()
    }

    /// Pid of the live process tracked for a bot, if any.
    pub fn pid(&self, id: BotId) -> Option<u32> {
        self.tracked(id)
            .filter(|h| h.try_exit().is_none())
            .map(|h| h.pid)
    }

    /// Remove the handle only if it still belongs to run `generation`.
    /// Whoever removes it settles that run's exit.
    fn take_if_current(&self, id: BotId, generation: u64) -> Option<ProcessHandle> {
        let mut handles = self.handles();
        match handles.get(&id) {
            Some(h) if h.generation == generation => handles.remove(&id),
            _ => None,
        }
    }

    fn emit(&self, event: BotEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub async fn start(&self, id: BotId) -> SupervisorResult<StartOutcome> {
        let lease = self.inner.registry.lock(id).await;
        self.start_locked(&lease).await
    }

    pub async fn stop(&self, id: BotId, timeout: Duration) -> SupervisorResult<StopOutcome> {
        let lease = self.inner.registry.lock(id).await;
        self.stop_locked(&lease, timeout).await
    }

    pub async fn restart(&self, id: BotId, timeout: Duration) -> SupervisorResult<StartOutcome> {
        let lease = self.inner.registry.lock(id).await;
        self.restart_locked(&lease, timeout).await
    }

    pub async fn restart_locked(
        &self,
        lease: &BotLease,
        timeout: Duration,
    ) -> SupervisorResult<StartOutcome> {
        self.stop_locked(lease, timeout).await?;
        self.start_locked(lease).await
    }

    pub async fn start_locked(&self, lease: &BotLease) -> SupervisorResult<StartOutcome> {
        let id = lease.id();
        let registry = &self.inner.registry;
        let mut bot = registry.get(id).await?;

        if let Some(handle) = self.tracked(id) {
            match handle.try_exit() {
                None => {
                    return Ok(StartOutcome::AlreadyRunning {
                        status: bot.status,
                        pid: handle.pid,
                    });
                }
                Some(exit) => {
                    // Exited but its reaper is still queued behind our lease.
                    if self.take_if_current(id, handle.generation).is_some() {
                        self.settle_exit(&bot, &exit).await;
                    }
                    bot = registry.get(id).await?;
                }
            }
        }

        let entry = resolve_entry_point(&bot.workdir)?;
        let env = build_env(&bot);
        let paths = bot.log_paths();
        let stdout = logs::open_append(&paths.stdout)?;
        let stderr = logs::open_append(&paths.stderr)?;
        let offsets = LogOffsets {
            stdout: stdout.metadata()?.len(),
            stderr: stderr.metadata()?.len(),
        };

        let mut cmd = Command::new(&self.inner.settings.interpreter);
        cmd.arg(entry.file_name().unwrap_or(entry.as_os_str()))
            .current_dir(&bot.workdir)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        NativePlatform::isolate_process_group(&mut cmd);

        let spawned = cmd.spawn();
        // Releases the parent's copies of the log handles on every path.
        drop(cmd);
        let child = spawned.map_err(|source| SupervisorError::Spawn {
            bot: bot.name.clone(),
            interpreter: self.inner.settings.interpreter.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(SupervisorError::Spawn {
                bot: bot.name.clone(),
                interpreter: self.inner.settings.interpreter.clone(),
                source: std::io::Error::other("child exited before its pid was read"),
            });
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let (exit_tx, exit_rx) = watch::channel(None);
        let stop_requested = Arc::new(AtomicBool::new(false));
        let handle = ProcessHandle::new(pid, generation, stop_requested, exit_rx);
        self.handles().insert(id, handle.clone());
        tokio::spawn(reap(self.clone(), id, generation, child, exit_tx));

        if let Err(e) = registry
            .upsert_status(id, BotStatus::Starting, Some(pid))
            .await
        {
            error!("Could not record start of bot {}: {}; killing pid {}", bot.name, e, pid);
            handle.request_stop();
            let _ = NativePlatform::force_kill(pid);
            self.take_if_current(id, generation);
            return Err(e);
        }
        info!(
            "Started bot {} ({}) with pid {} on {}",
            bot.name,
            id,
            pid,
            entry.display()
        );
        self.emit(BotEvent::Started {
            id,
            name: bot.name.clone(),
            paths,
            offsets,
        });

        match handle.wait_exit(self.inner.settings.startup_probe).await {
            None => {
                registry
                    .upsert_status(id, BotStatus::Running, Some(pid))
                    .await?;
                Ok(StartOutcome::Started { pid })
            }
            Some(exit) => {
                warn!(
                    "Bot {} exited during startup ({})",
                    bot.name,
                    exit.describe()
                );
                if self.take_if_current(id, generation).is_some() {
                    self.settle_exit(&bot, &exit).await;
                }
                Ok(StartOutcome::ExitedDuringStartup { pid, exit })
            }
        }
    }

    pub async fn stop_locked(
        &self,
        lease: &BotLease,
        timeout: Duration,
    ) -> SupervisorResult<StopOutcome> {
        let id = lease.id();
        let registry = &self.inner.registry;
        let bot = registry.get(id).await?;

        let Some(handle) = self.tracked(id) else {
            if bot.status != BotStatus::Stopped {
                debug!("Acknowledging {} bot {} as stopped", bot.status, bot.name);
                registry.upsert_status(id, BotStatus::Stopped, None).await?;
            }
            return Ok(StopOutcome::AlreadyStopped);
        };

        if let Some(exit) = handle.try_exit()
            && !handle.stop_requested()
        {
            // Died on its own before we got here: report it, then acknowledge.
            if self.take_if_current(id, handle.generation).is_some() {
                self.settle_exit(&bot, &exit).await;
            }
            registry.upsert_status(id, BotStatus::Stopped, None).await?;
            return Ok(StopOutcome::AlreadyStopped);
        }

        handle.request_stop();
        let pid = handle.pid;
        let mut outcome = StopOutcome::Stopped;
        if handle.try_exit().is_none() {
            registry
                .upsert_status(id, BotStatus::Stopping, Some(pid))
                .await?;
            info!("Stopping bot {} (pid {})", bot.name, pid);
            NativePlatform::terminate(pid)?;
            if handle.wait_exit(timeout).await.is_none() {
                warn!(
                    "Bot {} did not exit within {:?}, sending SIGKILL",
                    bot.name, timeout
                );
                NativePlatform::force_kill(pid)?;
                if handle.wait_exit(self.inner.settings.kill_grace).await.is_none() {
                    error!("Bot {} (pid {}) survived SIGKILL", bot.name, pid);
                    return Err(SupervisorError::StopTimeout {
                        pid,
                        waited: timeout + self.inner.settings.kill_grace,
                    });
                }
                outcome = StopOutcome::ForceKilled;
            }
        }

        let exit = handle.try_exit().unwrap_or_else(ExitReport::unknown);
        self.take_if_current(id, handle.generation);
        registry.upsert_status(id, BotStatus::Stopped, None).await?;
        registry
            .record_exit(id, &format!("stopped on request ({})", exit.describe()))
            .await?;
        self.emit(BotEvent::Exited {
            id,
            ends: LogOffsets::measure(&bot.log_paths()).ok(),
        });
        info!("Bot {} stopped ({:?})", bot.name, outcome);
        Ok(outcome)
    }

    /// Record an exit that nobody asked for. Non-zero exits, signals and a
    /// vanished working directory count as crashes and raise an alert.
    async fn settle_exit(&self, bot: &Bot, exit: &ExitReport) {
        let registry = &self.inner.registry;
        let workdir_gone = !bot.workdir.is_dir();
        let crashed = workdir_gone || !exit.is_clean();
        let reason = if workdir_gone {
            format!("{}; working directory vanished", exit.describe())
        } else {
            exit.describe()
        };
        let status = if crashed {
            BotStatus::Crashed
        } else {
            BotStatus::Stopped
        };

        if let Err(e) = registry.upsert_status(bot.id, status, None).await {
            error!("Failed to record exit of bot {}: {}", bot.name, e);
        }
        if let Err(e) = registry.record_exit(bot.id, &reason).await {
            warn!("Failed to record exit reason of bot {}: {}", bot.name, e);
        }
        self.emit(BotEvent::Exited {
            id: bot.id,
            ends: LogOffsets::measure(&bot.log_paths()).ok(),
        });

        if crashed {
            warn!("Bot {} crashed: {}", bot.name, reason);
            let mut body = reason;
            if let Ok(excerpt) = logs::read_tail(&bot.log_paths().stderr, CRASH_EXCERPT_BYTES)
                && !excerpt.trim().is_empty()
            {
                body.push_str("\n\n");
                body.push_str(excerpt.trim_end());
            }
            self.inner
                .dispatcher
                .spawn(Alert::for_bot(bot.name.clone(), AlertKind::Crash, body));
        } else {
            info!("Bot {} exited cleanly", bot.name);
        }
    }

    /// Reset bots that a previous supervisor run left marked as live.
    ///
    /// Any process still alive under the recorded pid is an orphan and is
    /// terminated first. Returns how many bots were reset.
    pub async fn recover(&self) -> SupervisorResult<usize> {
        let mut recovered = 0;
        for bot in self.inner.registry.list().await? {
            if !bot.status.is_live() {
                continue;
            }
            let _lease = self.inner.registry.lock(bot.id).await;
            if self.tracked(bot.id).is_some() {
                continue;
            }
            if let Some(pid) = bot.pid
                && NativePlatform::is_alive(pid)
            {
                warn!("Terminating orphaned pid {} of bot {}", pid, bot.name);
                self.reap_orphan(pid).await;
            }
            self.inner
                .registry
                .upsert_status(bot.id, BotStatus::Stopped, None)
                .await?;
            self.inner
                .registry
                .record_exit(bot.id, "orphaned by a previous supervisor run")
                .await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn reap_orphan(&self, pid: u32) {
        if let Err(e) = NativePlatform::terminate(pid) {
            warn!("SIGTERM to orphan {} failed: {}", pid, e);
        }
        let deadline = tokio::time::Instant::now() + self.inner.settings.stop_timeout;
        while NativePlatform::is_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if NativePlatform::is_alive(pid)
            && let Err(e) = NativePlatform::force_kill(pid)
        {
            warn!("SIGKILL to orphan {} failed: {}", pid, e);
        }
    }

    /// Stop every tracked bot in parallel.
    pub async fn stop_all(&self) {
        let ids: Vec<BotId> = self.handles().keys().copied().collect();
        let timeout = self.inner.settings.stop_timeout;
        let mut set = JoinSet::new();
        for id in ids {
            let controller = self.clone();
            set.spawn(async move { (id, controller.stop(id, timeout).await) });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Err(e))) => warn!("Failed to stop bot {}: {}", id, e),
                Ok(_) => {}
                Err(e) => warn!("Stop task panicked: {}", e),
            }
        }
    }
}

/// Awaits one child's exit and settles it unless a stop was requested or
/// another path already claimed the handle.
async fn reap(
    controller: ProcessController,
    id: BotId,
    generation: u64,
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitReport>>,
) {
    let exit = match child.wait().await {
        Ok(status) => ExitReport::from_status(status),
        Err(e) => {
            warn!("Waiting on bot {} failed: {}", id, e);
            ExitReport::unknown()
        }
    };
    debug!("Bot {} run {} ended: {}", id, generation, exit.describe());
    exit_tx.send_replace(Some(exit.clone()));

    let requested = controller
        .tracked(id)
        .is_some_and(|h| h.generation == generation && h.stop_requested());
    if requested {
        return;
    }

    let _lease = controller.inner.registry.lock(id).await;
    if controller.take_if_current(id, generation).is_none() {
        return;
    }
    match controller.inner.registry.get(id).await {
        Ok(bot) => controller.settle_exit(&bot, &exit).await,
        Err(e) => warn!("Bot {} exited but its record is gone: {}", id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bot::NewBot;
    use std::io::Write;

    fn settings() -> ProcessSettings {
        ProcessSettings {
            interpreter: "sh".to_string(),
            stop_timeout: Duration::from_secs(5),
            kill_grace: Duration::from_secs(2),
            startup_probe: Duration::from_millis(150),
        }
    }

    async fn setup(script: Option<(&str, &str)>) -> (tempfile::TempDir, ProcessController, BotId) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(BotRegistry::open_in_memory(dir.path().join("bots")).unwrap());
        let bot = registry
            .create(NewBot::new("alpha", "https://example.com/alpha.git"))
            .await
            .unwrap();
        std::fs::create_dir_all(&bot.workdir).unwrap();
        if let Some((name, body)) = script {
            std::fs::write(bot.workdir.join(name), body).unwrap();
        }
        let controller = ProcessController::new(registry, settings(), AlertDispatcher::disabled());
        (dir, controller, bot.id)
    }

    #[test]
    fn main_py_wins_over_k_py() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_entry_point(dir.path()),
            Err(SupervisorError::NoEntryPoint { .. })
        ));
        std::fs::write(dir.path().join("k.py"), "").unwrap();
        assert_eq!(
            resolve_entry_point(dir.path()).unwrap(),
            dir.path().join("k.py")
        );
        std::fs::write(dir.path().join("main.py"), "").unwrap();
        assert_eq!(
            resolve_entry_point(dir.path()).unwrap(),
            dir.path().join("main.py")
        );
    }

    #[tokio::test]
    async fn env_layers_dotenv_under_bot_settings() {
        let (_dir, controller, id) = setup(None).await;
        let mut bot = controller.registry().get(id).await.unwrap();
        std::fs::write(
            bot.workdir.join(".env"),
            "BOT_TOKEN=from-file\nLEVEL=debug\n",
        )
        .unwrap();
        bot.token = Some("from-record".into());
        bot.env.insert("LEVEL".into(), "info".into());

        let env = build_env(&bot);
        assert_eq!(env["BOT_TOKEN"], "from-record");
        assert_eq!(env["LEVEL"], "info");
    }

    #[tokio::test]
    async fn start_then_stop_walks_the_state_machine() {
        let (_dir, controller, id) = setup(Some(("main.py", "echo up\nsleep 30\n"))).await;

        let pid = match controller.start(id).await.unwrap() {
            StartOutcome::Started { pid } => pid,
            other => panic!("unexpected outcome {:?}", other),
        };
        let bot = controller.registry().get(id).await.unwrap();
        assert_eq!(bot.status, BotStatus::Running);
        assert_eq!(bot.pid, Some(pid));
        assert_eq!(controller.pid(id), Some(pid));

        assert!(matches!(
            controller.start(id).await.unwrap(),
            StartOutcome::AlreadyRunning { pid: p, .. } if p == pid
        ));

        let outcome = controller.stop(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, StopOutcome::Stopped);
        let bot = controller.registry().get(id).await.unwrap();
        assert_eq!(bot.status, BotStatus::Stopped);
        assert_eq!(bot.pid, None);
        assert!(!NativePlatform::is_alive(pid));

        assert_eq!(
            controller.stop(id, Duration::from_secs(5)).await.unwrap(),
            StopOutcome::AlreadyStopped
        );
    }

    #[tokio::test]
    async fn ignored_sigterm_escalates_to_sigkill() {
        let (_dir, controller, id) =
            setup(Some(("main.py", "trap '' TERM\nwhile :; do sleep 1; done\n"))).await;
        assert!(matches!(
            controller.start(id).await.unwrap(),
            StartOutcome::Started { .. }
        ));

        let outcome = controller
            .stop(id, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::ForceKilled);
        assert_eq!(
            controller.registry().get(id).await.unwrap().status,
            BotStatus::Stopped
        );
    }

    #[tokio::test]
    async fn unexpected_exit_is_a_crash() {
        let (_dir, controller, id) = setup(Some(("main.py", "sleep 0.4\nexit 3\n"))).await;
        assert!(matches!(
            controller.start(id).await.unwrap(),
            StartOutcome::Started { .. }
        ));

        let mut crashed = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let bot = controller.registry().get(id).await.unwrap();
            if bot.status == BotStatus::Crashed {
                crashed = Some(bot);
                break;
            }
        }
        let bot = crashed.expect("bot never settled as crashed");
        assert_eq!(bot.pid, None);
        assert_eq!(bot.last_exit.as_deref(), Some("exit code 3"));

        // A crashed bot is acknowledged back to stopped.
        assert_eq!(
            controller.stop(id, Duration::from_secs(1)).await.unwrap(),
            StopOutcome::AlreadyStopped
        );
        assert_eq!(
            controller.registry().get(id).await.unwrap().status,
            BotStatus::Stopped
        );
    }

    #[tokio::test]
    async fn exit_during_probe_is_settled_before_returning() {
        let (_dir, controller, id) = setup(Some(("k.py", "exit 0\n"))).await;
        let outcome = controller.start(id).await.unwrap();
        assert!(matches!(
            outcome,
            StartOutcome::ExitedDuringStartup { ref exit, .. } if exit.is_clean()
        ));
        let bot = controller.registry().get(id).await.unwrap();
        assert_eq!(bot.status, BotStatus::Stopped);
        assert_eq!(controller.pid(id), None);
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_spawn_error() {
        let (_dir, controller, id) = setup(Some(("main.py", "sleep 30\n"))).await;
        let broken = ProcessController::new(
            controller.registry().clone(),
            ProcessSettings {
                interpreter: "/nonexistent/python".into(),
                ..settings()
            },
            AlertDispatcher::disabled(),
        );
        assert!(matches!(
            broken.start(id).await,
            Err(SupervisorError::Spawn { .. })
        ));
        assert_eq!(
            broken.registry().get(id).await.unwrap().status,
            BotStatus::Stopped
        );
    }

    #[tokio::test]
    async fn started_event_carries_current_log_lengths() {
        let (_dir, controller, id) = setup(Some(("main.py", "sleep 30\n"))).await;
        let bot = controller.registry().get(id).await.unwrap();
        let paths = bot.log_paths();
        std::fs::create_dir_all(paths.stderr.parent().unwrap()).unwrap();
        std::fs::write(&paths.stderr, "old failure\n").unwrap();

        let mut events = controller.subscribe();
        controller.start(id).await.unwrap();
        match events.recv().await.unwrap() {
            BotEvent::Started { offsets, .. } => {
                assert_eq!(offsets, LogOffsets { stdout: 0, stderr: 12 });
            }
            other => panic!("unexpected event {:?}", other),
        }
        std::fs::OpenOptions::new()
            .append(true)
            .open(&paths.stderr)
            .unwrap()
            .write_all(b"late\n")
            .unwrap();
        controller.stop_all().await;
        match events.recv().await.unwrap() {
            BotEvent::Exited { ends, .. } => {
                assert_eq!(ends, Some(LogOffsets { stdout: 0, stderr: 17 }));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn recover_resets_stale_live_records() {
        let (_dir, controller, id) = setup(None).await;
        let mut orphan = Command::new("sleep");
        orphan.arg("30");
        NativePlatform::isolate_process_group(&mut orphan);
        let mut orphan = orphan.spawn().unwrap();
        let pid = orphan.id().unwrap();
        controller
            .registry()
            .upsert_status(id, BotStatus::Starting, Some(pid))
            .await
            .unwrap();
        controller
            .registry()
            .upsert_status(id, BotStatus::Running, Some(pid))
            .await
            .unwrap();

        assert_eq!(controller.recover().await.unwrap(), 1);
        let status = orphan.wait().await.unwrap();
        assert!(!status.success());
        let bot = controller.registry().get(id).await.unwrap();
        assert_eq!(bot.status, BotStatus::Stopped);
        assert_eq!(bot.pid, None);
    }
}
