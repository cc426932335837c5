use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::bot::Bot;
use crate::core::error::{SupervisorError, SupervisorResult};

/// Result of refreshing one bot's source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub previous: Option<String>,
    pub current: Option<String>,
}

impl UpdateOutcome {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// "Update the repository at this path" as seen by the scheduler.
#[async_trait]
pub trait SourceUpdater: Send + Sync {
    async fn update(&self, bot: &Bot) -> SupervisorResult<UpdateOutcome>;
}

/// Drives the `git` command line.
pub struct GitUpdater {
    program: String,
    timeout: Duration,
}

impl GitUpdater {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "git".to_string(),
            timeout,
        }
    }

    async fn git(&self, bot: &str, dir: &Path, args: &[&str]) -> SupervisorResult<String> {
        debug!("git {} in {}", args.join(" "), dir.display());
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let failed = |reason: String| SupervisorError::Update {
            bot: bot.to_string(),
            reason,
        };
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                failed(format!(
                    "git {} timed out after {:?}",
                    args.first().copied().unwrap_or_default(),
                    self.timeout
                ))
            })?
            .map_err(|e| failed(format!("could not run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn head(&self, bot: &str, dir: &Path) -> Option<String> {
        self.git(bot, dir, &["rev-parse", "HEAD"]).await.ok()
    }

    /// Clone the bot's repository into its working directory unless a
    /// checkout is already there. Returns the checked-out HEAD.
    pub async fn ensure_checkout(&self, bot: &Bot) -> SupervisorResult<Option<String>> {
        if bot.workdir.join(".git").exists() {
            return Ok(self.head(&bot.name, &bot.workdir).await);
        }
        let parent = bot.workdir.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let target = bot.workdir.to_string_lossy().into_owned();
        info!("Cloning {} into {}", bot.repo_url, target);
        self.git(
            &bot.name,
            parent,
            &["clone", "--branch", &bot.branch, &bot.repo_url, &target],
        )
        .await?;
        Ok(self.head(&bot.name, &bot.workdir).await)
    }
}

#[async_trait]
impl SourceUpdater for GitUpdater {
    async fn update(&self, bot: &Bot) -> SupervisorResult<UpdateOutcome> {
        if !bot.workdir.join(".git").exists() {
            return Err(SupervisorError::Update {
                bot: bot.name.clone(),
                reason: format!("{} is not a git checkout", bot.workdir.display()),
            });
        }
        let previous = self.head(&bot.name, &bot.workdir).await;
        self.git(&bot.name, &bot.workdir, &["fetch", "--prune", "origin"])
            .await?;
        self.git(&bot.name, &bot.workdir, &["checkout", &bot.branch])
            .await?;
        self.git(
            &bot.name,
            &bot.workdir,
            &["pull", "--ff-only", "origin", &bot.branch],
        )
        .await?;
        let current = self.head(&bot.name, &bot.workdir).await;

        let outcome = UpdateOutcome { previous, current };
        if outcome.changed() {
            info!(
                "Updated {} {} -> {}",
                bot.name,
                outcome.previous.as_deref().unwrap_or("none"),
                outcome.current.as_deref().unwrap_or("none")
            );
        } else {
            debug!("{} already up to date", bot.name);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bot::{BotId, BotStatus};
    use chrono::Utc;
    use std::path::PathBuf;

    fn bot(workdir: PathBuf, repo_url: &str) -> Bot {
        Bot {
            id: BotId(1),
            name: "alpha".into(),
            repo_url: repo_url.into(),
            branch: "master".into(),
            workdir,
            token: None,
            env: Default::default(),
            db_url: None,
            enabled: true,
            status: BotStatus::Stopped,
            pid: None,
            last_commit: None,
            last_exit: None,
            last_started_at: None,
            last_stopped_at: None,
            created_at: Utc::now(),
        }
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn run_git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args([
                "-c",
                "user.name=botwarden",
                "-c",
                "user.email=botwarden@localhost",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap()
            .status;
        assert!(status.success(), "git {:?} failed", args);
    }

    #[tokio::test]
    async fn update_refuses_a_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let updater = GitUpdater::new(Duration::from_secs(5));
        let err = updater
            .update(&bot(dir.path().to_path_buf(), "unused"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Update { ref bot, .. } if bot == "alpha"));
    }

    #[tokio::test]
    async fn clone_then_fast_forward() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("origin");
        std::fs::create_dir_all(&origin).unwrap();
        run_git(&origin, &["init", "-q"]);
        run_git(&origin, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        std::fs::write(origin.join("main.py"), "print('v1')\n").unwrap();
        run_git(&origin, &["add", "main.py"]);
        run_git(&origin, &["commit", "-q", "-m", "v1"]);

        let updater = GitUpdater::new(Duration::from_secs(30));
        let bot = bot(
            dir.path().join("bots").join("alpha"),
            &origin.to_string_lossy(),
        );
        let first = updater.ensure_checkout(&bot).await.unwrap();
        assert!(first.is_some());
        assert!(bot.workdir.join("main.py").exists());

        let unchanged = updater.update(&bot).await.unwrap();
        assert!(!unchanged.changed());

        std::fs::write(origin.join("main.py"), "print('v2')\n").unwrap();
        run_git(&origin, &["commit", "-q", "-am", "v2"]);
        let outcome = updater.update(&bot).await.unwrap();
        assert!(outcome.changed());
        assert_eq!(outcome.previous, first);
        assert_eq!(
            std::fs::read_to_string(bot.workdir.join("main.py")).unwrap(),
            "print('v2')\n"
        );
    }
}
