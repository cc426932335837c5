use anyhow::{Context, Result, anyhow, bail};
use console::style;
use std::path::Path;
use std::time::Duration;
use tokio_stream::StreamExt;

use super::daemon::supervisor_pid;
use super::{parse_bot_add_args, parse_logs_args};
use crate::core::bot::{Bot, NewBot};
use crate::core::config::SupervisorConfig;
use crate::core::intents::Intent;
use crate::core::logs::{self, LogStream, LogTail};
use crate::core::registry::BotRegistry;
use crate::core::terminal::{
    GuideSection, print_error, print_info, print_success, print_warn, styled_status,
};
use crate::core::updater::GitUpdater;
use crate::platform::{NativePlatform, Platform};

async fn open_registry(data_dir: &Path) -> Result<(SupervisorConfig, BotRegistry)> {
    let config = SupervisorConfig::load(data_dir).await?;
    std::fs::create_dir_all(data_dir)?;
    NativePlatform::restrict_dir_permissions(data_dir);
    let registry = BotRegistry::open(&config.database, config.bots_root.clone())
        .with_context(|| format!("Failed to open {}", config.database.display()))?;
    Ok((config, registry))
}

fn name_arg(args: &[String], sub: &str) -> Result<String> {
    args.get(3)
        .cloned()
        .ok_or_else(|| anyhow!("Usage: botwarden bot {} <name>", sub))
}

pub async fn run_bot_command(data_dir: &Path, args: &[String]) -> Result<()> {
    let sub_cmd = args.get(2).map(String::as_str).unwrap_or("");
    match sub_cmd {
        "add" => add_bot(data_dir, args).await,
        "remove" | "rm" => remove_bot(data_dir, args).await,
        "list" | "ls" => list_bots(data_dir).await,
        "show" => show_bot(data_dir, &name_arg(args, "show")?).await,
        "start" => queue(data_dir, &name_arg(args, "start")?, Intent::Start).await,
        "stop" => queue(data_dir, &name_arg(args, "stop")?, Intent::Stop).await,
        "restart" => queue(data_dir, &name_arg(args, "restart")?, Intent::Restart).await,
        "enable" => set_enabled(data_dir, &name_arg(args, "enable")?, true).await,
        "disable" => set_enabled(data_dir, &name_arg(args, "disable")?, false).await,
        "logs" => show_logs(data_dir, args).await,
        "clear-logs" => clear_logs(data_dir, &name_arg(args, "clear-logs")?).await,
        _ => {
            GuideSection::new("botwarden bot")
                .command("add", "Register a bot")
                .command("remove", "Forget a stopped bot")
                .command("list", "List bots")
                .command("show", "Show one bot")
                .command("start | stop | restart", "Queue a lifecycle request")
                .command("enable | disable", "Toggle autostart")
                .command("logs", "Print captured output")
                .command("clear-logs", "Truncate captured output")
                .blank()
                .hint("botwarden bot add alpha https://github.com/me/alpha.git --token 123:ABC")
                .hint("botwarden bot logs alpha --stderr --follow")
                .print();
            println!();
            Ok(())
        }
    }
}

async fn add_bot(data_dir: &Path, args: &[String]) -> Result<()> {
    let parsed = parse_bot_add_args(args, 3).map_err(|e| {
        anyhow!(
            "{}\nUsage: botwarden bot add <name> <repo_url> [--branch B] [--token T] \
             [--db-url URL] [--env KEY=VALUE]... [--no-clone] [--disabled]",
            e
        )
    })?;
    let (config, registry) = open_registry(data_dir).await?;

    let mut new = NewBot::new(parsed.name, parsed.repo_url);
    new.branch = parsed.branch;
    new.token = parsed.token;
    new.db_url = parsed.db_url;
    new.enabled = parsed.enabled;
    new.env.extend(parsed.env);
    let bot = registry.create(new).await?;

    if parsed.clone {
        let git = GitUpdater::new(config.scheduler.update_timeout());
        match git.ensure_checkout(&bot).await {
            Ok(head) => {
                registry.set_last_commit(bot.id, head.as_deref()).await?;
            }
            Err(e) => {
                registry.delete(bot.id).await?;
                return Err(e.into());
            }
        }
    } else {
        std::fs::create_dir_all(&bot.workdir)?;
    }
    write_initial_dotenv(&bot)?;

    print_success(&format!(
        "Registered {} ({}) in {}",
        bot.name,
        bot.id,
        bot.workdir.display()
    ));
    if bot.enabled {
        print_info("Run 'botwarden bot start <name>' or restart the supervisor to launch it.");
    }
    Ok(())
}

/// Seed `.env` with the bot's credentials unless the checkout already has one.
fn write_initial_dotenv(bot: &Bot) -> Result<()> {
    let path = bot.workdir.join(".env");
    if path.exists() || (bot.token.is_none() && bot.db_url.is_none()) {
        return Ok(());
    }
    let mut content = String::new();
    if let Some(token) = &bot.token {
        content.push_str(&format!("BOT_TOKEN={}\n", token));
    }
    if let Some(db_url) = &bot.db_url {
        content.push_str(&format!("DATABASE_URL={}\n", db_url));
    }
    std::fs::write(&path, content)?;
    NativePlatform::restrict_file_permissions(&path);
    Ok(())
}

async fn remove_bot(data_dir: &Path, args: &[String]) -> Result<()> {
    let name = name_arg(args, "remove")?;
    let purge = args.iter().skip(4).any(|a| a == "--purge");
    let (_, registry) = open_registry(data_dir).await?;
    let bot = registry.get_by_name(&name).await?;
    if bot.status.is_live() {
        bail!(
            "{} is {}; run 'botwarden bot stop {}' first",
            bot.name,
            bot.status,
            bot.name
        );
    }
    registry.delete(bot.id).await?;
    if purge && bot.workdir.exists() {
        std::fs::remove_dir_all(&bot.workdir)?;
        print_info(&format!("Deleted {}", bot.workdir.display()));
    }
    print_success(&format!("Removed {}", bot.name));
    Ok(())
}

async fn list_bots(data_dir: &Path) -> Result<()> {
    let (_, registry) = open_registry(data_dir).await?;
    let bots = registry.list().await?;
    if bots.is_empty() {
        print_info("No bots registered. Add one with 'botwarden bot add <name> <repo_url>'.");
        return Ok(());
    }
    println!(
        "\n {:<5} {:<20} {:<10} {:<8} {:<8} {}",
        style("ID").bold(),
        style("NAME").bold(),
        style("STATUS").bold(),
        style("PID").bold(),
        style("AUTO").bold(),
        style("COMMIT").bold()
    );
    for bot in bots {
        println!(
            " {:<5} {:<20} {:<10} {:<8} {:<8} {}",
            bot.id.0,
            bot.name,
            styled_status(bot.status),
            bot.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            if bot.enabled { "yes" } else { "no" },
            bot.last_commit
                .as_deref()
                .map(|c| &c[..c.len().min(10)])
                .unwrap_or("-")
        );
    }
    println!();
    Ok(())
}

async fn show_bot(data_dir: &Path, name: &str) -> Result<()> {
    let (_, registry) = open_registry(data_dir).await?;
    let bot = registry.get_by_name(name).await?;
    let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into())
    };
    let paths = bot.log_paths();
    GuideSection::new(&format!("Bot {}", bot.name))
        .status("ID", &bot.id.to_string())
        .status("Status", &styled_status(bot.status))
        .status(
            "PID",
            &bot.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
        )
        .status("Autostart", if bot.enabled { "yes" } else { "no" })
        .status("Repository", &format!("{} ({})", bot.repo_url, bot.branch))
        .status("Directory", &bot.workdir.display().to_string())
        .status("Commit", bot.last_commit.as_deref().unwrap_or("-"))
        .status("Last exit", bot.last_exit.as_deref().unwrap_or("-"))
        .status("Started", &fmt_time(bot.last_started_at))
        .status("Stopped", &fmt_time(bot.last_stopped_at))
        .status("Token", if bot.token.is_some() { "set" } else { "-" })
        .status("Env vars", &bot.env.keys().cloned().collect::<Vec<_>>().join(", "))
        .status("Stdout", &paths.stdout.display().to_string())
        .status("Stderr", &paths.stderr.display().to_string())
        .print();
    println!();
    Ok(())
}

async fn queue(data_dir: &Path, name: &str, intent: Intent) -> Result<()> {
    let (_, registry) = open_registry(data_dir).await?;
    let bot = registry.get_by_name(name).await?;
    registry.push_intent(Some(bot.id), intent).await?;
    print_success(&format!("Queued {} for {}", intent.as_str(), bot.name));
    warn_if_supervisor_down(data_dir);
    Ok(())
}

pub async fn update_now(data_dir: &Path) -> Result<()> {
    let (_, registry) = open_registry(data_dir).await?;
    registry.push_intent(None, Intent::UpdateAll).await?;
    print_success("Queued an update cycle for all bots");
    warn_if_supervisor_down(data_dir);
    Ok(())
}

fn warn_if_supervisor_down(data_dir: &Path) {
    if supervisor_pid(data_dir).is_none() {
        print_warn("The supervisor is not running; the request runs once 'botwarden run' starts.");
    }
}

async fn set_enabled(data_dir: &Path, name: &str, enabled: bool) -> Result<()> {
    let (_, registry) = open_registry(data_dir).await?;
    let bot = registry.get_by_name(name).await?;
    registry.set_enabled(bot.id, enabled).await?;
    print_success(&format!(
        "Autostart {} for {}",
        if enabled { "enabled" } else { "disabled" },
        bot.name
    ));
    Ok(())
}

async fn show_logs(data_dir: &Path, args: &[String]) -> Result<()> {
    let parsed = parse_logs_args(args, 3).map_err(|e| {
        anyhow!(
            "{}\nUsage: botwarden bot logs <name> [--stderr] [--bytes N] [--follow]",
            e
        )
    })?;
    let (_, registry) = open_registry(data_dir).await?;
    let bot = registry.get_by_name(&parsed.name).await?;
    let stream = if parsed.stderr {
        LogStream::Stderr
    } else {
        LogStream::Stdout
    };
    let paths = bot.log_paths();
    let path = paths.get(stream);

    match logs::read_tail(path, parsed.bytes) {
        Ok(text) => print!("{}", text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            print_info(&format!("No {} output captured yet.", stream.as_str()));
        }
        Err(e) => return Err(e.into()),
    }

    if parsed.follow {
        GuideSection::new("Live Logs")
            .text(&format!(
                "Following {} - press {} to stop.",
                style(path.display()).cyan(),
                style("Ctrl+C").bold().yellow()
            ))
            .print();
        println!();
        let tail = LogTail::at_end(path).await?;
        let lines = tail.lines(Duration::from_millis(500));
        tokio::pin!(lines);
        let mut reported = false;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                next = lines.next() => match next {
                    Some(Ok(line)) => {
                        reported = false;
                        println!("{}", line);
                    }
                    Some(Err(e)) => {
                        if !reported {
                            print_error(&format!("{}: {}", path.display(), e));
                            reported = true;
                        }
                    }
                    None => break,
                },
            }
        }
    }
    Ok(())
}

async fn clear_logs(data_dir: &Path, name: &str) -> Result<()> {
    let (_, registry) = open_registry(data_dir).await?;
    let bot = registry.get_by_name(name).await?;
    logs::clear(&bot.log_paths())?;
    print_success(&format!("Cleared logs of {}", bot.name));
    Ok(())
}
