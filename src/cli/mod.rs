mod bot_cmd;
mod daemon;

use anyhow::Result;
use console::style;

use crate::core::terminal::{self, GuideSection, print_error};
use crate::platform::{NativePlatform, Platform};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Supervisor")
        .command("run", "Run the supervisor in the foreground")
        .command("status", "Show whether the supervisor is running")
        .command("update-now", "Queue an update-and-restart cycle for every bot")
        .print();

    GuideSection::new("Bots")
        .command("bot add <name> <repo>", "Register a bot and clone its repository")
        .command("bot remove <name>", "Forget a stopped bot (--purge deletes its directory)")
        .command("bot list", "List bots with their status")
        .command("bot show <name>", "Show one bot in detail")
        .command("bot start|stop|restart <name>", "Queue a lifecycle request")
        .command("bot enable|disable <name>", "Toggle autostart")
        .command("bot logs <name>", "Print captured output (--stderr, --bytes N, --follow)")
        .command("bot clear-logs <name>", "Truncate both log files")
        .print();

    println!(
        "\n {} {} <command> [subcommand]\n",
        style("Usage:").bold(),
        style("botwarden").green()
    );
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BotAddArgs {
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub token: Option<String>,
    pub db_url: Option<String>,
    pub env: Vec<(String, String)>,
    pub clone: bool,
    pub enabled: bool,
}

/// Parse `bot add <name> <repo_url> [flags]` starting at `start`.
pub(crate) fn parse_bot_add_args(args: &[String], start: usize) -> Result<BotAddArgs, String> {
    let mut positional = Vec::new();
    let mut parsed = BotAddArgs {
        name: String::new(),
        repo_url: String::new(),
        branch: "master".to_string(),
        token: None,
        db_url: None,
        env: Vec::new(),
        clone: true,
        enabled: true,
    };
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--branch" | "-b" => {
                if i + 1 < args.len() {
                    parsed.branch = args[i + 1].clone();
                    i += 2;
                } else {
                    return Err("--branch needs a value".into());
                }
            }
            "--token" => {
                if i + 1 < args.len() {
                    parsed.token = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    return Err("--token needs a value".into());
                }
            }
            "--db-url" => {
                if i + 1 < args.len() {
                    parsed.db_url = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    return Err("--db-url needs a value".into());
                }
            }
            "--env" | "-e" => {
                let Some(pair) = args.get(i + 1) else {
                    return Err("--env needs KEY=VALUE".into());
                };
                let Some((key, value)) = pair.split_once('=') else {
                    return Err(format!("'{}' is not KEY=VALUE", pair));
                };
                parsed.env.push((key.trim().to_string(), value.to_string()));
                i += 2;
            }
            "--no-clone" => {
                parsed.clone = false;
                i += 1;
            }
            "--disabled" => {
                parsed.enabled = false;
                i += 1;
            }
            other if other.starts_with('-') => return Err(format!("unknown flag {}", other)),
            other => {
                positional.push(other.to_string());
                i += 1;
            }
        }
    }
    match positional.as_slice() {
        [name, repo_url] => {
            parsed.name = name.clone();
            parsed.repo_url = repo_url.clone();
            Ok(parsed)
        }
        _ => Err("expected <name> <repo_url>".into()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogsArgs {
    pub name: String,
    pub stderr: bool,
    pub bytes: u64,
    pub follow: bool,
}

pub(crate) fn parse_logs_args(args: &[String], start: usize) -> Result<LogsArgs, String> {
    let mut name = None;
    let mut parsed = LogsArgs {
        name: String::new(),
        stderr: false,
        bytes: crate::core::logs::DEFAULT_VIEW_BYTES,
        follow: false,
    };
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--stderr" | "--err" => {
                parsed.stderr = true;
                i += 1;
            }
            "--follow" | "-f" => {
                parsed.follow = true;
                i += 1;
            }
            "--bytes" | "-n" => {
                if i + 1 < args.len() {
                    parsed.bytes = args[i + 1]
                        .parse()
                        .map_err(|_| format!("'{}' is not a byte count", args[i + 1]))?;
                    i += 2;
                } else {
                    return Err("--bytes needs a value".into());
                }
            }
            other if name.is_none() && !other.starts_with('-') => {
                name = Some(other.to_string());
                i += 1;
            }
            other => return Err(format!("unexpected argument {}", other)),
        }
    }
    parsed.name = name.ok_or("expected <name>")?;
    Ok(parsed)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let data_dir = NativePlatform::data_dir();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "run" => daemon::run_supervisor(&data_dir).await,
        "status" => daemon::supervisor_status(&data_dir).await,
        "update-now" => bot_cmd::update_now(&data_dir).await,
        "bot" | "bots" => bot_cmd::run_bot_command(&data_dir, &args).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        cmd => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
