use console::{Emoji, style};

use crate::core::bot::BotStatus;

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn styled_status(status: BotStatus) -> String {
    let label = status.as_str().to_uppercase();
    match status {
        BotStatus::Running => style(label).green().bold().to_string(),
        BotStatus::Starting | BotStatus::Stopping => style(label).yellow().bold().to_string(),
        BotStatus::Crashed => style(label).red().bold().to_string(),
        BotStatus::Stopped => style(label).dim().to_string(),
    }
}

enum Line {
    Command(String, String),
    Status(String, String),
    Text(String),
    Hint(String),
    Info(String),
    Warn(String),
    Blank,
}

/// Titled block of help or status output.
pub struct GuideSection {
    title: String,
    lines: Vec<Line>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            lines: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.lines
            .push(Line::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.lines
            .push(Line::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.lines.push(Line::Text(text.to_string()));
        self
    }

    pub fn hint(mut self, example: &str) -> Self {
        self.lines.push(Line::Hint(example.to_string()));
        self
    }

    pub fn info(mut self, text: &str) -> Self {
        self.lines.push(Line::Info(text.to_string()));
        self
    }

    pub fn warn(mut self, text: &str) -> Self {
        self.lines.push(Line::Warn(text.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.lines.push(Line::Blank);
        self
    }

    pub fn print(self) {
        println!("\n {}", style(&self.title).bold().underlined());
        let width = self
            .lines
            .iter()
            .filter_map(|l| match l {
                Line::Command(name, _) => Some(name.len()),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        for line in self.lines {
            match line {
                Line::Command(name, description) => println!(
                    "   {}  {}",
                    style(format!("{:<width$}", name, width = width)).green(),
                    description
                ),
                Line::Status(label, value) => {
                    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), value)
                }
                Line::Text(text) => println!("   {}", text),
                Line::Hint(example) => println!("   {} {}", style("$").dim(), style(example).cyan()),
                Line::Info(text) => println!("  {} {}", INFO_ICON, text),
                Line::Warn(text) => println!("  {} {}", WARN_ICON, style(text).yellow()),
                Line::Blank => println!(),
            }
        }
    }
}

pub fn print_banner() {
    println!(
        "\n{} {}  {}\n",
        SPARKLE,
        style("botwarden").bold().cyan(),
        style("keeps your bots alive while you sleep").dim()
    );
}

pub fn print_goodbye() {
    println!(
        "\n{} {}",
        SPARKLE,
        style("botwarden stopped. Bye!").bold().cyan()
    );
}
