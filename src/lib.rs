//! botwarden supervises a fleet of bot processes on one host: it starts and
//! stops them, captures their output, alerts on errors and crashes, and runs
//! a daily update-and-restart cycle.

pub mod cli;
pub mod core;
mod logging;
pub mod platform;

pub use crate::core::bot::{Bot, BotId, BotStatus, NewBot};
pub use crate::core::error::{SupervisorError, SupervisorResult};
