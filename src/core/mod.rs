pub mod alerts;
pub mod bot;
pub mod config;
pub mod error;
pub mod intents;
pub mod lifecycle;
pub mod logs;
pub mod monitor;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
pub mod terminal;
pub mod updater;
