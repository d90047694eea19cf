pub mod cli;
pub mod config;
pub mod journaling;
pub mod remote;
pub mod storage;

pub use config::{AppConfig, ConfigLoader, ConfigPaths};
pub use journaling::{Entry, TodayEntryController, TodayEntryHandle, TodaySnapshot};
