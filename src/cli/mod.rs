//! CLI argument parsing and command output.

mod args;
pub mod listing;
pub mod progress;
mod validators;

pub use args::{Cli, Command, ConfigAction, RunArgs, StoreArgs};
