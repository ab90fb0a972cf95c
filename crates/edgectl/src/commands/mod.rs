//! Command dispatch and the helpers the handlers share.

pub mod queue;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use edgectl_core::{PersistentQueue, QueueSettings};

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

pub async fn dispatch(cmd: Command, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Run(args) => run::handle(&args, global).await,
        Command::Validate(args) => validate::handle(&args, global),
        Command::Queue(args) => queue::handle(args, global).await,
    }
}

/// `--config` if given, else the platform default.
pub fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(edgectl_config::config_path)
}

pub async fn open_queue(settings: &QueueSettings) -> Result<PersistentQueue, CliError> {
    let queue = match &settings.path {
        Some(path) => PersistentQueue::open(path).await,
        None => PersistentQueue::in_memory().await,
    };
    queue.map_err(CliError::Storage)
}
