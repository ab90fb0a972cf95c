use std::time::Duration;

use edgectl_config::load_settings;

use crate::cli::{GlobalOpts, OutputFormat, QueueArgs, QueueCommand};
use crate::commands::{config_file, open_queue};
use crate::error::CliError;

pub async fn handle(args: QueueArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let config = load_settings(&config_file(global))?.to_controller_config()?;
    let queue = open_queue(&config.queue).await?;

    let result = match args.command {
        QueueCommand::Stats { output } => {
            let stats = queue.stats().await.map_err(CliError::Storage)?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Text => {
                    println!("pending:  {}", stats.pending);
                    println!("sent:     {}", stats.sent);
                    println!("readings: {}", stats.readings);
                }
            }
            Ok(())
        }
        QueueCommand::Prune { older_than_hours } => {
            let retention = older_than_hours.map_or(config.queue.retention, |hours| {
                Duration::from_secs(hours.saturating_mul(3600))
            });
            let removed = queue.prune(retention).await.map_err(CliError::Storage)?;
            println!("pruned {removed} sent entries");
            Ok(())
        }
    };

    queue.close().await;
    result
}
