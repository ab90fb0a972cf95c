mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::{MakeWriterExt, OptionalWriter};

use crate::cli::{Cli, GlobalOpts, LogFormat};
use crate::error::{CliError, exit_code};

fn main() {
    let cli = Cli::parse();

    // Must outlive every log call.
    let _guard = match init_tracing(&cli.global) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{:?}", miette::Report::new(err));
            std::process::exit(exit_code::USAGE);
        }
    };
    install_panic_hook();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("{:?}", miette::Report::new(CliError::Io(err)));
            std::process::exit(exit_code::GENERAL);
        }
    };

    if let Err(err) = runtime.block_on(commands::dispatch(cli.command, &cli.global)) {
        let code = err.exit_code();
        tracing::debug!(code, "exiting with error");
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(global: &GlobalOpts) -> Result<Option<WorkerGuard>, CliError> {
    let level = match global.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_writer, guard) = match &global.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    // Stderr always, plus the file when one was requested.
    let writer = std::io::stderr.and(move || OptionalWriter::from(file_writer.clone()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer);
    match global.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(guard)
}

/// Route panics through tracing before the default report.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "panic");
        default_hook(info);
    }));
}
