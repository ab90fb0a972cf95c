//! CLI error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use edgectl_config::ConfigError;
use edgectl_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const STORAGE: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const FATAL: i32 = 10;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration file not found: {path}")]
    #[diagnostic(
        code(edgectl::no_config),
        help(
            "Pass one with --config <FILE> or set EDGECTL_CONFIG.\n\
             Default location: {default}"
        )
    )]
    NoConfig { path: String, default: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(edgectl::validation))]
    Validation { field: String, reason: String },

    #[error("Could not load configuration")]
    #[diagnostic(
        code(edgectl::config),
        help("Check the file syntax and any EDGECTL_* environment overrides.")
    )]
    Config(#[source] ConfigError),

    // ── Runtime ──────────────────────────────────────────────────────
    #[error("Could not open message queue")]
    #[diagnostic(code(edgectl::storage), help("Check [queue].path and its permissions."))]
    Storage(#[source] CoreError),

    #[error("Broker session could not be set up")]
    #[diagnostic(
        code(edgectl::broker),
        help("Check [broker].url, or start with --offline to buffer everything locally.")
    )]
    Broker(#[source] CoreError),

    #[error("Controller stopped after a fatal error: {reason}")]
    #[diagnostic(code(edgectl::fatal), help("Outputs were forced off before exit."))]
    Fatal { reason: String },

    #[error(transparent)]
    #[diagnostic(code(edgectl::core))]
    Core(CoreError),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Could not encode output: {0}")]
    #[diagnostic(code(edgectl::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoConfig { .. } | Self::Config(_) => exit_code::CONFIG,
            Self::Validation { .. } => exit_code::USAGE,
            Self::Storage(_) => exit_code::STORAGE,
            Self::Broker(_) => exit_code::CONNECTION,
            Self::Fatal { .. } => exit_code::FATAL,
            Self::Core(_) | Self::Io(_) | Self::Json(_) => exit_code::GENERAL,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            ConfigError::NotFound(path) => Self::NoConfig {
                path: path.display().to_string(),
                default: edgectl_config::config_path().display().to_string(),
            },
            other => Self::Config(other),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Storage(_) => Self::Storage(err),
            CoreError::Transport(_) => Self::Broker(err),
            CoreError::Validation { message } => Self::Validation {
                field: "controller".into(),
                reason: message,
            },
            CoreError::Fatal(reason) => Self::Fatal { reason },
            other => Self::Core(other),
        }
    }
}
