// ── Core error types ──
//
// Error taxonomy for the control-and-sync engine. Device, transport,
// storage and config failures are isolated where they occur and never
// stop the control loops; only `Fatal` escalates to a process shutdown.

use thiserror::Error;

use crate::gateway::DeviceIoError;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Device I/O ───────────────────────────────────────────────────
    #[error(transparent)]
    DeviceIo(#[from] DeviceIoError),

    // ── Delivery ─────────────────────────────────────────────────────
    #[error("Transport error: {0}")]
    Transport(#[from] edgectl_api::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("Invalid engine transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Returns `true` if this error should take the whole controller down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
