use thiserror::Error;

/// Top-level error type for the `edgectl-api` crate.
///
/// Covers broker session failures and payload encoding. `edgectl-core`
/// folds these into its own error type; none of them is ever fatal to
/// the controller process.
#[derive(Debug, Error)]
pub enum Error {
    // ── Session ─────────────────────────────────────────────────────
    /// The MQTT client rejected a request (request channel closed or full).
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// Connection to the broker failed or dropped.
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// A publish or subscribe was attempted while the session is down.
    #[error("Broker session is not connected")]
    NotConnected,

    // ── Configuration ───────────────────────────────────────────────
    /// Broker URL could not be used (bad scheme, missing host).
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidBrokerUrl { url: String, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON encoding or decoding of a payload failed.
    #[error("Payload encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if retrying after a reconnect may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Client(_) | Self::Connection(_) | Self::NotConnected)
    }
}
