//! JSON payloads exchanged with the backend.
//!
//! Field names are camelCase on the wire. Timestamps are RFC 3339 UTC.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

// ── Outbound ─────────────────────────────────────────────────────────

/// One sample inside a [`SensorBatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingPayload {
    pub sensor_id: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Published to `sensors/data` once per sampling tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorBatch {
    pub controller_id: String,
    pub readings: Vec<ReadingPayload>,
    pub timestamp: DateTime<Utc>,
}

/// Published to `actuators/{id}/status` after every actuator write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorStatus {
    pub actuator_id: String,
    pub state: f64,
    pub timestamp: DateTime<Utc>,
}

/// Liveness value carried by [`ControllerStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum HeartbeatState {
    Online,
    Offline,
}

/// Heartbeat published to `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub controller_id: String,
    pub name: String,
    pub status: HeartbeatState,
    pub timestamp: DateTime<Utc>,
}

impl ControllerStatus {
    pub fn now(controller_id: &str, name: &str, status: HeartbeatState) -> Self {
        Self {
            controller_id: controller_id.to_owned(),
            name: name.to_owned(),
            status,
            timestamp: Utc::now(),
        }
    }
}

// ── Inbound ──────────────────────────────────────────────────────────

/// Body of `commands/actuator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorCommand {
    pub actuator_id: String,
    pub state: f64,
}

/// Body of `commands/emergency-stop`. The timestamp is informational.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStopCommand {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}
