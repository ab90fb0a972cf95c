// ── Inbound commands ──
//
// Decoded backend commands handed from the transport to the engine over
// an mpsc channel.

use edgectl_api::CommandTopic;
use edgectl_api::wire::{ActuatorCommand, EmergencyStopCommand};
use tracing::warn;

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// Manual override; bypasses rule evaluation.
    SetActuator { actuator_id: String, state: f64 },
    EmergencyStop,
    ReloadConfig,
}

impl ControlCommand {
    /// Decode a payload received on a command topic.
    pub fn decode(topic: CommandTopic, payload: &[u8]) -> Result<Self, CoreError> {
        match topic {
            CommandTopic::Actuator => {
                let cmd: ActuatorCommand = serde_json::from_slice(payload)?;
                if cmd.actuator_id.trim().is_empty() {
                    return Err(CoreError::Validation {
                        message: "actuator command without actuatorId".into(),
                    });
                }
                if !cmd.state.is_finite() {
                    return Err(CoreError::Validation {
                        message: format!("non-finite state for '{}'", cmd.actuator_id),
                    });
                }
                Ok(Self::SetActuator {
                    actuator_id: cmd.actuator_id,
                    state: cmd.state,
                })
            }
            CommandTopic::EmergencyStop => {
                // Body is informational; a missing or unreadable one still stops.
                if !payload.is_empty() {
                    if let Err(e) = serde_json::from_slice::<EmergencyStopCommand>(payload) {
                        warn!(
                            error = %e,
                            body = %String::from_utf8_lossy(payload),
                            "emergency stop with unreadable body, stopping anyway"
                        );
                    }
                }
                Ok(Self::EmergencyStop)
            }
            CommandTopic::ConfigReload => Ok(Self::ReloadConfig),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SetActuator { .. } => "set-actuator",
            Self::EmergencyStop => "emergency-stop",
            Self::ReloadConfig => "config-reload",
        }
    }
}
