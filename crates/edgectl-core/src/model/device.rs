// ── Device descriptors ──

use serde::{Deserialize, Serialize};
use strum::Display;

/// Whether a device is read from or written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceKind {
    #[serde(alias = "SENSOR")]
    Sensor,
    #[serde(alias = "ACTUATOR")]
    Actuator,
}

/// Linear conversion from raw gateway values to engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scaling {
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
}

impl Scaling {
    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.scale + self.offset
    }
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            scale: default_scale(),
            offset: 0.0,
        }
    }
}

fn default_scale() -> f64 {
    1.0
}

/// A sensor or actuator known to the controller.
///
/// `address` is opaque here; only the device gateway interprets it
/// (register map, bus id, channel, ...). Descriptors are immutable once
/// loaded and replaced wholesale on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub address: serde_json::Value,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(flatten)]
    pub scaling: Scaling,
}

impl Device {
    pub fn is_sensor(&self) -> bool {
        self.kind == DeviceKind::Sensor
    }

    pub fn is_actuator(&self) -> bool {
        self.kind == DeviceKind::Actuator
    }

    /// Name for log lines: the human name if set, else the id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}
