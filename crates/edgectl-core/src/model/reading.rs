// ── Sensor readings ──

use chrono::{DateTime, Utc};
use edgectl_api::wire::ReadingPayload;
use serde::{Deserialize, Serialize};

/// One scaled sample taken from a sensor.
///
/// Appended to the audit log on every sampling tick and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub controller_id: String,
}

impl SensorReading {
    pub fn new(sensor_id: impl Into<String>, value: f64, controller_id: impl Into<String>) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            value,
            timestamp: Utc::now(),
            controller_id: controller_id.into(),
        }
    }

    pub fn to_payload(&self) -> ReadingPayload {
        ReadingPayload {
            sensor_id: self.sensor_id.clone(),
            value: self.value,
            timestamp: self.timestamp,
        }
    }
}

/// Find the latest reading for `sensor_id` in a batch.
pub fn find_reading<'a>(readings: &'a [SensorReading], sensor_id: &str) -> Option<&'a SensorReading> {
    readings.iter().rev().find(|r| r.sensor_id == sensor_id)
}
