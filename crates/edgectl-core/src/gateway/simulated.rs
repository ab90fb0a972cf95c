// ── In-memory gateway ──
//
// Scripted sensor values and a write log. Used by the test suites and by
// `edgectl run --simulate` when no bus driver is attached.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{DeviceGateway, DeviceIoError};
use crate::model::Device;

/// One recorded actuator write.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorWrite {
    pub actuator_id: String,
    pub value: f64,
}

#[derive(Default)]
struct SimState {
    // A queue per sensor; the last value sticks once the script runs out.
    values: HashMap<String, VecDeque<f64>>,
    writes: Vec<ActuatorWrite>,
    safety_stops: usize,
    failing_reads: HashSet<String>,
    failing_writes: HashSet<String>,
}

#[derive(Default)]
pub struct SimulatedGateway {
    state: Mutex<SimState>,
    delay: Option<Duration>,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed every sensor from its descriptor.
    ///
    /// The initial value is taken from `address.initial` when present,
    /// otherwise `0.0`.
    pub fn from_devices<'a>(devices: impl IntoIterator<Item = &'a Device>) -> Self {
        let sim = Self::new();
        for device in devices.into_iter().filter(|d| d.is_sensor()) {
            let initial = device
                .address
                .get("initial")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or_default();
            sim.set_value(&device.id, initial);
        }
        sim
    }

    /// Sleep this long inside every call.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_value(&self, sensor_id: &str, value: f64) {
        self.script(sensor_id, [value]);
    }

    /// Successive reads return `values` in order, then repeat the last one.
    pub fn script(&self, sensor_id: &str, values: impl IntoIterator<Item = f64>) {
        let mut state = self.lock();
        state
            .values
            .insert(sensor_id.to_owned(), values.into_iter().collect());
    }

    pub fn fail_reads(&self, sensor_id: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing_reads.insert(sensor_id.to_owned());
        } else {
            state.failing_reads.remove(sensor_id);
        }
    }

    pub fn fail_writes(&self, actuator_id: &str, failing: bool) {
        let mut state = self.lock();
        if failing {
            state.failing_writes.insert(actuator_id.to_owned());
        } else {
            state.failing_writes.remove(actuator_id);
        }
    }

    pub fn writes(&self) -> Vec<ActuatorWrite> {
        self.lock().writes.clone()
    }

    pub fn writes_to(&self, actuator_id: &str) -> Vec<f64> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.actuator_id == actuator_id)
            .map(|w| w.value)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn safety_stop_count(&self) -> usize {
        self.lock().safety_stops
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl DeviceGateway for SimulatedGateway {
    async fn read_sensor(&self, device: &Device) -> Result<f64, DeviceIoError> {
        self.pause().await;
        let mut state = self.lock();
        if state.failing_reads.contains(&device.id) {
            return Err(DeviceIoError::Read {
                device: device.id.clone(),
                reason: "injected failure".into(),
            });
        }
        let queue = state
            .values
            .get_mut(&device.id)
            .ok_or_else(|| DeviceIoError::UnknownDevice(device.id.clone()))?;
        let value = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().copied()
        };
        value.ok_or_else(|| DeviceIoError::Read {
            device: device.id.clone(),
            reason: "no value scripted".into(),
        })
    }

    async fn write_actuator(&self, device: &Device, value: f64) -> Result<(), DeviceIoError> {
        self.pause().await;
        let mut state = self.lock();
        if state.failing_writes.contains(&device.id) {
            return Err(DeviceIoError::Write {
                device: device.id.clone(),
                reason: "injected failure".into(),
            });
        }
        state.writes.push(ActuatorWrite {
            actuator_id: device.id.clone(),
            value,
        });
        Ok(())
    }

    async fn trigger_safety_stop(&self) -> Result<(), DeviceIoError> {
        self.pause().await;
        self.lock().safety_stops += 1;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn device(id: &str, kind: &str) -> Device {
        serde_json::from_value(serde_json::json!({ "id": id, "kind": kind })).unwrap()
    }

    #[tokio::test]
    async fn scripted_values_play_in_order_then_hold() {
        let sim = SimulatedGateway::new();
        sim.script("t", [1.0, 2.0, 3.0]);
        let t = device("t", "sensor");

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(sim.read_sensor(&t).await.unwrap());
        }
        assert_eq!(seen, vec![1.0, 2.0, 3.0, 3.0, 3.0]);
    }

    #[tokio::test]
    async fn unknown_sensor_is_an_error() {
        let sim = SimulatedGateway::new();
        let err = sim.read_sensor(&device("nope", "sensor")).await.unwrap_err();
        assert_eq!(err, DeviceIoError::UnknownDevice("nope".into()));
    }

    #[tokio::test]
    async fn injected_write_failure_is_not_recorded() {
        let sim = SimulatedGateway::new();
        let fan = device("fan_1", "actuator");
        sim.fail_writes("fan_1", true);
        assert!(sim.write_actuator(&fan, 1.0).await.is_err());
        sim.fail_writes("fan_1", false);
        sim.write_actuator(&fan, 1.0).await.unwrap();
        assert_eq!(sim.writes_to("fan_1"), vec![1.0]);
    }

    #[test]
    fn from_devices_seeds_initial_values() {
        let mut temp = device("temp_1", "sensor");
        temp.address = serde_json::json!({ "initial": 22.5 });
        let sim = SimulatedGateway::from_devices([&temp, &device("fan_1", "actuator")]);
        let state = sim.lock();
        assert_eq!(state.values["temp_1"].front().copied(), Some(22.5));
        assert!(!state.values.contains_key("fan_1"));
    }
}
