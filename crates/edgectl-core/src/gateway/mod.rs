// ── Device I/O gateway ──
//
// The seam between control logic and the physical bus. The bus driver
// itself lives outside this crate; the engine and the sampling loop only
// see `DeviceGateway`.

mod simulated;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Device;

pub use simulated::{ActuatorWrite, SimulatedGateway};

/// Physical read/write failure. Never fatal: the affected sample or rule
/// is skipped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceIoError {
    #[error("read from '{device}' failed: {reason}")]
    Read { device: String, reason: String },

    #[error("write to '{device}' failed: {reason}")]
    Write { device: String, reason: String },

    #[error("safety stop failed: {0}")]
    SafetyStop(String),

    #[error("{operation} on '{device}' timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        device: String,
        after: Duration,
    },

    #[error("unknown device '{0}'")]
    UnknownDevice(String),
}

/// Operations the controller needs from the physical bus.
///
/// `Device::address` is passed through untouched; only the implementation
/// knows what it means.
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// Raw (unscaled) value of a sensor.
    async fn read_sensor(&self, device: &Device) -> Result<f64, DeviceIoError>;

    async fn write_actuator(&self, device: &Device, value: f64) -> Result<(), DeviceIoError>;

    /// Hardware-level safety stop, independent of individual actuators.
    async fn trigger_safety_stop(&self) -> Result<(), DeviceIoError>;
}

#[async_trait]
impl<G: DeviceGateway + ?Sized> DeviceGateway for Arc<G> {
    async fn read_sensor(&self, device: &Device) -> Result<f64, DeviceIoError> {
        (**self).read_sensor(device).await
    }

    async fn write_actuator(&self, device: &Device, value: f64) -> Result<(), DeviceIoError> {
        (**self).write_actuator(device, value).await
    }

    async fn trigger_safety_stop(&self) -> Result<(), DeviceIoError> {
        (**self).trigger_safety_stop().await
    }
}

// ── TimeoutGateway ───────────────────────────────────────────────────

/// Bounds every call on the wrapped gateway.
///
/// A hung bus read must not stall the sampling loop or an emergency
/// stop, so each call races `limit` and fails with
/// [`DeviceIoError::Timeout`] when it loses.
pub struct TimeoutGateway<G> {
    inner: G,
    limit: Duration,
}

impl<G: DeviceGateway> TimeoutGateway<G> {
    pub fn new(inner: G, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

#[async_trait]
impl<G: DeviceGateway> DeviceGateway for TimeoutGateway<G> {
    async fn read_sensor(&self, device: &Device) -> Result<f64, DeviceIoError> {
        tokio::time::timeout(self.limit, self.inner.read_sensor(device))
            .await
            .map_err(|_| DeviceIoError::Timeout {
                operation: "read",
                device: device.id.clone(),
                after: self.limit,
            })?
    }

    async fn write_actuator(&self, device: &Device, value: f64) -> Result<(), DeviceIoError> {
        tokio::time::timeout(self.limit, self.inner.write_actuator(device, value))
            .await
            .map_err(|_| DeviceIoError::Timeout {
                operation: "write",
                device: device.id.clone(),
                after: self.limit,
            })?
    }

    async fn trigger_safety_stop(&self) -> Result<(), DeviceIoError> {
        tokio::time::timeout(self.limit, self.inner.trigger_safety_stop())
            .await
            .map_err(|_| DeviceIoError::Timeout {
                operation: "safety stop",
                device: "*".into(),
                after: self.limit,
            })?
    }
}
