// edgectl-core: control engine, store-and-forward delivery and orchestration
// for a field controller. Never reads configuration files; callers build a
// `ControllerConfig` and a `ConfigSource` and hand them in.

pub mod command;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod model;
pub mod pid;
pub mod queue;
pub mod schedule;
pub mod site;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use command::ControlCommand;
pub use config::{BrokerSettings, ControllerConfig, QueueSettings};
pub use controller::Controller;
pub use engine::{ActuatorDriver, ControlEngine, EngineState, EvaluationReport, OFF_STATE};
pub use error::CoreError;
pub use gateway::{DeviceGateway, DeviceIoError, SimulatedGateway, TimeoutGateway};
pub use pid::PidController;
pub use queue::{PersistentQueue, QueueEntry, QueueStats};
pub use schedule::{CronSchedule, ScheduleArena};
pub use site::{ConfigSource, ConfigStore, MemorySource, SiteConfig, SiteDefinition, Skipped};
pub use transport::{Delivery, MemoryLink, MessageTransport};

pub use model::{
    ActuatorAction, Comparator, ControlRule, Device, DeviceKind, PidParams, RuleDefinition,
    RuleKind, RuleKindTag, Scaling, SensorReading,
};
