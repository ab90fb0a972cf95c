// ── Domain model ──
//
// Device descriptors, validated control rules and sensor readings. All
// of these are plain data; behaviour lives in the engine.

pub mod device;
pub mod reading;
pub mod rule;

pub use device::{Device, DeviceKind, Scaling};
pub use reading::{SensorReading, find_reading};
pub use rule::{
    ActionsDefinition, ActuatorAction, Comparator, ConditionsDefinition, ControlRule, PidParams,
    PidRule, RuleDefinition, RuleError, RuleKind, RuleKindTag, ScheduledRule, ThresholdRule,
    sort_by_priority,
};
