// ── Control rules ──
//
// Rules arrive as loosely shaped definitions (`RuleDefinition`) and are
// validated once, at load time, into the tagged `RuleKind` union. The
// engine never does untyped key lookups while evaluating.

use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use crate::schedule::CronSchedule;

// ── Validation errors ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("rule '{rule}': missing {field}")]
    MissingField { rule: String, field: &'static str },

    #[error("rule '{rule}': unknown comparator '{operator}'")]
    InvalidOperator { rule: String, operator: String },

    #[error("rule '{rule}': invalid schedule '{expression}': {reason}")]
    InvalidSchedule {
        rule: String,
        expression: String,
        reason: String,
    },

    #[error("rule '{rule}': invalid PID parameters: {reason}")]
    InvalidPid { rule: String, reason: String },

    #[error("rule without an id")]
    MissingId,
}

// ── Comparator ───────────────────────────────────────────────────────

/// Threshold comparison applied as `reading <op> threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum Comparator {
    #[serde(rename = ">")]
    #[strum(serialize = ">")]
    Greater,
    #[serde(rename = "<")]
    #[strum(serialize = "<")]
    Less,
    #[serde(rename = ">=")]
    #[strum(serialize = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    #[strum(serialize = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    #[strum(serialize = "==")]
    Equal,
}

impl Comparator {
    pub fn parse(operator: &str) -> Option<Self> {
        match operator.trim() {
            ">" => Some(Self::Greater),
            "<" => Some(Self::Less),
            ">=" => Some(Self::GreaterOrEqual),
            "<=" => Some(Self::LessOrEqual),
            "==" | "=" => Some(Self::Equal),
            _ => None,
        }
    }

    #[allow(clippy::float_cmp)]
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Greater => value > threshold,
            Self::Less => value < threshold,
            Self::GreaterOrEqual => value >= threshold,
            Self::LessOrEqual => value <= threshold,
            Self::Equal => value == threshold,
        }
    }
}

// ── Kind-specific payloads ───────────────────────────────────────────

/// Write `target_state` to `actuator_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorAction {
    pub actuator_id: String,
    pub target_state: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub sensor_id: String,
    pub comparator: Comparator,
    pub threshold: f64,
    pub action: ActuatorAction,
}

impl ThresholdRule {
    pub fn triggers(&self, value: f64) -> bool {
        self.comparator.holds(value, self.threshold)
    }
}

/// Gains, target and output bounds of a PID loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidParams {
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,
    pub setpoint: f64,
    #[serde(alias = "outputMin")]
    pub output_min: f64,
    #[serde(alias = "outputMax")]
    pub output_max: f64,
}

impl PidParams {
    pub fn validate(&self) -> Result<(), String> {
        let all = [
            self.kp,
            self.ki,
            self.kd,
            self.setpoint,
            self.output_min,
            self.output_max,
        ];
        if all.iter().any(|v| !v.is_finite()) {
            return Err("all parameters must be finite".into());
        }
        if self.output_min > self.output_max {
            return Err(format!(
                "output_min ({}) exceeds output_max ({})",
                self.output_min, self.output_max
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PidRule {
    pub sensor_id: String,
    pub actuator_id: String,
    pub params: PidParams,
}

#[derive(Debug, Clone)]
pub struct ScheduledRule {
    pub schedule: CronSchedule,
    pub action: ActuatorAction,
}

/// Kind-specific body of a rule.
#[derive(Debug, Clone)]
pub enum RuleKind {
    Threshold(ThresholdRule),
    Pid(PidRule),
    Scheduled(ScheduledRule),
    /// Safety override. Driven by the emergency-stop command, never by
    /// sensor evaluation.
    EmergencyStop,
}

impl RuleKind {
    pub fn tag(&self) -> RuleKindTag {
        match self {
            Self::Threshold(_) => RuleKindTag::Threshold,
            Self::Pid(_) => RuleKindTag::Pid,
            Self::Scheduled(_) => RuleKindTag::Scheduled,
            Self::EmergencyStop => RuleKindTag::EmergencyStop,
        }
    }
}

// ── ControlRule ──────────────────────────────────────────────────────

/// A validated rule.
///
/// `load_order` is the position in the source definition list and breaks
/// priority ties so ordering is total and deterministic.
#[derive(Debug, Clone)]
pub struct ControlRule {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub priority: i32,
    pub load_order: usize,
    pub kind: RuleKind,
}

impl ControlRule {
    /// Validate a raw definition into a typed rule.
    pub fn from_definition(def: &RuleDefinition, load_order: usize) -> Result<Self, RuleError> {
        let id = def.id.trim();
        if id.is_empty() {
            return Err(RuleError::MissingId);
        }
        let missing = |field: &'static str| RuleError::MissingField {
            rule: id.to_owned(),
            field,
        };

        let kind = match def.kind {
            RuleKindTag::Threshold => {
                let cond = def.conditions.as_ref().ok_or_else(|| missing("conditions"))?;
                let sensor_id = cond.sensor_id.clone().ok_or_else(|| missing("conditions.sensor_id"))?;
                let operator = cond.operator.as_deref().ok_or_else(|| missing("conditions.operator"))?;
                let comparator =
                    Comparator::parse(operator).ok_or_else(|| RuleError::InvalidOperator {
                        rule: id.to_owned(),
                        operator: operator.to_owned(),
                    })?;
                let threshold = cond.threshold.ok_or_else(|| missing("conditions.threshold"))?;
                if let Some(secs) = cond.duration_sec {
                    tracing::debug!(
                        rule = %id,
                        duration_sec = secs,
                        "duration_sec is not applied, threshold rules trigger on a single sample"
                    );
                }
                RuleKind::Threshold(ThresholdRule {
                    sensor_id,
                    comparator,
                    threshold,
                    action: action_from(def, id)?,
                })
            }
            RuleKindTag::Pid => {
                let params = def.pid.ok_or_else(|| missing("pid"))?;
                params.validate().map_err(|reason| RuleError::InvalidPid {
                    rule: id.to_owned(),
                    reason,
                })?;
                let sensor_id = def
                    .conditions
                    .as_ref()
                    .and_then(|c| c.sensor_id.clone())
                    .ok_or_else(|| missing("conditions.sensor_id"))?;
                let actuator_id = def
                    .actions
                    .as_ref()
                    .and_then(|a| a.actuator_id.clone())
                    .ok_or_else(|| missing("actions.actuator_id"))?;
                RuleKind::Pid(PidRule {
                    sensor_id,
                    actuator_id,
                    params,
                })
            }
            RuleKindTag::Scheduled => {
                let expression = def.schedule.as_deref().ok_or_else(|| missing("schedule"))?;
                let schedule =
                    CronSchedule::parse(expression).map_err(|reason| RuleError::InvalidSchedule {
                        rule: id.to_owned(),
                        expression: expression.to_owned(),
                        reason,
                    })?;
                RuleKind::Scheduled(ScheduledRule {
                    schedule,
                    action: action_from(def, id)?,
                })
            }
            RuleKindTag::EmergencyStop => RuleKind::EmergencyStop,
        };

        Ok(Self {
            id: id.to_owned(),
            name: def.name.clone(),
            active: def.active,
            priority: def.priority,
            load_order,
            kind,
        })
    }

    /// The sensor this rule reads, if any.
    pub fn sensor_id(&self) -> Option<&str> {
        match &self.kind {
            RuleKind::Threshold(t) => Some(&t.sensor_id),
            RuleKind::Pid(p) => Some(&p.sensor_id),
            RuleKind::Scheduled(_) | RuleKind::EmergencyStop => None,
        }
    }

    /// The actuator this rule drives, if any.
    pub fn actuator_id(&self) -> Option<&str> {
        match &self.kind {
            RuleKind::Threshold(t) => Some(&t.action.actuator_id),
            RuleKind::Pid(p) => Some(&p.actuator_id),
            RuleKind::Scheduled(s) => Some(&s.action.actuator_id),
            RuleKind::EmergencyStop => None,
        }
    }
}

fn action_from(def: &RuleDefinition, id: &str) -> Result<ActuatorAction, RuleError> {
    let missing = |field: &'static str| RuleError::MissingField {
        rule: id.to_owned(),
        field,
    };
    let actions = def.actions.as_ref().ok_or_else(|| missing("actions"))?;
    Ok(ActuatorAction {
        actuator_id: actions
            .actuator_id
            .clone()
            .ok_or_else(|| missing("actions.actuator_id"))?,
        target_state: actions
            .target_state
            .ok_or_else(|| missing("actions.target_state"))?,
    })
}

/// Sort rules by descending priority; ties keep load order.
pub fn sort_by_priority(rules: &mut [std::sync::Arc<ControlRule>]) {
    rules.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.load_order.cmp(&b.load_order))
    });
}

// ── Raw definitions ──────────────────────────────────────────────────

/// Rule kind as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKindTag {
    #[serde(alias = "threshold")]
    Threshold,
    #[serde(alias = "pid")]
    Pid,
    #[serde(alias = "scheduled")]
    Scheduled,
    #[serde(alias = "emergency_stop")]
    EmergencyStop,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionsDefinition {
    #[serde(default, alias = "sensorId")]
    pub sensor_id: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Accepted for compatibility; threshold rules trigger immediately.
    #[serde(default, alias = "durationSec")]
    pub duration_sec: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionsDefinition {
    #[serde(default, alias = "actuatorId")]
    pub actuator_id: Option<String>,
    #[serde(default, alias = "targetState")]
    pub target_state: Option<f64>,
}

/// Rule exactly as it appears in the configuration source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: RuleKindTag,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Option<ConditionsDefinition>,
    #[serde(default)]
    pub actions: Option<ActionsDefinition>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub pid: Option<PidParams>,
}

fn default_active() -> bool {
    true
}
