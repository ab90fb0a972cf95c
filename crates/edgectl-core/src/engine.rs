// ── Control engine ──
//
// Evaluates active rules against each sampling batch in descending
// priority order, fires scheduled rules from their own timers and reacts
// to inbound commands. All rule-derived state (the validated site, PID
// instances) lives in one `RuleSet` behind an `ArcSwap`: an evaluation
// works on the snapshot it loaded, and a reload swaps in a complete new
// set in one store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwap;
use chrono::Utc;
use edgectl_api::wire::ActuatorStatus;
use strum::Display;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::command::ControlCommand;
use crate::error::CoreError;
use crate::gateway::{DeviceGateway, DeviceIoError};
use crate::model::{ActuatorAction, ControlRule, Device, RuleKind, SensorReading, find_reading};
use crate::pid::PidController;
use crate::schedule::ScheduleArena;
use crate::site::{ConfigStore, SiteConfig};
use crate::transport::MessageTransport;

/// Value written to an actuator to switch it off.
pub const OFF_STATE: f64 = 0.0;

// ── EngineState ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

// ── ActuatorDriver ───────────────────────────────────────────────────

/// Writes an actuator and publishes its new status.
pub struct ActuatorDriver {
    gateway: Arc<dyn DeviceGateway>,
    transport: Arc<MessageTransport>,
}

impl ActuatorDriver {
    pub fn new(gateway: Arc<dyn DeviceGateway>, transport: Arc<MessageTransport>) -> Self {
        Self { gateway, transport }
    }

    pub async fn write(&self, device: &Device, value: f64) -> Result<(), CoreError> {
        self.gateway.write_actuator(device, value).await?;
        debug!(actuator = %device.id, value, "actuator written");

        let status = ActuatorStatus {
            actuator_id: device.id.clone(),
            state: value,
            timestamp: Utc::now(),
        };
        let topic = self.transport.topics().actuator_status(&device.id);
        self.transport.publish_json(&topic, &status).await?;
        Ok(())
    }

    pub fn gateway(&self) -> &Arc<dyn DeviceGateway> {
        &self.gateway
    }
}

// ── RuleSet ──────────────────────────────────────────────────────────

/// Rule-derived state swapped as a unit on reload.
struct RuleSet {
    site: Arc<SiteConfig>,
    /// One controller per PID rule id. Never shared across rules.
    pids: HashMap<String, Mutex<PidController>>,
}

impl RuleSet {
    fn build(site: Arc<SiteConfig>) -> Self {
        let pids = site
            .rules()
            .iter()
            .filter_map(|rule| match &rule.kind {
                RuleKind::Pid(pid) => Some((rule.id.clone(), Mutex::new(PidController::new(pid.params)))),
                _ => None,
            })
            .collect();
        Self { site, pids }
    }
}

/// What one `evaluate` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    /// Rules that wrote an actuator, in the order they wrote.
    pub fired: Vec<String>,
    /// Rules whose evaluation failed.
    pub failed: Vec<String>,
}

// ── ControlEngine ────────────────────────────────────────────────────

/// Cheaply cloneable handle to the engine.
#[derive(Clone)]
pub struct ControlEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<ConfigStore>,
    driver: ActuatorDriver,
    rules: ArcSwap<RuleSet>,
    // Lifecycle transitions and timer rebuilds hold this lock.
    timers: AsyncMutex<ScheduleArena>,
    timer_faults: watch::Receiver<Option<String>>,
    state: watch::Sender<EngineState>,
}

impl ControlEngine {
    pub fn new(
        store: Arc<ConfigStore>,
        gateway: Arc<dyn DeviceGateway>,
        transport: Arc<MessageTransport>,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Stopped);
        let rules = ArcSwap::from_pointee(RuleSet::build(store.current()));
        let timers = ScheduleArena::new();
        let timer_faults = timers.faults();
        Self {
            inner: Arc::new(EngineInner {
                store,
                driver: ActuatorDriver::new(gateway, transport),
                rules,
                timers: AsyncMutex::new(timers),
                timer_faults,
                state,
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    /// Site the engine is currently evaluating.
    pub fn site(&self) -> Arc<SiteConfig> {
        Arc::clone(&self.inner.rules.load().site)
    }

    pub async fn scheduled_timers(&self) -> usize {
        self.inner.timers.lock().await.len()
    }

    /// Resolves once a scheduled action has panicked.
    pub async fn timer_fault(&self) -> String {
        let mut faults = self.inner.timer_faults.clone();
        match faults.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "schedule arena dropped".into(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// STOPPED → STARTING → RUNNING: build PID instances and arm timers.
    pub async fn start(&self) -> Result<(), CoreError> {
        let mut timers = self.inner.timers.lock().await;
        self.transition(EngineState::Stopped, EngineState::Starting)?;

        let set = Arc::new(RuleSet::build(self.inner.store.current()));
        self.inner.rules.store(Arc::clone(&set));
        self.arm_timers(&mut timers, &set.site);

        self.inner.state.send_replace(EngineState::Running);
        info!(
            rules = set.site.rules().len(),
            timers = timers.len(),
            "control engine running"
        );
        Ok(())
    }

    /// RUNNING → STOPPING → STOPPED: cancel every timer. Stopping a
    /// stopped engine is a no-op.
    pub async fn stop(&self) -> Result<(), CoreError> {
        let mut timers = self.inner.timers.lock().await;
        if self.state() == EngineState::Stopped {
            return Ok(());
        }
        self.transition(EngineState::Running, EngineState::Stopping)?;
        timers.cancel_all();
        self.inner.state.send_replace(EngineState::Stopped);
        info!("control engine stopped");
        Ok(())
    }

    /// Re-read the configuration and rebuild PID instances and timers.
    ///
    /// The new rule set is published in a single swap, so any evaluation
    /// sees either the old set or the new one. A failed reload keeps the
    /// old set and its timers.
    pub async fn reload(&self) -> Result<(), CoreError> {
        let mut timers = self.inner.timers.lock().await;
        if self.state() != EngineState::Running {
            debug!(state = %self.state(), "reload ignored, engine not running");
            return Ok(());
        }

        let site = self.inner.store.reload()?;
        timers.cancel_all();
        let set = Arc::new(RuleSet::build(site));
        self.inner.rules.store(Arc::clone(&set));
        self.arm_timers(&mut timers, &set.site);

        info!(
            rules = set.site.rules().len(),
            timers = timers.len(),
            "configuration reloaded"
        );
        Ok(())
    }

    fn transition(&self, from: EngineState, to: EngineState) -> Result<(), CoreError> {
        let current = self.state();
        if current != from {
            return Err(CoreError::InvalidTransition {
                from: current.to_string(),
                to: to.to_string(),
            });
        }
        self.inner.state.send_replace(to);
        Ok(())
    }

    fn arm_timers(&self, arena: &mut ScheduleArena, site: &SiteConfig) {
        for rule in site.rules().iter().filter(|r| r.active) {
            let RuleKind::Scheduled(scheduled) = &rule.kind else {
                continue;
            };
            let weak: Weak<EngineInner> = Arc::downgrade(&self.inner);
            let rule_id = rule.id.clone();
            arena.spawn(&rule.id, scheduled.schedule.clone(), move || {
                let weak = weak.clone();
                let rule_id = rule_id.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        ControlEngine { inner }.fire_scheduled(&rule_id).await;
                    }
                }
            });
            debug!(rule = %rule.id, schedule = %scheduled.schedule.expression(), "timer armed");
        }
    }

    // ── Evaluation ───────────────────────────────────────────────────

    /// Evaluate every active threshold and PID rule against `readings`.
    ///
    /// Rules run strictly in descending priority order. A failing rule is
    /// logged and skipped; the rest of the pass continues.
    pub async fn evaluate(&self, readings: &[SensorReading]) -> EvaluationReport {
        let mut report = EvaluationReport::default();
        if self.state() != EngineState::Running {
            return report;
        }

        let set = self.inner.rules.load_full();
        for rule in set.site.rules().iter().filter(|r| r.active) {
            match self.evaluate_rule(&set, rule, readings).await {
                Ok(true) => report.fired.push(rule.id.clone()),
                Ok(false) => {}
                Err(e) => {
                    warn!(rule = %rule.id, error = %e, "rule evaluation failed");
                    report.failed.push(rule.id.clone());
                }
            }
        }
        report
    }

    async fn evaluate_rule(
        &self,
        set: &RuleSet,
        rule: &ControlRule,
        readings: &[SensorReading],
    ) -> Result<bool, CoreError> {
        match &rule.kind {
            RuleKind::Threshold(threshold) => {
                let Some(reading) = find_reading(readings, &threshold.sensor_id) else {
                    return Ok(false);
                };
                if !threshold.triggers(reading.value) {
                    return Ok(false);
                }
                debug!(
                    rule = %rule.id,
                    value = reading.value,
                    op = %threshold.comparator,
                    threshold = threshold.threshold,
                    "threshold triggered"
                );
                self.apply_action(&set.site, &threshold.action).await?;
                Ok(true)
            }
            RuleKind::Pid(pid) => {
                let Some(reading) = find_reading(readings, &pid.sensor_id) else {
                    return Ok(false);
                };
                if !reading.value.is_finite() {
                    return Err(DeviceIoError::Read {
                        device: pid.sensor_id.clone(),
                        reason: format!("non-finite reading {}", reading.value),
                    }
                    .into());
                }
                let Some(controller) = set.pids.get(&rule.id) else {
                    debug!(rule = %rule.id, "no PID instance, skipping");
                    return Ok(false);
                };
                let output = {
                    let mut controller = controller.lock().map_err(|_| {
                        CoreError::Fatal(format!("PID state for '{}' poisoned", rule.id))
                    })?;
                    controller.update(reading.value).round()
                };
                let device = actuator(&set.site, &pid.actuator_id)?;
                self.inner.driver.write(device, output).await?;
                Ok(true)
            }
            RuleKind::Scheduled(_) | RuleKind::EmergencyStop => Ok(false),
        }
    }

    async fn apply_action(&self, site: &SiteConfig, action: &ActuatorAction) -> Result<(), CoreError> {
        let device = actuator(site, &action.actuator_id)?;
        self.inner.driver.write(device, action.target_state).await
    }

    /// Run a scheduled rule's action, ignoring sensor state. Does nothing
    /// if the rule is gone from the current set.
    pub async fn fire_scheduled(&self, rule_id: &str) {
        if self.state() != EngineState::Running {
            return;
        }
        let set = self.inner.rules.load_full();
        let Some(rule) = set.site.rule(rule_id).filter(|r| r.active) else {
            debug!(rule = %rule_id, "scheduled rule no longer present");
            return;
        };
        let RuleKind::Scheduled(scheduled) = &rule.kind else {
            return;
        };
        info!(rule = %rule.id, actuator = %scheduled.action.actuator_id, "scheduled rule fired");
        if let Err(e) = self.apply_action(&set.site, &scheduled.action).await {
            warn!(rule = %rule.id, error = %e, "scheduled action failed");
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Manual override: write `state` to `actuator_id`, bypassing rules.
    pub async fn set_actuator(&self, actuator_id: &str, state: f64) -> Result<(), CoreError> {
        let site = self.site();
        let device = actuator(&site, actuator_id)?;
        info!(actuator = %actuator_id, state, "manual override");
        self.inner.driver.write(device, state).await
    }

    /// Trigger the hardware safety stop, then switch every actuator off
    /// once. Normal evaluation and timers keep running.
    pub async fn emergency_stop(&self) -> usize {
        warn!("emergency stop triggered");
        if let Err(e) = self.inner.driver.gateway().trigger_safety_stop().await {
            error!(error = %e, "hardware safety stop failed, forcing outputs off anyway");
        }
        self.force_all_off().await
    }

    /// Write the off state to every configured actuator. Returns how many
    /// writes succeeded. Works in any engine state.
    pub async fn force_all_off(&self) -> usize {
        let site = self.site();
        let mut written = 0;
        for device in site.actuators() {
            match self.inner.driver.write(device, OFF_STATE).await {
                Ok(()) => written += 1,
                Err(e) => error!(actuator = %device.id, error = %e, "failed to switch actuator off"),
            }
        }
        written
    }

    /// Apply one inbound command. Ignored unless the engine is running.
    pub async fn handle_command(&self, command: ControlCommand) {
        if self.state() != EngineState::Running {
            debug!(command = command.name(), state = %self.state(), "command ignored");
            return;
        }
        match command {
            ControlCommand::SetActuator { actuator_id, state } => {
                if let Err(e) = self.set_actuator(&actuator_id, state).await {
                    warn!(actuator = %actuator_id, error = %e, "manual override failed");
                }
            }
            ControlCommand::EmergencyStop => {
                self.emergency_stop().await;
            }
            ControlCommand::ReloadConfig => {
                if let Err(e) = self.reload().await {
                    warn!(error = %e, "reload failed, previous rules kept");
                }
            }
        }
    }

    /// Process commands from the transport until cancelled.
    pub async fn run_commands(
        self,
        mut commands: mpsc::Receiver<ControlCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            let command = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                command = commands.recv() => command,
            };
            match command {
                Some(command) => self.handle_command(command).await,
                None => break,
            }
        }
        debug!("command processor exited");
    }
}

fn actuator<'a>(site: &'a SiteConfig, id: &str) -> Result<&'a Device, CoreError> {
    site.device(id)
        .filter(|d| d.is_actuator())
        .ok_or_else(|| DeviceIoError::UnknownDevice(id.to_owned()).into())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use edgectl_api::Topics;

    use super::*;
    use crate::gateway::SimulatedGateway;
    use crate::queue::PersistentQueue;
    use crate::site::{MemorySource, SiteDefinition};
    use crate::transport::MemoryLink;

    async fn engine(def: serde_json::Value) -> (ControlEngine, Arc<SimulatedGateway>) {
        let def: SiteDefinition = serde_json::from_value(def).unwrap();
        let store = Arc::new(ConfigStore::load(Box::new(MemorySource::new(def))));
        let gateway = Arc::new(SimulatedGateway::new());
        let queue = Arc::new(PersistentQueue::in_memory().await.unwrap());
        let transport = Arc::new(MessageTransport::new(
            Arc::new(MemoryLink::new()),
            queue,
            Topics::new("t", "c"),
            10,
        ));
        (ControlEngine::new(store, gateway.clone(), transport), gateway)
    }

    fn one_fan() -> serde_json::Value {
        serde_json::json!({
            "devices": [
                { "id": "temp_1", "kind": "sensor" },
                { "id": "fan_1", "kind": "actuator" }
            ],
            "rules": [
                { "id": "cool", "kind": "THRESHOLD",
                  "conditions": { "sensor_id": "temp_1", "operator": ">", "threshold": 30 },
                  "actions": { "actuator_id": "fan_1", "target_state": 1 } }
            ]
        })
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let (engine, _) = engine(one_fan()).await;
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(matches!(
            engine.start().await,
            Err(CoreError::InvalidTransition { .. })
        ));

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn evaluate_is_inert_until_started() {
        let (engine, gateway) = engine(one_fan()).await;
        let report = engine
            .evaluate(&[SensorReading::new("temp_1", 35.0, "c")])
            .await;
        assert!(report.fired.is_empty());
        assert!(gateway.writes().is_empty());
    }

    #[tokio::test]
    async fn commands_are_ignored_when_stopped() {
        let (engine, gateway) = engine(one_fan()).await;
        engine
            .handle_command(ControlCommand::SetActuator {
                actuator_id: "fan_1".into(),
                state: 1.0,
            })
            .await;
        assert!(gateway.writes().is_empty());
    }

    #[tokio::test]
    async fn manual_override_of_unknown_actuator_fails() {
        let (engine, _) = engine(one_fan()).await;
        engine.start().await.unwrap();
        let err = engine.set_actuator("temp_1", 1.0).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::DeviceIo(DeviceIoError::UnknownDevice(_))
        ));
    }

    #[test]
    fn engine_state_display() {
        assert_eq!(EngineState::Stopping.to_string(), "STOPPING");
    }
}
