// ── Site configuration ──
//
// Devices and rules as one reloadable unit. A `ConfigSource` produces
// raw definitions; `SiteConfig` is the validated, priority-sorted form
// the engine reads; `ConfigStore` swaps it atomically.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::CoreError;
use crate::model::{ControlRule, Device, DeviceKind, RuleDefinition, sort_by_priority};

/// Devices and rules exactly as loaded from a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteDefinition {
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

/// Where site definitions come from. Called at startup and on every
/// reload command.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<SiteDefinition, CoreError>;

    /// Short human description for logs.
    fn describe(&self) -> String {
        "configuration source".into()
    }
}

impl<S: ConfigSource + ?Sized> ConfigSource for Arc<S> {
    fn load(&self) -> Result<SiteDefinition, CoreError> {
        (**self).load()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// In-memory source whose contents can be replaced between reloads.
#[derive(Default)]
pub struct MemorySource {
    definition: Mutex<SiteDefinition>,
}

impl MemorySource {
    pub fn new(definition: SiteDefinition) -> Self {
        Self {
            definition: Mutex::new(definition),
        }
    }

    pub fn replace(&self, definition: SiteDefinition) {
        if let Ok(mut current) = self.definition.lock() {
            *current = definition;
        }
    }
}

impl ConfigSource for MemorySource {
    fn load(&self) -> Result<SiteDefinition, CoreError> {
        self.definition
            .lock()
            .map(|d| d.clone())
            .map_err(|_| CoreError::Config {
                message: "in-memory source poisoned".into(),
            })
    }

    fn describe(&self) -> String {
        "in-memory definition".into()
    }
}

/// A definition entry that was rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub id: String,
    pub reason: String,
}

/// Validated site: devices indexed by id, rules sorted by descending
/// priority with load order as tie-break.
#[derive(Debug, Default)]
pub struct SiteConfig {
    devices: Vec<Device>,
    index: HashMap<String, usize>,
    rules: Vec<Arc<ControlRule>>,
    skipped_devices: Vec<Skipped>,
    skipped_rules: Vec<Skipped>,
}

impl SiteConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate a definition. Bad entries are skipped with a warning
    /// rather than failing the whole site.
    pub fn from_definition(definition: SiteDefinition) -> Self {
        let mut site = Self::empty();

        for device in definition.devices {
            if device.id.trim().is_empty() {
                site.skip_device(&device.id, "empty id".into());
                continue;
            }
            if site.index.contains_key(&device.id) {
                site.skip_device(&device.id, "duplicate id".into());
                continue;
            }
            site.index.insert(device.id.clone(), site.devices.len());
            site.devices.push(device);
        }

        let mut seen = HashSet::new();
        for (load_order, def) in definition.rules.iter().enumerate() {
            let rule = match ControlRule::from_definition(def, load_order) {
                Ok(rule) => rule,
                Err(e) => {
                    site.skip_rule(&def.id, e.to_string());
                    continue;
                }
            };
            if !seen.insert(rule.id.clone()) {
                site.skip_rule(&rule.id, "duplicate id".into());
                continue;
            }
            if let Err(reason) = site.check_references(&rule) {
                site.skip_rule(&rule.id, reason);
                continue;
            }
            site.rules.push(Arc::new(rule));
        }

        sort_by_priority(&mut site.rules);
        site
    }

    fn check_references(&self, rule: &ControlRule) -> Result<(), String> {
        if let Some(sensor) = rule.sensor_id() {
            self.expect_kind(sensor, DeviceKind::Sensor)?;
        }
        if let Some(actuator) = rule.actuator_id() {
            self.expect_kind(actuator, DeviceKind::Actuator)?;
        }
        Ok(())
    }

    fn expect_kind(&self, id: &str, kind: DeviceKind) -> Result<(), String> {
        match self.device(id) {
            Some(device) if device.kind == kind => Ok(()),
            Some(device) => Err(format!("'{id}' is a {}, expected {kind}", device.kind)),
            None => Err(format!("unknown {kind} '{id}'")),
        }
    }

    fn skip_device(&mut self, id: &str, reason: String) {
        warn!(device = %id, reason = %reason, "skipping device");
        self.skipped_devices.push(Skipped {
            id: id.to_owned(),
            reason,
        });
    }

    fn skip_rule(&mut self, id: &str, reason: String) {
        warn!(rule = %id, reason = %reason, "skipping rule");
        self.skipped_rules.push(Skipped {
            id: id.to_owned(),
            reason,
        });
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.index.get(id).and_then(|&i| self.devices.get(i))
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|d| d.is_sensor())
    }

    pub fn actuators(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|d| d.is_actuator())
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Arc<ControlRule>] {
        &self.rules
    }

    pub fn rule(&self, id: &str) -> Option<&Arc<ControlRule>> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn skipped_devices(&self) -> &[Skipped] {
        &self.skipped_devices
    }

    pub fn skipped_rules(&self) -> &[Skipped] {
        &self.skipped_rules
    }
}

// ── ConfigStore ──────────────────────────────────────────────────────

/// Holds the current `SiteConfig` and reloads it from its source.
pub struct ConfigStore {
    source: Box<dyn ConfigSource>,
    current: ArcSwap<SiteConfig>,
}

impl ConfigStore {
    /// Load once from `source`. An unreadable source starts the store
    /// with an empty site.
    pub fn load(source: Box<dyn ConfigSource>) -> Self {
        let current = match source.load() {
            Ok(def) => SiteConfig::from_definition(def),
            Err(e) => {
                error!(source = %source.describe(), error = %e, "config load failed, starting with an empty site");
                SiteConfig::empty()
            }
        };
        log_summary(&current);
        Self {
            source,
            current: ArcSwap::from_pointee(current),
        }
    }

    pub fn current(&self) -> Arc<SiteConfig> {
        self.current.load_full()
    }

    /// Re-read the source. On failure the previous site stays in place.
    pub fn reload(&self) -> Result<Arc<SiteConfig>, CoreError> {
        let def = self.source.load().map_err(|e| {
            error!(source = %self.source.describe(), error = %e, "config reload failed, keeping previous site");
            e
        })?;
        let site = Arc::new(SiteConfig::from_definition(def));
        log_summary(&site);
        self.current.store(Arc::clone(&site));
        Ok(site)
    }
}

fn log_summary(site: &SiteConfig) {
    info!(
        devices = site.devices().len(),
        rules = site.rules().len(),
        skipped_rules = site.skipped_rules().len(),
        "site configuration loaded"
    );
}
