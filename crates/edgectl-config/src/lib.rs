//! Configuration for the edgectl controller.
//!
//! One TOML (or JSON) file carries both the runtime settings and the
//! reloadable site definition:
//!
//! ```toml
//! [controller]
//! id = "greenhouse-01"
//!
//! [broker]
//! url = "mqtt://broker.local:1883"
//! password_env = "GREENHOUSE_MQTT_PASSWORD"
//!
//! [[devices]]
//! id = "temp_1"
//! kind = "sensor"
//!
//! [[rules]]
//! id = "cool"
//! kind = "THRESHOLD"
//! ```
//!
//! Values are layered: built-in defaults, then the file, then
//! `EDGECTL_`-prefixed environment variables (`EDGECTL_BROKER__URL`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use edgectl_core::{
    BrokerSettings, ConfigSource, ControllerConfig, CoreError, Device, QueueSettings,
    RuleDefinition, SiteDefinition,
};

/// Queue path value that keeps the queue in memory.
pub const IN_MEMORY_QUEUE: &str = ":memory:";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

// ── File structs ────────────────────────────────────────────────────

/// Whole configuration file.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub controller: ControllerSection,

    #[serde(default)]
    pub broker: BrokerSection,

    #[serde(default)]
    pub queue: QueueSection,

    #[serde(default)]
    pub devices: Vec<Device>,

    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ControllerSection {
    pub id: String,

    /// Human name carried in heartbeats. Defaults to the id.
    pub name: Option<String>,

    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Bound on each device gateway call.
    #[serde(default = "default_io_timeout")]
    pub io_timeout_ms: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: None,
            sample_interval_secs: default_sample_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            io_timeout_ms: default_io_timeout(),
        }
    }
}

fn default_sample_interval() -> u64 {
    5
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_io_timeout() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BrokerSection {
    /// `mqtt://host[:port]`
    #[serde(default = "default_broker_url")]
    pub url: String,

    pub client_id: Option<String>,

    pub username: Option<String>,

    /// Password (plaintext; prefer `password_env`).
    pub password: Option<String>,

    /// Environment variable holding the password.
    pub password_env: Option<String>,

    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            client_id: None,
            username: None,
            password: None,
            password_env: None,
            topic_prefix: default_topic_prefix(),
            keep_alive_secs: default_keep_alive(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".into()
}
fn default_topic_prefix() -> String {
    "edgectl".into()
}
fn default_keep_alive() -> u64 {
    30
}
fn default_reconnect_delay() -> u64 {
    5
}

#[derive(Debug, Deserialize, Serialize)]
pub struct QueueSection {
    /// SQLite file; `":memory:"` for a volatile queue. Defaults to the
    /// platform data directory.
    pub path: Option<PathBuf>,

    #[serde(default = "default_drain_limit")]
    pub drain_limit: u32,

    #[serde(default = "default_retention")]
    pub retention_hours: u64,

    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,

    /// How often unsent entries are retried while the broker is up.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            path: None,
            drain_limit: default_drain_limit(),
            retention_hours: default_retention(),
            prune_interval_secs: default_prune_interval(),
            retry_interval_secs: default_retry_interval(),
        }
    }
}

fn default_drain_limit() -> u32 {
    100
}
fn default_retention() -> u64 {
    24
}
fn default_prune_interval() -> u64 {
    3600
}
fn default_retry_interval() -> u64 {
    10
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "edgectl", "edgectl")
}

/// Default config file location for this platform.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from("edgectl.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default queue database location for this platform.
pub fn default_queue_path() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from("edgectl-queue.db"),
        |dirs| dirs.data_dir().join("queue.db"),
    )
}

// ── Loading ─────────────────────────────────────────────────────────

/// Load settings from `path` (TOML, or JSON when the extension is
/// `.json`) layered over defaults and `EDGECTL_*` environment variables.
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let figment = Figment::new().merge(Serialized::defaults(Settings::default()));
    let figment = if is_json(path) {
        figment.merge(Json::file(path))
    } else {
        figment.merge(Toml::file(path))
    };
    let settings: Settings = figment
        .merge(Env::prefixed("EDGECTL_").split("__"))
        .extract()?;
    Ok(settings)
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

impl Settings {
    pub fn site_definition(&self) -> SiteDefinition {
        SiteDefinition {
            devices: self.devices.clone(),
            rules: self.rules.clone(),
        }
    }

    /// Translate into the core runtime configuration.
    pub fn to_controller_config(&self) -> Result<ControllerConfig, ConfigError> {
        let id = self.controller.id.trim();
        if id.is_empty() {
            return Err(ConfigError::Validation {
                field: "controller.id".into(),
                reason: "must be set".into(),
            });
        }

        let url: url::Url = self.broker.url.parse().map_err(|e| ConfigError::Validation {
            field: "broker.url".into(),
            reason: format!("'{}': {e}", self.broker.url),
        })?;
        if !matches!(url.scheme(), "mqtt" | "tcp") {
            return Err(ConfigError::Validation {
                field: "broker.url".into(),
                reason: format!("expected mqtt:// scheme, got '{}'", url.scheme()),
            });
        }

        let mut broker = BrokerSettings::new(url);
        broker.client_id.clone_from(&self.broker.client_id);
        broker.username.clone_from(&self.broker.username);
        broker.password = resolve_password(&self.broker);
        broker.topic_prefix.clone_from(&self.broker.topic_prefix);
        broker.keep_alive = Duration::from_secs(self.broker.keep_alive_secs);
        broker.reconnect_delay = Duration::from_secs(self.broker.reconnect_delay_secs);

        let queue = QueueSettings {
            path: match &self.queue.path {
                Some(p) if p.as_os_str() == IN_MEMORY_QUEUE => None,
                Some(p) => Some(p.clone()),
                None => Some(default_queue_path()),
            },
            drain_limit: self.queue.drain_limit,
            retention: Duration::from_secs(self.queue.retention_hours.saturating_mul(3600)),
            prune_interval: Duration::from_secs(self.queue.prune_interval_secs),
            retry_interval: Duration::from_secs(self.queue.retry_interval_secs),
        };

        let mut config = ControllerConfig::new(id, broker);
        config.name = self
            .controller
            .name
            .clone()
            .unwrap_or_else(|| id.to_owned());
        config.sample_interval = Duration::from_secs(self.controller.sample_interval_secs);
        config.heartbeat_interval = Duration::from_secs(self.controller.heartbeat_interval_secs);
        config.io_timeout = Duration::from_millis(self.controller.io_timeout_ms);
        config.queue = queue;

        config.validate().map_err(|e| ConfigError::Validation {
            field: "controller".into(),
            reason: e.to_string(),
        })?;
        Ok(config)
    }
}

/// `password_env` wins over a plaintext `password`.
fn resolve_password(broker: &BrokerSection) -> Option<SecretString> {
    if let Some(ref env_name) = broker.password_env {
        match std::env::var(env_name) {
            Ok(value) => return Some(SecretString::from(value)),
            Err(_) => tracing::warn!(var = %env_name, "broker password variable not set"),
        }
    }
    broker.password.clone().map(SecretString::from)
}

// ── Reloadable source ───────────────────────────────────────────────

/// Site definitions read from the config file on every load.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<SiteDefinition, CoreError> {
        Ok(load_settings(&self.path)?.site_definition())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use figment::Jail;
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    const SAMPLE: &str = r#"
        [controller]
        id = "gh-01"
        name = "Greenhouse"
        sample_interval_secs = 2

        [broker]
        url = "mqtt://broker.local:1884"
        username = "edge"
        password = "plain"
        topic_prefix = "farm"

        [queue]
        path = ":memory:"
        retention_hours = 48
        retry_interval_secs = 3

        [[devices]]
        id = "temp_1"
        kind = "sensor"
        scale = 0.1

        [[devices]]
        id = "fan_1"
        kind = "actuator"

        [[rules]]
        id = "cool"
        kind = "THRESHOLD"
        priority = 10
        conditions = { sensor_id = "temp_1", operator = ">", threshold = 30.0 }
        actions = { actuator_id = "fan_1", target_state = 1.0 }
    "#;

    #[test]
    fn loads_toml_into_controller_config() {
        Jail::expect_with(|jail| {
            jail.create_file("edgectl.toml", SAMPLE)?;
            let settings = load_settings(Path::new("edgectl.toml")).unwrap();
            let config = settings.to_controller_config().unwrap();

            assert_eq!(config.controller_id, "gh-01");
            assert_eq!(config.name, "Greenhouse");
            assert_eq!(config.sample_interval, Duration::from_secs(2));
            assert_eq!(config.broker.url.port(), Some(1884));
            assert_eq!(config.topics().controller_status(), "farm/gh-01/status");
            assert_eq!(config.queue.path, None);
            assert_eq!(config.queue.retention, Duration::from_secs(48 * 3600));
            assert_eq!(config.queue.retry_interval, Duration::from_secs(3));
            assert_eq!(
                config.broker.password.as_ref().unwrap().expose_secret(),
                "plain"
            );

            let site = settings.site_definition();
            assert_eq!(site.devices.len(), 2);
            assert_eq!(site.rules.len(), 1);
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("edgectl.toml", SAMPLE)?;
            jail.set_env("EDGECTL_BROKER__URL", "mqtt://other:1883");
            jail.set_env("EDGECTL_CONTROLLER__SAMPLE_INTERVAL_SECS", "9");

            let config = load_settings(Path::new("edgectl.toml"))
                .unwrap()
                .to_controller_config()
                .unwrap();
            assert_eq!(config.broker.url.host_str(), Some("other"));
            assert_eq!(config.sample_interval, Duration::from_secs(9));
            Ok(())
        });
    }

    #[test]
    fn password_env_takes_precedence() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "edgectl.toml",
                r#"
                [controller]
                id = "gh-01"
                [broker]
                password = "plain"
                password_env = "GH_MQTT_PASSWORD"
                "#,
            )?;
            jail.set_env("GH_MQTT_PASSWORD", "from-env");

            let config = load_settings(Path::new("edgectl.toml"))
                .unwrap()
                .to_controller_config()
                .unwrap();
            assert_eq!(
                config.broker.password.unwrap().expose_secret(),
                "from-env"
            );
            Ok(())
        });
    }

    #[test]
    fn json_files_are_supported() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "site.json",
                r#"{
                    "controller": { "id": "gh-02" },
                    "devices": [{ "id": "temp_1", "kind": "SENSOR" }],
                    "rules": []
                }"#,
            )?;
            let settings = load_settings(Path::new("site.json")).unwrap();
            assert_eq!(settings.controller.id, "gh-02");
            assert_eq!(settings.devices.len(), 1);
            Ok(())
        });
    }

    #[test]
    fn missing_id_and_bad_scheme_are_rejected() {
        let mut settings = Settings::default();
        assert!(matches!(
            settings.to_controller_config(),
            Err(ConfigError::Validation { ref field, .. }) if field == "controller.id"
        ));

        settings.controller.id = "gh-01".into();
        settings.broker.url = "http://broker".into();
        assert!(matches!(
            settings.to_controller_config(),
            Err(ConfigError::Validation { ref field, .. }) if field == "broker.url"
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = load_settings(Path::new("/nonexistent/edgectl.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn file_source_rereads_on_each_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edgectl.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let source = FileConfigSource::new(&path);
        assert_eq!(source.load().unwrap().rules.len(), 1);

        std::fs::write(&path, "[controller]\nid = \"gh-01\"\n").unwrap();
        assert!(source.load().unwrap().rules.is_empty());

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(source.load(), Err(CoreError::Config { .. })));
    }
}
