// ── Runtime controller configuration ──
//
// These types describe how the controller runs: identity, loop cadences,
// broker connection and queue tuning. They never touch disk; the config
// crate builds a `ControllerConfig` and hands it in.

use std::path::PathBuf;
use std::time::Duration;

use edgectl_api::session::LastWillMessage;
use edgectl_api::wire::{ControllerStatus, HeartbeatState};
use edgectl_api::{SessionConfig, Topics};
use secrecy::SecretString;
use url::Url;

use crate::error::CoreError;
use crate::queue::DEFAULT_DRAIN_LIMIT;

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// `mqtt://host[:port]`
    pub url: Url,
    /// MQTT client id. Defaults to the controller id when `None`.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub topic_prefix: String,
    pub keep_alive: Duration,
    /// Fixed backoff between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl BrokerSettings {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            client_id: None,
            username: None,
            password: None,
            topic_prefix: "edgectl".into(),
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Persistent queue settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// SQLite file. `None` keeps the queue in memory.
    pub path: Option<PathBuf>,
    pub drain_limit: u32,
    /// How long sent entries are kept before pruning.
    pub retention: Duration,
    pub prune_interval: Duration,
    /// Period of the background flush that retries unsent entries while
    /// the link is up.
    pub retry_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            path: None,
            drain_limit: DEFAULT_DRAIN_LIMIT,
            retention: Duration::from_secs(24 * 60 * 60),
            prune_interval: Duration::from_secs(60 * 60),
            retry_interval: Duration::from_secs(10),
        }
    }
}

/// Everything the orchestrator needs apart from the site definition.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub controller_id: String,
    pub name: String,
    pub sample_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Upper bound on any single device gateway call.
    pub io_timeout: Duration,
    pub broker: BrokerSettings,
    pub queue: QueueSettings,
}

impl ControllerConfig {
    pub fn new(controller_id: impl Into<String>, broker: BrokerSettings) -> Self {
        let controller_id = controller_id.into();
        Self {
            name: controller_id.clone(),
            controller_id,
            sample_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            io_timeout: Duration::from_secs(2),
            broker,
            queue: QueueSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |message: String| Err(CoreError::Validation { message });
        if self.controller_id.trim().is_empty() {
            return invalid("controller id must not be empty".into());
        }
        if self.controller_id.contains(['/', '+', '#']) {
            return invalid(format!(
                "controller id '{}' contains MQTT topic characters",
                self.controller_id
            ));
        }
        for (name, value) in [
            ("sample interval", self.sample_interval),
            ("heartbeat interval", self.heartbeat_interval),
            ("device I/O timeout", self.io_timeout),
            ("prune interval", self.queue.prune_interval),
            ("queue retry interval", self.queue.retry_interval),
        ] {
            if value.is_zero() {
                return invalid(format!("{name} must be greater than zero"));
            }
        }
        if self.queue.drain_limit == 0 {
            return invalid("queue drain limit must be at least 1".into());
        }
        Ok(())
    }

    pub fn topics(&self) -> Topics {
        Topics::new(&self.broker.topic_prefix, &self.controller_id)
    }

    /// Broker session settings, with a retained OFFLINE status as the
    /// last will.
    pub fn session_config(&self) -> Result<SessionConfig, CoreError> {
        let client_id = self
            .broker
            .client_id
            .clone()
            .unwrap_or_else(|| self.controller_id.clone());
        let will = ControllerStatus::now(&self.controller_id, &self.name, HeartbeatState::Offline);

        let mut session = SessionConfig::new(self.broker.url.clone(), client_id);
        session.username.clone_from(&self.broker.username);
        session.password.clone_from(&self.broker.password);
        session.keep_alive = self.broker.keep_alive;
        session.reconnect_delay = self.broker.reconnect_delay;
        session.last_will = Some(LastWillMessage {
            topic: self.topics().controller_status(),
            payload: serde_json::to_vec(&will)?,
        });
        Ok(session)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(id: &str) -> ControllerConfig {
        let url = Url::parse("mqtt://localhost:1883").unwrap();
        ControllerConfig::new(id, BrokerSettings::new(url))
    }

    #[test]
    fn defaults_are_valid() {
        let config = config("ctrl-01");
        config.validate().unwrap();
        assert_eq!(config.name, "ctrl-01");
        assert_eq!(config.queue.drain_limit, 100);
    }

    #[test]
    fn topic_characters_in_id_are_rejected() {
        let config = config("ctrl/01");
        assert!(matches!(
            config.validate(),
            Err(CoreError::Validation { .. })
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut config = config("ctrl-01");
        config.sample_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        config.sample_interval = Duration::from_secs(1);
        config.queue.retry_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn session_carries_offline_last_will() {
        let mut config = config("ctrl-01");
        config.broker.topic_prefix = "farm".into();
        let session = config.session_config().unwrap();

        assert_eq!(session.client_id, "ctrl-01");
        let will = session.last_will.unwrap();
        assert_eq!(will.topic, "farm/ctrl-01/status");
        let body: serde_json::Value = serde_json::from_slice(&will.payload).unwrap();
        assert_eq!(body["status"], "OFFLINE");
    }
}
