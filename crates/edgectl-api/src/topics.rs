// ── Topic scheme ──
//
// Every topic is rooted at `{prefix}/{controller_id}`. Outbound data goes
// to `sensors/data`, `actuators/{id}/status` and `status`; inbound
// commands arrive under `commands/`.

use strum::{Display, EnumIter, IntoEnumIterator};

/// Inbound command channel, identified by the last topic segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum CommandTopic {
    /// `commands/actuator`: manual actuator override.
    Actuator,
    /// `commands/emergency-stop`: force every output off.
    EmergencyStop,
    /// `commands/config-reload`: re-read rules and devices.
    ConfigReload,
}

/// Topic builder for a single controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    root: String,
}

impl Topics {
    pub fn new(prefix: &str, controller_id: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        let root = if prefix.is_empty() {
            controller_id.to_owned()
        } else {
            format!("{prefix}/{controller_id}")
        };
        Self { root }
    }

    /// `{prefix}/{controller_id}`
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn sensor_data(&self) -> String {
        format!("{}/sensors/data", self.root)
    }

    pub fn actuator_status(&self, actuator_id: &str) -> String {
        format!("{}/actuators/{actuator_id}/status", self.root)
    }

    pub fn controller_status(&self) -> String {
        format!("{}/status", self.root)
    }

    pub fn command(&self, command: CommandTopic) -> String {
        format!("{}/commands/{command}", self.root)
    }

    /// All inbound command topics this controller subscribes to.
    pub fn command_subscriptions(&self) -> Vec<String> {
        CommandTopic::iter().map(|c| self.command(c)).collect()
    }

    /// Map an inbound topic back to its command channel.
    ///
    /// Returns `None` for topics outside this controller's command tree.
    pub fn classify(&self, topic: &str) -> Option<CommandTopic> {
        let rest = topic.strip_prefix(self.root.as_str())?;
        let name = rest.strip_prefix("/commands/")?;
        CommandTopic::iter().find(|c| c.to_string() == name)
    }
}
