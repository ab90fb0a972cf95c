#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;

use edgectl_api::Topics;
use edgectl_core::{
    ConfigStore, ControlEngine, MemoryLink, MemorySource, MessageTransport, PersistentQueue,
    SimulatedGateway, SiteDefinition,
};

pub struct Harness {
    pub engine: ControlEngine,
    pub gateway: Arc<SimulatedGateway>,
    pub link: Arc<MemoryLink>,
    pub source: Arc<MemorySource>,
    pub transport: Arc<MessageTransport>,
}

pub fn site(value: serde_json::Value) -> SiteDefinition {
    serde_json::from_value(value).unwrap()
}

pub async fn harness(definition: SiteDefinition) -> Harness {
    harness_with(definition, SimulatedGateway::new()).await
}

pub async fn harness_with(definition: SiteDefinition, gateway: SimulatedGateway) -> Harness {
    let source = Arc::new(MemorySource::new(definition));
    let store = Arc::new(ConfigStore::load(Box::new(Arc::clone(&source))));
    let gateway = Arc::new(gateway);
    let link = Arc::new(MemoryLink::new());
    link.set_connected(true);
    let queue = Arc::new(PersistentQueue::in_memory().await.unwrap());
    let transport = Arc::new(MessageTransport::new(
        link.clone(),
        queue,
        Topics::new("farm", "ctrl-01"),
        100,
    ));
    let engine = ControlEngine::new(store, gateway.clone(), Arc::clone(&transport));
    Harness {
        engine,
        gateway,
        link,
        source,
        transport,
    }
}

/// Three actuators and one sensor; rule priorities 10, 50 and 30, all
/// triggering above 30.
pub fn prioritized() -> SiteDefinition {
    site(serde_json::json!({
        "devices": [
            { "id": "temp_1", "kind": "sensor" },
            { "id": "fan_1", "kind": "actuator" },
            { "id": "vent_1", "kind": "actuator" },
            { "id": "pump_1", "kind": "actuator" }
        ],
        "rules": [
            { "id": "p10", "kind": "THRESHOLD", "priority": 10,
              "conditions": { "sensor_id": "temp_1", "operator": ">", "threshold": 30 },
              "actions": { "actuator_id": "fan_1", "target_state": 1 } },
            { "id": "p50", "kind": "THRESHOLD", "priority": 50,
              "conditions": { "sensor_id": "temp_1", "operator": ">", "threshold": 30 },
              "actions": { "actuator_id": "vent_1", "target_state": 1 } },
            { "id": "p30", "kind": "THRESHOLD", "priority": 30,
              "conditions": { "sensor_id": "temp_1", "operator": ">", "threshold": 30 },
              "actions": { "actuator_id": "pump_1", "target_state": 1 } }
        ]
    }))
}
