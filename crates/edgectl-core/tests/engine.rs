#![allow(clippy::unwrap_used)]

mod common;

use std::time::Duration;

use edgectl_core::{ControlCommand, SensorReading, SimulatedGateway, SiteDefinition};
use pretty_assertions::assert_eq;

use common::{harness, harness_with, prioritized, site};

fn reading(sensor: &str, value: f64) -> SensorReading {
    SensorReading::new(sensor, value, "ctrl-01")
}

#[tokio::test]
async fn threshold_scenario_writes_only_when_condition_holds() {
    let h = harness(site(serde_json::json!({
        "devices": [
            { "id": "temp_1", "kind": "sensor" },
            { "id": "fan_1", "kind": "actuator" }
        ],
        "rules": [
            { "id": "cool", "kind": "THRESHOLD",
              "conditions": { "sensorId": "temp_1", "operator": ">", "threshold": 30 },
              "actions": { "actuatorId": "fan_1", "targetState": 1 } }
        ]
    })))
    .await;
    h.engine.start().await.unwrap();

    h.engine.evaluate(&[reading("temp_1", 31.0)]).await;
    assert_eq!(h.gateway.writes_to("fan_1"), vec![1.0]);

    h.gateway.clear_writes();
    h.engine.evaluate(&[reading("temp_1", 29.0)]).await;
    assert!(h.gateway.writes().is_empty());
}

#[tokio::test]
async fn triggered_rules_write_in_descending_priority_order() {
    let h = harness(prioritized()).await;
    h.engine.start().await.unwrap();

    let report = h.engine.evaluate(&[reading("temp_1", 35.0)]).await;
    assert_eq!(report.fired, vec!["p50", "p30", "p10"]);

    let order: Vec<String> = h
        .gateway
        .writes()
        .into_iter()
        .map(|w| w.actuator_id)
        .collect();
    assert_eq!(order, vec!["vent_1", "pump_1", "fan_1"]);
}

#[tokio::test]
async fn failing_rule_does_not_stop_the_pass() {
    let h = harness(prioritized()).await;
    h.engine.start().await.unwrap();
    h.gateway.fail_writes("pump_1", true);

    let report = h.engine.evaluate(&[reading("temp_1", 35.0)]).await;
    assert_eq!(report.failed, vec!["p30"]);
    assert_eq!(report.fired, vec!["p50", "p10"]);
}

#[tokio::test]
async fn inactive_rules_are_skipped() {
    let mut def = prioritized();
    def.rules[1].active = false;
    let h = harness(def).await;
    h.engine.start().await.unwrap();

    let report = h.engine.evaluate(&[reading("temp_1", 35.0)]).await;
    assert_eq!(report.fired, vec!["p30", "p10"]);
}

#[tokio::test]
async fn every_write_publishes_actuator_status() {
    let h = harness(prioritized()).await;
    h.engine.start().await.unwrap();
    h.engine.evaluate(&[reading("temp_1", 35.0)]).await;

    let statuses = h.link.published_to("farm/ctrl-01/actuators/vent_1/status");
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["actuatorId"], "vent_1");
    assert_eq!(statuses[0]["state"], 1.0);
}

#[tokio::test]
async fn pid_rule_writes_rounded_clamped_output() {
    let h = harness(site(serde_json::json!({
        "devices": [
            { "id": "temp_1", "kind": "sensor" },
            { "id": "heater_1", "kind": "actuator" }
        ],
        "rules": [
            { "id": "heat", "kind": "PID",
              "conditions": { "sensor_id": "temp_1" },
              "actions": { "actuator_id": "heater_1" },
              "pid": { "kp": 1.0, "ki": 0.0, "kd": 0.0, "setpoint": 50.0,
                       "outputMin": 0.0, "outputMax": 100.0 } }
        ]
    })))
    .await;
    h.engine.start().await.unwrap();

    h.engine.evaluate(&[reading("temp_1", 29.6)]).await;
    h.engine.evaluate(&[reading("temp_1", -1000.0)]).await;
    assert_eq!(h.gateway.writes_to("heater_1"), vec![20.0, 100.0]);
}

#[tokio::test]
async fn pid_rule_rejects_non_finite_reading_without_corrupting_state() {
    let h = harness(site(serde_json::json!({
        "devices": [
            { "id": "temp_1", "kind": "sensor" },
            { "id": "heater_1", "kind": "actuator" }
        ],
        "rules": [
            { "id": "heat", "kind": "PID",
              "conditions": { "sensor_id": "temp_1" },
              "actions": { "actuator_id": "heater_1" },
              "pid": { "kp": 1.0, "ki": 0.5, "kd": 0.0, "setpoint": 50.0,
                       "outputMin": 0.0, "outputMax": 100.0 } }
        ]
    })))
    .await;
    h.engine.start().await.unwrap();

    let report = h.engine.evaluate(&[reading("temp_1", f64::NAN)]).await;
    assert_eq!(report.failed, vec!["heat".to_owned()]);
    assert!(h.gateway.writes_to("heater_1").is_empty());

    // The controller still responds to real readings afterwards.
    h.engine.evaluate(&[reading("temp_1", 40.0)]).await;
    let writes = h.gateway.writes_to("heater_1");
    assert_eq!(writes.len(), 1);
    assert!(writes[0].is_finite() && writes[0] >= 10.0, "got {writes:?}");
}

#[tokio::test]
async fn manual_override_bypasses_rules_and_publishes_status() {
    let h = harness(prioritized()).await;
    h.engine.start().await.unwrap();

    h.engine
        .handle_command(ControlCommand::SetActuator {
            actuator_id: "fan_1".into(),
            state: 0.75,
        })
        .await;

    assert_eq!(h.gateway.writes_to("fan_1"), vec![0.75]);
    let statuses = h.link.published_to("farm/ctrl-01/actuators/fan_1/status");
    assert_eq!(statuses[0]["state"], 0.75);
}

#[tokio::test]
async fn emergency_stop_writes_off_once_per_actuator_during_evaluation() {
    let gateway = SimulatedGateway::new().with_delay(Duration::from_millis(20));
    let h = harness_with(prioritized(), gateway).await;
    h.engine.start().await.unwrap();

    let readings = [reading("temp_1", 35.0)];
    let (_, switched_off) = tokio::join!(h.engine.evaluate(&readings), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.engine.emergency_stop().await
    });

    assert_eq!(switched_off, 3);
    assert_eq!(h.gateway.safety_stop_count(), 1);
    for actuator in ["fan_1", "vent_1", "pump_1"] {
        let offs = h
            .gateway
            .writes_to(actuator)
            .into_iter()
            .filter(|v| *v == 0.0)
            .count();
        assert_eq!(offs, 1, "{actuator} should be switched off exactly once");
    }
}

#[tokio::test]
async fn reload_swaps_rules_atomically() {
    let h = harness(prioritized()).await;
    h.engine.start().await.unwrap();

    let mut smaller = prioritized();
    smaller.rules.retain(|r| r.id == "p10");
    h.source.replace(smaller);
    h.engine.handle_command(ControlCommand::ReloadConfig).await;

    let report = h.engine.evaluate(&[reading("temp_1", 35.0)]).await;
    assert_eq!(report.fired, vec!["p10"]);
}

#[tokio::test]
async fn removed_scheduled_rule_never_fires_after_reload() {
    let scheduled = site(serde_json::json!({
        "devices": [{ "id": "pump_1", "kind": "actuator" }],
        "rules": [
            { "id": "tick", "kind": "SCHEDULED", "schedule": "* * * * * *",
              "actions": { "actuator_id": "pump_1", "target_state": 1 } }
        ]
    }));
    let h = harness(scheduled).await;
    h.engine.start().await.unwrap();
    assert_eq!(h.engine.scheduled_timers().await, 1);

    tokio::time::timeout(Duration::from_secs(3), async {
        while h.gateway.writes_to("pump_1").is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    h.source.replace(SiteDefinition {
        devices: prioritized().devices,
        rules: Vec::new(),
    });
    h.engine.reload().await.unwrap();
    assert_eq!(h.engine.scheduled_timers().await, 0);

    h.gateway.clear_writes();
    tokio::time::sleep(Duration::from_millis(2200)).await;
    assert!(h.gateway.writes_to("pump_1").is_empty());
}

#[tokio::test]
async fn stop_cancels_timers_and_ignores_commands() {
    let h = harness(site(serde_json::json!({
        "devices": [{ "id": "pump_1", "kind": "actuator" }],
        "rules": [
            { "id": "nightly", "kind": "SCHEDULED", "schedule": "0 2 * * *",
              "actions": { "actuator_id": "pump_1", "target_state": 1 } }
        ]
    })))
    .await;
    h.engine.start().await.unwrap();
    assert_eq!(h.engine.scheduled_timers().await, 1);

    h.engine.stop().await.unwrap();
    assert_eq!(h.engine.scheduled_timers().await, 0);

    h.engine.handle_command(ControlCommand::EmergencyStop).await;
    assert_eq!(h.gateway.safety_stop_count(), 0);
}
