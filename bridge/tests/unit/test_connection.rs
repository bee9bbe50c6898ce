//! Connection lifecycle tests against a scripted connector

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crealink::connection::manager::{ConnectionState, NoDiscovery};
use crealink::connection::power::PowerState;
use crealink::device::machine::{DegradedReason, Lifecycle};
use crealink::device::runtime::DeviceConfig;
use crealink::model::identity::DeviceIdentity;
use crealink::storage::device::{DeviceRecord, DeviceStore, MemoryDeviceStore};

use crate::harness::{spawn_device, wait_for, FixedDiscovery, ScriptedConnector};

const HOST: &str = "192.168.1.40";
const MAC: &str = "aa:bb:cc:dd:ee:ff";

fn close_to(actual: Duration, expected: Duration) -> bool {
    actual >= expected && actual < expected + Duration::from_millis(50)
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule() {
    let connector = ScriptedConnector::new();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;

    // 1 + 2 + 4 + 8 + 16 + 30 seconds between seven attempts
    tokio::time::sleep(Duration::from_secs(75)).await;

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 7);
    let expected = [1, 2, 4, 8, 16, 30];
    for (pair, secs) in attempts.windows(2).zip(expected) {
        let gap = pair[1].0 - pair[0].0;
        assert!(close_to(gap, Duration::from_secs(secs)), "gap {:?}, expected {}s", gap, secs);
    }
    assert!(attempts.iter().all(|(_, url)| url.as_str() == "ws://192.168.1.40:9999/"));

    assert_eq!(handle.connection_state(), ConnectionState::BackingOff);
    let view = handle.view();
    assert_eq!(view.lifecycle, Lifecycle::Connecting);
    assert!(!view.telemetry.available);
    assert_eq!(handle.diagnostics().health.consecutive_failures, 7);

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_lost_session() {
    let connector = ScriptedConnector::new();
    let mut first = connector.accept();
    let mut second = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    first.expect_handshake().await;
    first.push(json!({ "state": 0, "nozzleTemp": 24.0 }));
    wait_for(&mut views, "live", |v| v.telemetry.temperatures.nozzle == Some(24.0)).await;
    first.hang_up();

    wait_for(&mut views, "stale", |v| v.lifecycle == Lifecycle::Degraded(DegradedReason::Stale)).await;
    second.expect_handshake().await;
    second.push(json!({ "nozzleTemp": 25.0 }));
    let view = wait_for(&mut views, "live again", |v| v.telemetry.temperatures.nozzle == Some(25.0)).await;
    assert_eq!(view.lifecycle, Lifecycle::Live);
    assert!(view.telemetry.available);

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert!(close_to(attempts[1].0 - attempts[0].0, Duration::from_secs(1)));

    let health = handle.diagnostics().health;
    assert_eq!(health.connects, 2);
    assert_eq!(health.reconnects, 1);

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_is_answered() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;

    printer.expect_handshake().await;
    printer.push(json!({ "ModeCode": "heart_beat" }));
    assert_eq!(printer.next_sent().await, "ok");

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_power_off_suppresses_connection_attempts() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let config = DeviceConfig {
        power_switch: true,
        ..DeviceConfig::new("k2", HOST)
    };
    let handle = spawn_device(config, &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();
    handle.set_power(PowerState::Off).unwrap();

    let view = wait_for(&mut views, "power off", |v| v.power_off).await;
    assert_eq!(view.lifecycle, Lifecycle::Degraded(DegradedReason::PowerOff));
    assert!(view.telemetry.available);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempt_count(), 0);
    assert_eq!(handle.connection_state(), ConnectionState::PowerOffIdle);

    handle.set_power(PowerState::On).unwrap();
    printer.expect_handshake().await;
    printer.push(json!({ "state": 1, "nozzleTemp": 200.0, "bedTemp0": 60.0 }));
    let view = wait_for(&mut views, "live", |v| v.telemetry.temperatures.nozzle == Some(200.0)).await;
    assert_eq!(view.lifecycle, Lifecycle::Live);
    assert!(!view.power_off);

    // Switching off mid-session closes the socket and zeroes live values.
    handle.set_power(PowerState::Off).unwrap();
    let view = wait_for(&mut views, "power off again", |v| v.power_off).await;
    assert_eq!(view.telemetry.temperatures.nozzle, Some(0.0));
    assert_eq!(view.telemetry.temperatures.bed, Some(0.0));
    assert_eq!(view.telemetry.status, None);
    assert!(view.telemetry.available);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(printer.is_closed());
    assert_eq!(connector.attempt_count(), 1);

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_set_power_without_switch_is_config_error() {
    let connector = ScriptedConnector::new();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;

    assert!(handle.set_power(PowerState::Off).is_err());
    assert!(handle.diagnostics().power.is_none());

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_printer_found_at_new_address_by_mac() {
    let connector = ScriptedConnector::new();
    connector.refuse(3);
    let mut printer = connector.accept();
    let discovery = FixedDiscovery::new(None, Some("192.168.1.77"));
    let store = Arc::new(MemoryDeviceStore::new());
    let config = DeviceConfig {
        mac: Some(MAC.to_string()),
        ..DeviceConfig::new("k2", HOST)
    };
    let handle = spawn_device(config, &connector, &store, discovery.clone()).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    let view = wait_for(&mut views, "new address", |v| v.identity.host == "192.168.1.77").await;
    assert_eq!(view.identity.mac.as_deref(), Some(MAC));

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 4);
    assert_eq!(attempts[2].1.host_str(), Some(HOST));
    assert_eq!(attempts[3].1.host_str(), Some("192.168.1.77"));
    // The lookup result is retried immediately, not after a backoff delay.
    assert_eq!(attempts[3].0, attempts[2].0);
    assert_eq!(discovery.lookups(), 1);

    wait_for(&mut views, "live", |v| v.lifecycle == Lifecycle::Live).await;
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_mac_learned_after_first_connect() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let discovery = FixedDiscovery::new(Some("AA-BB-CC-DD-EE-FF"), None);
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, discovery).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    let view = wait_for(&mut views, "mac", |v| v.identity.mac.is_some()).await;
    assert_eq!(view.identity.mac.as_deref(), Some(MAC));

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

async fn store_with_moved_printer() -> Arc<MemoryDeviceStore> {
    let store = Arc::new(MemoryDeviceStore::new());
    let mut identity = DeviceIdentity::new("192.168.1.77");
    identity.mac = Some(MAC.to_string());
    identity.model = "K2 Plus".to_string();
    let record = DeviceRecord {
        identity,
        ..Default::default()
    };
    store.save("k2", &record).await.unwrap();
    store
}

#[tokio::test(start_paused = true)]
async fn test_restart_tries_last_known_address_first() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = store_with_moved_printer().await;
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();
    assert_eq!(handle.view().identity.host, "192.168.1.77");

    printer.expect_handshake().await;
    wait_for(&mut views, "live", |v| v.lifecycle == Lifecycle::Live).await;
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].1.host_str(), Some("192.168.1.77"));

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_last_address_falls_back_to_configured() {
    let connector = ScriptedConnector::new();
    connector.refuse(1);
    let mut printer = connector.accept();
    let store = store_with_moved_printer().await;
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    let view = wait_for(&mut views, "configured address", |v| v.identity.host == HOST).await;
    assert_eq!(view.identity.mac.as_deref(), Some(MAC));

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].1.host_str(), Some("192.168.1.77"));
    assert_eq!(attempts[1].1.host_str(), Some(HOST));
    assert_eq!(attempts[1].0, attempts[0].0);

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}
