//! Device runtime tests: frames in, published views out

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crealink::connection::manager::NoDiscovery;
use crealink::device::dispatcher::Command;
use crealink::device::machine::{DegradedReason, DeviceView, Lifecycle};
use crealink::device::runtime::DeviceConfig;
use crealink::model::capability::Capability;
use crealink::model::status::PrintStatus;
use crealink::model::telemetry::ChangeSet;
use crealink::storage::device::MemoryDeviceStore;

use crate::harness::{k2_identity, spawn_device, wait_for, ScriptedConnector};

const HOST: &str = "192.168.1.40";

#[tokio::test(start_paused = true)]
async fn test_printing_then_paused() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    let mut frame = k2_identity();
    frame["state"] = json!(1);
    frame["printProgress"] = json!(42);
    frame["printFileName"] = json!("benchy.gcode");
    frame["nozzleTemp"] = json!("219.5");
    frame["bedTemp0"] = json!(60);
    printer.push(frame);

    let view = wait_for(&mut views, "printing", |v| v.status == Some(PrintStatus::Printing)).await;
    assert_eq!(view.lifecycle, Lifecycle::Live);
    assert_eq!(view.model.as_deref(), Some("K2 Plus"));
    assert!(view.capabilities.has_cfs);
    assert!(view.telemetry.available);
    assert_eq!(view.telemetry.job.progress, Some(42));
    assert_eq!(view.telemetry.temperatures.nozzle, Some(219.5));

    let ack = handle.send(Command::Pause).await.unwrap();
    assert_eq!(ack.command, "pause");
    assert!(!ack.acknowledged);
    assert_eq!(printer.next_command().await, r#"{"method":"set","params":{"pause":1}}"#);

    wait_for(&mut views, "pausing", |v| v.status == Some(PrintStatus::Pausing)).await;

    printer.push(json!({ "state": 5 }));
    let view = wait_for(&mut views, "paused", |v| v.status == Some(PrintStatus::Paused)).await;
    assert_eq!(view.telemetry.job.progress, Some(42));
    assert_eq!(view.telemetry.job.file_name.as_deref(), Some("benchy.gcode"));

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
    assert!(printer.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_absent_fields_keep_previous_values() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    printer.push(json!({ "state": 1, "nozzleTemp": 210.0, "bedTemp0": 60.0, "printProgress": 10 }));
    wait_for(&mut views, "first frame", |v| v.telemetry.job.progress == Some(10)).await;

    printer.push(json!({ "nozzleTemp": 215.0 }));
    let view = wait_for(&mut views, "second frame", |v| v.telemetry.temperatures.nozzle == Some(215.0)).await;
    assert_eq!(view.telemetry.temperatures.bed, Some(60.0));
    assert_eq!(view.telemetry.job.progress, Some(10));
    assert_eq!(view.status, Some(PrintStatus::Printing));

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_and_malformed_frames_are_dropped() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    printer.push(json!({ "nozzleTemp": 200.0 }));
    wait_for(&mut views, "baseline", |v| v.telemetry.temperatures.nozzle == Some(200.0)).await;

    printer.push_text("{not json");
    printer.push(json!({ "nozzleTemp": 9999.0, "bedTemp0": 55.0 }));
    let view = wait_for(&mut views, "bed update", |v| v.telemetry.temperatures.bed == Some(55.0)).await;
    assert_eq!(view.telemetry.temperatures.nozzle, Some(200.0));
    assert_eq!(view.lifecycle, Lifecycle::Live);

    let health = handle.diagnostics().health;
    assert_eq!(health.parse_errors, 1);
    assert!(health.rejected_fields >= 1);

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_identical_frame_is_not_republished() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    handle.subscribe(Arc::new(move |_view: &DeviceView, _changes: ChangeSet| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    printer.expect_handshake().await;
    let frame = json!({ "state": 0, "nozzleTemp": 25.0, "bedTemp0": 24.0 });
    printer.push(frame.clone());
    wait_for(&mut views, "first frame", |v| v.telemetry.temperatures.nozzle == Some(25.0)).await;
    let before = calls.load(Ordering::SeqCst);

    printer.push(frame);
    printer.push(json!({ "layer": 3 }));
    wait_for(&mut views, "marker", |v| v.telemetry.job.layer == Some(3)).await;
    assert_eq!(calls.load(Ordering::SeqCst), before + 1);

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_observed_capability_survives_restart() {
    let store = Arc::new(MemoryDeviceStore::new());

    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let handle = spawn_device(DeviceConfig::new("ender", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    printer.push(json!({
        "model": "Ender-3 V3",
        "modelVersion": "Printer HW Ver: F001; Printer SW Ver: 1.0.4",
        "hostname": "Ender-3V3-77AA",
        "state": 0,
    }));
    let view = wait_for(&mut views, "resolved", |v| v.resolved).await;
    assert_eq!(view.model.as_deref(), Some("Ender-3 V3"));
    assert!(!view.capabilities.has_light);

    printer.push(json!({ "lightSw": 1 }));
    wait_for(&mut views, "light observed", |v| v.capabilities.has_light).await;
    printer.push(json!({ "state": 1 }));
    let view = wait_for(&mut views, "printing", |v| v.status == Some(PrintStatus::Printing)).await;
    assert!(view.capabilities.has_light);
    handle.shutdown(Duration::from_secs(5)).await.unwrap();

    let record = store.get("ender").await.unwrap();
    assert_eq!(record.capabilities.light, Capability::Observed);
    assert_eq!(record.identity.hostname, "Ender-3V3-77AA");

    // Restart: the stored record is authoritative before any frame arrives.
    let connector = ScriptedConnector::new();
    let handle = spawn_device(DeviceConfig::new("ender", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let view = handle.view();
    assert!(view.resolved);
    assert!(view.capabilities.has_light);
    assert_eq!(view.model.as_deref(), Some("Ender-3 V3"));
    assert_eq!(view.telemetry.status, None);
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_grace_window_resolves_partial_identity() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k1", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    printer.push(json!({ "model": "K1C", "state": 0 }));
    let view = wait_for(&mut views, "model", |v| v.model.as_deref() == Some("K1C")).await;
    assert!(!view.resolved);
    assert!(store.get("k1").await.is_none());

    // Keep the link fresh while the grace window runs out.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_secs(6)).await;
        printer.push(json!({ "nozzleTemp": 30.0 }));
    }
    wait_for(&mut views, "resolved", |v| v.resolved).await;
    let record = store.get("k1").await.unwrap();
    assert_eq!(record.identity.model, "K1C");

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stale_link_keeps_values_but_marks_unavailable() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    printer.push(json!({ "state": 1, "nozzleTemp": 220.0 }));
    wait_for(&mut views, "live", |v| v.telemetry.temperatures.nozzle == Some(220.0)).await;

    // Printer goes silent; the probes go unanswered.
    let view = wait_for(&mut views, "stale", |v| {
        v.lifecycle == Lifecycle::Degraded(DegradedReason::Stale)
    })
    .await;
    assert!(!view.telemetry.available);
    assert!(!view.power_off);
    assert_eq!(view.telemetry.temperatures.nozzle, Some(220.0));
    assert_eq!(view.telemetry.status, Some(PrintStatus::Printing));
    assert!(printer.is_closed());

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}
