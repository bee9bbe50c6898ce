//! Command dispatch tests

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crealink::connection::manager::NoDiscovery;
use crealink::device::dispatcher::{Command, Material};
use crealink::device::runtime::DeviceConfig;
use crealink::errors::CommandError;
use crealink::protocol::message::Request;
use crealink::storage::device::MemoryDeviceStore;

use crate::harness::{k2_identity, spawn_device, wait_for, ScriptedConnector};

const HOST: &str = "192.168.1.40";

#[tokio::test(start_paused = true)]
async fn test_commands_fail_fast_while_disconnected() {
    let connector = ScriptedConnector::new();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(handle.send(Command::Pause).await, Err(CommandError::NotConnected));
    assert_eq!(handle.send(Command::RefreshInfo).await, Err(CommandError::NotConnected));
    assert!(handle.diagnostics().pending_commands.is_empty());

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_refresh_waits_for_reply_frame() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    printer.push(k2_identity());
    wait_for(&mut views, "identity", |v| v.resolved).await;

    let (ack, ()) = tokio::join!(handle.send(Command::RefreshCfs), async {
        assert_eq!(printer.next_command().await, Request::cfs_info().to_text());
        tokio::time::sleep(Duration::from_millis(250)).await;
        printer.push(json!({
            "boxsInfo": { "materialBoxs": [
                { "id": 1, "type": 0, "temp": 28, "humidity": 41, "materials": [
                    { "id": 0, "type": "PLA", "color": "#0ffa800", "selected": 1, "percent": 80 }
                ] }
            ] }
        }));
    });
    let ack = ack.unwrap();
    assert!(ack.acknowledged);
    assert_eq!(ack.command, "refresh_cfs");
    assert!(ack.latency_ms >= 250);

    let view = wait_for(&mut views, "cfs", |v| v.telemetry.cfs.slot(1, 0).is_some()).await;
    let slot = view.telemetry.cfs.slot(1, 0).unwrap();
    assert_eq!(slot.color.as_deref(), Some("#ffa800"));
    assert_eq!(view.telemetry.cfs.selected(), Some((1, 0)));
    assert!(handle.diagnostics().pending_commands.is_empty());

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_refresh_times_out() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    printer.push(k2_identity());
    wait_for(&mut views, "identity", |v| v.resolved).await;

    let result = handle.send(Command::RefreshCfs).await;
    assert_eq!(result, Err(CommandError::Timeout(Duration::from_secs(5))));
    assert!(handle.diagnostics().pending_commands.is_empty());

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_set_commands_complete_on_write() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("k2", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    printer.push(k2_identity());
    wait_for(&mut views, "identity", |v| v.capabilities.has_light).await;

    let ack = handle.send(Command::SetLight { on: true }).await.unwrap();
    assert!(!ack.acknowledged);
    assert_eq!(printer.next_command().await, r#"{"method":"set","params":{"lightSw":1}}"#);

    handle.send(Command::SetBedTemp { target: 60.4 }).await.unwrap();
    assert_eq!(
        printer.next_command().await,
        r#"{"method":"set","params":{"bedTempControl":{"num":0,"val":60}}}"#
    );

    let material = Material {
        filament_type: "PETG".to_string(),
        name: "Hyper PETG".to_string(),
        vendor: "Creality".to_string(),
        color: "#1a2b3c".to_string(),
        min_temp: Some(230),
        max_temp: Some(260),
    };
    handle
        .send(Command::CfsLoad { box_id: 2, slot: 3, material: Some(material) })
        .await
        .unwrap();
    let edit: serde_json::Value = serde_json::from_str(&printer.next_command().await).unwrap();
    assert_eq!(edit["params"]["modifyMaterial"]["color"], "#01a2b3c");
    assert_eq!(edit["params"]["modifyMaterial"]["boxId"], 2);
    let feed: serde_json::Value = serde_json::from_str(&printer.next_command().await).unwrap();
    assert_eq!(feed["params"]["feedInOrOut"], json!({ "boxId": 2, "materialId": 3, "isFeed": 1 }));

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_commands_are_rejected() {
    let connector = ScriptedConnector::new();
    let mut printer = connector.accept();
    let store = Arc::new(MemoryDeviceStore::new());
    let handle = spawn_device(DeviceConfig::new("ender", HOST), &connector, &store, Arc::new(NoDiscovery)).await;
    let mut views = handle.watch();

    printer.expect_handshake().await;
    printer.push(json!({
        "model": "Ender-3 V3 KE",
        "modelVersion": "Printer HW Ver: F005;",
        "hostname": "KE-0001",
        "state": 0,
    }));
    wait_for(&mut views, "resolved", |v| v.resolved).await;

    let cases = [
        Command::SetBoxTemp { target: 40.0 },
        Command::CfsUnload { box_id: 1, slot: 0 },
        Command::SetLight { on: true },
        Command::Pause,
        Command::Resume,
        Command::SetNozzleTemp { target: 450.0 },
        Command::SetFeedRate { percent: 0 },
    ];
    for command in cases {
        let name = command.name();
        assert!(
            matches!(handle.send(command).await, Err(CommandError::Rejected(_))),
            "{} should be rejected",
            name
        );
    }

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}
