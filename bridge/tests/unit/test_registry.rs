//! Device registry tests

use std::sync::Arc;
use std::time::Duration;

use crealink::connection::manager::NoDiscovery;
use crealink::device::dispatcher::Command;
use crealink::device::registry::DeviceRegistry;
use crealink::device::runtime::{DeviceConfig, DeviceServices};
use crealink::errors::{BridgeError, CommandError};
use crealink::storage::device::MemoryDeviceStore;

use crate::harness::ScriptedConnector;

fn registry(connector: &Arc<ScriptedConnector>) -> DeviceRegistry {
    DeviceRegistry::new(DeviceServices {
        store: Arc::new(MemoryDeviceStore::new()),
        connector: connector.clone(),
        discovery: Arc::new(NoDiscovery),
    })
    .with_teardown_timeout(Duration::from_secs(2))
}

#[tokio::test(start_paused = true)]
async fn test_add_get_remove() {
    let connector = ScriptedConnector::new();
    let registry = registry(&connector);

    registry.add(DeviceConfig::new("office", "10.0.0.8")).await.unwrap();
    registry.add(DeviceConfig::new("garage", "10.0.0.9")).await.unwrap();
    assert_eq!(registry.ids().await, vec!["garage".to_string(), "office".to_string()]);

    let duplicate = registry.add(DeviceConfig::new("office", "10.0.0.10")).await;
    assert!(matches!(duplicate, Err(BridgeError::ConfigError(_))));

    let office = registry.get("office").await.unwrap();
    assert_eq!(office.view().identity.host, "10.0.0.8");

    registry.remove("office").await.unwrap();
    assert!(registry.get("office").await.is_none());
    assert!(matches!(registry.remove("office").await, Err(BridgeError::NotFound(_))));

    registry.shutdown_all().await;
    assert!(registry.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_replace_restarts_device() {
    let connector = ScriptedConnector::new();
    let registry = registry(&connector);

    registry.add(DeviceConfig::new("office", "10.0.0.8")).await.unwrap();
    let replaced = registry.replace(DeviceConfig::new("office", "10.0.0.20")).await.unwrap();
    assert_eq!(replaced.view().identity.host, "10.0.0.20");
    assert_eq!(registry.len().await, 1);

    registry.shutdown_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_unknown_printer_is_rejected() {
    let connector = ScriptedConnector::new();
    let registry = registry(&connector);

    let result = registry.send("nowhere", Command::Pause).await;
    assert!(matches!(result, Err(CommandError::Rejected(_))));
}
