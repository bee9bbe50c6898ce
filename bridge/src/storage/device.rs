//! Persisted per-printer state
//!
//! Only identity, inferred capabilities and user overrides survive a
//! restart. Telemetry is always rebuilt from the live connection.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::BridgeError;
use crate::model::capability::{CapabilityOverrides, CapabilitySet};
use crate::model::identity::DeviceIdentity;
use crate::storage::layout::StorageLayout;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,

    #[serde(default)]
    pub capabilities: CapabilitySet,

    #[serde(default)]
    pub overrides: CapabilityOverrides,
}

/// Load/save hooks for device records
#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<DeviceRecord>, BridgeError>;

    async fn save(&self, id: &str, record: &DeviceRecord) -> Result<(), BridgeError>;

    async fn remove(&self, id: &str) -> Result<(), BridgeError>;
}

/// One JSON file per printer under `<data-dir>/devices/`
#[derive(Debug, Clone)]
pub struct FileDeviceStore {
    layout: StorageLayout,
}

impl FileDeviceStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl DeviceStore for FileDeviceStore {
    async fn load(&self, id: &str) -> Result<Option<DeviceRecord>, BridgeError> {
        let file = self.layout.device_file(id);
        if !file.exists().await {
            return Ok(None);
        }
        file.read_json().await.map(Some).map_err(|e| {
            BridgeError::StorageError(format!("Failed to read {}: {}", file.path().display(), e))
        })
    }

    async fn save(&self, id: &str, record: &DeviceRecord) -> Result<(), BridgeError> {
        let file = self.layout.device_file(id);
        file.write_json(record).await.map_err(|e| {
            BridgeError::StorageError(format!("Failed to write {}: {}", file.path().display(), e))
        })
    }

    async fn remove(&self, id: &str) -> Result<(), BridgeError> {
        self.layout.device_file(id).delete().await
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    records: RwLock<HashMap<String, DeviceRecord>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.records.read().await.get(id).cloned()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn load(&self, id: &str) -> Result<Option<DeviceRecord>, BridgeError> {
        Ok(self.get(id).await)
    }

    async fn save(&self, id: &str, record: &DeviceRecord) -> Result<(), BridgeError> {
        self.records.write().await.insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), BridgeError> {
        self.records.write().await.remove(id);
        Ok(())
    }
}
