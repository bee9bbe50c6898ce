//! Registry of running printers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{error, info};

use crate::device::dispatcher::{Ack, Command};
use crate::device::runtime::{DeviceConfig, DeviceHandle, DeviceServices};
use crate::errors::{BridgeError, CommandError};

pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DeviceRegistry {
    services: DeviceServices,
    devices: RwLock<HashMap<String, Arc<DeviceHandle>>>,
    teardown_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(services: DeviceServices) -> Self {
        Self {
            services,
            devices: RwLock::new(HashMap::new()),
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    /// Start a printer. Ids must be unique.
    pub async fn add(&self, config: DeviceConfig) -> Result<Arc<DeviceHandle>, BridgeError> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&config.id) {
            return Err(BridgeError::ConfigError(format!(
                "Printer {} is already registered",
                config.id
            )));
        }
        let id = config.id.clone();
        let handle = Arc::new(DeviceHandle::spawn(config, self.services.clone()).await?);
        devices.insert(id, handle.clone());
        Ok(handle)
    }

    /// Tear down any printer with the same id, then start the new config.
    pub async fn replace(&self, config: DeviceConfig) -> Result<Arc<DeviceHandle>, BridgeError> {
        let mut devices = self.devices.write().await;
        if let Some(old) = devices.remove(&config.id) {
            info!("Replacing printer {}", config.id);
            if let Err(e) = old.shutdown(self.teardown_timeout).await {
                error!("Printer {} did not stop cleanly: {}", config.id, e);
            }
        }
        let id = config.id.clone();
        let handle = Arc::new(DeviceHandle::spawn(config, self.services.clone()).await?);
        devices.insert(id, handle.clone());
        Ok(handle)
    }

    /// Stop a printer and forget it. Its stored record is kept.
    pub async fn remove(&self, id: &str) -> Result<(), BridgeError> {
        let handle = self
            .devices
            .write()
            .await
            .remove(id)
            .ok_or_else(|| BridgeError::NotFound(format!("Printer {}", id)))?;
        handle.shutdown(self.teardown_timeout).await
    }

    pub async fn get(&self, id: &str) -> Option<Arc<DeviceHandle>> {
        self.devices.read().await.get(id).cloned()
    }

    /// Registered ids, sorted
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    pub async fn send(&self, id: &str, command: Command) -> Result<Ack, CommandError> {
        match self.get(id).await {
            Some(handle) => handle.send(command).await,
            None => Err(CommandError::Rejected(format!("unknown printer {}", id))),
        }
    }

    pub async fn shutdown_all(&self) {
        let devices: Vec<Arc<DeviceHandle>> =
            self.devices.write().await.drain().map(|(_, handle)| handle).collect();
        if devices.is_empty() {
            return;
        }
        info!("Stopping {} printers...", devices.len());

        let timeout = self.teardown_timeout;
        let stops = devices.into_iter().map(|handle| async move {
            if let Err(e) = handle.shutdown(timeout).await {
                error!("Printer {} did not stop cleanly: {}", handle.id(), e);
            }
        });
        futures::future::join_all(stops).await;
    }
}
