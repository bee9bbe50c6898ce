//! Application state management

use std::sync::Arc;

use tracing::{error, info};

use crate::app::options::AppOptions;
use crate::connection::transport::WsConnector;
use crate::device::registry::DeviceRegistry;
use crate::device::runtime::{DeviceConfig, DeviceServices};
use crate::errors::BridgeError;
use crate::scanner::SubnetDiscovery;
use crate::storage::device::FileDeviceStore;

/// Main application state
pub struct AppState {
    /// Running printers
    pub registry: Arc<DeviceRegistry>,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, BridgeError> {
        info!("Initializing application state...");

        options.layout.setup().await?;

        let services = DeviceServices {
            store: Arc::new(FileDeviceStore::new(options.layout.clone())),
            connector: Arc::new(WsConnector),
            discovery: Arc::new(SubnetDiscovery::new(
                options.discovery.clone(),
                options.subnets.clone(),
            )),
        };
        let registry = Arc::new(
            DeviceRegistry::new(services)
                .with_teardown_timeout(options.lifecycle.device_shutdown_timeout),
        );

        let state = Self { registry };
        state.start_printers(&options.printers).await;
        Ok(state)
    }

    /// Start every printer; one failing never blocks the rest.
    pub async fn start_printers(&self, printers: &[DeviceConfig]) -> usize {
        let mut started = 0;
        for config in printers {
            match self.registry.add(config.clone()).await {
                Ok(_) => started += 1,
                Err(e) => error!("Failed to start printer {}: {}", config.id, e),
            }
        }
        info!("Started {} of {} printers", started, printers.len());
        started
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        info!("Shutting down application state...");
        self.registry.shutdown_all().await;
        Ok(())
    }
}
