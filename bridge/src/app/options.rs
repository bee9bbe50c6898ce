//! Application configuration options

use std::time::Duration;

use ipnet::Ipv4Net;

use crate::device::runtime::DeviceConfig;
use crate::scanner::ScanOptions;
use crate::storage::layout::StorageLayout;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Scan options used when a printer has to be found by MAC
    pub discovery: ScanOptions,

    /// Extra subnets searched during re-resolution
    pub subnets: Vec<Ipv4Net>,

    /// Printers to start
    pub printers: Vec<DeviceConfig>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::default(),
            enable_server: true,
            server: ServerOptions::default(),
            discovery: ScanOptions::default(),
            subnets: Vec::new(),
            printers: Vec::new(),
        }
    }
}

/// Lifecycle options for the bridge
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Per-printer teardown budget
    pub device_shutdown_timeout: Duration,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            device_shutdown_timeout: Duration::from_secs(5),
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8126,
        }
    }
}
