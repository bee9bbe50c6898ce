//! Settings file management

use std::collections::HashSet;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::connection::backoff::BackoffPolicy;
use crate::connection::manager;
use crate::device::dispatcher::DispatchOptions;
use crate::device::machine::MachineOptions;
use crate::device::runtime::DeviceConfig;
use crate::errors::BridgeError;
use crate::logs::LogLevel;
use crate::model::capability::{CameraMode, CapabilityOverrides};
use crate::protocol::frame::normalize_mac;
use crate::protocol::DEFAULT_WS_PORT;
use crate::scanner::ScanOptions;

/// Bridge settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines on stdout
    #[serde(default)]
    pub json_logs: bool,

    /// Also write daily log files under `<data-dir>/logs`
    #[serde(default)]
    pub log_to_file: bool,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub discovery: DiscoverySettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub printers: Vec<PrinterSettings>,
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Device configs for every valid printer entry, plus the entries that
    /// were rejected and why. A bad entry never blocks the others.
    pub fn device_configs(&self) -> (Vec<DeviceConfig>, Vec<(String, BridgeError)>) {
        let mut seen = HashSet::new();
        let mut configs = Vec::new();
        let mut rejected = Vec::new();

        for printer in &self.printers {
            let label = if printer.id.is_empty() { printer.host.clone() } else { printer.id.clone() };
            if !seen.insert(printer.id.clone()) {
                rejected.push((
                    label,
                    BridgeError::ConfigError(format!("Duplicate printer id {}", printer.id)),
                ));
                continue;
            }
            match printer.to_device_config(&self.connection, &self.device) {
                Ok(config) => configs.push(config),
                Err(e) => rejected.push((label, e)),
            }
        }
        (configs, rejected)
    }
}

/// Local HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8126
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Subnet scanning used by `--scan` and MAC based re-resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Extra subnets (CIDR) searched when a printer moves
    #[serde(default)]
    pub subnets: Vec<String>,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_probe_timeout_ms() -> u64 {
    400
}

fn default_max_concurrent() -> usize {
    64
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            subnets: Vec::new(),
            probe_timeout_ms: default_probe_timeout_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl DiscoverySettings {
    pub fn parsed_subnets(&self) -> Result<Vec<Ipv4Net>, BridgeError> {
        self.subnets
            .iter()
            .map(|s| {
                s.parse::<Ipv4Net>()
                    .map_err(|e| BridgeError::ConfigError(format!("Invalid subnet {}: {}", s, e)))
            })
            .collect()
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            port: DEFAULT_WS_PORT,
            max_concurrent: self.max_concurrent.max(1),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms.max(1)),
        }
    }
}

/// Connection manager tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_stale_multiplier")]
    pub stale_multiplier: u32,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default = "default_short_attempts")]
    pub short_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_long_interval")]
    pub long_interval_secs: u64,

    #[serde(default = "default_power_probe")]
    pub power_probe_secs: u64,

    #[serde(default = "default_loud_failures")]
    pub loud_failure_count: u32,

    #[serde(default = "default_rediscover_after")]
    pub rediscover_after: u32,
}

fn default_probe_interval() -> u64 {
    10
}

fn default_stale_multiplier() -> u32 {
    3
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_short_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    1
}

fn default_backoff_max() -> u64 {
    16
}

fn default_long_interval() -> u64 {
    30
}

fn default_power_probe() -> u64 {
    10
}

fn default_loud_failures() -> u32 {
    3
}

fn default_rediscover_after() -> u32 {
    3
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            stale_multiplier: default_stale_multiplier(),
            handshake_timeout_secs: default_handshake_timeout(),
            short_attempts: default_short_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            long_interval_secs: default_long_interval(),
            power_probe_secs: default_power_probe(),
            loud_failure_count: default_loud_failures(),
            rediscover_after: default_rediscover_after(),
        }
    }
}

/// Longest interval accepted from the settings file
pub const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Longest stale window as a multiple of the probe interval
const MAX_STALE_MULTIPLIER: u32 = 100;

fn bounded_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(1, MAX_INTERVAL_SECS))
}

impl ConnectionSettings {
    pub fn to_options(&self, port: u16) -> Result<manager::Options, BridgeError> {
        if self.long_interval_secs == 0 {
            return Err(BridgeError::ConfigError(
                "connection.long_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(manager::Options {
            port,
            probe_interval: bounded_secs(self.probe_interval_secs),
            stale_multiplier: self.stale_multiplier.clamp(1, MAX_STALE_MULTIPLIER),
            handshake_timeout: bounded_secs(self.handshake_timeout_secs),
            backoff: BackoffPolicy {
                base_delay: bounded_secs(self.backoff_base_secs),
                max_short_delay: bounded_secs(self.backoff_max_secs),
                short_attempts: self.short_attempts,
                long_interval: bounded_secs(self.long_interval_secs),
                ..Default::default()
            },
            power_probe_interval: bounded_secs(self.power_probe_secs),
            loud_failure_count: self.loud_failure_count,
            rediscover_after: self.rediscover_after,
        })
    }
}

/// Device task tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(default = "default_grace_window")]
    pub grace_window_secs: u64,

    #[serde(default = "default_ack_timeout")]
    pub command_ack_timeout_secs: u64,

    #[serde(default = "default_transition_timeout")]
    pub transition_timeout_secs: u64,
}

fn default_grace_window() -> u64 {
    15
}

fn default_ack_timeout() -> u64 {
    5
}

fn default_transition_timeout() -> u64 {
    30
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            grace_window_secs: default_grace_window(),
            command_ack_timeout_secs: default_ack_timeout(),
            transition_timeout_secs: default_transition_timeout(),
        }
    }
}

impl DeviceSettings {
    pub fn machine_options(&self) -> MachineOptions {
        MachineOptions {
            grace_window: Duration::from_secs(self.grace_window_secs),
            transition_timeout: Duration::from_secs(self.transition_timeout_secs),
        }
    }

    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            ack_timeout: Duration::from_secs(self.command_ack_timeout_secs.max(1)),
            ..Default::default()
        }
    }
}

/// One configured printer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterSettings {
    pub id: String,

    pub host: String,

    #[serde(default)]
    pub mac: Option<String>,

    #[serde(default = "default_ws_port")]
    pub port: u16,

    /// The host controls a smart switch powering this printer
    #[serde(default)]
    pub power_switch: bool,

    #[serde(default)]
    pub camera_mode: CameraMode,

    #[serde(default)]
    pub overrides: OverrideSettings,
}

fn default_ws_port() -> u16 {
    DEFAULT_WS_PORT
}

/// Forced capability values
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverrideSettings {
    #[serde(default)]
    pub light: Option<bool>,

    #[serde(default)]
    pub box_temperature: Option<bool>,

    #[serde(default)]
    pub box_control: Option<bool>,

    #[serde(default)]
    pub cfs: Option<bool>,
}

impl PrinterSettings {
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.id.trim().is_empty() {
            return Err(BridgeError::ConfigError("Printer id is empty".to_string()));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(BridgeError::ConfigError(format!(
                "Printer id {} may only contain letters, digits, '-' and '_'",
                self.id
            )));
        }
        if self.host.trim().is_empty() {
            return Err(BridgeError::ConfigError(format!("Printer {} has no host", self.id)));
        }
        if self.port == 0 {
            return Err(BridgeError::ConfigError(format!("Printer {} has port 0", self.id)));
        }
        if let Some(mac) = &self.mac {
            if normalize_mac(mac).is_none() {
                return Err(BridgeError::ConfigError(format!(
                    "Printer {} has an invalid MAC address {}",
                    self.id, mac
                )));
            }
        }
        Ok(())
    }

    pub fn capability_overrides(&self) -> CapabilityOverrides {
        CapabilityOverrides {
            camera: self.camera_mode,
            light: self.overrides.light,
            box_temperature: self.overrides.box_temperature,
            box_control: self.overrides.box_control,
            cfs: self.overrides.cfs,
        }
    }

    pub fn to_device_config(
        &self,
        connection: &ConnectionSettings,
        device: &DeviceSettings,
    ) -> Result<DeviceConfig, BridgeError> {
        self.validate()?;
        Ok(DeviceConfig {
            id: self.id.clone(),
            host: self.host.trim().to_string(),
            mac: self.mac.as_deref().and_then(normalize_mac),
            power_switch: self.power_switch,
            overrides: self.capability_overrides(),
            connection: connection.to_options(self.port)?,
            machine: device.machine_options(),
            dispatch: device.dispatch_options(),
        })
    }
}
