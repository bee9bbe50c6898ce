//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::BridgeError;
use crate::filesys::file::File;

/// On-disk layout of the bridge data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Directory holding one record per printer
    pub fn devices_dir(&self) -> PathBuf {
        self.base_dir.join("devices")
    }

    pub fn device_file(&self, id: &str) -> File {
        File::new(self.devices_dir().join(format!("{}.json", id)))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Create the directories
    pub async fn setup(&self) -> Result<(), BridgeError> {
        tokio::fs::create_dir_all(self.devices_dir()).await?;
        tokio::fs::create_dir_all(self.logs_dir()).await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/crealink");

        #[cfg(not(target_os = "linux"))]
        let base_dir = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".crealink");

        Self::new(base_dir)
    }
}
