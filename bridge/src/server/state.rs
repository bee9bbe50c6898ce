//! Server state

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::device::registry::DeviceRegistry;

/// Server state shared across handlers
pub struct ServerState {
    pub registry: Arc<DeviceRegistry>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            started_at: Utc::now(),
        }
    }
}
