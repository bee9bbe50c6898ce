//! Power-control binding
//!
//! The host owns a smart switch that powers the printer. When such a switch
//! is configured, its state gates connection attempts and zeroes telemetry.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    /// Switch exists but its state is not (yet) known
    Unknown,
}

impl PowerState {
    /// Fail-safe: an unknown switch state counts as off.
    pub fn is_off(&self) -> bool {
        !matches!(self, PowerState::On)
    }
}

impl FromStr for PowerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" | "true" | "1" => Ok(PowerState::On),
            "off" | "false" | "0" => Ok(PowerState::Off),
            "unknown" | "unavailable" => Ok(PowerState::Unknown),
            _ => Err(format!("Invalid power state: {}", s)),
        }
    }
}

/// Host side of a power binding
#[derive(Debug)]
pub struct PowerSwitch {
    tx: watch::Sender<PowerState>,
}

impl PowerSwitch {
    pub fn set(&self, state: PowerState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    pub fn get(&self) -> PowerState {
        *self.tx.borrow()
    }
}

/// Device side of a power binding; unbound when no switch is configured
#[derive(Debug, Clone)]
pub struct PowerBinding {
    rx: Option<watch::Receiver<PowerState>>,
}

impl PowerBinding {
    pub fn unbound() -> Self {
        Self { rx: None }
    }

    /// A new binding starting in `Unknown` until the host reports a state.
    pub fn bound() -> (PowerSwitch, PowerBinding) {
        let (tx, rx) = watch::channel(PowerState::Unknown);
        (PowerSwitch { tx }, PowerBinding { rx: Some(rx) })
    }

    pub fn is_bound(&self) -> bool {
        self.rx.is_some()
    }

    pub fn state(&self) -> PowerState {
        match &self.rx {
            Some(rx) => *rx.borrow(),
            None => PowerState::On,
        }
    }

    pub fn is_off(&self) -> bool {
        self.state().is_off()
    }

    /// Resolves on the next state change. Never resolves when unbound or
    /// once the switch is gone.
    pub async fn changed(&mut self) -> PowerState {
        match self.rx.as_mut() {
            Some(rx) => match rx.changed().await {
                Ok(()) => *rx.borrow_and_update(),
                Err(_) => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }
}
