//! Printer identity

use serde::{Deserialize, Serialize};

use crate::protocol::frame::{normalize_mac, PartialUpdate};

/// Who the printer is. Persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Current network address
    pub host: String,

    /// Hardware address, immutable once learned
    #[serde(default)]
    pub mac: Option<String>,

    /// Friendly model string, e.g. `K1C`
    #[serde(default)]
    pub model: String,

    /// Raw `modelVersion`; may embed the board code
    #[serde(default)]
    pub model_version: String,

    #[serde(default)]
    pub hostname: String,
}

/// Result of offering a MAC address to the identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacOutcome {
    Learned,
    Unchanged,
    /// A different MAC than the one already cached; ignored
    Conflict { cached: String },
    Invalid,
}

impl DeviceIdentity {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Board code such as `F012`, taken from `modelVersion` or the model string.
    pub fn board_code(&self) -> Option<String> {
        extract_board_code(&self.model_version).or_else(|| extract_board_code(&self.model))
    }

    /// Friendly model string, if it is not itself a board code.
    pub fn friendly_model(&self) -> Option<&str> {
        let model = self.model.trim();
        if model.is_empty() || is_board_code(model) {
            None
        } else {
            Some(model)
        }
    }

    /// `model`, `model_version` and `hostname` have all arrived.
    pub fn is_complete(&self) -> bool {
        !self.model.is_empty() && !self.model_version.is_empty() && !self.hostname.is_empty()
    }

    /// Merge identity fields from a frame. Empty values never replace
    /// cached ones. Returns true when anything changed.
    pub fn backfill(&mut self, update: &PartialUpdate) -> bool {
        let mut changed = false;
        changed |= backfill_field(&mut self.model, update.model.as_deref());
        changed |= backfill_field(&mut self.model_version, update.model_version.as_deref());
        changed |= backfill_field(&mut self.hostname, update.hostname.as_deref());
        if let Some(mac) = update.mac.as_deref() {
            changed |= self.learn_mac(mac) == MacOutcome::Learned;
        }
        changed
    }

    pub fn learn_mac(&mut self, mac: &str) -> MacOutcome {
        let Some(mac) = normalize_mac(mac) else {
            return MacOutcome::Invalid;
        };
        match &self.mac {
            None => {
                self.mac = Some(mac);
                MacOutcome::Learned
            }
            Some(cached) if *cached == mac => MacOutcome::Unchanged,
            Some(cached) => MacOutcome::Conflict {
                cached: cached.clone(),
            },
        }
    }
}

fn backfill_field(slot: &mut String, incoming: Option<&str>) -> bool {
    match incoming.map(str::trim) {
        Some(value) if !value.is_empty() && value != slot.as_str() => {
            *slot = value.to_string();
            true
        }
        _ => false,
    }
}

fn is_board_code(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() == 4
        && bytes[0].eq_ignore_ascii_case(&b'F')
        && bytes[1..].iter().all(u8::is_ascii_digit)
}

/// Find a standalone `Fnnn` token, e.g. in `Printer HW Ver: F008; Printer SW Ver: 1.2`.
pub fn extract_board_code(text: &str) -> Option<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .find(|token| is_board_code(token))
        .map(str::to_ascii_uppercase)
}
