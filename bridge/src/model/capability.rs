//! Capability inference
//!
//! Capabilities are seeded from a static model table and promoted by live
//! telemetry evidence. A capability promoted from evidence is sticky: later
//! frames that lack the field never demote it, so entities built on top of
//! it do not appear and disappear. User overrides sit on top of inference
//! and are kept separately so removing an override restores the inferred
//! value.

use serde::{Deserialize, Serialize};

use crate::model::identity::DeviceIdentity;
use crate::protocol::frame::PartialUpdate;

/// Inferred state of one capability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Capability {
    /// Nothing known yet
    #[default]
    Unknown,

    /// Default taken from the model table; may still be promoted
    Assumed(bool),

    /// Seen in live telemetry; never retracted
    Observed,
}

impl Capability {
    pub fn is_present(&self) -> bool {
        match self {
            Capability::Unknown => false,
            Capability::Assumed(present) => *present,
            Capability::Observed => true,
        }
    }

    pub fn is_sticky(&self) -> bool {
        matches!(self, Capability::Observed)
    }

    fn infer(self, evidence: bool, model_default: Option<bool>) -> Self {
        if self.is_sticky() || evidence {
            return Capability::Observed;
        }
        match model_default {
            Some(present) => Capability::Assumed(present),
            None => self,
        }
    }
}

/// Camera stream kinds the printer may expose
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    #[default]
    None,
    Mjpeg,
    WebRtc,
}

/// User camera setting; anything but `Auto` short-circuits inference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    #[default]
    Auto,
    None,
    Mjpeg,
    WebRtc,
}

impl CameraMode {
    fn forced(&self) -> Option<CameraKind> {
        match self {
            CameraMode::Auto => None,
            CameraMode::None => Some(CameraKind::None),
            CameraMode::Mjpeg => Some(CameraKind::Mjpeg),
            CameraMode::WebRtc => Some(CameraKind::WebRtc),
        }
    }
}

/// Explicit user overrides from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityOverrides {
    #[serde(default)]
    pub camera: CameraMode,

    #[serde(default)]
    pub light: Option<bool>,

    #[serde(default)]
    pub box_temperature: Option<bool>,

    #[serde(default)]
    pub box_control: Option<bool>,

    #[serde(default)]
    pub cfs: Option<bool>,
}

/// The inferred capability set. Persisted across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    #[serde(default)]
    pub box_temperature: Capability,

    #[serde(default)]
    pub box_control: Capability,

    #[serde(default)]
    pub light: Capability,

    #[serde(default)]
    pub cfs: Capability,

    #[serde(default)]
    pub camera: Option<CameraKind>,
}

/// Live evidence extracted from a single frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evidence {
    pub box_temperature: bool,
    pub box_control: bool,
    pub light: bool,
    pub cfs: bool,
}

impl Evidence {
    pub fn from_update(update: &PartialUpdate) -> Self {
        Self {
            box_temperature: update.box_temp.is_some(),
            box_control: update.target_box_temp.is_some(),
            light: update.light.is_some(),
            cfs: update.cfs.as_ref().is_some_and(|cfs| !cfs.boxes.is_empty()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Evidence::default()
    }
}

/// Target-temperature bounds used to validate set commands.
///
/// Chamber heating behaviour is firmware specific, so these are tuned per
/// model in the table below rather than derived from a rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureLimits {
    pub max_nozzle: f64,
    pub max_bed: f64,
    pub max_box: f64,
}

impl Default for TemperatureLimits {
    fn default() -> Self {
        Self {
            max_nozzle: 300.0,
            max_bed: 100.0,
            max_box: 0.0,
        }
    }
}

/// Static knowledge about one printer model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelProfile {
    pub name: &'static str,
    pub board_code: Option<&'static str>,
    pub box_temperature: bool,
    pub box_control: bool,
    pub light: bool,
    pub cfs: bool,
    pub camera: CameraKind,
    pub limits: TemperatureLimits,
}

const K2_LIMITS: TemperatureLimits = TemperatureLimits {
    max_nozzle: 350.0,
    max_bed: 120.0,
    max_box: 60.0,
};

const K1_LIMITS: TemperatureLimits = TemperatureLimits {
    max_nozzle: 300.0,
    max_bed: 100.0,
    max_box: 0.0,
};

const ENDER_LIMITS: TemperatureLimits = TemperatureLimits {
    max_nozzle: 300.0,
    max_bed: 110.0,
    max_box: 0.0,
};

const fn profile(
    name: &'static str,
    board_code: Option<&'static str>,
    flags: [bool; 4],
    camera: CameraKind,
    limits: TemperatureLimits,
) -> ModelProfile {
    ModelProfile {
        name,
        board_code,
        box_temperature: flags[0],
        box_control: flags[1],
        light: flags[2],
        cfs: flags[3],
        camera,
        limits,
    }
}

/// Known models. Flags are `[box_temperature, box_control, light, cfs]`.
pub const MODEL_TABLE: &[ModelProfile] = &[
    profile("K2 Pro", Some("F012"), [true, true, true, true], CameraKind::WebRtc, K2_LIMITS),
    profile("K2 Plus", Some("F008"), [true, true, true, true], CameraKind::WebRtc, K2_LIMITS),
    profile("K2", Some("F021"), [true, true, true, true], CameraKind::WebRtc, K2_LIMITS),
    profile("Creality Hi", Some("F018"), [false, false, true, false], CameraKind::Mjpeg, K1_LIMITS),
    profile("Ender 3 V3 KE", Some("F005"), [false, false, false, false], CameraKind::Mjpeg, ENDER_LIMITS),
    profile("Ender 3 V3 Plus", Some("F002"), [false, false, false, false], CameraKind::Mjpeg, ENDER_LIMITS),
    profile("Ender 3 V3", Some("F001"), [false, false, false, false], CameraKind::Mjpeg, ENDER_LIMITS),
    profile("K1 Max", None, [true, false, true, false], CameraKind::Mjpeg, K1_LIMITS),
    profile("K1 SE", None, [false, false, false, false], CameraKind::Mjpeg, K1_LIMITS),
    profile("K1C", None, [true, false, true, false], CameraKind::Mjpeg, K1_LIMITS),
    profile("K1", None, [true, false, true, false], CameraKind::Mjpeg, K1_LIMITS),
];

/// Substrings of the squashed friendly model string, most specific first.
const NAME_PATTERNS: &[(&str, &str)] = &[
    ("k2pro", "K2 Pro"),
    ("k2plus", "K2 Plus"),
    ("k2", "K2"),
    ("k1max", "K1 Max"),
    ("k1se", "K1 SE"),
    ("k1c", "K1C"),
    ("k1", "K1"),
    ("v3ke", "Ender 3 V3 KE"),
    ("v3plus", "Ender 3 V3 Plus"),
    ("ender3v3", "Ender 3 V3"),
    ("crealityhi", "Creality Hi"),
];

impl ModelProfile {
    pub fn by_board_code(code: &str) -> Option<&'static ModelProfile> {
        MODEL_TABLE
            .iter()
            .find(|p| p.board_code.is_some_and(|c| c.eq_ignore_ascii_case(code)))
    }

    pub fn by_name(name: &str) -> Option<&'static ModelProfile> {
        let squashed: String = name
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect::<String>()
            .to_ascii_lowercase();
        if squashed == "hi" {
            return Self::by_display_name("Creality Hi");
        }
        NAME_PATTERNS
            .iter()
            .find(|(pattern, _)| squashed.contains(pattern))
            .and_then(|(_, display)| Self::by_display_name(display))
    }

    fn by_display_name(display: &str) -> Option<&'static ModelProfile> {
        MODEL_TABLE.iter().find(|p| p.name == display)
    }

    /// Friendly model string first, board code as fallback.
    pub fn lookup(identity: &DeviceIdentity) -> Option<&'static ModelProfile> {
        identity
            .friendly_model()
            .and_then(Self::by_name)
            .or_else(|| identity.board_code().as_deref().and_then(Self::by_board_code))
    }
}

/// Display name for the printer even before the friendly string arrives.
pub fn resolved_model(identity: &DeviceIdentity) -> Option<String> {
    if let Some(model) = identity.friendly_model() {
        return Some(model.to_string());
    }
    identity
        .board_code()
        .as_deref()
        .and_then(ModelProfile::by_board_code)
        .map(|p| p.name.to_string())
}

/// Effective capabilities: inference with user overrides applied
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub inferred: CapabilitySet,
    pub overrides: CapabilityOverrides,
    pub model: Option<String>,
    pub limits: TemperatureLimits,
}

/// Flattened view used for export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapabilitySummary {
    pub has_box_temperature: bool,
    pub has_box_control: bool,
    pub has_light: bool,
    pub has_cfs: bool,
    pub camera: CameraKind,
}

impl CapabilityDescriptor {
    pub fn has_box_temperature(&self) -> bool {
        self.overrides
            .box_temperature
            .unwrap_or_else(|| self.inferred.box_temperature.is_present())
    }

    pub fn has_box_control(&self) -> bool {
        self.overrides
            .box_control
            .unwrap_or_else(|| self.inferred.box_control.is_present())
    }

    pub fn has_light(&self) -> bool {
        self.overrides
            .light
            .unwrap_or_else(|| self.inferred.light.is_present())
    }

    pub fn has_cfs(&self) -> bool {
        self.overrides
            .cfs
            .unwrap_or_else(|| self.inferred.cfs.is_present())
    }

    pub fn camera(&self) -> CameraKind {
        self.overrides
            .camera
            .forced()
            .or(self.inferred.camera)
            .unwrap_or_default()
    }

    pub fn summary(&self) -> CapabilitySummary {
        CapabilitySummary {
            has_box_temperature: self.has_box_temperature(),
            has_box_control: self.has_box_control(),
            has_light: self.has_light(),
            has_cfs: self.has_cfs(),
            camera: self.camera(),
        }
    }
}

/// Derive the capability descriptor.
///
/// 1. Overrides win outright (applied by the descriptor accessors).
/// 2. The model table seeds defaults for anything not yet observed.
/// 3. Evidence promotes to `Observed`, even against the table.
/// 4. `Observed` is never demoted.
pub fn resolve(
    identity: &DeviceIdentity,
    evidence: &Evidence,
    existing: &CapabilitySet,
    overrides: &CapabilityOverrides,
) -> CapabilityDescriptor {
    let profile = ModelProfile::lookup(identity);
    let default = |pick: fn(&ModelProfile) -> bool| profile.map(pick);

    let inferred = CapabilitySet {
        box_temperature: existing
            .box_temperature
            .infer(evidence.box_temperature, default(|p| p.box_temperature)),
        box_control: existing
            .box_control
            .infer(evidence.box_control, default(|p| p.box_control)),
        light: existing.light.infer(evidence.light, default(|p| p.light)),
        cfs: existing.cfs.infer(evidence.cfs, default(|p| p.cfs)),
        camera: profile.map(|p| p.camera).or(existing.camera),
    };

    CapabilityDescriptor {
        inferred,
        overrides: overrides.clone(),
        model: resolved_model(identity),
        limits: profile.map(|p| p.limits).unwrap_or_default(),
    }
}
