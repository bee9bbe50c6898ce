//! Telemetry frame parser
//!
//! Printers push JSON objects that carry only a subset of the known fields.
//! Parsing yields a [`PartialUpdate`] holding exactly the fields present in
//! the frame. Values that are non-finite or outside their declared range are
//! dropped (and listed in [`PartialUpdate::rejected`]) so a single garbage
//! reading never reaches the snapshot.

use std::ops::RangeInclusive;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::ParseError;

pub const NOZZLE_TEMP_RANGE: RangeInclusive<f64> = 0.0..=500.0;
pub const BED_TEMP_RANGE: RangeInclusive<f64> = 0.0..=200.0;
pub const BOX_TEMP_RANGE: RangeInclusive<f64> = 0.0..=150.0;
pub const PERCENT_RANGE: RangeInclusive<f64> = 0.0..=100.0;
pub const RATE_PCT_RANGE: RangeInclusive<f64> = 0.0..=1000.0;
pub const DURATION_RANGE: RangeInclusive<f64> = 0.0..=31_536_000.0;
pub const LAYER_RANGE: RangeInclusive<f64> = 0.0..=1_000_000.0;
pub const LENGTH_RANGE: RangeInclusive<f64> = 0.0..=10_000_000.0;

/// Highest CFS box id; box ids start at 1.
pub const MAX_CFS_BOXES: u8 = 4;
/// Slots per CFS box, ids 0..=3.
pub const SLOTS_PER_BOX: u8 = 4;

/// Keys consumed by the parser. Everything else is kept in `extras`.
const KNOWN_KEYS: &[&str] = &[
    "model",
    "modelVersion",
    "hostname",
    "mac",
    "state",
    "err",
    "printProgress",
    "dProgress",
    "printJobTime",
    "printLeftTime",
    "printFileName",
    "nozzleTemp",
    "targetNozzleTemp",
    "bedTemp0",
    "targetBedTemp0",
    "boxTemp",
    "targetBoxTemp",
    "layer",
    "TotalLayer",
    "lightSw",
    "caseFan",
    "modelFan",
    "sideFan",
    "curFeedratePct",
    "curFlowratePct",
    "curPosition",
    "usedMaterialLength",
    "boxsInfo",
];

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `{"ModeCode":"heart_beat"}`, answered with `ok`
    Heartbeat,

    /// Bare `ok` text
    Ack,

    /// Any other object
    Telemetry(PartialUpdate),
}

/// Toolhead position reported as `X:.. Y:.. Z:..`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// One filament slot as reported in a frame
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SlotUpdate {
    pub slot: u8,
    pub filament_type: Option<String>,
    pub name: Option<String>,
    pub vendor: Option<String>,
    pub color: Option<String>,
    pub percent: Option<u8>,
    pub selected: Option<bool>,
    pub loaded: Option<bool>,
}

/// One CFS box as reported in a frame
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BoxUpdate {
    pub id: u8,
    pub temp: Option<f64>,
    pub humidity: Option<f64>,
    pub slots: Vec<SlotUpdate>,
}

/// The `boxsInfo` section
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CfsUpdate {
    pub boxes: Vec<BoxUpdate>,
    pub external: Option<SlotUpdate>,
}

/// Fields present in a single telemetry frame
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PartialUpdate {
    pub model: Option<String>,
    pub model_version: Option<String>,
    pub hostname: Option<String>,
    pub mac: Option<String>,

    pub state_code: Option<i64>,
    pub error_code: Option<i64>,
    pub progress: Option<u8>,
    pub elapsed_secs: Option<u64>,
    pub remaining_secs: Option<u64>,
    pub file_name: Option<String>,

    pub nozzle_temp: Option<f64>,
    pub target_nozzle_temp: Option<f64>,
    pub bed_temp: Option<f64>,
    pub target_bed_temp: Option<f64>,
    pub box_temp: Option<f64>,
    pub target_box_temp: Option<f64>,

    pub layer: Option<u32>,
    pub total_layers: Option<u32>,
    pub light: Option<bool>,

    pub case_fan: Option<u8>,
    pub model_fan: Option<u8>,
    pub side_fan: Option<u8>,
    pub feedrate_pct: Option<u16>,
    pub flowrate_pct: Option<u16>,
    pub position: Option<Position>,
    pub used_material_mm: Option<f64>,

    pub cfs: Option<CfsUpdate>,

    /// Unrecognised top-level keys, kept for diagnostics only
    pub extras: Map<String, Value>,

    /// Keys whose values were present but rejected
    pub rejected: Vec<String>,
}

impl PartialUpdate {
    /// True when the frame carries any identity field.
    pub fn has_identity(&self) -> bool {
        self.model.is_some()
            || self.model_version.is_some()
            || self.hostname.is_some()
            || self.mac.is_some()
    }

    /// Test whether a protocol key was present and accepted in this frame.
    pub fn carries(&self, key: &str) -> bool {
        match key {
            "boxsInfo" => self.cfs.is_some(),
            "reqPrinterPara" => self.state_code.is_some() || self.model.is_some(),
            "lightSw" => self.light.is_some(),
            "targetBoxTemp" => self.target_box_temp.is_some(),
            "targetNozzleTemp" => self.target_nozzle_temp.is_some(),
            "targetBedTemp0" => self.target_bed_temp.is_some(),
            "state" => self.state_code.is_some(),
            other => self.extras.contains_key(other),
        }
    }
}

/// Parse a raw text frame.
pub fn parse(raw: &str) -> Result<Frame, ParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }
    if trimmed == "ok" {
        return Ok(Frame::Ack);
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| ParseError::Json(e.to_string()))?;
    let object = match value {
        Value::Object(object) => object,
        other => return Err(ParseError::NotAnObject(kind_of(&other))),
    };

    if object.get("ModeCode").and_then(Value::as_str) == Some("heart_beat") {
        return Ok(Frame::Heartbeat);
    }

    Ok(Frame::Telemetry(parse_object(object)))
}

/// Parse a raw binary frame. Printers only ever send UTF-8 JSON.
pub fn parse_bytes(raw: &[u8]) -> Result<Frame, ParseError> {
    let text = std::str::from_utf8(raw).map_err(|_| ParseError::InvalidUtf8)?;
    parse(text)
}

/// Cheap heartbeat check for the socket loop, which must answer before the
/// frame reaches the device task.
pub fn is_heartbeat(raw: &str) -> bool {
    raw.contains("heart_beat") && matches!(parse(raw), Ok(Frame::Heartbeat))
}

fn parse_object(object: Map<String, Value>) -> PartialUpdate {
    let mut fields = Fields {
        object: &object,
        rejected: Vec::new(),
    };

    let mut update = PartialUpdate {
        model: fields.text("model"),
        model_version: fields.text("modelVersion"),
        hostname: fields.text("hostname"),
        mac: fields.mac("mac"),
        state_code: fields.integer("state"),
        error_code: object
            .get("err")
            .and_then(|err| err.get("errcode"))
            .and_then(number)
            .map(|code| code as i64),
        progress: fields
            .ranged("printProgress", PERCENT_RANGE)
            .or_else(|| fields.ranged("dProgress", PERCENT_RANGE))
            .map(|v| v.round() as u8),
        elapsed_secs: fields.ranged("printJobTime", DURATION_RANGE).map(|v| v as u64),
        remaining_secs: fields.ranged("printLeftTime", DURATION_RANGE).map(|v| v as u64),
        file_name: fields.text("printFileName"),
        nozzle_temp: fields.ranged("nozzleTemp", NOZZLE_TEMP_RANGE),
        target_nozzle_temp: fields.ranged("targetNozzleTemp", NOZZLE_TEMP_RANGE),
        bed_temp: fields.ranged("bedTemp0", BED_TEMP_RANGE),
        target_bed_temp: fields.ranged("targetBedTemp0", BED_TEMP_RANGE),
        box_temp: fields.ranged("boxTemp", BOX_TEMP_RANGE),
        target_box_temp: fields.ranged("targetBoxTemp", BOX_TEMP_RANGE),
        layer: fields.ranged("layer", LAYER_RANGE).map(|v| v as u32),
        total_layers: fields.ranged("TotalLayer", LAYER_RANGE).map(|v| v as u32),
        light: fields.switch("lightSw"),
        case_fan: fields.ranged("caseFan", PERCENT_RANGE).map(|v| v.round() as u8),
        model_fan: fields.ranged("modelFan", PERCENT_RANGE).map(|v| v.round() as u8),
        side_fan: fields.ranged("sideFan", PERCENT_RANGE).map(|v| v.round() as u8),
        feedrate_pct: fields.ranged("curFeedratePct", RATE_PCT_RANGE).map(|v| v.round() as u16),
        flowrate_pct: fields.ranged("curFlowratePct", RATE_PCT_RANGE).map(|v| v.round() as u16),
        position: fields.position("curPosition"),
        used_material_mm: fields.ranged("usedMaterialLength", LENGTH_RANGE),
        cfs: None,
        extras: Map::new(),
        rejected: Vec::new(),
    };

    if let Some(info) = object.get("boxsInfo") {
        update.cfs = parse_cfs(info, &mut fields.rejected);
    }

    update.rejected = fields.rejected;
    update.extras = object
        .into_iter()
        .filter(|(key, _)| !KNOWN_KEYS.contains(&key.as_str()))
        .collect();
    update
}

fn parse_cfs(info: &Value, rejected: &mut Vec<String>) -> Option<CfsUpdate> {
    let boxes = info.get("materialBoxs")?.as_array()?;
    let mut cfs = CfsUpdate::default();

    for entry in boxes {
        let Some(box_object) = entry.as_object() else {
            continue;
        };
        let materials = box_object
            .get("materials")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        // type 1 is the single external spool holder
        if box_object.get("type").and_then(number) == Some(1.0) {
            cfs.external = materials
                .iter()
                .filter_map(|m| parse_slot(m, rejected))
                .next();
            continue;
        }

        let id = match box_object.get("id").and_then(number) {
            Some(id) if (1.0..=MAX_CFS_BOXES as f64).contains(&id) => id as u8,
            _ => {
                rejected.push("boxsInfo.materialBoxs.id".to_string());
                continue;
            }
        };

        let mut fields = Fields {
            object: box_object,
            rejected: Vec::new(),
        };
        let temp = fields.ranged("temp", BOX_TEMP_RANGE);
        let humidity = fields.ranged("humidity", PERCENT_RANGE);
        rejected.extend(fields.rejected.into_iter().map(|k| format!("cfs.{id}.{k}")));

        let slots = materials
            .iter()
            .filter_map(|m| parse_slot(m, rejected))
            .collect();

        cfs.boxes.push(BoxUpdate {
            id,
            temp,
            humidity,
            slots,
        });
    }

    Some(cfs)
}

fn parse_slot(material: &Value, rejected: &mut Vec<String>) -> Option<SlotUpdate> {
    let object = material.as_object()?;
    let slot = match object.get("id").and_then(number) {
        Some(id) if id >= 0.0 && id < SLOTS_PER_BOX as f64 => id as u8,
        _ => {
            rejected.push("materials.id".to_string());
            return None;
        }
    };

    let mut fields = Fields {
        object,
        rejected: Vec::new(),
    };
    let update = SlotUpdate {
        slot,
        filament_type: fields.text("type"),
        name: fields.text("name"),
        vendor: fields.text("vendor"),
        color: fields.text("color").map(|c| normalize_color(&c)),
        percent: fields.ranged("percent", PERCENT_RANGE).map(|v| v.round() as u8),
        selected: fields.switch("selected"),
        loaded: fields.switch("state"),
    };
    rejected.extend(fields.rejected.into_iter().map(|k| format!("materials.{slot}.{k}")));
    Some(update)
}

/// Colours carry a leading channel digit: `#0ffa800` is `#ffa800`.
pub fn normalize_color(raw: &str) -> String {
    let hex = raw.trim().trim_start_matches('#');
    let all_hex = hex.chars().all(|c| c.is_ascii_hexdigit());
    match hex.len() {
        7 if all_hex => format!("#{}", hex[1..].to_ascii_lowercase()),
        6 if all_hex => format!("#{}", hex.to_ascii_lowercase()),
        _ => raw.trim().to_string(),
    }
}

/// Accessor that records rejected keys while extracting values.
struct Fields<'a> {
    object: &'a Map<String, Value>,
    rejected: Vec<String>,
}

impl Fields<'_> {
    fn text(&mut self, key: &str) -> Option<String> {
        match self.object.get(key)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Null => None,
            _ => {
                self.rejected.push(key.to_string());
                None
            }
        }
    }

    fn ranged(&mut self, key: &str, range: RangeInclusive<f64>) -> Option<f64> {
        let raw = self.object.get(key)?;
        match number(raw) {
            Some(v) if range.contains(&v) => Some(v),
            _ => {
                self.rejected.push(key.to_string());
                None
            }
        }
    }

    fn integer(&mut self, key: &str) -> Option<i64> {
        let raw = self.object.get(key)?;
        match number(raw) {
            Some(v) if v.fract() == 0.0 => Some(v as i64),
            _ => {
                self.rejected.push(key.to_string());
                None
            }
        }
    }

    fn switch(&mut self, key: &str) -> Option<bool> {
        let raw = self.object.get(key)?;
        match raw {
            Value::Bool(b) => Some(*b),
            other => match number(other) {
                Some(v) if v == 0.0 => Some(false),
                Some(v) if v == 1.0 => Some(true),
                _ => {
                    self.rejected.push(key.to_string());
                    None
                }
            },
        }
    }

    fn mac(&mut self, key: &str) -> Option<String> {
        let raw = self.text(key)?;
        match normalize_mac(&raw) {
            Some(mac) => Some(mac),
            None => {
                self.rejected.push(key.to_string());
                None
            }
        }
    }

    fn position(&mut self, key: &str) -> Option<Position> {
        let raw = self.object.get(key)?.as_str()?;
        let mut position = Position::default();
        let mut seen = 0;
        for part in raw.split_whitespace() {
            let Some((axis, value)) = part.split_once(':') else {
                continue;
            };
            let Ok(value) = value.parse::<f64>() else {
                continue;
            };
            if !value.is_finite() {
                continue;
            }
            match axis {
                "X" | "x" => position.x = value,
                "Y" | "y" => position.y = value,
                "Z" | "z" => position.z = value,
                _ => continue,
            }
            seen += 1;
        }
        if seen == 3 {
            Some(position)
        } else {
            self.rejected.push(key.to_string());
            None
        }
    }
}

/// Numbers arrive either as JSON numbers or as numeric strings.
fn number(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// Canonical lowercase, colon-separated MAC address.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let hex: String = raw
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let hex = hex.to_ascii_lowercase();
    let pairs: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
    Some(pairs.join(":"))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
