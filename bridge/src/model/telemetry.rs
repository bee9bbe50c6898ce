//! Telemetry snapshot and field-by-field merge

use std::collections::BTreeMap;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::model::status::PrintStatus;
use crate::protocol::frame::{PartialUpdate, Position, SlotUpdate};

/// Top-level groups used to scope change notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    Status,
    Job,
    Temperatures,
    Light,
    Motion,
    Cfs,
    Identity,
    Capabilities,
    Availability,
}

impl Group {
    pub const ALL: [Group; 9] = [
        Group::Status,
        Group::Job,
        Group::Temperatures,
        Group::Light,
        Group::Motion,
        Group::Cfs,
        Group::Identity,
        Group::Capabilities,
        Group::Availability,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Set of changed groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet(u16);

impl ChangeSet {
    pub fn all() -> Self {
        Group::ALL.iter().fold(Self::default(), |set, g| set.with(*g))
    }

    pub fn with(mut self, group: Group) -> Self {
        self.insert(group);
        self
    }

    pub fn insert(&mut self, group: Group) {
        self.0 |= group.bit();
    }

    pub fn contains(&self, group: Group) -> bool {
        self.0 & group.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: ChangeSet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn groups(&self) -> Vec<Group> {
        Group::ALL
            .iter()
            .copied()
            .filter(|g| self.contains(*g))
            .collect()
    }
}

impl Serialize for ChangeSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.groups().serialize(serializer)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Temperatures {
    pub nozzle: Option<f64>,
    pub nozzle_target: Option<f64>,
    pub bed: Option<f64>,
    pub bed_target: Option<f64>,
    #[serde(rename = "box")]
    pub box_temp: Option<f64>,
    pub box_target: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobState {
    pub progress: Option<u8>,
    pub elapsed_secs: Option<u64>,
    pub remaining_secs: Option<u64>,
    pub file_name: Option<String>,
    pub layer: Option<u32>,
    pub total_layers: Option<u32>,
    pub used_material_mm: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Motion {
    pub case_fan: Option<u8>,
    pub model_fan: Option<u8>,
    pub side_fan: Option<u8>,
    pub feedrate_pct: Option<u16>,
    pub flowrate_pct: Option<u16>,
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilamentSlot {
    pub filament_type: Option<String>,
    pub name: Option<String>,
    pub vendor: Option<String>,
    pub color: Option<String>,
    pub percent: Option<u8>,
    pub selected: bool,
    pub loaded: Option<bool>,
}

impl FilamentSlot {
    fn merge(&mut self, update: &SlotUpdate) {
        merge_opt(&mut self.filament_type, &update.filament_type);
        merge_opt(&mut self.name, &update.name);
        merge_opt(&mut self.vendor, &update.vendor);
        merge_opt(&mut self.color, &update.color);
        merge_opt(&mut self.percent, &update.percent);
        merge_opt(&mut self.loaded, &update.loaded);
        if let Some(selected) = update.selected {
            self.selected = selected;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CfsBox {
    pub temp: Option<f64>,
    pub humidity: Option<f64>,
    pub slots: BTreeMap<u8, FilamentSlot>,
}

/// Filament changer state: up to four boxes of four slots, plus the
/// external single-spool holder.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CfsState {
    pub boxes: BTreeMap<u8, CfsBox>,
    pub external: Option<FilamentSlot>,
}

impl CfsState {
    pub fn slot(&self, box_id: u8, slot: u8) -> Option<&FilamentSlot> {
        self.boxes.get(&box_id)?.slots.get(&slot)
    }

    pub fn selected(&self) -> Option<(u8, u8)> {
        self.boxes.iter().find_map(|(id, b)| {
            b.slots
                .iter()
                .find(|(_, slot)| slot.selected)
                .map(|(slot, _)| (*id, *slot))
        })
    }
}

/// Latest merged telemetry for one printer.
///
/// Only ever merged into, never replaced: a field missing from a frame
/// keeps its previous value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// False while the connection is stale; values are retained but must
    /// not be presented as current
    pub available: bool,

    /// Status as reported by the printer, before transitional overlays
    pub status: Option<PrintStatus>,
    pub state_code: Option<i64>,
    pub error_code: Option<i64>,
    pub job: JobState,
    pub temperatures: Temperatures,
    pub light: Option<bool>,
    pub motion: Motion,
    pub cfs: CfsState,

    /// Unrecognised keys from the latest frames, for diagnostics
    pub extras: Map<String, Value>,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            available: false,
            status: None,
            state_code: None,
            error_code: None,
            job: JobState::default(),
            temperatures: Temperatures::default(),
            light: None,
            motion: Motion::default(),
            cfs: CfsState::default(),
            extras: Map::new(),
        }
    }
}

impl TelemetrySnapshot {
    /// Merge a partial update field by field and report changed groups.
    pub fn merge(&mut self, update: &PartialUpdate) -> ChangeSet {
        let before = self.clone();

        merge_opt(&mut self.state_code, &update.state_code);
        merge_opt(&mut self.error_code, &update.error_code);

        let job = &mut self.job;
        merge_opt(&mut job.progress, &update.progress);
        merge_opt(&mut job.elapsed_secs, &update.elapsed_secs);
        merge_opt(&mut job.remaining_secs, &update.remaining_secs);
        merge_opt(&mut job.file_name, &update.file_name);
        merge_opt(&mut job.layer, &update.layer);
        merge_opt(&mut job.total_layers, &update.total_layers);
        merge_opt(&mut job.used_material_mm, &update.used_material_mm);

        let temps = &mut self.temperatures;
        merge_opt(&mut temps.nozzle, &update.nozzle_temp);
        merge_opt(&mut temps.nozzle_target, &update.target_nozzle_temp);
        merge_opt(&mut temps.bed, &update.bed_temp);
        merge_opt(&mut temps.bed_target, &update.target_bed_temp);
        merge_opt(&mut temps.box_temp, &update.box_temp);
        merge_opt(&mut temps.box_target, &update.target_box_temp);

        merge_opt(&mut self.light, &update.light);

        let motion = &mut self.motion;
        merge_opt(&mut motion.case_fan, &update.case_fan);
        merge_opt(&mut motion.model_fan, &update.model_fan);
        merge_opt(&mut motion.side_fan, &update.side_fan);
        merge_opt(&mut motion.feedrate_pct, &update.feedrate_pct);
        merge_opt(&mut motion.flowrate_pct, &update.flowrate_pct);
        merge_opt(&mut motion.position, &update.position);

        if let Some(cfs) = &update.cfs {
            for box_update in &cfs.boxes {
                let entry = self.cfs.boxes.entry(box_update.id).or_default();
                merge_opt(&mut entry.temp, &box_update.temp);
                merge_opt(&mut entry.humidity, &box_update.humidity);
                for slot in &box_update.slots {
                    entry.slots.entry(slot.slot).or_default().merge(slot);
                }
            }
            if let Some(external) = &cfs.external {
                self.cfs.external.get_or_insert_with(Default::default).merge(external);
            }
        }

        for (key, value) in &update.extras {
            self.extras.insert(key.clone(), value.clone());
        }

        if let Some(status) = PrintStatus::derive(
            self.state_code,
            self.error_code,
            self.job.progress,
            self.job.file_name.as_deref(),
        ) {
            self.status = Some(status);
        }

        self.diff(&before)
    }

    /// Zero dynamic fields, e.g. when the printer is switched off.
    pub fn reset_dynamic(&mut self) -> ChangeSet {
        let before = self.clone();
        self.status = None;
        self.state_code = None;
        self.error_code = None;
        self.job = JobState {
            progress: Some(0),
            elapsed_secs: Some(0),
            remaining_secs: Some(0),
            file_name: None,
            layer: Some(0),
            total_layers: Some(0),
            used_material_mm: None,
        };
        self.temperatures = Temperatures {
            nozzle: Some(0.0),
            nozzle_target: Some(0.0),
            bed: Some(0.0),
            bed_target: Some(0.0),
            box_temp: before.temperatures.box_temp.map(|_| 0.0),
            box_target: before.temperatures.box_target.map(|_| 0.0),
        };
        self.light = before.light.map(|_| false);
        self.motion = Motion::default();
        self.cfs = CfsState::default();
        self.extras.clear();
        self.diff(&before)
    }

    pub fn set_available(&mut self, available: bool) -> ChangeSet {
        if self.available == available {
            return ChangeSet::default();
        }
        self.available = available;
        ChangeSet::default().with(Group::Availability)
    }

    fn diff(&self, before: &TelemetrySnapshot) -> ChangeSet {
        let mut changes = ChangeSet::default();
        if self.status != before.status
            || self.state_code != before.state_code
            || self.error_code != before.error_code
        {
            changes.insert(Group::Status);
        }
        if self.job != before.job {
            changes.insert(Group::Job);
        }
        if self.temperatures != before.temperatures {
            changes.insert(Group::Temperatures);
        }
        if self.light != before.light {
            changes.insert(Group::Light);
        }
        if self.motion != before.motion {
            changes.insert(Group::Motion);
        }
        if self.cfs != before.cfs {
            changes.insert(Group::Cfs);
        }
        if self.available != before.available {
            changes.insert(Group::Availability);
        }
        changes
    }
}

fn merge_opt<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *slot = Some(value.clone());
    }
}
