//! Command dispatcher
//!
//! Turns high-level intents into protocol messages and writes them through
//! the connection task. A command succeeds once the socket accepts it; `get`
//! requests additionally wait for the matching reply frame. State changes
//! caused by a command arrive later through the normal telemetry path.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::manager::{ConnectionState, Outbound};
use crate::device::machine::DeviceView;
use crate::errors::CommandError;
use crate::model::status::PrintStatus;
use crate::protocol::frame::{normalize_color, PartialUpdate, MAX_CFS_BOXES, RATE_PCT_RANGE, SLOTS_PER_BOX};
use crate::protocol::message::Request;

/// Filament description written to a CFS slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    #[serde(rename = "type")]
    pub filament_type: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub vendor: String,

    /// `#rrggbb`
    pub color: String,

    #[serde(default)]
    pub min_temp: Option<u16>,

    #[serde(default)]
    pub max_temp: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Pause,
    Resume,
    Stop,
    ToggleLight,
    SetLight {
        on: bool,
    },
    CfsLoad {
        box_id: u8,
        slot: u8,
        #[serde(default)]
        material: Option<Material>,
    },
    CfsUnload {
        box_id: u8,
        slot: u8,
    },
    EditMaterial {
        box_id: u8,
        slot: u8,
        material: Material,
    },
    RefreshInfo,
    RefreshCfs,
    SetNozzleTemp {
        target: f64,
    },
    SetBedTemp {
        target: f64,
    },
    SetBoxTemp {
        target: f64,
    },
    SetFeedRate {
        percent: u16,
    },
    SetFlowRate {
        percent: u16,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Stop => "stop",
            Command::ToggleLight => "toggle_light",
            Command::SetLight { .. } => "set_light",
            Command::CfsLoad { .. } => "cfs_load",
            Command::CfsUnload { .. } => "cfs_unload",
            Command::EditMaterial { .. } => "edit_material",
            Command::RefreshInfo => "refresh_info",
            Command::RefreshCfs => "refresh_cfs",
            Command::SetNozzleTemp { .. } => "set_nozzle_temp",
            Command::SetBedTemp { .. } => "set_bed_temp",
            Command::SetBoxTemp { .. } => "set_box_temp",
            Command::SetFeedRate { .. } => "set_feed_rate",
            Command::SetFlowRate { .. } => "set_flow_rate",
        }
    }

    /// Reply key for requests the printer answers directly. Matching is by
    /// key, so the first frame carrying it after the request is written
    /// counts as the reply.
    pub fn ack_key(&self) -> Option<&'static str> {
        match self {
            Command::RefreshInfo => Some("reqPrinterPara"),
            Command::RefreshCfs => Some("boxsInfo"),
            _ => None,
        }
    }

    /// Check the command against what the printer can do right now.
    pub fn validate(&self, view: &DeviceView) -> Result<(), CommandError> {
        let caps = &view.capabilities;
        let limits = &view.limits;
        let status = view.status;

        match self {
            Command::Pause | Command::Stop => {
                if status.is_some_and(|s| !s.is_job_active()) {
                    return Err(rejected(format!("no active job ({})", status_name(status))));
                }
            }
            Command::Resume => {
                if status.is_some_and(|s| !matches!(s, PrintStatus::Paused | PrintStatus::Pausing)) {
                    return Err(rejected(format!("job is not paused ({})", status_name(status))));
                }
            }
            Command::ToggleLight | Command::SetLight { .. } => {
                if !caps.has_light {
                    return Err(rejected("printer has no light"));
                }
            }
            Command::CfsLoad { box_id, slot, material } => {
                check_cfs_slot(view, *box_id, *slot)?;
                if let Some(material) = material {
                    check_material(material)?;
                }
            }
            Command::CfsUnload { box_id, slot } => check_cfs_slot(view, *box_id, *slot)?,
            Command::EditMaterial { box_id, slot, material } => {
                check_cfs_slot(view, *box_id, *slot)?;
                check_material(material)?;
            }
            Command::RefreshInfo => {}
            Command::RefreshCfs => {
                if !caps.has_cfs {
                    return Err(rejected("printer has no CFS"));
                }
            }
            Command::SetNozzleTemp { target } => check_temp("nozzle", *target, limits.max_nozzle)?,
            Command::SetBedTemp { target } => check_temp("bed", *target, limits.max_bed)?,
            Command::SetBoxTemp { target } => {
                if !caps.has_box_control {
                    return Err(rejected("printer has no chamber heater control"));
                }
                check_temp("box", *target, limits.max_box)?;
            }
            Command::SetFeedRate { percent } | Command::SetFlowRate { percent } => {
                let value = f64::from(*percent);
                if *percent == 0 || !RATE_PCT_RANGE.contains(&value) {
                    return Err(rejected(format!("rate {}% out of range", percent)));
                }
            }
        }
        Ok(())
    }

    /// Protocol messages for the command, in send order.
    pub fn requests(&self, view: &DeviceView) -> Vec<Request> {
        match self {
            Command::Pause => vec![Request::set(json!({ "pause": 1 }))],
            Command::Resume => vec![Request::set(json!({ "pause": 0 }))],
            Command::Stop => vec![Request::set(json!({ "stop": 1 }))],
            Command::ToggleLight => {
                let on = !view.telemetry.light.unwrap_or(false);
                vec![light_request(on)]
            }
            Command::SetLight { on } => vec![light_request(*on)],
            Command::CfsLoad { box_id, slot, material } => {
                let mut requests = Vec::with_capacity(2);
                if let Some(material) = material {
                    requests.push(material_request(*box_id, *slot, material));
                }
                requests.push(feed_request(*box_id, *slot, true));
                requests
            }
            Command::CfsUnload { box_id, slot } => vec![feed_request(*box_id, *slot, false)],
            Command::EditMaterial { box_id, slot, material } => {
                vec![material_request(*box_id, *slot, material)]
            }
            Command::RefreshInfo => vec![Request::printer_info()],
            Command::RefreshCfs => vec![Request::cfs_info()],
            Command::SetNozzleTemp { target } => {
                vec![Request::set(json!({ "nozzleTempControl": target.round() as i64 }))]
            }
            Command::SetBedTemp { target } => vec![Request::set(json!({
                "bedTempControl": { "num": 0, "val": target.round() as i64 }
            }))],
            Command::SetBoxTemp { target } => {
                vec![Request::set(json!({ "boxTempControl": target.round() as i64 }))]
            }
            Command::SetFeedRate { percent } => vec![Request::set(json!({ "setFeedratePct": percent }))],
            Command::SetFlowRate { percent } => vec![Request::set(json!({ "setFlowratePct": percent }))],
        }
    }
}

fn rejected(reason: impl Into<String>) -> CommandError {
    CommandError::Rejected(reason.into())
}

fn status_name(status: Option<PrintStatus>) -> &'static str {
    status.map(|s| s.as_str()).unwrap_or("unknown")
}

fn check_cfs_slot(view: &DeviceView, box_id: u8, slot: u8) -> Result<(), CommandError> {
    if !view.capabilities.has_cfs {
        return Err(rejected("printer has no CFS"));
    }
    if box_id == 0 || box_id > MAX_CFS_BOXES {
        return Err(rejected(format!("CFS box {} does not exist", box_id)));
    }
    if slot >= SLOTS_PER_BOX {
        return Err(rejected(format!("CFS slot {} does not exist", slot)));
    }
    Ok(())
}

fn check_material(material: &Material) -> Result<(), CommandError> {
    if material.filament_type.trim().is_empty() {
        return Err(rejected("material type is empty"));
    }
    if wire_color(&material.color).is_none() {
        return Err(rejected(format!("invalid colour {}", material.color)));
    }
    if let (Some(min), Some(max)) = (material.min_temp, material.max_temp) {
        if min > max {
            return Err(rejected(format!("min temperature {} above max {}", min, max)));
        }
    }
    Ok(())
}

fn check_temp(heater: &str, target: f64, max: f64) -> Result<(), CommandError> {
    if !target.is_finite() || target < 0.0 || target > max {
        return Err(rejected(format!(
            "{} target {} outside 0..={}",
            heater, target, max
        )));
    }
    Ok(())
}

/// Colours go out with the leading channel digit the firmware expects.
fn wire_color(color: &str) -> Option<String> {
    let normalized = normalize_color(color);
    let hex = normalized.strip_prefix('#')?;
    (hex.len() == 6 && hex.chars().all(|c| c.is_ascii_hexdigit())).then(|| format!("#0{}", hex))
}

fn light_request(on: bool) -> Request {
    Request::set(json!({ "lightSw": u8::from(on) }))
}

fn feed_request(box_id: u8, slot: u8, load: bool) -> Request {
    Request::set(json!({
        "feedInOrOut": { "boxId": box_id, "materialId": slot, "isFeed": u8::from(load) }
    }))
}

fn material_request(box_id: u8, slot: u8, material: &Material) -> Request {
    let color = wire_color(&material.color).unwrap_or_default();
    Request::set(json!({
        "modifyMaterial": {
            "boxId": box_id,
            "id": slot,
            "type": material.filament_type.trim(),
            "name": material.name.trim(),
            "vendor": material.vendor.trim(),
            "color": color,
            "minTemp": material.min_temp.unwrap_or(0),
            "maxTemp": material.max_temp.unwrap_or(0),
        }
    }))
}

/// Result of an accepted command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ack {
    pub token: Uuid,
    pub command: &'static str,

    /// A reply frame was matched, not just accepted by the socket
    pub acknowledged: bool,
    pub latency_ms: u64,
}

struct PendingCommand {
    token: Uuid,
    command: &'static str,
    payload: String,
    issued_at: Instant,
    ack_key: &'static str,
    reply: oneshot::Sender<Instant>,
}

/// Outstanding command as shown in diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingSummary {
    pub token: Uuid,
    pub command: &'static str,
    pub payload: String,
    pub waiting_for: &'static str,
    pub age_ms: u64,
}

/// Commands waiting for a correlated reply frame
#[derive(Default)]
pub struct PendingCommands {
    entries: Mutex<Vec<PendingCommand>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        command: &'static str,
        ack_key: &'static str,
        payload: String,
    ) -> (Uuid, oneshot::Receiver<Instant>) {
        let (reply, rx) = oneshot::channel();
        let token = Uuid::new_v4();
        self.lock().push(PendingCommand {
            token,
            command,
            payload,
            issued_at: Instant::now(),
            ack_key,
            reply,
        });
        (token, rx)
    }

    /// Complete every pending command whose reply key the frame carries.
    pub fn resolve(&self, update: &PartialUpdate) -> usize {
        let mut entries = self.lock();
        let (matched, waiting): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|pending| update.carries(pending.ack_key));
        *entries = waiting;
        drop(entries);

        let now = Instant::now();
        let count = matched.len();
        for pending in matched {
            debug!("Matched reply for {} ({})", pending.command, pending.token);
            let _ = pending.reply.send(now);
        }
        count
    }

    fn cancel(&self, token: Uuid) {
        self.lock().retain(|pending| pending.token != token);
    }

    /// Drop all waiters; their callers see the link as gone.
    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summaries(&self) -> Vec<PendingSummary> {
        self.lock()
            .iter()
            .map(|pending| PendingSummary {
                token: pending.token,
                command: pending.command,
                payload: pending.payload.clone(),
                waiting_for: pending.ack_key,
                age_ms: pending.issued_at.elapsed().as_millis() as u64,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingCommand>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Dispatcher options
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Wait for a matching reply frame
    pub ack_timeout: Duration,

    /// Wait for the socket to accept a write
    pub accept_timeout: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-device command entry point; cheap to clone.
#[derive(Clone)]
pub struct CommandDispatcher {
    id: String,
    options: DispatchOptions,
    outbound: mpsc::Sender<Outbound>,
    connection: watch::Receiver<ConnectionState>,
    view: watch::Receiver<Arc<DeviceView>>,
    pending: Arc<PendingCommands>,
    accepted: mpsc::UnboundedSender<Command>,
}

impl CommandDispatcher {
    pub fn new(
        id: impl Into<String>,
        options: DispatchOptions,
        outbound: mpsc::Sender<Outbound>,
        connection: watch::Receiver<ConnectionState>,
        view: watch::Receiver<Arc<DeviceView>>,
        pending: Arc<PendingCommands>,
        accepted: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id: id.into(),
            options,
            outbound,
            connection,
            view,
            pending,
            accepted,
        }
    }

    /// Send a command. Fails immediately when the printer is not connected;
    /// never queues and never retries.
    pub async fn send(&self, command: Command) -> Result<Ack, CommandError> {
        if *self.connection.borrow() != ConnectionState::Connected {
            debug!("{}: {} refused, not connected", self.id, command.name());
            return Err(CommandError::NotConnected);
        }

        let view = self.view.borrow().clone();
        command.validate(&view)?;
        let requests = command.requests(&view);
        let payloads: Vec<String> = requests.iter().map(Request::to_text).collect();

        let issued_at = Instant::now();
        for payload in &payloads {
            if let Err(e) = self.write(payload.clone()).await {
                warn!("{}: {} failed: {}", self.id, command.name(), e);
                return Err(e);
            }
        }
        info!("{}: sent {}", self.id, command.name());
        let _ = self.accepted.send(command.clone());

        // Registered only once the request is on the wire, so a frame that
        // was already in flight cannot complete it.
        let Some(key) = command.ack_key() else {
            return Ok(Ack {
                token: Uuid::new_v4(),
                command: command.name(),
                acknowledged: false,
                latency_ms: elapsed_ms(issued_at, Instant::now()),
            });
        };
        let payload = payloads.last().cloned().unwrap_or_default();
        let (token, reply) = self.pending.register(command.name(), key, payload);

        match tokio::time::timeout(self.options.ack_timeout, reply).await {
            Ok(Ok(at)) => Ok(Ack {
                token,
                command: command.name(),
                acknowledged: true,
                latency_ms: elapsed_ms(issued_at, at),
            }),
            Ok(Err(_)) => Err(CommandError::NotConnected),
            Err(_) => {
                self.pending.cancel(token);
                warn!("{}: no reply to {} within {:?}", self.id, command.name(), self.options.ack_timeout);
                Err(CommandError::Timeout(self.options.ack_timeout))
            }
        }
    }

    async fn write(&self, payload: String) -> Result<(), CommandError> {
        let (out, accepted) = Outbound::new(payload);
        self.outbound.try_send(out).map_err(|e| match e {
            TrySendError::Full(_) => CommandError::Rejected("printer link is busy".to_string()),
            TrySendError::Closed(_) => CommandError::NotConnected,
        })?;

        match tokio::time::timeout(self.options.accept_timeout, accepted).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => {
                debug!("{}: write failed: {}", self.id, e);
                Err(CommandError::NotConnected)
            }
            Ok(Err(_)) => Err(CommandError::NotConnected),
            Err(_) => Err(CommandError::Timeout(self.options.accept_timeout)),
        }
    }
}

fn elapsed_ms(from: Instant, to: Instant) -> u64 {
    to.saturating_duration_since(from).as_millis() as u64
}
