//! Device state machine
//!
//! Owns identity, capabilities and the telemetry snapshot of one printer.
//! Every mutation goes through here, from the device task only, so merges
//! happen strictly in frame arrival order.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::manager::ConnectionState;
use crate::connection::power::PowerState;
use crate::device::dispatcher::Command;
use crate::model::capability::{
    self, CapabilityDescriptor, CapabilityOverrides, CapabilitySet, CapabilitySummary, Evidence,
    TemperatureLimits,
};
use crate::model::identity::{DeviceIdentity, MacOutcome};
use crate::model::status::PrintStatus;
use crate::model::telemetry::{ChangeSet, Group, TelemetrySnapshot};
use crate::protocol::frame::PartialUpdate;

/// Machine settings
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Time after the first connection before identity and capabilities are
    /// considered final even if some identity fields never arrived
    pub grace_window: Duration,

    /// Upper bound for showing `pausing` / `resuming`
    pub transition_timeout: Duration,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(15),
            transition_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    PowerOff,
    Stale,
}

/// Device lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Connecting,
    Live,
    Degraded(DegradedReason),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Transition {
    status: PrintStatus,
    deadline: Instant,
}

/// Read-only export handed to observers and the HTTP API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceView {
    pub id: String,
    pub lifecycle: Lifecycle,
    pub connection: ConnectionState,

    /// Effective status, including `pausing` / `resuming`
    pub status: Option<PrintStatus>,
    pub power_off: bool,
    pub identity: DeviceIdentity,
    pub model: Option<String>,
    pub capabilities: CapabilitySummary,

    /// Identity and capabilities passed the grace window
    pub resolved: bool,
    pub limits: TemperatureLimits,
    pub telemetry: TelemetrySnapshot,
}

impl DeviceView {
    pub fn empty(id: impl Into<String>) -> Self {
        let descriptor = CapabilityDescriptor::default();
        Self {
            id: id.into(),
            lifecycle: Lifecycle::Uninitialized,
            connection: ConnectionState::Disconnected,
            status: None,
            power_off: false,
            identity: DeviceIdentity::default(),
            model: None,
            capabilities: descriptor.summary(),
            resolved: false,
            limits: descriptor.limits,
            telemetry: TelemetrySnapshot::default(),
        }
    }
}

pub struct DeviceMachine {
    id: String,
    options: MachineOptions,
    lifecycle: Lifecycle,
    connection: ConnectionState,
    identity: DeviceIdentity,
    overrides: CapabilityOverrides,
    capabilities: CapabilityDescriptor,
    snapshot: TelemetrySnapshot,
    transition: Option<Transition>,
    first_connected_at: Option<Instant>,
    resolved: bool,
}

impl DeviceMachine {
    /// `restored` is true when identity and capabilities come from storage;
    /// they were final when saved.
    pub fn new(
        id: impl Into<String>,
        identity: DeviceIdentity,
        capabilities: CapabilitySet,
        overrides: CapabilityOverrides,
        options: MachineOptions,
        restored: bool,
    ) -> Self {
        let descriptor = capability::resolve(&identity, &Evidence::default(), &capabilities, &overrides);
        Self {
            id: id.into(),
            options,
            lifecycle: Lifecycle::Uninitialized,
            connection: ConnectionState::Disconnected,
            identity,
            overrides,
            capabilities: descriptor,
            snapshot: TelemetrySnapshot::default(),
            transition: None,
            first_connected_at: None,
            resolved: restored,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    pub fn overrides(&self) -> &CapabilityOverrides {
        &self.overrides
    }

    pub fn snapshot(&self) -> &TelemetrySnapshot {
        &self.snapshot
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Status with any pending pause/resume overlay applied.
    pub fn status(&self) -> Option<PrintStatus> {
        self.transition
            .map(|t| t.status)
            .or(self.snapshot.status)
    }

    pub fn view(&self) -> DeviceView {
        DeviceView {
            id: self.id.clone(),
            lifecycle: self.lifecycle,
            connection: self.connection,
            status: self.status(),
            power_off: self.lifecycle == Lifecycle::Degraded(DegradedReason::PowerOff),
            identity: self.identity.clone(),
            model: self.capabilities.model.clone(),
            capabilities: self.capabilities.summary(),
            resolved: self.resolved,
            limits: self.capabilities.limits,
            telemetry: self.snapshot.clone(),
        }
    }

    pub fn on_connection_state(&mut self, state: ConnectionState, now: Instant) -> ChangeSet {
        self.connection = state;
        let mut changes = ChangeSet::default();

        match state {
            ConnectionState::Connecting => {
                if self.lifecycle == Lifecycle::Uninitialized {
                    self.lifecycle = Lifecycle::Connecting;
                    changes.insert(Group::Availability);
                }
            }
            ConnectionState::Connected => {
                if self.lifecycle != Lifecycle::Live {
                    debug!("{}: live", self.id);
                    self.lifecycle = Lifecycle::Live;
                    changes.insert(Group::Availability);
                }
                self.first_connected_at.get_or_insert(now);
                changes = changes.union(self.snapshot.set_available(true));
            }
            ConnectionState::Disconnected | ConnectionState::BackingOff => {
                if self.lifecycle == Lifecycle::Live {
                    info!("{}: connection stale, telemetry unavailable", self.id);
                    self.lifecycle = Lifecycle::Degraded(DegradedReason::Stale);
                    changes.insert(Group::Availability);
                    changes = changes.union(self.clear_transition());
                }
                changes = changes.union(self.snapshot.set_available(false));
            }
            ConnectionState::PowerOffIdle => changes = self.power_off(),
        }
        changes
    }

    /// Only called when a power binding is configured.
    pub fn on_power(&mut self, power: PowerState) -> ChangeSet {
        match power {
            PowerState::Off => self.power_off(),
            PowerState::On | PowerState::Unknown => ChangeSet::default(),
        }
    }

    fn power_off(&mut self) -> ChangeSet {
        if self.lifecycle == Lifecycle::Degraded(DegradedReason::PowerOff) {
            return ChangeSet::default();
        }
        info!("{}: printer powered off", self.id);
        self.lifecycle = Lifecycle::Degraded(DegradedReason::PowerOff);
        self.transition = None;
        self.snapshot
            .reset_dynamic()
            .union(self.snapshot.set_available(true))
            .with(Group::Availability)
            .with(Group::Status)
    }

    /// Merge a parsed frame. Frames outside a live session are ignored.
    pub fn on_frame(&mut self, update: &PartialUpdate) -> ChangeSet {
        if self.lifecycle != Lifecycle::Live {
            debug!("{}: dropping frame while {:?}", self.id, self.lifecycle);
            return ChangeSet::default();
        }

        let status_before = self.status();
        let mut changes = self.snapshot.merge(update);

        let identity_changed = update.has_identity() && self.identity.backfill(update);
        if identity_changed {
            changes.insert(Group::Identity);
        }

        let evidence = Evidence::from_update(update);
        if identity_changed || !evidence.is_empty() {
            changes = changes.union(self.refresh_capabilities(&evidence));
        }

        if let Some(transition) = self.transition {
            let reported = self.snapshot.status;
            let settled = match transition.status {
                PrintStatus::Pausing => reported != Some(PrintStatus::Printing),
                PrintStatus::Resuming => reported != Some(PrintStatus::Paused),
                _ => true,
            };
            if settled {
                self.transition = None;
            }
        }
        if self.status() != status_before {
            changes.insert(Group::Status);
        }

        if !self.resolved && self.identity.is_complete() {
            changes = changes.union(self.resolve_now("identity complete"));
        }
        changes
    }

    pub fn on_command_accepted(&mut self, command: &Command, now: Instant) -> ChangeSet {
        let overlay = match (command, self.snapshot.status) {
            (Command::Pause, Some(PrintStatus::Printing)) => PrintStatus::Pausing,
            (Command::Resume, Some(PrintStatus::Paused)) => PrintStatus::Resuming,
            _ => return ChangeSet::default(),
        };
        self.transition = Some(Transition {
            status: overlay,
            deadline: now + self.options.transition_timeout,
        });
        ChangeSet::default().with(Group::Status)
    }

    pub fn on_address_changed(&mut self, host: &str) -> ChangeSet {
        if self.identity.host == host {
            return ChangeSet::default();
        }
        info!("{}: address changed {} -> {}", self.id, self.identity.host, host);
        self.identity.host = host.to_string();
        ChangeSet::default().with(Group::Identity)
    }

    pub fn on_mac_learned(&mut self, mac: &str) -> ChangeSet {
        match self.identity.learn_mac(mac) {
            MacOutcome::Learned => ChangeSet::default().with(Group::Identity),
            MacOutcome::Conflict { cached } => {
                warn!("{}: ignoring MAC {}, already known as {}", self.id, mac, cached);
                ChangeSet::default()
            }
            MacOutcome::Unchanged | MacOutcome::Invalid => ChangeSet::default(),
        }
    }

    /// Next instant at which [`DeviceMachine::tick`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let grace = match (self.resolved, self.first_connected_at) {
            (false, Some(at)) => Some(at + self.options.grace_window),
            _ => None,
        };
        let transition = self.transition.map(|t| t.deadline);
        match (grace, transition) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Expire transitions and close the grace window.
    pub fn tick(&mut self, now: Instant) -> ChangeSet {
        let mut changes = ChangeSet::default();
        if self.transition.is_some_and(|t| t.deadline <= now) {
            debug!("{}: status transition timed out", self.id);
            changes = changes.union(self.clear_transition());
        }
        if !self.resolved
            && self
                .first_connected_at
                .is_some_and(|at| at + self.options.grace_window <= now)
        {
            changes = changes.union(self.resolve_now("grace window elapsed"));
        }
        changes
    }

    fn clear_transition(&mut self) -> ChangeSet {
        match self.transition.take() {
            Some(_) => ChangeSet::default().with(Group::Status),
            None => ChangeSet::default(),
        }
    }

    fn refresh_capabilities(&mut self, evidence: &Evidence) -> ChangeSet {
        let next = capability::resolve(
            &self.identity,
            evidence,
            &self.capabilities.inferred,
            &self.overrides,
        );
        if next == self.capabilities {
            return ChangeSet::default();
        }
        debug!("{}: capabilities {:?}", self.id, next.summary());
        self.capabilities = next;
        ChangeSet::default().with(Group::Capabilities)
    }

    fn resolve_now(&mut self, reason: &str) -> ChangeSet {
        self.resolved = true;
        info!(
            "{}: resolved as {} ({})",
            self.id,
            self.capabilities.model.as_deref().unwrap_or("unknown model"),
            reason
        );
        ChangeSet::default()
            .with(Group::Identity)
            .with(Group::Capabilities)
    }
}
