//! Per-device runtime
//!
//! Each printer gets two tasks: the connection manager, which owns the
//! socket, and the device task, which parses frames and drives the state
//! machine. [`DeviceHandle`] is what the host holds on to.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::connection::health::{ConnectionHealth, HealthSnapshot};
use crate::connection::manager::{
    self, ConnectionEvent, ConnectionManager, ConnectionState, Discovery, Links, RawFrame,
};
use crate::connection::power::{PowerBinding, PowerState, PowerSwitch};
use crate::connection::transport::Connector;
use crate::device::dispatcher::{
    Ack, Command, CommandDispatcher, DispatchOptions, PendingCommands, PendingSummary,
};
use crate::device::machine::{DeviceMachine, DeviceView, MachineOptions};
use crate::device::media::{media_info, MediaInfo};
use crate::device::publisher::{Observer, ObserverId, Publisher};
use crate::errors::{BridgeError, CommandError};
use crate::model::capability::{CapabilityDescriptor, CapabilityOverrides};
use crate::model::identity::{DeviceIdentity, MacOutcome};
use crate::model::telemetry::TelemetrySnapshot;
use crate::protocol::frame::{self, Frame};
use crate::storage::device::{DeviceRecord, DeviceStore};

const EVENT_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 16;

/// Everything needed to start one printer
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: String,
    pub host: String,
    pub mac: Option<String>,

    /// A host-controlled power switch gates this printer
    pub power_switch: bool,
    pub overrides: CapabilityOverrides,
    pub connection: manager::Options,
    pub machine: MachineOptions,
    pub dispatch: DispatchOptions,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            mac: None,
            power_switch: false,
            overrides: CapabilityOverrides::default(),
            connection: manager::Options::default(),
            machine: MachineOptions::default(),
            dispatch: DispatchOptions::default(),
        }
    }
}

/// Shared collaborators handed to every device
#[derive(Clone)]
pub struct DeviceServices {
    pub store: Arc<dyn DeviceStore>,
    pub connector: Arc<dyn Connector>,
    pub discovery: Arc<dyn Discovery>,
}

/// Troubleshooting dump
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub id: String,
    pub generated_at: DateTime<Utc>,
    pub connection: ConnectionState,
    pub power: Option<PowerState>,
    pub view: DeviceView,
    pub capabilities: CapabilityDescriptor,
    pub health: HealthSnapshot,
    pub pending_commands: Vec<PendingSummary>,
    pub observers: usize,
}

pub struct DeviceHandle {
    id: String,
    publisher: Arc<Publisher>,
    dispatcher: CommandDispatcher,
    health: Arc<ConnectionHealth>,
    pending: Arc<PendingCommands>,
    connection: watch::Receiver<ConnectionState>,
    descriptor: watch::Receiver<CapabilityDescriptor>,
    power: Option<PowerSwitch>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceHandle {
    /// Restore persisted state and start the device and connection tasks.
    pub async fn spawn(config: DeviceConfig, services: DeviceServices) -> Result<Self, BridgeError> {
        let id = config.id.clone();
        let record = match services.store.load(&id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("{}: ignoring stored record: {}", id, e);
                None
            }
        };
        let restored = record.is_some();

        let mut identity = match &record {
            Some(record) => record.identity.clone(),
            None => DeviceIdentity::new(config.host.clone()),
        };
        // A printer last found elsewhere by its MAC is tried there first; the
        // configured address is the fallback.
        let followed = record
            .as_ref()
            .map(|r| &r.identity)
            .filter(|cached| cached.mac.is_some() && !cached.host.is_empty() && cached.host != config.host)
            .map(|cached| cached.host.clone());
        identity.host = followed.clone().unwrap_or_else(|| config.host.clone());
        if let Some(mac) = &config.mac {
            if let MacOutcome::Conflict { cached } = identity.learn_mac(mac) {
                warn!("{}: configured MAC {} differs from cached {}, keeping cached", id, mac, cached);
            }
        }
        let capabilities = record.map(|r| r.capabilities).unwrap_or_default();

        let machine = DeviceMachine::new(
            id.clone(),
            identity.clone(),
            capabilities,
            config.overrides.clone(),
            config.machine.clone(),
            restored,
        );

        let publisher = Arc::new(Publisher::new(machine.view()));
        let health = Arc::new(ConnectionHealth::new());
        let pending = Arc::new(PendingCommands::new());
        let (descriptor_tx, descriptor_rx) = watch::channel(machine.capabilities().clone());
        let (mac_tx, mac_rx) = watch::channel(identity.mac.clone());
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let (power_switch, power) = if config.power_switch {
            let (switch, binding) = PowerBinding::bound();
            (Some(switch), binding)
        } else {
            (None, PowerBinding::unbound())
        };

        let (mut manager, connection_rx) = ConnectionManager::new(
            id.clone(),
            identity.host.clone(),
            config.connection.clone(),
            Links {
                connector: services.connector.clone(),
                discovery: services.discovery.clone(),
                power: power.clone(),
                health: health.clone(),
                mac: mac_rx,
                events: events_tx,
            },
        );

        if let Some(last_seen) = &followed {
            info!("{}: trying last known address {} before {}", id, last_seen, config.host);
            manager = manager.with_fallback_host(config.host.clone());
        }

        let dispatcher = CommandDispatcher::new(
            id.clone(),
            config.dispatch.clone(),
            outbound_tx,
            connection_rx.clone(),
            publisher.watch(),
            pending.clone(),
            accepted_tx,
        );

        let task = DeviceTask {
            id: id.clone(),
            machine,
            publisher: publisher.clone(),
            health: health.clone(),
            pending: pending.clone(),
            store: services.store.clone(),
            saved: None,
            descriptor: descriptor_tx,
            mac: mac_tx,
            power,
        };

        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn(task.run(
            events_rx,
            accepted_rx,
            shutdown_future(&shutdown_tx),
        )));
        tasks.push(tokio::spawn(manager.run(outbound_rx, shutdown_future(&shutdown_tx))));

        info!("{}: started ({})", id, identity.host);
        Ok(Self {
            id,
            publisher,
            dispatcher,
            health,
            pending,
            connection: connection_rx,
            descriptor: descriptor_rx,
            power: power_switch,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest published view
    pub fn view(&self) -> Arc<DeviceView> {
        self.publisher.latest()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<DeviceView>> {
        self.publisher.watch()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn capabilities(&self) -> CapabilityDescriptor {
        self.descriptor.borrow().clone()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.view().telemetry.clone()
    }

    pub fn media(&self) -> MediaInfo {
        media_info(&self.view())
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ObserverId {
        self.publisher.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.publisher.unsubscribe(id)
    }

    pub async fn send(&self, command: Command) -> Result<Ack, CommandError> {
        self.dispatcher.send(command).await
    }

    /// Report the state of the power switch feeding this printer.
    pub fn set_power(&self, state: PowerState) -> Result<(), BridgeError> {
        match &self.power {
            Some(switch) => {
                switch.set(state);
                Ok(())
            }
            None => Err(BridgeError::ConfigError(format!(
                "Printer {} has no power switch configured",
                self.id
            ))),
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            id: self.id.clone(),
            generated_at: Utc::now(),
            connection: self.connection_state(),
            power: self.power.as_ref().map(PowerSwitch::get),
            view: (*self.view()).clone(),
            capabilities: self.capabilities(),
            health: self.health.snapshot(),
            pending_commands: self.pending.summaries(),
            observers: self.publisher.observer_count(),
        }
    }

    /// Stop both tasks and wait for them; the socket is closed on return.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), BridgeError> {
        let _ = self.shutdown_tx.send(());
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );

        let mut result = Ok(());
        for mut task in tasks {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("{}: task failed: {}", self.id, e);
                    result = Err(BridgeError::ShutdownError(e.to_string()));
                }
                Err(_) => {
                    warn!("{}: task did not stop within {:?}, aborting", self.id, timeout);
                    task.abort();
                    let _ = task.await;
                    result = Err(BridgeError::ShutdownError(format!(
                        "{} did not stop in time",
                        self.id
                    )));
                }
            }
        }
        info!("{}: stopped", self.id);
        result
    }
}

fn shutdown_future(tx: &broadcast::Sender<()>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let mut rx = tx.subscribe();
    Box::pin(async move {
        let _ = rx.recv().await;
    })
}

struct DeviceTask {
    id: String,
    machine: DeviceMachine,
    publisher: Arc<Publisher>,
    health: Arc<ConnectionHealth>,
    pending: Arc<PendingCommands>,
    store: Arc<dyn DeviceStore>,
    saved: Option<DeviceRecord>,
    descriptor: watch::Sender<CapabilityDescriptor>,
    mac: watch::Sender<Option<String>>,
    power: PowerBinding,
}

impl DeviceTask {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<ConnectionEvent>,
        mut accepted: mpsc::UnboundedReceiver<Command>,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) {
        debug!("{}: device task starting", self.id);

        if self.power.is_bound() && self.power.state() == PowerState::Off {
            let changes = self.machine.on_power(PowerState::Off);
            self.publisher.stage(changes);
        }

        loop {
            let deadline = self.machine.next_deadline();
            tokio::select! {
                biased;

                _ = shutdown_signal.as_mut() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event);
                    // Drain whatever else is queued so observers see one batch.
                    while let Ok(event) = events.try_recv() {
                        self.handle(event);
                    }
                }
                Some(command) = accepted.recv() => {
                    let changes = self.machine.on_command_accepted(&command, Instant::now());
                    self.publisher.stage(changes);
                }
                power = self.power.changed() => {
                    let changes = self.machine.on_power(power);
                    self.publisher.stage(changes);
                }
                _ = sleep_until(deadline) => {
                    let changes = self.machine.tick(Instant::now());
                    self.publisher.stage(changes);
                }
            }

            self.sync().await;
        }

        self.pending.clear();
        debug!("{}: device task stopped", self.id);
    }

    fn handle(&mut self, event: ConnectionEvent) {
        let now = Instant::now();
        let changes = match event {
            ConnectionEvent::State(state) => {
                if state != ConnectionState::Connected {
                    self.pending.clear();
                }
                self.machine.on_connection_state(state, now)
            }
            ConnectionEvent::Frame(raw) => {
                let parsed = match &raw {
                    RawFrame::Text(text) => frame::parse(text),
                    RawFrame::Binary(bytes) => frame::parse_bytes(bytes),
                };
                match parsed {
                    Ok(Frame::Telemetry(update)) => {
                        if !update.rejected.is_empty() {
                            debug!("{}: dropped fields {:?}", self.id, update.rejected);
                            self.health.on_rejected_fields(update.rejected.len());
                        }
                        let changes = self.machine.on_frame(&update);
                        self.pending.resolve(&update);
                        changes
                    }
                    Ok(Frame::Heartbeat) | Ok(Frame::Ack) => return,
                    Err(e) => {
                        self.health.on_parse_error();
                        warn!("{}: discarding malformed frame: {}", self.id, e);
                        return;
                    }
                }
            }
            ConnectionEvent::AddressChanged { to, .. } => self.machine.on_address_changed(&to),
            ConnectionEvent::MacLearned(mac) => self.machine.on_mac_learned(&mac),
            ConnectionEvent::Lost(e) => {
                debug!("{}: session lost: {}", self.id, e);
                return;
            }
        };
        self.publisher.stage(changes);
    }

    /// Publish the batch, mirror identity/capabilities, persist once resolved.
    async fn sync(&mut self) {
        self.publisher.flush(self.machine.view());

        let descriptor = self.machine.capabilities();
        if *self.descriptor.borrow() != *descriptor {
            self.descriptor.send_replace(descriptor.clone());
        }
        let mac = self.machine.identity().mac.clone();
        if *self.mac.borrow() != mac {
            self.mac.send_replace(mac);
        }

        if !self.machine.is_resolved() {
            return;
        }
        let record = DeviceRecord {
            identity: self.machine.identity().clone(),
            capabilities: self.machine.capabilities().inferred.clone(),
            overrides: self.machine.overrides().clone(),
        };
        if self.saved.as_ref() == Some(&record) {
            return;
        }
        match self.store.save(&self.id, &record).await {
            Ok(()) => {
                debug!("{}: saved device record", self.id);
                self.saved = Some(record);
            }
            Err(e) => error!("{}: failed to save device record: {}", self.id, e),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
