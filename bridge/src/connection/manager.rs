//! Connection manager
//!
//! Owns the printer socket for one device: connect, probe, detect stale
//! links, back off, honour the power binding and follow a printer that moved
//! to a new address. Everything it learns is forwarded to the device task as
//! [`ConnectionEvent`]s in arrival order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn, Level};

use crate::connection::backoff::BackoffPolicy;
use crate::connection::health::ConnectionHealth;
use crate::connection::power::{PowerBinding, PowerState};
use crate::connection::transport::{self, Connector, Inbound, Session};
use crate::errors::TransportError;
use crate::protocol::frame::{is_heartbeat, normalize_mac};
use crate::protocol::message::{Request, HEARTBEAT_REPLY};
use crate::protocol::DEFAULT_WS_PORT;

/// Connection manager options
#[derive(Debug, Clone)]
pub struct Options {
    /// Printer WebSocket port
    pub port: u16,

    /// Interval between liveness probes on an open socket
    pub probe_interval: Duration,

    /// Probe intervals without any inbound frame before the link is stale
    pub stale_multiplier: u32,

    /// Bound on a single connection attempt
    pub handshake_timeout: Duration,

    pub backoff: BackoffPolicy,

    /// Re-check interval while the power binding reports off
    pub power_probe_interval: Duration,

    /// Consecutive failures logged at warn level before going quiet
    pub loud_failure_count: u32,

    /// Consecutive failures between MAC based address lookups
    pub rediscover_after: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            port: DEFAULT_WS_PORT,
            probe_interval: Duration::from_secs(10),
            stale_multiplier: 3,
            handshake_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            power_probe_interval: Duration::from_secs(10),
            loud_failure_count: 3,
            rediscover_after: 3,
        }
    }
}

impl Options {
    pub fn stale_after(&self) -> Duration {
        self.probe_interval.saturating_mul(self.stale_multiplier.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    BackingOff,
    PowerOffIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    State(ConnectionState),
    Frame(RawFrame),
    AddressChanged { from: String, to: String },
    MacLearned(String),
    /// An established session ended
    Lost(TransportError),
}

/// A payload waiting to be written on the open session. The result tells the
/// caller whether the socket accepted it.
#[derive(Debug)]
pub struct Outbound {
    pub text: String,
    pub accepted: oneshot::Sender<Result<(), TransportError>>,
}

impl Outbound {
    pub fn new(text: String) -> (Self, oneshot::Receiver<Result<(), TransportError>>) {
        let (accepted, rx) = oneshot::channel();
        (Self { text, accepted }, rx)
    }

    fn reject(self) {
        let _ = self.accepted.send(Err(TransportError::Closed));
    }
}

/// Network lookups keyed by hardware address
#[async_trait]
pub trait Discovery: Send + Sync {
    /// MAC address currently answering at `host`
    async fn mac_for(&self, host: &str) -> Option<String>;

    /// Current address of the printer with `mac`; `last_host` narrows the search
    async fn host_for(&self, mac: &str, last_host: &str) -> Option<String>;
}

/// Discovery that never finds anything
#[derive(Debug, Default, Clone)]
pub struct NoDiscovery;

#[async_trait]
impl Discovery for NoDiscovery {
    async fn mac_for(&self, _host: &str) -> Option<String> {
        None
    }

    async fn host_for(&self, _mac: &str, _last_host: &str) -> Option<String> {
        None
    }
}

enum Wake {
    Elapsed,
    Power,
    Shutdown,
}

enum SessionEnd {
    Shutdown,
    PowerOff,
    Lost(TransportError),
}

pub struct ConnectionManager {
    id: String,
    options: Options,
    host: String,
    fallback_host: Option<String>,
    mac: watch::Receiver<Option<String>>,
    connector: Arc<dyn Connector>,
    discovery: Arc<dyn Discovery>,
    power: PowerBinding,
    health: Arc<ConnectionHealth>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<ConnectionEvent>,
}

/// Shared handles a connection manager is wired to
pub struct Links {
    pub connector: Arc<dyn Connector>,
    pub discovery: Arc<dyn Discovery>,
    pub power: PowerBinding,
    pub health: Arc<ConnectionHealth>,
    pub mac: watch::Receiver<Option<String>>,
    pub events: mpsc::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        options: Options,
        links: Links,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let manager = Self {
            id: id.into(),
            options,
            host: host.into(),
            fallback_host: None,
            mac: links.mac,
            connector: links.connector,
            discovery: links.discovery,
            power: links.power,
            health: links.health,
            state,
            events: links.events,
        };
        (manager, state_rx)
    }

    /// Address to retry once if the first connect to `host` fails.
    pub fn with_fallback_host(mut self, host: impl Into<String>) -> Self {
        self.fallback_host = Some(host.into());
        self
    }

    /// Run until shutdown. Only one attempt or session is ever in flight.
    pub async fn run(
        mut self,
        mut outbound: mpsc::Receiver<Outbound>,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) {
        info!("Connection manager for {} starting ({})", self.id, self.host);

        loop {
            let session = if self.power.is_off() {
                if self.transition(ConnectionState::PowerOffIdle).await {
                    info!("{}: power is off, suspending connection attempts", self.id);
                }

                // A switch in an unknown state may still be powering the printer.
                let probe = match self.power.state() {
                    PowerState::Unknown => match self.try_connect().await {
                        Ok(session) => Some(session),
                        Err(e) => {
                            debug!("{}: power probe failed: {}", self.id, e);
                            None
                        }
                    },
                    _ => None,
                };
                match probe {
                    Some(session) => session,
                    None => {
                        let delay = self.options.power_probe_interval;
                        match self.pause(delay, &mut outbound, &mut shutdown_signal).await {
                            Wake::Shutdown => break,
                            Wake::Elapsed | Wake::Power => continue,
                        }
                    }
                }
            } else {
                self.transition(ConnectionState::Connecting).await;
                match self.try_connect().await {
                    Ok(session) => session,
                    Err(e) => {
                        let failures = self.health.on_failure(&e);
                        if failure_level(failures, self.options.loud_failure_count) == Level::WARN {
                            warn!(
                                "{}: connection to {} failed (attempt {}): {}",
                                self.id, self.host, failures, e
                            );
                        } else {
                            debug!(
                                "{}: connection to {} failed (attempt {}): {}",
                                self.id, self.host, failures, e
                            );
                        }

                        if self.fall_back().await || self.rediscover(failures).await {
                            continue;
                        }

                        let delay = self.options.backoff.delay(failures);
                        self.transition(ConnectionState::BackingOff).await;
                        debug!("{}: retrying in {:?}", self.id, delay);
                        match self.pause(delay, &mut outbound, &mut shutdown_signal).await {
                            Wake::Shutdown => break,
                            Wake::Elapsed | Wake::Power => continue,
                        }
                    }
                }
            };

            let previous_failures = self.health.consecutive_failures();
            self.health.on_connected();
            self.fallback_host = None;
            if previous_failures > self.options.loud_failure_count {
                info!(
                    "{}: reconnected to {} after {} failed attempts",
                    self.id, self.host, previous_failures
                );
            } else {
                info!("{}: connected to {}", self.id, self.host);
            }
            self.transition(ConnectionState::Connected).await;
            self.learn_mac().await;

            match self.run_session(session, &mut outbound, &mut shutdown_signal).await {
                SessionEnd::Shutdown => {
                    self.health.on_disconnected(None);
                    break;
                }
                SessionEnd::PowerOff => {
                    self.health.on_disconnected(None);
                    info!("{}: power switched off, closing connection", self.id);
                }
                SessionEnd::Lost(e) => {
                    self.health.on_disconnected(Some(&e));
                    warn!("{}: connection to {} lost: {}", self.id, self.host, e);
                    self.transition(ConnectionState::Disconnected).await;
                    self.emit(ConnectionEvent::Lost(e)).await;

                    let delay = self.options.backoff.base_delay;
                    if let Wake::Shutdown = self.pause(delay, &mut outbound, &mut shutdown_signal).await {
                        break;
                    }
                }
            }
        }

        self.transition(ConnectionState::Disconnected).await;
        info!("Connection manager for {} stopped", self.id);
    }

    async fn try_connect(&self) -> Result<Box<dyn Session>, TransportError> {
        let url = transport::endpoint(&self.host, self.options.port)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        trace!("{}: connecting to {}", self.id, url);
        match tokio::time::timeout(self.options.handshake_timeout, self.connector.connect(&url)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::HandshakeTimeout),
        }
    }

    async fn run_session(
        &mut self,
        mut session: Box<dyn Session>,
        outbound: &mut mpsc::Receiver<Outbound>,
        shutdown_signal: &mut Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> SessionEnd {
        for request in [Request::printer_info(), Request::cfs_info()] {
            if let Err(e) = session.send(request.to_text()).await {
                session.close().await;
                return SessionEnd::Lost(e);
            }
        }

        let probe_interval = self.options.probe_interval;
        let stale_after = self.options.stale_after();
        let mut probe = tokio::time::interval_at(Instant::now() + probe_interval, probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown_signal.as_mut() => {
                    session.close().await;
                    return SessionEnd::Shutdown;
                }
                state = self.power.changed() => {
                    if state == PowerState::Off {
                        session.close().await;
                        return SessionEnd::PowerOff;
                    }
                }
                inbound = session.recv() => {
                    let inbound = match inbound {
                        Some(Ok(inbound)) => inbound,
                        Some(Err(e)) => {
                            session.close().await;
                            return SessionEnd::Lost(e);
                        }
                        None => return SessionEnd::Lost(TransportError::Closed),
                    };
                    last_inbound = Instant::now();
                    match inbound {
                        Inbound::Text(text) => {
                            self.health.on_message();
                            if is_heartbeat(&text) {
                                trace!("{}: heartbeat", self.id);
                                if let Err(e) = session.send(HEARTBEAT_REPLY.to_string()).await {
                                    session.close().await;
                                    return SessionEnd::Lost(e);
                                }
                            }
                            self.emit(ConnectionEvent::Frame(RawFrame::Text(text))).await;
                        }
                        Inbound::Binary(bytes) => {
                            self.health.on_message();
                            self.emit(ConnectionEvent::Frame(RawFrame::Binary(bytes))).await;
                        }
                        Inbound::Control => {}
                    }
                }
                _ = probe.tick() => {
                    if last_inbound.elapsed() >= stale_after {
                        session.close().await;
                        return SessionEnd::Lost(TransportError::Stale);
                    }
                    if let Err(e) = session.send(Request::printer_info().to_text()).await {
                        session.close().await;
                        return SessionEnd::Lost(e);
                    }
                }
                Some(out) = outbound.recv() => {
                    let result = session.send(out.text).await;
                    let failed = result.as_ref().err().cloned();
                    let _ = out.accepted.send(result);
                    if let Some(e) = failed {
                        session.close().await;
                        return SessionEnd::Lost(e);
                    }
                }
            }
        }
    }

    /// Sleep while no session is open. Writes that arrive meanwhile are
    /// refused rather than queued.
    async fn pause(
        &mut self,
        delay: Duration,
        outbound: &mut mpsc::Receiver<Outbound>,
        shutdown_signal: &mut Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Wake {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = shutdown_signal.as_mut() => return Wake::Shutdown,
                _ = &mut sleep => return Wake::Elapsed,
                _ = self.power.changed() => return Wake::Power,
                Some(out) = outbound.recv() => out.reject(),
            }
        }
    }

    /// Drop a remembered address that did not answer and go back to the
    /// configured one. Only ever happens once per manager.
    async fn fall_back(&mut self) -> bool {
        let Some(host) = self.fallback_host.take() else {
            return false;
        };
        if host == self.host {
            return false;
        }
        info!("{}: {} did not answer, trying configured address {}", self.id, self.host, host);
        let from = std::mem::replace(&mut self.host, host.clone());
        self.emit(ConnectionEvent::AddressChanged { from, to: host }).await;
        true
    }

    /// Look the printer up by MAC after repeated failures. Returns true when
    /// it answered at a new address and should be retried right away.
    async fn rediscover(&mut self, failures: u32) -> bool {
        let every = self.options.rediscover_after;
        if every == 0 || failures % every != 0 {
            return false;
        }
        let mac = match self.mac.borrow().clone() {
            Some(mac) => mac,
            None => return false,
        };

        debug!("{}: looking for {} on the network", self.id, mac);
        match self.discovery.host_for(&mac, &self.host).await {
            Some(new_host) if new_host != self.host => {
                info!("{}: printer {} moved from {} to {}", self.id, mac, self.host, new_host);
                let from = std::mem::replace(&mut self.host, new_host.clone());
                self.emit(ConnectionEvent::AddressChanged { from, to: new_host }).await;
                true
            }
            _ => false,
        }
    }

    async fn learn_mac(&mut self) {
        if self.mac.borrow().is_some() {
            return;
        }
        let learned = self.discovery.mac_for(&self.host).await;
        if let Some(mac) = learned.as_deref().and_then(normalize_mac) {
            debug!("{}: learned MAC {} for {}", self.id, mac, self.host);
            self.emit(ConnectionEvent::MacLearned(mac)).await;
        }
    }

    async fn transition(&self, next: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            trace!("{}: connection state {:?}", self.id, next);
            self.emit(ConnectionEvent::State(next)).await;
        }
        changed
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).await.is_err() {
            trace!("{}: device task is gone, dropping event", self.id);
        }
    }
}

/// Level for a failed attempt: the first `loud` failures in a row are
/// warnings, later ones only show up at debug.
pub(crate) fn failure_level(failures: u32, loud: u32) -> Level {
    if failures <= loud {
        Level::WARN
    } else {
        Level::DEBUG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_level() {
        assert_eq!(failure_level(1, 3), Level::WARN);
        assert_eq!(failure_level(3, 3), Level::WARN);
        assert_eq!(failure_level(4, 3), Level::DEBUG);
        assert_eq!(failure_level(40, 3), Level::DEBUG);
        assert_eq!(failure_level(1, 0), Level::DEBUG);
    }

    #[test]
    fn test_stale_window() {
        let options = Options {
            probe_interval: Duration::from_secs(5),
            stale_multiplier: 3,
            ..Default::default()
        };
        assert_eq!(options.stale_after(), Duration::from_secs(15));

        let degenerate = Options {
            stale_multiplier: 0,
            ..options
        };
        assert_eq!(degenerate.stale_after(), Duration::from_secs(5));
    }

    #[test]
    fn test_outbound_reject() {
        let (out, mut rx) = Outbound::new("{}".to_string());
        out.reject();
        assert_eq!(rx.try_recv().unwrap(), Err(TransportError::Closed));
    }
}
