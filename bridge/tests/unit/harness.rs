//! Scripted printer links for driving devices without a network

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use url::Url;

use crealink::connection::manager::Discovery;
use crealink::connection::transport::{Connector, Inbound, Session};
use crealink::device::machine::DeviceView;
use crealink::device::runtime::{DeviceConfig, DeviceHandle, DeviceServices};
use crealink::errors::TransportError;
use crealink::protocol::message::Request;
use crealink::storage::device::MemoryDeviceStore;

const WAIT: Duration = Duration::from_secs(120);

/// Bridge side of a scripted socket
pub struct ScriptedSession {
    inbound: mpsc::UnboundedReceiver<Result<Inbound, TransportError>>,
    sent: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sent
            .send(text)
            .map_err(|_| TransportError::Send("printer hung up".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

/// Printer side of a scripted socket
pub struct PrinterSim {
    inbound: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl PrinterSim {
    fn pair() -> (ScriptedSession, PrinterSim) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        (
            ScriptedSession {
                inbound: inbound_rx,
                sent: sent_tx,
            },
            PrinterSim {
                inbound: inbound_tx,
                sent: sent_rx,
            },
        )
    }

    pub fn push(&self, frame: Value) {
        self.push_text(&frame.to_string());
    }

    pub fn push_text(&self, text: &str) {
        let _ = self.inbound.send(Ok(Inbound::Text(text.to_string())));
    }

    /// Next text the bridge wrote, including probes.
    pub async fn next_sent(&mut self) -> String {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("bridge sent nothing")
            .expect("bridge closed the session")
    }

    /// Next text that is not a liveness probe.
    pub async fn next_command(&mut self) -> String {
        let probe = Request::printer_info().to_text();
        loop {
            let text = self.next_sent().await;
            if text != probe {
                return text;
            }
        }
    }

    /// The two requests every session opens with.
    pub async fn expect_handshake(&mut self) {
        assert_eq!(self.next_sent().await, Request::printer_info().to_text());
        assert_eq!(self.next_sent().await, Request::cfs_info().to_text());
    }

    /// True once the bridge dropped its end.
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }

    pub fn hang_up(self) {}
}

enum Attempt {
    Refuse,
    Accept(ScriptedSession),
}

/// Connector that plays back a fixed list of outcomes, then refuses.
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Attempt>>,
    attempts: Mutex<Vec<(Instant, Url)>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse(&self, count: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..count {
            script.push_back(Attempt::Refuse);
        }
    }

    /// Queue a successful connection and return the printer end.
    pub fn accept(&self) -> PrinterSim {
        let (session, printer) = PrinterSim::pair();
        self.script.lock().unwrap().push_back(Attempt::Accept(session));
        printer
    }

    pub fn attempts(&self) -> Vec<(Instant, Url)> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Session>, TransportError> {
        self.attempts.lock().unwrap().push((Instant::now(), url.clone()));
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Attempt::Accept(session)) => Ok(Box::new(session)),
            Some(Attempt::Refuse) | None => {
                Err(TransportError::Connect("connection refused".to_string()))
            }
        }
    }
}

/// Discovery with fixed answers
#[derive(Default)]
pub struct FixedDiscovery {
    pub mac: Option<String>,
    pub moved_to: Option<String>,
    lookups: AtomicUsize,
}

impl FixedDiscovery {
    pub fn new(mac: Option<&str>, moved_to: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            mac: mac.map(str::to_string),
            moved_to: moved_to.map(str::to_string),
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for FixedDiscovery {
    async fn mac_for(&self, _host: &str) -> Option<String> {
        self.mac.clone()
    }

    async fn host_for(&self, _mac: &str, _last_host: &str) -> Option<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.moved_to.clone()
    }
}

pub async fn spawn_device(
    config: DeviceConfig,
    connector: &Arc<ScriptedConnector>,
    store: &Arc<MemoryDeviceStore>,
    discovery: Arc<dyn Discovery>,
) -> DeviceHandle {
    let services = DeviceServices {
        store: store.clone(),
        connector: connector.clone(),
        discovery,
    };
    DeviceHandle::spawn(config, services).await.unwrap()
}

/// Wait until the published view satisfies `pred`.
pub async fn wait_for(
    views: &mut watch::Receiver<Arc<DeviceView>>,
    what: &str,
    pred: impl Fn(&DeviceView) -> bool,
) -> Arc<DeviceView> {
    match tokio::time::timeout(WAIT, views.wait_for(|view| pred(view))).await {
        Ok(Ok(view)) => view.clone(),
        _ => panic!("timed out waiting for {}", what),
    }
}

/// The identity frame a K2 Plus sends in reply to `reqPrinterPara`.
pub fn k2_identity() -> Value {
    serde_json::json!({
        "model": "K2 Plus",
        "modelVersion": "Printer HW Ver: F008; Printer SW Ver: 1.1.2.10",
        "hostname": "K2-Plus-1A2B",
    })
}
