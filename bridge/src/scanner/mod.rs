//! Printer discovery on the local network using async TCP probing.
//!
//! No external binaries (nmap, arp) are required. MAC addresses come from
//! the kernel ARP cache, which the probes themselves populate.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::connection::manager::Discovery;
use crate::device::media::{MJPEG_PORT, WEBRTC_SIGNALING_PORT};
use crate::protocol::frame::normalize_mac;
use crate::protocol::DEFAULT_WS_PORT;

const ARP_TABLE: &str = "/proc/net/arp";

/// Scan options
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Printer WebSocket port
    pub port: u16,

    /// Max concurrent TCP probes to avoid overwhelming the local network
    pub max_concurrent: usize,

    /// Per-probe timeout
    pub probe_timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_WS_PORT,
            max_concurrent: 64,
            probe_timeout: Duration::from_millis(400),
        }
    }
}

/// A printer found during a subnet scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPrinter {
    pub ip: String,

    pub mac: Option<String>,

    /// MJPEG camera port answered
    pub mjpeg: bool,

    /// WebRTC signaling port answered
    pub webrtc: bool,
}

/// Scan every host in `net` for an open printer port.
///
/// Best-effort: hosts that do not answer within the timeout are skipped.
pub async fn scan_subnet(net: Ipv4Net, options: &ScanOptions) -> Vec<DiscoveredPrinter> {
    let hosts: Vec<Ipv4Addr> = net.hosts().collect();
    info!("Scanning {} hosts in {} for port {}", hosts.len(), net, options.port);

    let semaphore = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
    let mut handles = Vec::with_capacity(hosts.len());

    for ip in hosts {
        let sem = Arc::clone(&semaphore);
        let options = options.clone();
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire().await.ok()?;
            let ip = IpAddr::V4(ip);
            if !probe(ip, options.port, options.probe_timeout).await {
                return None;
            }
            Some(DiscoveredPrinter {
                ip: ip.to_string(),
                mac: None,
                mjpeg: probe(ip, MJPEG_PORT, options.probe_timeout).await,
                webrtc: probe(ip, WEBRTC_SIGNALING_PORT, options.probe_timeout).await,
            })
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        if let Ok(Some(printer)) = handle.await {
            results.push(printer);
        }
    }

    let arp = read_arp_table().await;
    for printer in &mut results {
        printer.mac = arp.get(&printer.ip).cloned();
        debug!("Found printer: {} mac={:?}", printer.ip, printer.mac);
    }

    info!("Scan complete: {} printers found", results.len());
    results
}

async fn probe(ip: IpAddr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::new(ip, port);
    matches!(tokio::time::timeout(timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// Parse `/proc/net/arp` into `ip -> mac`. Incomplete entries are skipped.
pub fn parse_arp_table(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            let ip = columns.first()?;
            let mac = normalize_mac(columns.get(3)?)?;
            (mac != "00:00:00:00:00:00").then(|| (ip.to_string(), mac))
        })
        .collect()
}

pub async fn read_arp_table() -> HashMap<String, String> {
    match tokio::fs::read_to_string(ARP_TABLE).await {
        Ok(contents) => parse_arp_table(&contents),
        Err(e) => {
            debug!("ARP table unavailable: {}", e);
            HashMap::new()
        }
    }
}

/// The /24 around an IPv4 address
pub fn neighbourhood(host: &str) -> Option<Ipv4Net> {
    let ip: Ipv4Addr = host.parse().ok()?;
    Ipv4Net::new(ip, 24).ok().map(|net| net.trunc())
}

/// MAC based lookups over the ARP cache and subnet scans
#[derive(Debug, Clone, Default)]
pub struct SubnetDiscovery {
    options: ScanOptions,
    subnets: Vec<Ipv4Net>,
}

impl SubnetDiscovery {
    pub fn new(options: ScanOptions, subnets: Vec<Ipv4Net>) -> Self {
        Self { options, subnets }
    }

    fn candidate_subnets(&self, last_host: &str) -> Vec<Ipv4Net> {
        let mut subnets = self.subnets.clone();
        if let Some(net) = neighbourhood(last_host) {
            if !subnets.contains(&net) {
                subnets.push(net);
            }
        }
        subnets
    }
}

fn find_host(arp: &HashMap<String, String>, mac: &str) -> Option<String> {
    arp.iter()
        .find(|(_, entry)| entry.as_str() == mac)
        .map(|(ip, _)| ip.clone())
}

#[async_trait]
impl Discovery for SubnetDiscovery {
    async fn mac_for(&self, host: &str) -> Option<String> {
        read_arp_table().await.get(host).cloned()
    }

    async fn host_for(&self, mac: &str, last_host: &str) -> Option<String> {
        let mac = normalize_mac(mac)?;

        // Cached neighbour entries are cheap; only trust them if the port answers.
        if let Some(ip) = find_host(&read_arp_table().await, &mac) {
            if let Ok(addr) = ip.parse::<IpAddr>() {
                if probe(addr, self.options.port, self.options.probe_timeout).await {
                    return Some(ip);
                }
            }
        }

        for net in self.candidate_subnets(last_host) {
            let found = scan_subnet(net, &self.options).await;
            if let Some(printer) = found.into_iter().find(|p| p.mac.as_deref() == Some(mac.as_str())) {
                return Some(printer.ip);
            }
        }
        warn!("Printer {} not found on the network", mac);
        None
    }
}
