//! Device scanner: periodic ARP sweep of the local /24.
//!
//! Each sweep broadcasts a who-has request for every host address, collects
//! replies for a short window, enriches them (reverse DNS via the gateway
//! resolver, OUI vendor), and upserts device records. Newly discovered
//! devices are emitted as `device` events.

use super::arp;
use super::iface::{vendor_for_mac, Interface};
use crate::dns::packet as dns_packet;
use crate::events::{Event, EventSink};
use crate::store::Store;
use crate::types::{canonical_mac, now_rfc3339, Device};
use pnet::util::MacAddr;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Reply collection window per sweep.
const SWEEP_WINDOW: Duration = Duration::from_secs(3);

pub struct DeviceScanner {
    iface: Interface,
    store: Arc<Store>,
    sink: EventSink,
    running: Arc<AtomicBool>,
}

impl DeviceScanner {
    pub fn new(iface: Interface, store: Arc<Store>, sink: EventSink) -> Self {
        Self {
            iface,
            store,
            sink,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run sweeps every `interval` seconds until `stop` is called.
    pub async fn run(self: Arc<Self>, interval_secs: u64) {
        self.running.store(true, Ordering::SeqCst);
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(5)));
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let scanner = self.clone();
            let result = tokio::task::spawn_blocking(move || scanner.sweep()).await;
            match result {
                Ok(Ok(found)) => debug!("ARP sweep saw {} devices", found),
                Ok(Err(e)) => warn!("ARP sweep failed: {}", e),
                Err(e) => warn!("ARP sweep task panicked: {}", e),
            }
        }
        info!("device scanner stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One immediate sweep outside the periodic cadence. Blocking.
    pub fn sweep_now(&self) {
        match self.sweep() {
            Ok(found) => debug!("on-demand sweep saw {} devices", found),
            Err(e) => warn!("on-demand sweep failed: {}", e),
        }
    }

    /// One blocking sweep of the local /24.
    fn sweep(&self) -> Result<usize, super::iface::NetError> {
        let (mut tx, mut rx) = arp::open_channel(&self.iface)?;
        let base = self.iface.network_base().octets();

        for host in 1..=254u8 {
            let target = Ipv4Addr::new(base[0], base[1], base[2], host);
            if target == self.iface.ip {
                continue;
            }
            let request = arp::build_arp_request(self.iface.mac, self.iface.ip, target);
            if let Some(Err(e)) = tx.send_to(&request, None) {
                warn!("sweep send to {} failed: {}", target, e);
                break;
            }
        }

        let deadline = Instant::now() + SWEEP_WINDOW;
        let mut seen = 0usize;
        while Instant::now() < deadline {
            let frame = match rx.next() {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            let Some(reply) = arp::parse_arp(frame) else {
                continue;
            };
            if reply.operation != pnet::packet::arp::ArpOperations::Reply {
                continue;
            }
            seen += 1;
            self.record_sighting(reply.sender_ip, reply.sender_mac);
        }
        Ok(seen)
    }

    /// Upsert one sighting; emits a `device` event for unknown devices.
    fn record_sighting(&self, ip: Ipv4Addr, mac: MacAddr) {
        let mac_str = canonical_mac(&mac.to_string());
        let known = match self.store.device_by_mac(&mac_str) {
            Ok(existing) => existing.is_some(),
            Err(e) => {
                warn!("device lookup failed: {}", e);
                return;
            }
        };

        let mut device = Device::new(&mac_str, &ip.to_string());
        device.is_gateway = ip == self.iface.gateway_ip;
        device.is_self = ip == self.iface.ip;
        device.vendor = vendor_for_mac(&mac_str).map(str::to_string);
        device.last_seen = now_rfc3339();
        if !known {
            device.hostname = reverse_dns(ip, self.iface.gateway_ip);
        }

        match self.store.upsert_device(&device) {
            Ok(stored) => {
                if !known {
                    info!(
                        "new device {} at {} ({})",
                        stored.mac,
                        stored.ip,
                        stored.vendor.as_deref().unwrap_or("unknown vendor")
                    );
                    self.sink.emit(Event::Device { device: stored });
                }
            }
            Err(e) => warn!("device upsert failed: {}", e),
        }
    }
}

/// PTR lookup against the segment's resolver. Best-effort with a 1 s
/// timeout.
pub fn reverse_dns(ip: Ipv4Addr, resolver: Ipv4Addr) -> Option<String> {
    let o = ip.octets();
    let ptr_name = format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0]);
    let query = dns_packet::build_query(rand::random(), &ptr_name, dns_packet::rtype::PTR);

    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.set_read_timeout(Some(Duration::from_secs(1))).ok()?;
    socket
        .send_to(&query, SocketAddr::from((resolver, 53)))
        .ok()?;

    let mut buf = [0u8; 1500];
    let (len, _) = socket.recv_from(&mut buf).ok()?;
    let reply = dns_packet::parse(&buf[..len])?;
    reply
        .answers
        .iter()
        .find(|r| r.rtype == dns_packet::rtype::PTR)
        .map(|r| r.rdata.0.trim_end_matches('.').to_string())
}
