//! DNS interceptor: observes UDP/53 on the monitor interface, applies
//! policy, forges replies for blocked queries, and records everything.
//!
//! Allowed queries are not touched; kernel forwarding carries them to the
//! real resolver. Blocked queries are answered in the same capture tick
//! (NXDOMAIN or redirect) or silenced (drop mode, which relies on the
//! udp/53 forward filter installed by the control plane). Responses are
//! linked to their query by transaction id and client address; unlinked
//! responses are still recorded.

use crate::config::DnsMode;
use crate::events::{Event, EventSink};
use crate::net::arp::FrameSender;
use crate::net::iface::{Interface, NetError};
use crate::policy::SharedPolicy;
use crate::store::Store;
use crate::types::DnsQueryRecord;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::packet::{MutablePacket, Packet};
use pnet::util::MacAddr;
use serde_json::json;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::packet as dns_packet;

/// Unlinked queries are flushed to the store after this long.
const PENDING_TTL: Duration = Duration::from_secs(3);

pub struct DnsInterceptor {
    iface: Interface,
    policy: SharedPolicy,
    store: Arc<Store>,
    sink: EventSink,
    mode: Arc<Mutex<DnsMode>>,
    redirect_ip: Ipv4Addr,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DnsInterceptor {
    pub fn new(
        iface: Interface,
        policy: SharedPolicy,
        store: Arc<Store>,
        sink: EventSink,
        mode: DnsMode,
        redirect_ip: Ipv4Addr,
    ) -> Self {
        Self {
            iface,
            policy,
            store,
            sink,
            mode: Arc::new(Mutex::new(mode)),
            redirect_ip,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn set_mode(&self, mode: DnsMode) {
        *self.mode.lock().unwrap() = mode;
        let mut detail = serde_json::Map::new();
        detail.insert("mode".to_string(), json!(mode.as_str()));
        self.sink.emit(Event::ConfigUpdate {
            action: "dns_mode".to_string(),
            detail,
        });
    }

    pub fn mode(&self) -> DnsMode {
        *self.mode.lock().unwrap()
    }

    /// Start the capture thread.
    pub fn start(&self) -> Result<(), NetError> {
        let (tx, mut rx) = crate::net::arp::open_channel(&self.iface)?;
        self.running.store(true, Ordering::SeqCst);

        let mut state = CaptureState {
            our_mac: self.iface.mac,
            policy: self.policy.clone(),
            store: self.store.clone(),
            sink: self.sink.clone(),
            mode: self.mode.clone(),
            redirect_ip: self.redirect_ip,
            pending: HashMap::new(),
        };
        let running = self.running.clone();
        let handle = std::thread::Builder::new()
            .name("dns-capture".to_string())
            .spawn(move || {
                let mut sender = crate::net::arp::DatalinkSender(tx);
                while running.load(Ordering::SeqCst) {
                    match rx.next() {
                        Ok(frame) => state.process_frame(frame, &mut sender),
                        // Read timeout; fall through to flush.
                        Err(_) => {}
                    }
                    state.flush_stale();
                }
                state.flush_all();
            })?;
        *self.thread.lock().unwrap() = Some(handle);

        let mut detail = serde_json::Map::new();
        detail.insert("interface".to_string(), json!(self.iface.name));
        detail.insert("mode".to_string(), json!(self.mode().as_str()));
        self.sink.emit(Event::Started {
            component: "dns_interceptor".to_string(),
            detail,
        });
        info!("DNS interceptor started on {}", self.iface.name);
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.sink.emit(Event::Stopped {
            component: "dns_interceptor".to_string(),
            detail: serde_json::Map::new(),
        });
        info!("DNS interceptor stopped");
    }
}

/// Capture-thread state. Separated from the handle so tests can feed
/// crafted frames without a datalink channel.
pub(crate) struct CaptureState {
    pub our_mac: MacAddr,
    pub policy: SharedPolicy,
    pub store: Arc<Store>,
    pub sink: EventSink,
    pub mode: Arc<Mutex<DnsMode>>,
    pub redirect_ip: Ipv4Addr,
    /// Queries awaiting their response, keyed by (txid, client address).
    pending: HashMap<(u16, Ipv4Addr), (DnsQueryRecord, Instant)>,
}

impl CaptureState {
    #[cfg(test)]
    pub(crate) fn new(
        our_mac: MacAddr,
        policy: SharedPolicy,
        store: Arc<Store>,
        sink: EventSink,
        mode: DnsMode,
        redirect_ip: Ipv4Addr,
    ) -> Self {
        Self {
            our_mac,
            policy,
            store,
            sink,
            mode: Arc::new(Mutex::new(mode)),
            redirect_ip,
            pending: HashMap::new(),
        }
    }

    /// Handle one link-layer frame.
    pub(crate) fn process_frame(&mut self, frame: &[u8], reply_out: &mut dyn FrameSender) {
        let Some(eth) = EthernetPacket::new(frame) else {
            return;
        };
        if eth.get_ethertype() != EtherTypes::Ipv4 {
            return;
        }
        // Skip our own transmissions (forwarded copies carry our MAC).
        if eth.get_source() == self.our_mac {
            return;
        }
        let Some(ip) = Ipv4Packet::new(eth.payload()) else {
            return;
        };
        if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
            return;
        }
        let Some(udp) = UdpPacket::new(ip.payload()) else {
            return;
        };

        if udp.get_destination() == 53 {
            self.handle_query(&eth, &ip, &udp, reply_out);
        } else if udp.get_source() == 53 {
            self.handle_response(&ip, &udp);
        }
    }

    fn handle_query(
        &mut self,
        eth: &EthernetPacket<'_>,
        ip: &Ipv4Packet<'_>,
        udp: &UdpPacket<'_>,
        reply_out: &mut dyn FrameSender,
    ) {
        let Some(packet) = dns_packet::parse(udp.payload()) else {
            // Malformed queries are discarded without error propagation.
            return;
        };
        if packet.is_response {
            return;
        }
        let Some(domain) = packet.query_name() else {
            return;
        };
        let client_ip = ip.get_source();
        let qtype = packet.query_type().unwrap_or_else(|| "A".to_string());

        let mut record = DnsQueryRecord::new(&client_ip.to_string(), &domain, &qtype);
        record.device_id = self.store.device_id_for_ip(&record.device_ip);

        let decision = self.policy.read().unwrap().check(&domain, "", "");
        if !decision.should_block {
            // Kernel forwarding carries the query upstream; hold the record
            // until its response arrives.
            self.pending
                .insert((packet.id, client_ip), (record, Instant::now()));
            return;
        }

        record.blocked = true;
        record.block_reason = Some(decision.reason.clone());
        record.category = decision.category.clone();

        // Reply synthesis happens in this same capture tick.
        let mode = *self.mode.lock().unwrap();
        let payload = match mode {
            DnsMode::Nxdomain => Some(dns_packet::build_nxdomain(&packet)),
            DnsMode::Redirect => Some(dns_packet::build_redirect(&packet, self.redirect_ip)),
            // The forward filter keeps the query from going upstream.
            DnsMode::Drop => None,
        };
        if let Some(payload) = payload {
            let frame = build_udp_frame(
                self.our_mac,
                eth.get_source(),
                ip.get_destination(),
                client_ip,
                53,
                udp.get_source(),
                &payload,
            );
            if let Err(e) = reply_out.send_frame(&frame) {
                warn!("failed to send forged DNS reply: {}", e);
            }
        }
        debug!("blocked DNS query {} from {} ({})", domain, client_ip, mode.as_str());

        self.sink.emit(Event::Blocked {
            reason: decision.reason,
            host: domain.clone(),
            url: None,
            device_ip: client_ip.to_string(),
        });
        self.persist(record);
    }

    fn handle_response(&mut self, ip: &Ipv4Packet<'_>, udp: &UdpPacket<'_>) {
        let Some(packet) = dns_packet::parse(udp.payload()) else {
            return;
        };
        if !packet.is_response {
            return;
        }
        let client_ip = ip.get_destination();
        match self.pending.remove(&(packet.id, client_ip)) {
            Some((mut record, _)) => {
                let ips = packet.resolved_ips();
                if !ips.is_empty() {
                    record.response_ip = Some(ips.join(","));
                }
                record.response_ttl = packet.answer_ttl();
                self.persist(record);
            }
            None => {
                // Unlinked response: still stored, attributed to the client.
                let Some(domain) = packet.query_name() else {
                    return;
                };
                let qtype = packet.query_type().unwrap_or_else(|| "A".to_string());
                let mut record = DnsQueryRecord::new(&client_ip.to_string(), &domain, &qtype);
                record.device_id = self.store.device_id_for_ip(&record.device_ip);
                let ips = packet.resolved_ips();
                if !ips.is_empty() {
                    record.response_ip = Some(ips.join(","));
                }
                record.response_ttl = packet.answer_ttl();
                self.persist(record);
            }
        }
    }

    /// Queries whose response never arrived are recorded as-is.
    fn flush_stale(&mut self) {
        let now = Instant::now();
        let stale: Vec<(u16, Ipv4Addr)> = self
            .pending
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) > PENDING_TTL)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some((record, _)) = self.pending.remove(&key) {
                self.persist(record);
            }
        }
    }

    fn flush_all(&mut self) {
        let drained: Vec<DnsQueryRecord> =
            self.pending.drain().map(|(_, (record, _))| record).collect();
        for record in drained {
            self.persist(record);
        }
    }

    fn persist(&self, record: DnsQueryRecord) {
        if let Err(e) = self.store.insert_dns(&record) {
            self.sink.emit(Event::error("dns", &e));
            warn!("failed to persist DNS record: {}", e);
            return;
        }
        self.sink.emit(Event::Dns { record });
    }
}

/// Wrap a DNS payload in UDP/IPv4/Ethernet with correct checksums.
fn build_udp_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let ip_len = 20 + udp_len;
    let mut buf = vec![0u8; 14 + ip_len];

    let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
    eth.set_destination(dst_mac);
    eth.set_source(src_mac);
    eth.set_ethertype(EtherTypes::Ipv4);

    {
        let mut ip = MutableIpv4Packet::new(eth.payload_mut()).unwrap();
        ip.set_version(4);
        ip.set_header_length(5);
        ip.set_total_length(ip_len as u16);
        ip.set_ttl(64);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
        ip.set_source(src_ip);
        ip.set_destination(dst_ip);
        {
            let mut udp = MutableUdpPacket::new(ip.payload_mut()).unwrap();
            udp.set_source(src_port);
            udp.set_destination(dst_port);
            udp.set_length(udp_len as u16);
            udp.set_payload(payload);
            let checksum = udp::ipv4_checksum(&udp.to_immutable(), &src_ip, &dst_ip);
            udp.set_checksum(checksum);
        }
        let checksum = ipv4::checksum(&ip.to_immutable());
        ip.set_checksum(checksum);
    }
    buf
}
