//! ARP frame construction, parsing, and broadcast resolution.
//!
//! All ARP frames in the system are built and decoded here; the engine,
//! scanner, and resolver share this codec.

use super::iface::{Interface, NetError};
use pnet::datalink::{self, Channel, Config, DataLinkReceiver, DataLinkSender};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperation, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::{MutablePacket, Packet};
use pnet::util::MacAddr;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Ethernet header plus a 28-byte IPv4 ARP payload.
pub const ARP_FRAME_LEN: usize = 42;

/// Resolution parameters (3 attempts of 3 s each).
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);
pub const RESOLVE_ATTEMPTS: u32 = 3;

/// A decoded ARP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpFrame {
    pub operation: ArpOperation,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

fn build_frame(
    operation: ArpOperation,
    eth_dst: MacAddr,
    eth_src: MacAddr,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> [u8; ARP_FRAME_LEN] {
    let mut buf = [0u8; ARP_FRAME_LEN];
    {
        let mut eth = MutableEthernetPacket::new(&mut buf).unwrap();
        eth.set_destination(eth_dst);
        eth.set_source(eth_src);
        eth.set_ethertype(EtherTypes::Arp);

        let mut arp = MutableArpPacket::new(eth.payload_mut()).unwrap();
        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(operation);
        arp.set_sender_hw_addr(sender_mac);
        arp.set_sender_proto_addr(sender_ip);
        arp.set_target_hw_addr(target_mac);
        arp.set_target_proto_addr(target_ip);
    }
    buf
}

/// Broadcast who-has request for `target_ip`.
pub fn build_arp_request(
    our_mac: MacAddr,
    our_ip: Ipv4Addr,
    target_ip: Ipv4Addr,
) -> [u8; ARP_FRAME_LEN] {
    build_frame(
        ArpOperations::Request,
        MacAddr::broadcast(),
        our_mac,
        our_mac,
        our_ip,
        MacAddr::zero(),
        target_ip,
    )
}

/// Unsolicited reply telling `dest` that `claimed_ip` is at `claimed_mac`.
pub fn build_arp_reply(
    dest_mac: MacAddr,
    dest_ip: Ipv4Addr,
    claimed_ip: Ipv4Addr,
    claimed_mac: MacAddr,
) -> [u8; ARP_FRAME_LEN] {
    build_frame(
        ArpOperations::Reply,
        dest_mac,
        claimed_mac,
        claimed_mac,
        claimed_ip,
        dest_mac,
        dest_ip,
    )
}

/// Decode an Ethernet frame as ARP; `None` for anything else.
pub fn parse_arp(frame: &[u8]) -> Option<ArpFrame> {
    let eth = EthernetPacket::new(frame)?;
    if eth.get_ethertype() != EtherTypes::Arp {
        return None;
    }
    let arp = ArpPacket::new(eth.payload())?;
    Some(ArpFrame {
        operation: arp.get_operation(),
        sender_mac: arp.get_sender_hw_addr(),
        sender_ip: arp.get_sender_proto_addr(),
        target_mac: arp.get_target_hw_addr(),
        target_ip: arp.get_target_proto_addr(),
    })
}

/// Open a raw datalink channel on the interface with a short read timeout.
pub fn open_channel(
    iface: &Interface,
) -> Result<(Box<dyn DataLinkSender>, Box<dyn DataLinkReceiver>), NetError> {
    let pnet_iface = iface.pnet_interface()?;
    let config = Config {
        read_timeout: Some(Duration::from_millis(500)),
        ..Config::default()
    };
    match datalink::channel(&pnet_iface, config) {
        Ok(Channel::Ethernet(tx, rx)) => Ok((tx, rx)),
        Ok(_) => Err(NetError::Channel("unexpected channel type".to_string())),
        Err(e) => Err(NetError::Channel(e.to_string())),
    }
}

/// Resolve the link-layer address for `target_ip` with a broadcast request.
/// Blocking; run off the async reactor.
pub fn resolve_mac(iface: &Interface, target_ip: Ipv4Addr) -> Result<MacAddr, NetError> {
    let (mut tx, mut rx) = open_channel(iface)?;
    let request = build_arp_request(iface.mac, iface.ip, target_ip);

    for attempt in 1..=RESOLVE_ATTEMPTS {
        tx.send_to(&request, None)
            .transpose()
            .map_err(|e| NetError::Channel(e.to_string()))?;

        let deadline = Instant::now() + RESOLVE_TIMEOUT;
        while Instant::now() < deadline {
            let frame = match rx.next() {
                Ok(frame) => frame,
                // Read timeout; keep waiting until the attempt deadline.
                Err(_) => continue,
            };
            if let Some(arp) = parse_arp(frame) {
                if arp.operation == ArpOperations::Reply && arp.sender_ip == target_ip {
                    debug!("resolved {} to {}", target_ip, arp.sender_mac);
                    return Ok(arp.sender_mac);
                }
            }
        }
        debug!("ARP resolve attempt {}/{} for {} timed out", attempt, RESOLVE_ATTEMPTS, target_ip);
    }
    Err(NetError::GatewayUnreachable(format!(
        "no ARP reply from {target_ip}"
    )))
}

/// Frame sink used by the engine so tests can observe emitted frames.
pub trait FrameSender: Send {
    fn send_frame(&mut self, frame: &[u8]) -> std::io::Result<()>;
}

/// Real sender over a datalink channel.
pub struct DatalinkSender(pub Box<dyn DataLinkSender>);

impl FrameSender for DatalinkSender {
    fn send_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        match self.0.send_to(frame, None) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(e),
            None => Err(std::io::Error::other("datalink send failed")),
        }
    }
}
