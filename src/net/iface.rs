//! Interface discovery and L2 identity.
//!
//! Finds the monitor interface (named, or the first up, non-loopback one
//! with an IPv4 address), its link-layer address, netmask, and the default
//! gateway. On Linux the gateway comes from `/proc/net/route`; if that
//! fails the common `.1` heuristic for home /24 networks is used.

use pnet::datalink;
use pnet::ipnetwork::IpNetwork;
use pnet::util::MacAddr;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("no usable network interface found")]
    NoInterface,
    #[error("interface {0} not found or has no IPv4 address")]
    InterfaceNotFound(String),
    #[error("could not determine default gateway")]
    NoGateway,
    #[error("gateway unreachable: {0}")]
    GatewayUnreachable(String),
    #[error("datalink channel error: {0}")]
    Channel(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The monitor interface, discovered at start and static during a run.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
}

impl Interface {
    /// Base address of the local /24, used by the scanner sweep.
    pub fn network_base(&self) -> Ipv4Addr {
        let o = self.ip.octets();
        Ipv4Addr::new(o[0], o[1], o[2], 0)
    }

    /// The underlying pnet interface, for opening datalink channels.
    pub fn pnet_interface(&self) -> Result<datalink::NetworkInterface, NetError> {
        datalink::interfaces()
            .into_iter()
            .find(|i| i.name == self.name)
            .ok_or_else(|| NetError::InterfaceNotFound(self.name.clone()))
    }
}

/// Discover the monitor interface.
pub fn discover(name: Option<&str>, gateway_override: Option<Ipv4Addr>) -> Result<Interface, NetError> {
    let candidates = datalink::interfaces();
    let picked = match name {
        Some(name) => candidates
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| NetError::InterfaceNotFound(name.to_string()))?,
        None => candidates
            .into_iter()
            .filter(|i| i.is_up() && !i.is_loopback())
            .find(|i| i.ips.iter().any(|ip| matches!(ip, IpNetwork::V4(_))))
            .ok_or(NetError::NoInterface)?,
    };

    let (ip, netmask) = picked
        .ips
        .iter()
        .find_map(|net| match net {
            IpNetwork::V4(v4) if !v4.ip().is_loopback() => Some((v4.ip(), v4.mask())),
            _ => None,
        })
        .ok_or_else(|| NetError::InterfaceNotFound(picked.name.clone()))?;

    let mac = picked.mac.ok_or_else(|| NetError::InterfaceNotFound(picked.name.clone()))?;

    let gateway_ip = match gateway_override {
        Some(gw) => gw,
        None => default_gateway(&picked.name).unwrap_or_else(|| {
            let o = ip.octets();
            let guess = Ipv4Addr::new(o[0], o[1], o[2], 1);
            warn!("gateway detection failed, assuming {}", guess);
            guess
        }),
    };

    debug!(
        "interface {}: ip={} mask={} mac={} gateway={}",
        picked.name, ip, netmask, mac, gateway_ip
    );
    Ok(Interface {
        name: picked.name,
        mac,
        ip,
        netmask,
        gateway_ip,
    })
}

/// Default gateway for `iface` from the kernel routing table.
#[cfg(target_os = "linux")]
fn default_gateway(iface: &str) -> Option<Ipv4Addr> {
    let table = std::fs::read_to_string("/proc/net/route").ok()?;
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Iface Destination Gateway Flags ...
        if fields.len() >= 3 && fields[0] == iface && fields[1] == "00000000" {
            let raw = u32::from_str_radix(fields[2], 16).ok()?;
            // /proc/net/route stores addresses little-endian.
            return Some(Ipv4Addr::from(raw.swap_bytes()));
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn default_gateway(_iface: &str) -> Option<Ipv4Addr> {
    None
}

/// OUI prefix → vendor. Abbreviated table of common home devices.
const OUI_TABLE: &[(&str, &str)] = &[
    ("00:1a:2b", "HP"),
    ("00:1e:a6", "Samsung"),
    ("f4:f5:d8", "Google"),
    ("fc:a1:83", "Amazon"),
    ("40:cb:c0", "Apple"),
    ("3c:22:fb", "Apple"),
    ("f0:18:98", "Apple"),
    ("a4:83:e7", "Apple"),
    ("00:17:88", "Philips"),
    ("34:3e:a4", "Ring"),
    ("84:ea:ed", "Roku"),
    ("b8:27:eb", "Raspberry Pi"),
    ("dc:a6:32", "Raspberry Pi"),
    ("00:50:56", "VMware"),
    ("00:0c:29", "VMware"),
    ("08:00:27", "VirtualBox"),
    ("ac:de:48", "Intel"),
];

/// Vendor name for a link-layer address, from the OUI prefix table.
pub fn vendor_for_mac(mac: &str) -> Option<&'static str> {
    let canonical = crate::types::canonical_mac(mac);
    let prefix = canonical.get(..8)?;
    OUI_TABLE
        .iter()
        .find(|(oui, _)| *oui == prefix)
        .map(|(_, vendor)| *vendor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_lookup() {
        assert_eq!(vendor_for_mac("B8:27:EB:12:34:56"), Some("Raspberry Pi"));
        assert_eq!(vendor_for_mac("b8-27-eb-12-34-56"), Some("Raspberry Pi"));
        assert_eq!(vendor_for_mac("ff:ff:ff:00:00:00"), None);
        assert_eq!(vendor_for_mac("short"), None);
    }

    #[test]
    fn test_network_base() {
        let iface = Interface {
            name: "eth0".to_string(),
            mac: MacAddr::new(0xaa, 0xbb, 0xcc, 0x11, 0x22, 0x33),
            ip: Ipv4Addr::new(192, 168, 1, 42),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway_ip: Ipv4Addr::new(192, 168, 1, 1),
        };
        assert_eq!(iface.network_base(), Ipv4Addr::new(192, 168, 1, 0));
    }
}
