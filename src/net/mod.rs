//! L2 networking: interface discovery, ARP frame handling, the redirection
//! engine, the device scanner, and the host OS capability seam.

pub mod arp;
pub mod gateway;
pub mod hostops;
pub mod iface;
pub mod scanner;

pub use arp::{build_arp_reply, build_arp_request, parse_arp, ArpFrame};
pub use gateway::{ArpEngine, ArpEngineError, ArpTarget};
pub use hostops::{HostOps, MockHostOps};
pub use iface::{vendor_for_mac, Interface, NetError};
pub use scanner::DeviceScanner;
