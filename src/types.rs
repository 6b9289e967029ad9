//! Core record types shared across subsystems.
//!
//! Every observed fact is one of three records: a [`Device`] (keyed by its
//! link-layer address), a [`DnsQueryRecord`] (one per observed query packet),
//! or an [`HttpFlow`] (one per intercepted request/response pair). Records
//! are immutable once persisted; devices are upserted, never deleted.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Sentinel device id used when a record's source address cannot be
/// resolved to a known device at event time.
pub const UNKNOWN_DEVICE: Uuid = Uuid::nil();

/// Current unix time in seconds.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current time as an RFC 3339 timestamp (UTC), the format used on the
/// event plane and in the store.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Current local wall-clock time, used by schedule evaluation.
pub fn now_local() -> DateTime<Local> {
    Local::now()
}

/// Canonicalize a link-layer address: lowercase, colon-separated.
/// Two records with the same canonical address refer to the same device.
pub fn canonical_mac(mac: &str) -> String {
    mac.trim().replace('-', ":").to_ascii_lowercase()
}

// =============================================================================
// SEVERITY / SENSITIVITY
// =============================================================================

/// Alert severity, ordered low → critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// One step up; Critical stays Critical.
    pub fn elevated(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Per-flow sensitivity label derived from credentials, tokens, and
/// financial/PII patterns found in the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Public,
    Private,
    Sensitive,
    Critical,
}

impl Sensitivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Sensitivity::Public => "public",
            Sensitivity::Private => "private",
            Sensitivity::Sensitive => "sensitive",
            Sensitivity::Critical => "critical",
        }
    }
}

// =============================================================================
// DEVICE
// =============================================================================

/// A device observed on the monitored segment.
///
/// Identity is the canonical link-layer address; the IPv4 address is the
/// most recent one seen and may change across DHCP leases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    /// Canonical lowercase link-layer address (unique).
    pub mac: String,
    pub ip: String,
    pub hostname: Option<String>,
    /// Vendor name from the OUI prefix table.
    pub vendor: Option<String>,
    pub is_gateway: bool,
    pub is_self: bool,
    pub is_monitored: bool,
    pub has_ca_installed: bool,
    /// RFC 3339 timestamps.
    pub first_seen: String,
    pub last_seen: String,
    pub total_requests: u64,
    pub total_bytes: u64,
}

impl Device {
    pub fn new(mac: &str, ip: &str) -> Self {
        let ts = now_rfc3339();
        Self {
            id: Uuid::new_v4(),
            mac: canonical_mac(mac),
            ip: ip.to_string(),
            hostname: None,
            vendor: None,
            is_gateway: false,
            is_self: false,
            is_monitored: true,
            has_ca_installed: false,
            first_seen: ts.clone(),
            last_seen: ts,
            total_requests: 0,
            total_bytes: 0,
        }
    }
}

// =============================================================================
// DNS QUERY RECORD
// =============================================================================

/// One observed DNS query (and, when linkable, its response).
/// Immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsQueryRecord {
    pub id: Uuid,
    pub timestamp: String,
    pub device_id: Uuid,
    pub device_ip: String,
    pub query_name: String,
    /// Record type mnemonic ("A", "AAAA", …) or "TYPE<n>" for unknowns.
    pub query_type: String,
    /// Resolved addresses from A/AAAA answers, comma-joined.
    pub response_ip: Option<String>,
    pub response_ttl: Option<u32>,
    pub blocked: bool,
    pub block_reason: Option<String>,
    pub category: Option<String>,
}

impl DnsQueryRecord {
    pub fn new(device_ip: &str, query_name: &str, query_type: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now_rfc3339(),
            device_id: UNKNOWN_DEVICE,
            device_ip: device_ip.to_string(),
            query_name: query_name.to_ascii_lowercase(),
            query_type: query_type.to_string(),
            response_ip: None,
            response_ttl: None,
            blocked: false,
            block_reason: None,
            category: None,
        }
    }
}

// =============================================================================
// HTTP FLOW
// =============================================================================

/// A decoded HTTP body attached to a flow record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowBody {
    /// Decoded text, when the body was text.
    pub text: Option<String>,
    /// Content type label ("application/json", "image/png", …).
    pub body_type: Option<String>,
    /// Size on the wire, before decompression.
    pub raw_size: u64,
    /// Size after decompression/decoding.
    pub decoded_size: u64,
}

/// One intercepted HTTP(S) request/response pair.
///
/// Created on the first request byte, finalized when the response completes
/// (or the flow errors); immutable after finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpFlow {
    pub id: Uuid,
    pub timestamp: String,
    pub device_id: Uuid,
    pub device_ip: String,
    pub method: String,
    /// "http" or "https".
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub url: String,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: FlowBody,
    pub status_code: Option<u16>,
    pub status_message: Option<String>,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: FlowBody,
    pub duration_ms: u64,
    pub category: Option<String>,
    pub sensitivity: Sensitivity,
    pub blocked: bool,
    pub block_reason: Option<String>,
    /// Alert tags such as `KEYWORD_URL:<word>`.
    pub alerts: Vec<String>,
    /// Upstream certificate validation failed but the flow continued.
    pub upstream_insecure: bool,
}

impl HttpFlow {
    pub fn new(device_ip: &str, scheme: &str, host: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now_rfc3339(),
            device_id: UNKNOWN_DEVICE,
            device_ip: device_ip.to_string(),
            method: String::new(),
            scheme: scheme.to_string(),
            host: host.to_string(),
            path: "/".to_string(),
            url: String::new(),
            request_headers: BTreeMap::new(),
            request_body: FlowBody::default(),
            status_code: None,
            status_message: None,
            response_headers: BTreeMap::new(),
            response_body: FlowBody::default(),
            duration_ms: 0,
            category: None,
            sensitivity: Sensitivity::Public,
            blocked: false,
            block_reason: None,
            alerts: Vec::new(),
            upstream_insecure: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_mac() {
        assert_eq!(canonical_mac("AA-BB-CC-11-22-33"), "aa:bb:cc:11:22:33");
        assert_eq!(canonical_mac(" aa:bb:cc:11:22:33 "), "aa:bb:cc:11:22:33");
    }

    #[test]
    fn test_severity_elevation() {
        assert_eq!(Severity::Low.elevated(), Severity::Medium);
        assert_eq!(Severity::Medium.elevated(), Severity::High);
        assert_eq!(Severity::High.elevated(), Severity::Critical);
        assert_eq!(Severity::Critical.elevated(), Severity::Critical);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Critical);
        assert!(Severity::Medium < Severity::High);
    }

    #[test]
    fn test_device_identity_defaults() {
        let d = Device::new("AA:BB:CC:DD:EE:FF", "192.168.1.50");
        assert_eq!(d.mac, "aa:bb:cc:dd:ee:ff");
        assert!(d.is_monitored);
        assert!(!d.has_ca_installed);
        assert_eq!(d.first_seen, d.last_seen);
    }

    #[test]
    fn test_flow_record_roundtrip() {
        let flow = HttpFlow::new("192.168.1.23", "https", "example.com");
        let json = serde_json::to_string(&flow).unwrap();
        let back: HttpFlow = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host, "example.com");
        assert_eq!(back.sensitivity, Sensitivity::Public);
    }
}
