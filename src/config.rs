//! Runtime configuration.
//!
//! Read-only during a run; the control plane owns the single instance and
//! subsystems receive clones at startup. Policy state (blocklists,
//! schedules, keywords) lives in its own JSON documents, not here.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How blocked DNS queries are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsMode {
    /// Forge an authoritative NXDOMAIN reply.
    Nxdomain,
    /// Reply with a single A record pointing at `dns_redirect_ip`.
    Redirect,
    /// Send nothing and filter the query so forwarding cannot relay it.
    Drop,
}

impl DnsMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "nxdomain" => Some(DnsMode::Nxdomain),
            "redirect" => Some(DnsMode::Redirect),
            "drop" => Some(DnsMode::Drop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DnsMode::Nxdomain => "nxdomain",
            DnsMode::Redirect => "redirect",
            DnsMode::Drop => "drop",
        }
    }
}

/// Monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Interface to operate on; `None` means pick the default route interface.
    pub interface: Option<String>,
    /// Root directory for persistent state (database, policy, certificates).
    pub data_dir: PathBuf,
    /// Gateway IPv4 override; auto-detected when `None`.
    pub gateway_ip: Option<String>,

    /// Local port the transparent proxy listens on. OS redirect rules send
    /// 80/443 here.
    pub proxy_port: u16,
    /// Accept upstream certificates that fail validation, marking the flow.
    pub ssl_insecure: bool,
    /// Bodies beyond this many bytes are not buffered for analysis.
    pub max_body_size: usize,
    /// Per-connection idle timeout in seconds.
    pub idle_timeout_secs: u64,

    pub dns_mode: DnsMode,
    /// Target address for `DnsMode::Redirect` answers.
    pub dns_redirect_ip: String,

    /// Stealth poisoning: reduced ARP frequency.
    pub quiet_mode: bool,
    /// Seconds between poison rounds in stealth mode (aggressive mode is 2 s).
    pub spoof_interval_secs: u64,

    /// Seconds between device-scanner sweeps. 0 disables the scanner.
    pub scan_interval_secs: u64,

    /// CA disguise profile id (see `ca::profiles`).
    pub ca_profile: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            data_dir: PathBuf::from("./data"),
            gateway_ip: None,
            proxy_port: 8080,
            ssl_insecure: true,
            max_body_size: 5 * 1024 * 1024,
            idle_timeout_secs: 60,
            dns_mode: DnsMode::Nxdomain,
            dns_redirect_ip: "0.0.0.0".to_string(),
            quiet_mode: true,
            spoof_interval_secs: 15,
            scan_interval_secs: 30,
            ca_profile: "wifi_security".to_string(),
        }
    }
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("netwarden.db")
    }

    pub fn policy_dir(&self) -> PathBuf {
        self.data_dir.join("policy")
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.data_dir.join("certs")
    }

    /// Effective seconds between poison rounds.
    pub fn effective_spoof_interval(&self) -> u64 {
        if self.quiet_mode {
            self.spoof_interval_secs.max(15)
        } else {
            2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_mode_parse() {
        assert_eq!(DnsMode::parse("nxdomain"), Some(DnsMode::Nxdomain));
        assert_eq!(DnsMode::parse("redirect"), Some(DnsMode::Redirect));
        assert_eq!(DnsMode::parse("drop"), Some(DnsMode::Drop));
        assert_eq!(DnsMode::parse("bogus"), None);
    }

    #[test]
    fn test_spoof_interval_floor() {
        let mut cfg = Config::default();
        cfg.quiet_mode = true;
        cfg.spoof_interval_secs = 5;
        assert_eq!(cfg.effective_spoof_interval(), 15);
        cfg.quiet_mode = false;
        assert_eq!(cfg.effective_spoof_interval(), 2);
    }

    #[test]
    fn test_paths_under_data_dir() {
        let cfg = Config::default();
        assert!(cfg.db_path().starts_with(&cfg.data_dir));
        assert!(cfg.cert_dir().starts_with(&cfg.data_dir));
    }
}
