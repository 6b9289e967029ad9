//! Control plane: subsystem lifecycle and the stdin command loop.
//!
//! Startup order: store → CA → policy → interface → host ops → ARP engine →
//! DNS interceptor → proxy → scanner. Shutdown reverses it; the ARP engine
//! restores its targets before forwarding and redirect rules are removed.
//! Commands arrive as one JSON object per line on stdin; malformed or
//! unknown commands produce an `error` event and are otherwise no-ops.

use crate::ca::CertificateAuthority;
use crate::config::{Config, DnsMode};
use crate::dns::DnsInterceptor;
use crate::events::{run_dispatcher, Event, EventSink};
use crate::net::gateway::ArpEngine;
use crate::net::hostops::HostOps;
use crate::net::iface::{self, Interface};
use crate::net::scanner::DeviceScanner;
use crate::policy::engine::{shared, PolicyEngine, SharedPolicy};
use crate::proxy::TransparentProxy;
use crate::store::Store;
use serde::Deserialize;
use serde_json::json;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("store: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("certificates: {0}")]
    Ca(#[from] crate::ca::CaError),
    #[error("network: {0}")]
    Net(#[from] crate::net::iface::NetError),
    #[error("arp engine: {0}")]
    Arp(#[from] crate::net::gateway::ArpEngineError),
    #[error("proxy: {0}")]
    Proxy(#[from] crate::proxy::ProxyError),
    #[error("host ops: {0}")]
    HostOps(#[from] std::io::Error),
}

/// One command-plane message.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Stop,
    AddTarget {
        ip: String,
        #[serde(default)]
        hostname: Option<String>,
    },
    RemoveTarget {
        ip: String,
    },
    SetQuiet {
        enabled: bool,
        #[serde(default = "default_quiet_interval")]
        interval: u64,
    },
    AddBlock {
        domain: String,
    },
    RemoveBlock {
        domain: String,
    },
    BlockCategory {
        category: String,
    },
    UnblockCategory {
        category: String,
    },
    AddKeyword {
        word: String,
    },
    RemoveKeyword {
        word: String,
    },
    DnsMode {
        mode: String,
    },
    Scan,
    Status,
    Cleanup {
        days: i64,
    },
}

fn default_quiet_interval() -> u64 {
    15
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Apply a policy-family command. Returns false when the command is not a
/// policy command.
pub fn apply_policy_command(policy: &SharedPolicy, sink: &EventSink, cmd: &Command) -> bool {
    let mut detail = serde_json::Map::new();
    let action;
    {
        let mut engine = policy.write().unwrap();
        match cmd {
            Command::AddBlock { domain } => {
                engine.block_domain(domain);
                action = "add_block";
                detail.insert("domain".to_string(), json!(domain));
            }
            Command::RemoveBlock { domain } => {
                engine.unblock_domain(domain);
                action = "remove_block";
                detail.insert("domain".to_string(), json!(domain));
            }
            Command::BlockCategory { category } => {
                if let Err(e) = engine.block_category(category) {
                    sink.emit(Event::error("policy", e));
                    return true;
                }
                action = "block_category";
                detail.insert("category".to_string(), json!(category));
            }
            Command::UnblockCategory { category } => {
                if let Err(e) = engine.unblock_category(category) {
                    sink.emit(Event::error("policy", e));
                    return true;
                }
                action = "unblock_category";
                detail.insert("category".to_string(), json!(category));
            }
            Command::AddKeyword { word } => {
                engine.add_blocked_keyword(word);
                action = "add_keyword";
                detail.insert("keyword".to_string(), json!(word));
            }
            Command::RemoveKeyword { word } => {
                engine.remove_blocked_keyword(word);
                action = "remove_keyword";
                detail.insert("keyword".to_string(), json!(word));
            }
            _ => return false,
        }
        if let Err(e) = engine.save() {
            warn!("failed to persist policy: {}", e);
            sink.emit(Event::error("policy", e));
        }
    }
    sink.emit(Event::ConfigUpdate {
        action: action.to_string(),
        detail,
    });
    true
}

/// The assembled monitor.
pub struct Monitor {
    pub cfg: Config,
    pub sink: EventSink,
    pub store: Arc<Store>,
    pub policy: SharedPolicy,
    pub ca: Arc<CertificateAuthority>,
    pub iface: Interface,
    hostops: Arc<dyn HostOps>,
    arp: Arc<ArpEngine>,
    dns: Arc<DnsInterceptor>,
    scanner: Arc<DeviceScanner>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    fatal_tx: watch::Sender<Option<String>>,
    fatal_rx: watch::Receiver<Option<String>>,
    redirect_installed: std::sync::Mutex<bool>,
    dns_filter_active: std::sync::Mutex<bool>,
}

impl Monitor {
    /// Build everything that does not need privileges yet.
    pub fn new(
        cfg: Config,
        hostops: Arc<dyn HostOps>,
        sink: EventSink,
    ) -> Result<Self, MonitorError> {
        let store = Arc::new(Store::open(&cfg.db_path())?);

        let mut engine = PolicyEngine::load(&cfg.policy_dir());
        if engine.keywords.is_empty() {
            let loaded = engine.keywords.load_all_predefined();
            info!("loaded {} predefined alert keywords", loaded);
            if let Err(e) = engine.save() {
                warn!("failed to persist predefined keywords: {}", e);
            }
        }
        let policy = shared(engine);

        let ca = Arc::new(CertificateAuthority::open(&cfg.cert_dir(), &cfg.ca_profile)?);

        let gateway_override = cfg
            .gateway_ip
            .as_deref()
            .and_then(|s| s.parse::<Ipv4Addr>().ok());
        let iface = iface::discover(cfg.interface.as_deref(), gateway_override)?;
        info!(
            "monitoring {} ({} / gw {})",
            iface.name, iface.ip, iface.gateway_ip
        );

        let arp = Arc::new(ArpEngine::new(
            iface.clone(),
            hostops.clone(),
            sink.clone(),
            cfg.effective_spoof_interval(),
        ));
        let redirect_ip = cfg
            .dns_redirect_ip
            .parse()
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let dns = Arc::new(DnsInterceptor::new(
            iface.clone(),
            policy.clone(),
            store.clone(),
            sink.clone(),
            cfg.dns_mode,
            redirect_ip,
        ));
        let scanner = Arc::new(DeviceScanner::new(iface.clone(), store.clone(), sink.clone()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = watch::channel(None);
        Ok(Self {
            cfg,
            sink,
            store,
            policy,
            ca,
            iface,
            hostops,
            arp,
            dns,
            scanner,
            shutdown_tx,
            shutdown_rx,
            fatal_tx,
            fatal_rx,
            redirect_installed: std::sync::Mutex::new(false),
            dns_filter_active: std::sync::Mutex::new(false),
        })
    }

    /// Resolves with a message when a subsystem hits a fatal runtime error
    /// (exit code 2).
    pub async fn fatal_error(&self) -> String {
        let mut rx = self.fatal_rx.clone();
        loop {
            if let Some(msg) = rx.borrow().clone() {
                return msg;
            }
            if rx.changed().await.is_err() {
                return "fatal channel closed".to_string();
            }
        }
    }

    /// Bring the whole system up. Failures here are startup failures
    /// (exit code 1).
    pub async fn start(self: &Arc<Self>) -> Result<(), MonitorError> {
        // Event dispatcher owns stdout.
        tokio::spawn(run_dispatcher(self.sink.clone(), self.shutdown_rx.clone()));

        self.hostops.install_redirect(self.cfg.proxy_port)?;
        *self.redirect_installed.lock().unwrap() = true;

        self.arp.start().await?;
        self.dns.start()?;
        if self.cfg.dns_mode == DnsMode::Drop {
            self.hostops.set_dns_filter(true)?;
            *self.dns_filter_active.lock().unwrap() = true;
        }

        let proxy = Arc::new(TransparentProxy::new(
            self.cfg.clone(),
            self.ca.clone(),
            self.policy.clone(),
            self.store.clone(),
            self.sink.clone(),
        ));
        let listener = proxy.bind().await?;
        let shutdown = self.shutdown_rx.clone();
        let sink = self.sink.clone();
        let fatal = self.fatal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy.run(listener, shutdown).await {
                sink.emit(Event::error("proxy", &e));
                error!("proxy failed: {}", e);
                let _ = fatal.send(Some(format!("proxy failed: {e}")));
            }
        });

        if self.cfg.scan_interval_secs > 0 {
            let scanner = self.scanner.clone();
            let interval = self.cfg.scan_interval_secs;
            tokio::spawn(scanner.run(interval));
        }

        self.sink.emit(Event::status("monitor started"));
        Ok(())
    }

    /// Orderly shutdown, reversing startup. ARP restoration completes
    /// before host state is put back.
    pub async fn shutdown(&self) {
        self.sink.emit(Event::status("shutting down"));
        let _ = self.shutdown_tx.send(true);
        self.scanner.stop();

        let dns = self.dns.clone();
        let _ = tokio::task::spawn_blocking(move || dns.stop()).await;

        let arp = self.arp.clone();
        let _ = tokio::task::spawn_blocking(move || arp.stop()).await;

        if *self.dns_filter_active.lock().unwrap() {
            if let Err(e) = self.hostops.set_dns_filter(false) {
                warn!("failed to remove DNS filter: {}", e);
            }
        }
        if *self.redirect_installed.lock().unwrap() {
            if let Err(e) = self.hostops.remove_redirect(self.cfg.proxy_port) {
                warn!("failed to remove redirect rules: {}", e);
            }
        }
        self.sink.emit(Event::Stopped {
            component: "monitor".to_string(),
            detail: serde_json::Map::new(),
        });
    }

    /// Handle one command. Returns false when the monitor should stop.
    pub async fn handle_command(&self, cmd: Command) -> bool {
        if apply_policy_command(&self.policy, &self.sink, &cmd) {
            return true;
        }
        match cmd {
            Command::Stop => return false,
            Command::AddTarget { ip, hostname } => {
                let Ok(ip) = ip.parse::<Ipv4Addr>() else {
                    self.sink
                        .emit(Event::error("arp", format!("invalid target ip: {ip}")));
                    return true;
                };
                match self.arp.add_target(ip, hostname).await {
                    Ok(target) => {
                        // Targets become monitored devices immediately.
                        let device = crate::types::Device::new(
                            &target.mac.to_string(),
                            &target.ip.to_string(),
                        );
                        if let Err(e) = self.store.upsert_device(&device) {
                            warn!("failed to upsert target device: {}", e);
                        }
                    }
                    Err(e) => self.sink.emit(Event::error("arp", e)),
                }
            }
            Command::RemoveTarget { ip } => {
                match ip.parse::<Ipv4Addr>() {
                    Ok(ip) => {
                        let arp = self.arp.clone();
                        let result =
                            tokio::task::spawn_blocking(move || arp.remove_target(ip)).await;
                        if let Ok(Err(e)) = result {
                            self.sink.emit(Event::error("arp", e));
                        }
                    }
                    Err(_) => self
                        .sink
                        .emit(Event::error("arp", format!("invalid target ip: {ip}"))),
                }
            }
            Command::SetQuiet { enabled, interval } => {
                self.arp.set_stealth(enabled, interval);
            }
            Command::DnsMode { mode } => match DnsMode::parse(&mode) {
                Some(mode) => {
                    let was_drop = self.dns.mode() == DnsMode::Drop;
                    self.dns.set_mode(mode);
                    let want_filter = mode == DnsMode::Drop;
                    if want_filter != was_drop {
                        if let Err(e) = self.hostops.set_dns_filter(want_filter) {
                            self.sink.emit(Event::error("dns", e));
                        } else {
                            *self.dns_filter_active.lock().unwrap() = want_filter;
                        }
                    }
                }
                None => self
                    .sink
                    .emit(Event::error("dns", format!("unknown dns mode: {mode}"))),
            },
            Command::Scan => {
                // One immediate sweep outside the normal cadence.
                let scanner = self.scanner.clone();
                tokio::spawn(async move {
                    let _ = tokio::task::spawn_blocking(move || scanner.sweep_now()).await;
                });
            }
            Command::Status => {
                let (devices, dns, traffic) = self.store.counts().unwrap_or((0, 0, 0));
                let policy_status = self.policy.read().unwrap().status();
                let mut detail = serde_json::Map::new();
                detail.insert("devices".to_string(), json!(devices));
                detail.insert("dns_queries".to_string(), json!(dns));
                detail.insert("flows".to_string(), json!(traffic));
                detail.insert("policy".to_string(), policy_status);
                detail.insert("targets".to_string(), json!(self.arp.targets().len()));
                detail.insert("events_dropped".to_string(), json!(self.sink.dropped_count()));
                self.sink.emit(Event::status_with("status", detail));
            }
            Command::Cleanup { days } => {
                let store = self.store.clone();
                let sink = self.sink.clone();
                tokio::task::spawn_blocking(move || match store.cleanup(days) {
                    Ok(removed) => {
                        sink.emit(Event::status(format!("cleanup removed {removed} rows")))
                    }
                    Err(e) => sink.emit(Event::error("store", e)),
                });
            }
            // Policy commands were consumed above.
            _ => {}
        }
        true
    }

    /// Read commands from stdin until `stop` or EOF.
    pub async fn run_command_loop(self: &Arc<Self>) {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match Command::parse(line) {
                        Ok(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        Err(e) => {
                            self.sink
                                .emit(Event::error("control", format!("bad command: {e}")));
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::engine::shared;

    #[test]
    fn test_command_parsing() {
        assert_eq!(Command::parse(r#"{"action":"stop"}"#).unwrap(), Command::Stop);
        assert_eq!(
            Command::parse(r#"{"action":"add_target","ip":"192.168.1.23"}"#).unwrap(),
            Command::AddTarget {
                ip: "192.168.1.23".to_string(),
                hostname: None
            }
        );
        assert_eq!(
            Command::parse(r#"{"action":"set_quiet","enabled":true,"interval":30}"#).unwrap(),
            Command::SetQuiet {
                enabled: true,
                interval: 30
            }
        );
        assert_eq!(
            Command::parse(r#"{"action":"set_quiet","enabled":false}"#).unwrap(),
            Command::SetQuiet {
                enabled: false,
                interval: 15
            }
        );
        assert_eq!(
            Command::parse(r#"{"action":"dns_mode","mode":"redirect"}"#).unwrap(),
            Command::DnsMode {
                mode: "redirect".to_string()
            }
        );
        assert!(Command::parse(r#"{"action":"warp_drive"}"#).is_err());
        assert!(Command::parse("not json").is_err());
    }

    #[test]
    fn test_policy_commands_update_engine() {
        let policy = shared(PolicyEngine::new());
        let sink = EventSink::new();

        assert!(apply_policy_command(
            &policy,
            &sink,
            &Command::AddBlock {
                domain: "Ads.Example".to_string()
            }
        ));
        assert!(policy
            .read()
            .unwrap()
            .check("ads.example", "", "")
            .should_block);

        assert!(apply_policy_command(
            &policy,
            &sink,
            &Command::RemoveBlock {
                domain: "ads.example".to_string()
            }
        ));
        assert!(!policy
            .read()
            .unwrap()
            .check("ads.example", "", "")
            .should_block);

        // Category round trip.
        apply_policy_command(
            &policy,
            &sink,
            &Command::BlockCategory {
                category: "gaming".to_string(),
            },
        );
        assert!(policy
            .read()
            .unwrap()
            .check("steampowered.com", "", "")
            .should_block);
        apply_policy_command(
            &policy,
            &sink,
            &Command::UnblockCategory {
                category: "gaming".to_string(),
            },
        );
        assert!(!policy
            .read()
            .unwrap()
            .check("steampowered.com", "", "")
            .should_block);

        // Unknown category is an error event, not a change.
        apply_policy_command(
            &policy,
            &sink,
            &Command::BlockCategory {
                category: "nonsense".to_string(),
            },
        );
        let lines = sink.drain();
        assert!(lines.iter().any(|l| l.contains("\"type\":\"error\"")));
        assert!(lines
            .iter()
            .any(|l| l.contains("\"type\":\"config_update\"")));
    }

    #[test]
    fn test_non_policy_commands_fall_through() {
        let policy = shared(PolicyEngine::new());
        let sink = EventSink::new();
        assert!(!apply_policy_command(&policy, &sink, &Command::Stop));
        assert!(!apply_policy_command(&policy, &sink, &Command::Scan));
    }
}
