//! netwarden: LAN-wide transparent traffic monitor.
//!
//! Inserts this host between local devices and the gateway (ARP
//! redirection), observes DNS and HTTP(S) flows through a TLS-intercepting
//! transparent proxy, applies blocking policy, and streams structured JSON
//! events on stdout while accepting JSON commands on stdin.

use clap::Parser;
use netwarden::config::{Config, DnsMode};
use netwarden::control::{Command, Monitor};
use netwarden::events::EventSink;
use netwarden::net::hostops;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// netwarden version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "netwarden", version, about = "LAN traffic monitor core")]
struct Args {
    /// Network interface (default: first up non-loopback with IPv4)
    #[arg(short, long)]
    interface: Option<String>,

    /// Data directory (database, policy, certificates)
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Gateway IP (auto-detected if not set)
    #[arg(short, long)]
    gateway: Option<String>,

    /// Transparent proxy listen port
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// DNS block mode: nxdomain, redirect, drop
    #[arg(long, default_value = "nxdomain")]
    dns_mode: String,

    /// Redirect address for DNS redirect mode
    #[arg(long, default_value = "0.0.0.0")]
    dns_redirect: String,

    /// Initial ARP targets (comma-separated IPs)
    #[arg(short, long)]
    targets: Option<String>,

    /// Stealth poisoning (longer ARP intervals)
    #[arg(short, long, default_value_t = true, action = clap::ArgAction::Set)]
    quiet: bool,

    /// Seconds between ARP rounds in stealth mode
    #[arg(long, default_value = "15")]
    interval: u64,

    /// Seconds between device-scanner sweeps (0 disables)
    #[arg(long, default_value = "30")]
    scan_interval: u64,

    /// CA disguise profile
    #[arg(long, default_value = "wifi_security")]
    ca_profile: String,

    /// Fail upstream TLS validation instead of continuing insecurely
    #[arg(long)]
    strict_upstream: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging. Stdout belongs to the event plane.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("netwarden=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let Some(dns_mode) = DnsMode::parse(&args.dns_mode) else {
        error!(
            "invalid DNS mode {:?}; use nxdomain, redirect, or drop",
            args.dns_mode
        );
        return ExitCode::from(1);
    };

    let cfg = Config {
        interface: args.interface,
        data_dir: args.data_dir,
        gateway_ip: args.gateway,
        proxy_port: args.port,
        ssl_insecure: !args.strict_upstream,
        dns_mode,
        dns_redirect_ip: args.dns_redirect,
        quiet_mode: args.quiet,
        spoof_interval_secs: args.interval,
        scan_interval_secs: args.scan_interval,
        ca_profile: args.ca_profile,
        ..Config::default()
    };

    info!("netwarden v{} starting", VERSION);
    info!(
        "proxy port {} | dns mode {} | stealth {}",
        cfg.proxy_port,
        cfg.dns_mode.as_str(),
        cfg.quiet_mode
    );

    let sink = EventSink::new();
    let monitor = match Monitor::new(cfg, hostops::platform(), sink) {
        Ok(monitor) => Arc::new(monitor),
        Err(e) => {
            error!("startup failed: {}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = monitor.start().await {
        error!("startup failed: {}", e);
        monitor.shutdown().await;
        return ExitCode::from(1);
    }

    // Initial targets from the command line.
    if let Some(targets) = &args.targets {
        for ip in targets.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if ip.parse::<Ipv4Addr>().is_err() {
                error!("skipping invalid target ip {:?}", ip);
                continue;
            }
            monitor
                .handle_command(Command::AddTarget {
                    ip: ip.to_string(),
                    hostname: None,
                })
                .await;
        }
    }

    info!("netwarden running; reading commands on stdin");

    // Command loop until `stop`, EOF, ctrl-c, or a fatal runtime error.
    let command_monitor = monitor.clone();
    let mut exit = ExitCode::SUCCESS;
    tokio::select! {
        _ = command_monitor.run_command_loop() => {
            info!("command loop ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
        msg = monitor.fatal_error() => {
            error!("fatal: {}", msg);
            exit = ExitCode::from(2);
        }
    }

    monitor.shutdown().await;
    info!("netwarden stopped");
    exit
}
