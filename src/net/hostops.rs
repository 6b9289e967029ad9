//! Host OS capability seam.
//!
//! Everything that mutates host networking state (IP forwarding, the 80/443
//! redirect rules, the DNS drop filter) goes through this trait so the core
//! stays platform-independent and testable. Privilege failures here are
//! fatal at startup.

use std::io;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Platform operations the monitor needs from the host.
pub trait HostOps: Send + Sync {
    /// Enable IPv4 forwarding, returning the prior state for restoration.
    fn enable_ip_forwarding(&self) -> io::Result<bool>;
    /// Restore IPv4 forwarding to `prior`.
    fn restore_ip_forwarding(&self, prior: bool) -> io::Result<()>;
    /// Install redirect rules sending inbound 80/443 from non-local sources
    /// to the local proxy port.
    fn install_redirect(&self, proxy_port: u16) -> io::Result<()>;
    /// Remove the redirect rules installed by `install_redirect`.
    fn remove_redirect(&self, proxy_port: u16) -> io::Result<()>;
    /// Toggle the udp/53 drop filter used by DNS drop mode. With forwarding
    /// enabled the kernel would otherwise relay blocked queries upstream.
    fn set_dns_filter(&self, enabled: bool) -> io::Result<()>;
}

/// Linux implementation: procfs for forwarding, iptables for redirect and
/// the DNS filter.
pub struct LinuxHostOps;

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

fn iptables(args: &[&str]) -> io::Result<()> {
    let output = Command::new("iptables").args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "iptables {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

impl HostOps for LinuxHostOps {
    fn enable_ip_forwarding(&self) -> io::Result<bool> {
        let prior = std::fs::read_to_string(IP_FORWARD)?.trim() == "1";
        std::fs::write(IP_FORWARD, "1")?;
        info!("IPv4 forwarding enabled (was {})", if prior { "on" } else { "off" });
        Ok(prior)
    }

    fn restore_ip_forwarding(&self, prior: bool) -> io::Result<()> {
        std::fs::write(IP_FORWARD, if prior { "1" } else { "0" })?;
        info!("IPv4 forwarding restored to {}", if prior { "on" } else { "off" });
        Ok(())
    }

    fn install_redirect(&self, proxy_port: u16) -> io::Result<()> {
        let port = proxy_port.to_string();
        for dport in ["80", "443"] {
            iptables(&[
                "-t", "nat", "-A", "PREROUTING", "-p", "tcp", "--dport", dport,
                "-j", "REDIRECT", "--to-port", &port,
            ])?;
        }
        info!("redirect rules installed: 80,443 -> {}", proxy_port);
        Ok(())
    }

    fn remove_redirect(&self, proxy_port: u16) -> io::Result<()> {
        let port = proxy_port.to_string();
        for dport in ["80", "443"] {
            if let Err(e) = iptables(&[
                "-t", "nat", "-D", "PREROUTING", "-p", "tcp", "--dport", dport,
                "-j", "REDIRECT", "--to-port", &port,
            ]) {
                warn!("failed to remove redirect rule for {}: {}", dport, e);
            }
        }
        Ok(())
    }

    fn set_dns_filter(&self, enabled: bool) -> io::Result<()> {
        let action = if enabled { "-A" } else { "-D" };
        iptables(&["-t", "filter", action, "FORWARD", "-p", "udp", "--dport", "53", "-j", "DROP"])?;
        info!("DNS drop filter {}", if enabled { "installed" } else { "removed" });
        Ok(())
    }
}

/// Inert implementation recording its calls; used by tests and dry runs.
#[derive(Default)]
pub struct MockHostOps {
    pub forwarding: AtomicBool,
    pub redirect_installed: AtomicBool,
    pub dns_filter: AtomicBool,
}

impl HostOps for MockHostOps {
    fn enable_ip_forwarding(&self) -> io::Result<bool> {
        Ok(self.forwarding.swap(true, Ordering::SeqCst))
    }

    fn restore_ip_forwarding(&self, prior: bool) -> io::Result<()> {
        self.forwarding.store(prior, Ordering::SeqCst);
        Ok(())
    }

    fn install_redirect(&self, _proxy_port: u16) -> io::Result<()> {
        self.redirect_installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn remove_redirect(&self, _proxy_port: u16) -> io::Result<()> {
        self.redirect_installed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_dns_filter(&self, enabled: bool) -> io::Result<()> {
        self.dns_filter.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

/// The platform implementation for this build.
#[cfg(target_os = "linux")]
pub fn platform() -> std::sync::Arc<dyn HostOps> {
    std::sync::Arc::new(LinuxHostOps)
}

#[cfg(not(target_os = "linux"))]
pub fn platform() -> std::sync::Arc<dyn HostOps> {
    warn!("no host-ops implementation for this platform; using inert mock");
    std::sync::Arc::new(MockHostOps::default())
}
