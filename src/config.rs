//! Daemon configuration and CLI front end.
//!
//! Defaults mirror the original `netd_config.h` constants exactly so a
//! freshly started daemon behaves the same as the reference implementation.

use clap::Parser;

/// `10.0.2.15`
pub const DEFAULT_IP: u32 = 0x0A00_020F;
/// `255.255.255.0`
pub const DEFAULT_MASK: u32 = 0xFFFF_FF00;
/// `10.0.2.2`
pub const DEFAULT_GW: u32 = 0x0A00_0202;
/// `10.0.2.3`
pub const DEFAULT_DNS: u32 = 0x0A00_0203;

pub const MAX_CLIENTS: usize = 8;
pub const ARP_CACHE_SIZE: usize = 16;
pub const FRAME_MAX: usize = 1600;
pub const ICMP_DATA_SIZE: usize = 56;
pub const ARP_TIMEOUT_MS: u64 = 800;
pub const PING_ID: u16 = 0x1234;
pub const TCP_RX_CAP: usize = 4096;
pub const TLS_RX_CAP: usize = 8192;
pub const TCP_MSS: usize = 1200;
pub const DNS_MAX_WAITS: usize = 8;
pub const DNS_CACHE_SIZE: usize = 32;
pub const DNS_CACHE_DEFAULT_TTL_MS: u32 = 60_000;
pub const HTTP_MAX_REDIRECTS: u32 = 4;
pub const HTTP_HEADER_BUF_CAP: usize = 2048;
pub const HTTP_BODY_CHUNK_CAP: usize = 512;
pub const HTTP_LINE_CAP: usize = 64;
pub const HTTP_LOCATION_CAP: usize = 384;
pub const HTTP_HOST_CAP: usize = 253;
pub const EVENT_LOOP_TICK_MS: u64 = 50;
pub const COOPERATIVE_SLEEP_MS: u64 = 10;
pub const IPC_MAX_PAYLOAD: usize = 1024;
pub const IPC_MAGIC: u16 = 0x4E74;

#[derive(Parser, Debug, Clone)]
#[command(name = "networkd", about = "User-space network daemon core")]
pub struct Args {
    /// Path to the raw Ethernet device handle.
    #[arg(long, default_value = "/dev/ne2k0")]
    pub device: String,

    /// IPv4 address, dotted quad.
    #[arg(long)]
    pub ip: Option<String>,

    /// Netmask, dotted quad.
    #[arg(long)]
    pub mask: Option<String>,

    /// Default gateway, dotted quad.
    #[arg(long)]
    pub gw: Option<String>,

    /// DNS server, dotted quad.
    #[arg(long)]
    pub dns: Option<String>,

    /// Name of the local IPC listen endpoint.
    #[arg(long, default_value = "networkd")]
    pub ipc_name: String,

    /// Log level filter passed to `tracing_subscriber::EnvFilter` when
    /// `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy)]
pub struct IfaceConfig {
    pub ip: u32,
    pub mask: u32,
    pub gw: u32,
    pub dns: u32,
}

impl Default for IfaceConfig {
    fn default() -> Self {
        Self {
            ip: DEFAULT_IP,
            mask: DEFAULT_MASK,
            gw: DEFAULT_GW,
            dns: DEFAULT_DNS,
        }
    }
}

pub fn parse_ipv4(s: &str) -> Option<u32> {
    let mut parts = s.split('.');
    let mut out: u32 = 0;
    for _ in 0..4 {
        let octet: u8 = parts.next()?.parse().ok()?;
        out = (out << 8) | octet as u32;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

impl Args {
    pub fn iface_config(&self) -> IfaceConfig {
        let mut cfg = IfaceConfig::default();
        if let Some(ip) = self.ip.as_deref().and_then(parse_ipv4) {
            cfg.ip = ip;
        }
        if let Some(mask) = self.mask.as_deref().and_then(parse_ipv4) {
            cfg.mask = mask;
        }
        if let Some(gw) = self.gw.as_deref().and_then(parse_ipv4) {
            cfg.gw = gw;
        }
        if let Some(dns) = self.dns.as_deref().and_then(parse_ipv4) {
            cfg.dns = dns;
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_constants() {
        assert_eq!(DEFAULT_IP, 0x0A00020F);
        assert_eq!(DEFAULT_MASK, 0xFFFFFF00);
        assert_eq!(DEFAULT_GW, 0x0A000202);
        assert_eq!(DEFAULT_DNS, 0x0A000203);
    }

    #[test]
    fn parses_dotted_quad() {
        assert_eq!(parse_ipv4("10.0.2.15"), Some(DEFAULT_IP));
        assert_eq!(parse_ipv4("127.0.0.1"), Some(0x7F00_0001));
        assert_eq!(parse_ipv4("10.0.2"), None);
        assert_eq!(parse_ipv4("10.0.2.15.1"), None);
    }
}
