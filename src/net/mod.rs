//! Network stack: Ethernet/ARP/IPv4 up through UDP-based DNS, TCP, TLS 1.3,
//! and HTTP/1.0 (spec §4).

pub mod arp;
pub mod checksum;
pub mod device;
pub mod dns;
pub mod dns_cache;
pub mod eth;
pub mod http;
pub mod ipc;
pub mod ipv4;
pub mod tcp;
pub mod tls;
pub mod udp;
