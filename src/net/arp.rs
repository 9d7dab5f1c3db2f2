//! ARP cache + request/reply (spec §4.3), RFC 826.

use tracing::{debug, trace, warn};

use crate::config::ARP_CACHE_SIZE;
use crate::error::NetError;
use crate::net::device::Device;
use crate::net::eth::{EthHeader, ETHERTYPE_ARP};

pub const ARP_HTYPE_ETHERNET: u16 = 1;
pub const ARP_PTYPE_IPV4: u16 = 0x0800;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

#[derive(Clone, Copy, Default)]
struct ArpEntry {
    used: bool,
    ip: u32,
    mac: [u8; 6],
}

pub struct ArpCache {
    entries: [ArpEntry; ARP_CACHE_SIZE],
    next_slot: usize,
}

impl ArpCache {
    pub fn new() -> Self {
        Self {
            entries: [ArpEntry::default(); ARP_CACHE_SIZE],
            next_slot: 0,
        }
    }

    pub fn lookup(&self, ip: u32) -> Option<[u8; 6]> {
        self.entries
            .iter()
            .find(|e| e.used && e.ip == ip)
            .map(|e| e.mac)
    }

    pub fn update(&mut self, ip: u32, mac: [u8; 6]) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.used && e.ip == ip) {
            e.mac = mac;
            return;
        }

        let slot = self.next_slot % ARP_CACHE_SIZE;
        self.next_slot += 1;
        let evicted = self.entries[slot];
        if evicted.used {
            debug!(ip = evicted.ip, slot, "ARP cache evicting FIFO entry");
        }
        self.entries[slot] = ArpEntry {
            used: true,
            ip,
            mac,
        };
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed view over an inbound ARP packet (Ethernet header already stripped).
pub struct ArpPacket {
    pub htype: u16,
    pub ptype: u16,
    pub hlen: u8,
    pub plen: u8,
    pub opcode: u16,
    pub sha: [u8; 6],
    pub spa: u32,
    pub tha: [u8; 6],
    pub tpa: u32,
}

pub const ARP_WIRE_LEN: usize = 28;

impl ArpPacket {
    pub fn parse(buf: &[u8]) -> Option<ArpPacket> {
        if buf.len() < ARP_WIRE_LEN {
            return None;
        }
        Some(ArpPacket {
            htype: u16::from_be_bytes([buf[0], buf[1]]),
            ptype: u16::from_be_bytes([buf[2], buf[3]]),
            hlen: buf[4],
            plen: buf[5],
            opcode: u16::from_be_bytes([buf[6], buf[7]]),
            sha: buf[8..14].try_into().unwrap(),
            spa: u32::from_be_bytes(buf[14..18].try_into().unwrap()),
            tha: buf[18..24].try_into().unwrap(),
            tpa: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
        })
    }

    fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.htype.to_be_bytes());
        out[2..4].copy_from_slice(&self.ptype.to_be_bytes());
        out[4] = self.hlen;
        out[5] = self.plen;
        out[6..8].copy_from_slice(&self.opcode.to_be_bytes());
        out[8..14].copy_from_slice(&self.sha);
        out[14..18].copy_from_slice(&self.spa.to_be_bytes());
        out[18..24].copy_from_slice(&self.tha);
        out[24..28].copy_from_slice(&self.tpa.to_be_bytes());
    }
}

fn send_arp(
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    dst_mac: [u8; 6],
    opcode: u16,
    our_ip: u32,
    target_mac: [u8; 6],
    target_ip: u32,
) -> std::io::Result<()> {
    let eth = EthHeader {
        dst: dst_mac,
        src: our_mac,
        ethertype: ETHERTYPE_ARP,
    };
    let arp = ArpPacket {
        htype: ARP_HTYPE_ETHERNET,
        ptype: ARP_PTYPE_IPV4,
        hlen: 6,
        plen: 4,
        opcode,
        sha: our_mac,
        spa: our_ip,
        tha: target_mac,
        tpa: target_ip,
    };

    let mut frame = vec![0u8; EthHeader::LEN + ARP_WIRE_LEN];
    eth.write(&mut frame[..EthHeader::LEN]);
    arp.write(&mut frame[EthHeader::LEN..]);
    dev.write(&frame)
}

pub fn send_request(
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    target_ip: u32,
) -> std::io::Result<()> {
    trace!(target_ip, "sending ARP request");
    send_arp(
        dev,
        our_mac,
        [0xFF; 6],
        ARP_OP_REQUEST,
        our_ip,
        [0; 6],
        target_ip,
    )
}

fn send_reply(
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    target_mac: [u8; 6],
    target_ip: u32,
) -> std::io::Result<()> {
    send_arp(
        dev,
        our_mac,
        target_mac,
        ARP_OP_REPLY,
        our_ip,
        target_mac,
        target_ip,
    )
}

/// Handles one inbound ARP packet: updates the cache and replies to
/// requests targeting our IP.
pub fn process_frame(
    cache: &mut ArpCache,
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    payload: &[u8],
) {
    let Some(arp) = ArpPacket::parse(payload) else {
        return;
    };
    if arp.htype != ARP_HTYPE_ETHERNET || arp.ptype != ARP_PTYPE_IPV4 {
        return;
    }
    if arp.hlen != 6 || arp.plen != 4 {
        return;
    }

    cache.update(arp.spa, arp.sha);

    if arp.opcode == ARP_OP_REQUEST && arp.tpa == our_ip {
        if let Err(e) = send_reply(dev, our_mac, our_ip, arp.sha, arp.spa) {
            warn!(error = %e, "failed to send ARP reply");
        }
    }
}

/// Blocking resolve: spec §4.3 `arp_resolve_mac`. `process_tick` is called on
/// every poll iteration to let the caller drain the device into `cache` via
/// `process_frame`.
pub fn resolve_mac(
    cache: &mut ArpCache,
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    target_ip: u32,
    timeout_ms: u64,
    mut process_tick: impl FnMut(&mut ArpCache, &mut dyn Device),
    mut sleep: impl FnMut(u64),
) -> Result<[u8; 6], NetError> {
    if let Some(mac) = cache.lookup(target_ip) {
        return Ok(mac);
    }

    let step_ms = 10u64;
    let mut elapsed = 0u64;
    let mut next_send = 0u64;

    while elapsed < timeout_ms {
        if elapsed >= next_send {
            let _ = send_request(dev, our_mac, our_ip, target_ip);
            next_send += 200;
        }

        process_tick(cache, dev);

        if let Some(mac) = cache.lookup(target_ip) {
            return Ok(mac);
        }

        sleep(step_ms);
        elapsed += step_ms;
    }

    Err(NetError::ArpTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_eviction_after_17_entries() {
        let mut cache = ArpCache::new();
        for i in 0..17u32 {
            cache.update(i, [i as u8; 6]);
        }
        // Entry 0 was evicted by entry 16 wrapping into slot 0.
        assert_eq!(cache.lookup(0), None);
        for i in 1..17u32 {
            assert_eq!(cache.lookup(i), Some([i as u8; 6]));
        }
    }

    #[test]
    fn update_existing_entry_does_not_evict() {
        let mut cache = ArpCache::new();
        cache.update(1, [1; 6]);
        cache.update(1, [9; 6]);
        assert_eq!(cache.lookup(1), Some([9; 6]));
    }

    #[test]
    fn request_reply_round_trip() {
        use crate::net::device::DeviceSim;

        let mut cache = ArpCache::new();
        let mut dev = DeviceSim::new([0xAA; 6]);
        let our_ip = 0x0A00_020Fu32;
        let peer_mac = [0xBB; 6];
        let peer_ip = 0x0A00_0201u32;

        let request = ArpPacket {
            htype: ARP_HTYPE_ETHERNET,
            ptype: ARP_PTYPE_IPV4,
            hlen: 6,
            plen: 4,
            opcode: ARP_OP_REQUEST,
            sha: peer_mac,
            spa: peer_ip,
            tha: [0; 6],
            tpa: our_ip,
        };
        let mut payload = [0u8; ARP_WIRE_LEN];
        request.write(&mut payload);

        process_frame(&mut cache, &mut dev, [0xAA; 6], our_ip, &payload);

        assert_eq!(cache.lookup(peer_ip), Some(peer_mac));
        let sent = dev.take_outbound();
        assert_eq!(sent.len(), 1);
        let reply = ArpPacket::parse(&sent[0][EthHeader::LEN..]).unwrap();
        assert_eq!(reply.opcode, ARP_OP_REPLY);
        assert_eq!(reply.spa, our_ip);
        assert_eq!(reply.tpa, peer_ip);
    }
}
