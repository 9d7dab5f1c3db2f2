//! Stub DNS resolver: query encode, response parse/correlate, and both the
//! non-blocking step API and the blocking wrapper built on top of it (spec
//! §4.5, `SPEC_FULL.md`'s `[MODULE: dns — non-blocking step API]`), grounded
//! in `netd_dns.c`.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::DNS_MAX_WAITS;
use crate::crypto::Rand;
use crate::error::NetError;
use crate::net::dns_cache::DnsCache;
use crate::stats::Stats;

const DNS_HDR_LEN: usize = 12;
const UDP_HDR_LEN: usize = 8;

fn port_from_id(id: u16) -> u16 {
    49152u16.wrapping_add(id & 0x03FF)
}

fn gen_id(rand: &mut Rand, now: Instant) -> u16 {
    let mut buf = [0u8; 2];
    rand.bytes(&mut buf);
    let r = u16::from_be_bytes(buf);
    if r != 0 {
        r
    } else {
        (now.elapsed().as_millis() as u16) | 1
    }
}

/// Encodes a dotted name into DNS label form (`3www6example3com0`). Returns
/// `None` if any label exceeds 63 bytes or the name is empty.
fn encode_qname(name: &str, out: &mut Vec<u8>) -> Option<()> {
    if name.is_empty() {
        return None;
    }
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        if label.len() > 63 {
            return None;
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Some(())
}

fn build_query(id: u16, name: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(300);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD=1
    out.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    out.extend_from_slice(&0u16.to_be_bytes()); // ancount
    out.extend_from_slice(&0u16.to_be_bytes()); // nscount
    out.extend_from_slice(&0u16.to_be_bytes()); // arcount
    encode_qname(name, &mut out)?;
    out.extend_from_slice(&1u16.to_be_bytes()); // qtype A
    out.extend_from_slice(&1u16.to_be_bytes()); // qclass IN
    Some(out)
}

/// Advances `off` past one (possibly compressed) name, RFC 1035 §4.1.4.
fn skip_name(msg: &[u8], mut off: usize) -> Option<usize> {
    let mut jumps = 0u32;
    let mut jumped = false;
    let mut ret = off;

    loop {
        if off >= msg.len() {
            return None;
        }
        let b = msg[off];
        if b == 0 {
            off += 1;
            if !jumped {
                ret = off;
            }
            return Some(ret);
        }
        if b & 0xC0 == 0xC0 {
            if off + 1 >= msg.len() {
                return None;
            }
            let ptr = (((b & 0x3F) as usize) << 8) | (msg[off + 1] as usize);
            if ptr >= msg.len() {
                return None;
            }
            if !jumped {
                ret = off + 2;
                jumped = true;
            }
            off = ptr;
            jumps += 1;
            if jumps > 16 {
                return None;
            }
            continue;
        }
        if b & 0xC0 != 0 {
            return None;
        }
        let label_len = b as usize;
        off += 1;
        if off + label_len > msg.len() {
            return None;
        }
        off += label_len;
    }
}

/// Parses one DNS response, matching it against `expect_id`. Returns the
/// first A record's address and TTL (seconds) on success.
fn parse_response(msg: &[u8], expect_id: u16) -> Option<(u32, u32)> {
    if msg.len() < DNS_HDR_LEN {
        return None;
    }
    let rid = u16::from_be_bytes([msg[0], msg[1]]);
    if rid != expect_id {
        return None;
    }
    let flags = u16::from_be_bytes([msg[2], msg[3]]);
    if flags & 0x8000 == 0 {
        return None; // not a response
    }
    if flags & 0x000F != 0 {
        return None; // rcode != 0
    }

    let qdcount = u16::from_be_bytes([msg[4], msg[5]]);
    let ancount = u16::from_be_bytes([msg[6], msg[7]]);

    let mut off = DNS_HDR_LEN;
    for _ in 0..qdcount {
        off = skip_name(msg, off)?;
        if off + 4 > msg.len() {
            return None;
        }
        off += 4;
    }

    for _ in 0..ancount {
        off = skip_name(msg, off)?;
        if off + 10 > msg.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([msg[off], msg[off + 1]]);
        let rclass = u16::from_be_bytes([msg[off + 2], msg[off + 3]]);
        let ttl = u32::from_be_bytes(msg[off + 4..off + 8].try_into().unwrap());
        let rdlen = u16::from_be_bytes([msg[off + 8], msg[off + 9]]) as usize;
        off += 10;
        if off + rdlen > msg.len() {
            return None;
        }
        if rtype == 1 && rclass == 1 && rdlen == 4 {
            let addr = u32::from_be_bytes(msg[off..off + 4].try_into().unwrap());
            return Some((addr, ttl));
        }
        off += rdlen;
    }

    None
}

#[derive(Default, Clone, Copy)]
struct DnsWaitState {
    active: bool,
    received: bool,
    id: u16,
    port: u16,
    addr: u32,
    ttl: u32,
}

pub struct DnsWaitSlot {
    state: DnsWaitState,
    start: Option<Instant>,
    timeout: Duration,
}

impl Default for DnsWaitSlot {
    fn default() -> Self {
        Self {
            state: DnsWaitState::default(),
            start: None,
            timeout: Duration::from_millis(1000),
        }
    }
}

/// Fixed-size table of in-flight queries, `SPEC_FULL.md`'s multi-slot
/// primary API (the original's single-slot `ctx->dns_wait` is the degenerate
/// one-slot case and isn't separately modeled here).
pub struct DnsWaits {
    slots: [DnsWaitSlot; DNS_MAX_WAITS],
}

impl DnsWaits {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
        }
    }

    fn alloc(&mut self) -> Option<usize> {
        self.slots.iter().position(|s| !s.state.active)
    }

    /// Handles one inbound UDP payload (header included) from the
    /// configured DNS server, matching it against any active wait slot and
    /// populating the resolver cache on success.
    pub fn process_udp(
        &mut self,
        src_ip: u32,
        dns_server: u32,
        payload: &[u8],
        name_by_slot: impl Fn(usize) -> Option<String>,
        cache: &mut DnsCache,
        now: Instant,
        stats: &mut Stats,
    ) {
        if dns_server == 0 || src_ip != dns_server {
            return;
        }
        if payload.len() < UDP_HDR_LEN {
            return;
        }
        let src_port = u16::from_be_bytes([payload[0], payload[1]]);
        let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
        let udp_len = u16::from_be_bytes([payload[4], payload[5]]) as usize;
        if src_port != 53 || udp_len < UDP_HDR_LEN || udp_len > payload.len() {
            return;
        }
        let dns_msg = &payload[UDP_HDR_LEN..udp_len];

        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.state.active || slot.state.received || dst_port != slot.state.port {
                continue;
            }
            if let Some((addr, ttl)) = parse_response(dns_msg, slot.state.id) {
                slot.state.addr = addr;
                slot.state.ttl = ttl;
                slot.state.received = true;
                stats.dns_responses += 1;
                debug!(addr, ttl, "DNS response matched wait slot");
                if let Some(name) = name_by_slot(i) {
                    cache.insert(&name, addr, ttl.saturating_mul(1000), now);
                }
            }
        }
    }

    /// Allocates a wait slot and sends the query via `send`. `send` is
    /// injected so this module never touches `Device`/`ArpCache` directly.
    pub fn query_start(
        &mut self,
        name: &str,
        timeout_ms: u64,
        now: Instant,
        rand: &mut Rand,
        mut send: impl FnMut(u16, &[u8]) -> Result<(), NetError>,
        stats: &mut Stats,
    ) -> Result<usize, NetError> {
        if name.is_empty() {
            return Err(NetError::Malformed("empty DNS name"));
        }
        let handle = self.alloc().ok_or(NetError::Unreachable)?;

        let id = gen_id(rand, now);
        let port = port_from_id(id);
        let query = build_query(id, name).ok_or(NetError::Malformed("dns query too long"))?;

        send(port, &query)?;

        let timeout_ms = if timeout_ms == 0 { 1000 } else { timeout_ms };
        self.slots[handle] = DnsWaitSlot {
            state: DnsWaitState {
                active: true,
                received: false,
                id,
                port,
                addr: 0,
                ttl: 0,
            },
            start: Some(now),
            timeout: Duration::from_millis(timeout_ms),
        };
        stats.dns_queries += 1;
        trace!(name, handle, "DNS query started");
        Ok(handle)
    }

    /// Non-blocking poll: `Ok(Some(addr))` resolved, `Ok(None)` still
    /// pending, `Err(Timeout)` expired (slot freed either way once decided).
    pub fn query_poll(
        &mut self,
        handle: usize,
        now: Instant,
        stats: &mut Stats,
    ) -> Result<Option<u32>, NetError> {
        let slot = self.slots.get_mut(handle).ok_or(NetError::NotConnected)?;
        if !slot.state.active {
            return Err(NetError::NotConnected);
        }

        if slot.state.received {
            let addr = slot.state.addr;
            slot.state = DnsWaitState::default();
            return Ok(Some(addr));
        }

        let elapsed = slot.start.map(|s| now.duration_since(s)).unwrap_or_default();
        if elapsed >= slot.timeout {
            slot.state = DnsWaitState::default();
            stats.dns_timeouts += 1;
            return Err(NetError::Timeout);
        }

        Ok(None)
    }

    pub fn query_cancel(&mut self, handle: usize) {
        if let Some(slot) = self.slots.get_mut(handle) {
            slot.state = DnsWaitState::default();
        }
    }

    /// Blocking resolve built on the step API (spec §4.5's `netd_dns_query`):
    /// starts a query and ticks until resolved or timed out.
    #[allow(clippy::too_many_arguments)]
    pub fn query(
        &mut self,
        name: &str,
        timeout_ms: u64,
        now: Instant,
        rand: &mut Rand,
        send: impl FnMut(u16, &[u8]) -> Result<(), NetError>,
        stats: &mut Stats,
        mut process_tick: impl FnMut(&mut Self),
        mut sleep: impl FnMut(u64),
        mut clock: impl FnMut() -> Instant,
    ) -> Result<u32, NetError> {
        let handle = self.query_start(name, timeout_ms, now, rand, send, stats)?;

        loop {
            process_tick(self);
            match self.query_poll(handle, clock(), stats) {
                Ok(Some(addr)) => return Ok(addr),
                Ok(None) => {
                    sleep(10);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for DnsWaits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_response(id: u16, name: &str, addr: u32, ttl: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&0x8180u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        encode_qname(name, &mut out).unwrap();
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        // answer
        out.extend_from_slice(&0xC00Cu16.to_be_bytes()); // pointer to qname at offset 12
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&ttl.to_be_bytes());
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&addr.to_be_bytes());
        out
    }

    #[test]
    fn qname_round_trip_via_skip_name() {
        let mut buf = Vec::new();
        encode_qname("example.com", &mut buf).unwrap();
        let end = skip_name(&buf, 0).unwrap();
        assert_eq!(end, buf.len());
    }

    #[test]
    fn parses_compressed_response() {
        let id = 0xABCD;
        let msg = build_response(id, "example.com", 0x0A0B0C0D, 300);
        let (addr, ttl) = parse_response(&msg, id).unwrap();
        assert_eq!(addr, 0x0A0B0C0D);
        assert_eq!(ttl, 300);
    }

    #[test]
    fn rejects_id_mismatch() {
        let msg = build_response(1, "example.com", 1, 60);
        assert!(parse_response(&msg, 2).is_none());
    }

    #[test]
    fn query_start_then_process_udp_resolves() {
        let mut waits = DnsWaits::new();
        let mut rand = Rand::new();
        let mut cache = DnsCache::new();
        let mut stats = Stats::new();
        let now = Instant::now();

        let mut sent_port = 0u16;
        let mut sent_query = Vec::new();
        let handle = waits
            .query_start(
                "example.com",
                1000,
                now,
                &mut rand,
                |port, query| {
                    sent_port = port;
                    sent_query = query.to_vec();
                    Ok(())
                },
                &mut stats,
            )
            .unwrap();

        let id = u16::from_be_bytes([sent_query[0], sent_query[1]]);
        let dns_resp = build_response(id, "example.com", 0x01020304, 60);
        let mut udp_payload = Vec::new();
        udp_payload.extend_from_slice(&53u16.to_be_bytes());
        udp_payload.extend_from_slice(&sent_port.to_be_bytes());
        udp_payload.extend_from_slice(&((UDP_HDR_LEN + dns_resp.len()) as u16).to_be_bytes());
        udp_payload.extend_from_slice(&0u16.to_be_bytes());
        udp_payload.extend_from_slice(&dns_resp);

        waits.process_udp(
            0x0A00_0203,
            0x0A00_0203,
            &udp_payload,
            |_| Some("example.com".to_string()),
            &mut cache,
            now,
            &mut stats,
        );

        assert_eq!(waits.query_poll(handle, now, &mut stats).unwrap(), Some(0x01020304));
        assert_eq!(cache.lookup("example.com", now, &mut stats), Some(0x01020304));
    }

    #[test]
    fn query_poll_times_out() {
        let mut waits = DnsWaits::new();
        let mut rand = Rand::new();
        let mut stats = Stats::new();
        let now = Instant::now();

        let handle = waits
            .query_start("x.test", 100, now, &mut rand, |_, _| Ok(()), &mut stats)
            .unwrap();

        let later = now + Duration::from_millis(200);
        let err = waits.query_poll(handle, later, &mut stats).unwrap_err();
        assert!(matches!(err, NetError::Timeout));
        assert_eq!(stats.dns_timeouts, 1);
    }
}
