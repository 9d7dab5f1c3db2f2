//! IPv4 receive/send, ICMP echo (spec §4.4), RFC 791 / RFC 792.

use tracing::{debug, trace, warn};

use crate::config::{ARP_TIMEOUT_MS, ICMP_DATA_SIZE, PING_ID};
use crate::error::NetError;
use crate::net::arp::ArpCache;
use crate::net::checksum::checksum;
use crate::net::device::Device;
use crate::net::eth::{EthHeader, ETHERTYPE_IPV4};
use crate::stats::Stats;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;

pub struct Ipv4Header {
    pub ihl: u8,
    pub total_len: u16,
    pub ttl: u8,
    pub proto: u8,
    pub src: u32,
    pub dst: u32,
}

impl Ipv4Header {
    pub const MIN_LEN: usize = 20;

    pub fn parse(buf: &[u8]) -> Option<Ipv4Header> {
        if buf.len() < Self::MIN_LEN {
            return None;
        }
        let version = buf[0] >> 4;
        let ihl = (buf[0] & 0x0F) * 4;
        if version != 4 || (ihl as usize) < Self::MIN_LEN {
            return None;
        }
        if buf.len() < ihl as usize {
            return None;
        }
        if checksum(&buf[..ihl as usize]) != 0 {
            return None;
        }

        Some(Ipv4Header {
            ihl,
            total_len: u16::from_be_bytes([buf[2], buf[3]]),
            ttl: buf[8],
            proto: buf[9],
            src: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
            dst: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }

    pub(crate) fn write(&self, out: &mut [u8]) {
        out[0] = 0x45;
        out[1] = 0; // tos
        out[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        out[4..6].copy_from_slice(&0u16.to_be_bytes()); // id
        out[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags_frag
        out[8] = self.ttl;
        out[9] = self.proto;
        out[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum placeholder
        out[12..16].copy_from_slice(&self.src.to_be_bytes());
        out[16..20].copy_from_slice(&self.dst.to_be_bytes());
        let cksum = checksum(&out[..20]);
        out[10..12].copy_from_slice(&cksum.to_be_bytes());
    }
}

pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub id: u16,
    pub seq: u16,
}

impl IcmpHeader {
    pub const LEN: usize = 8;

    pub fn parse(buf: &[u8]) -> Option<IcmpHeader> {
        if buf.len() < Self::LEN {
            return None;
        }
        if checksum(buf) != 0 {
            return None;
        }
        Some(IcmpHeader {
            icmp_type: buf[0],
            code: buf[1],
            id: u16::from_be_bytes([buf[4], buf[5]]),
            seq: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }
}

/// True iff `ip` is on the same subnet as `local`/`mask`.
pub fn ip_same_subnet(ip: u32, local: u32, mask: u32) -> bool {
    (ip & mask) == (local & mask)
}

#[derive(Default)]
pub struct PingWait {
    pub active: bool,
    pub received: bool,
    pub id: u16,
    pub seq: u16,
    pub target_ip: u32,
}

fn send_icmp_reply(
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    peer_mac: [u8; 6],
    our_ip: u32,
    peer_ip: u32,
    icmp_payload: &[u8],
) -> std::io::Result<()> {
    let mut icmp = icmp_payload.to_vec();
    icmp[0] = ICMP_TYPE_ECHO_REPLY;
    icmp[1] = 0;
    icmp[2] = 0;
    icmp[3] = 0;
    let cksum = checksum(&icmp);
    icmp[2..4].copy_from_slice(&cksum.to_be_bytes());

    let ip_hdr = Ipv4Header {
        ihl: 20,
        total_len: (20 + icmp.len()) as u16,
        ttl: 64,
        proto: PROTO_ICMP,
        src: our_ip,
        dst: peer_ip,
    };

    let mut frame = vec![0u8; EthHeader::LEN + 20 + icmp.len()];
    EthHeader {
        dst: peer_mac,
        src: our_mac,
        ethertype: ETHERTYPE_IPV4,
    }
    .write(&mut frame[..EthHeader::LEN]);
    ip_hdr.write(&mut frame[EthHeader::LEN..EthHeader::LEN + 20]);
    frame[EthHeader::LEN + 20..].copy_from_slice(&icmp);

    dev.write(&frame)
}

fn send_icmp_echo(
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    dst_mac: [u8; 6],
    our_ip: u32,
    dst_ip: u32,
    seq: u16,
) -> std::io::Result<()> {
    let mut icmp = vec![0u8; IcmpHeader::LEN + ICMP_DATA_SIZE];
    icmp[0] = ICMP_TYPE_ECHO_REQUEST;
    icmp[1] = 0;
    icmp[4..6].copy_from_slice(&PING_ID.to_be_bytes());
    icmp[6..8].copy_from_slice(&seq.to_be_bytes());
    for (i, b) in icmp[IcmpHeader::LEN..].iter_mut().enumerate() {
        *b = (i & 0xFF) as u8;
    }
    let cksum = checksum(&icmp);
    icmp[2..4].copy_from_slice(&cksum.to_be_bytes());

    let ip_hdr = Ipv4Header {
        ihl: 20,
        total_len: (20 + icmp.len()) as u16,
        ttl: 64,
        proto: PROTO_ICMP,
        src: our_ip,
        dst: dst_ip,
    };

    let mut frame = vec![0u8; EthHeader::LEN + 20 + icmp.len()];
    EthHeader {
        dst: dst_mac,
        src: our_mac,
        ethertype: ETHERTYPE_IPV4,
    }
    .write(&mut frame[..EthHeader::LEN]);
    ip_hdr.write(&mut frame[EthHeader::LEN..EthHeader::LEN + 20]);
    frame[EthHeader::LEN + 20..].copy_from_slice(&icmp);

    dev.write(&frame)
}

/// Outcome of processing one inbound IPv4 payload, for layers above (TCP/DNS)
/// to react to.
pub enum Ipv4Event<'a> {
    None,
    Udp {
        src: u32,
        payload: &'a [u8],
    },
    Tcp {
        src: u32,
        payload: &'a [u8],
    },
}

/// Parses and validates one inbound Ethernet+IPv4 frame, handling ICMP
/// locally (echo reply and ping-wait matching) and returning a higher-layer
/// event for UDP/TCP payloads.
pub fn process_frame<'a>(
    frame: &'a [u8],
    our_mac: [u8; 6],
    our_ip: u32,
    ping_wait: &mut PingWait,
    dev: &mut dyn Device,
    stats: &mut Stats,
) -> Ipv4Event<'a> {
    let Some(eth) = EthHeader::parse(frame) else {
        return Ipv4Event::None;
    };
    if eth.ethertype != ETHERTYPE_IPV4 {
        return Ipv4Event::None;
    }
    let ip_buf = &frame[EthHeader::LEN..];
    let Some(ip) = Ipv4Header::parse(ip_buf) else {
        stats.ipv4_checksum_errors += 1;
        return Ipv4Event::None;
    };

    if (ip.total_len as usize) < ip.ihl as usize || (ip.total_len as usize) > ip_buf.len() {
        stats.ipv4_dropped += 1;
        return Ipv4Event::None;
    }
    if ip.dst != our_ip && ip.dst != 0xFFFF_FFFF {
        return Ipv4Event::None;
    }

    stats.ipv4_rx(ip.total_len as u32, ip.proto);
    let payload = &ip_buf[ip.ihl as usize..ip.total_len as usize];

    match ip.proto {
        PROTO_ICMP => {
            let Some(icmp) = IcmpHeader::parse(payload) else {
                stats.ipv4_checksum_errors += 1;
                return Ipv4Event::None;
            };

            if icmp.icmp_type == ICMP_TYPE_ECHO_REQUEST && ip.dst == our_ip {
                trace!(src = ip.src, "ICMP echo request");
                if let Err(e) = send_icmp_reply(dev, our_mac, eth.src, our_ip, ip.src, payload) {
                    warn!(error = %e, "failed to send ICMP echo reply");
                }
            } else if icmp.icmp_type == ICMP_TYPE_ECHO_REPLY
                && ping_wait.active
                && !ping_wait.received
                && icmp.id == ping_wait.id
                && icmp.seq == ping_wait.seq
                && ip.src == ping_wait.target_ip
            {
                debug!(src = ip.src, "ICMP echo reply matched ping wait");
                ping_wait.received = true;
            }
            Ipv4Event::None
        }
        PROTO_UDP => Ipv4Event::Udp {
            src: ip.src,
            payload,
        },
        PROTO_TCP => Ipv4Event::Tcp {
            src: ip.src,
            payload,
        },
        _ => Ipv4Event::None,
    }
}

/// Blocking `send_ping` (spec §4.4 + the IPC `PING_REQ` handler): resolves
/// the next hop, sends one echo request, and waits for the matching reply.
#[allow(clippy::too_many_arguments)]
pub fn send_ping(
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    our_mask: u32,
    gateway: u32,
    dst_ip: u32,
    seq: u16,
    timeout_ms: u64,
    arp_cache: &mut ArpCache,
    ping_wait: &mut PingWait,
    mut process_tick: impl FnMut(&mut ArpCache, &mut PingWait, &mut dyn Device),
    mut sleep: impl FnMut(u64),
) -> Result<u64, NetError> {
    let next_hop = if ip_same_subnet(dst_ip, our_ip, our_mask) {
        dst_ip
    } else if gateway != 0 {
        gateway
    } else {
        return Err(NetError::Unreachable);
    };

    let dst_mac = crate::net::arp::resolve_mac(
        arp_cache,
        dev,
        our_mac,
        our_ip,
        next_hop,
        ARP_TIMEOUT_MS,
        |cache, dev| process_tick(cache, ping_wait, dev),
        &mut sleep,
    )?;

    send_icmp_echo(dev, our_mac, dst_mac, our_ip, dst_ip, seq).map_err(|_| NetError::Unreachable)?;

    ping_wait.active = true;
    ping_wait.received = false;
    ping_wait.id = PING_ID;
    ping_wait.seq = seq;
    ping_wait.target_ip = dst_ip;

    let step_ms = 10u64;
    let mut elapsed = 0u64;
    while elapsed < timeout_ms {
        process_tick(arp_cache, ping_wait, dev);
        if ping_wait.received {
            ping_wait.active = false;
            return Ok(elapsed);
        }
        sleep(step_ms);
        elapsed += step_ms;
    }

    ping_wait.active = false;
    Err(NetError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::DeviceSim;

    #[test]
    fn same_subnet_check() {
        assert!(ip_same_subnet(0x0A00_0201, 0x0A00_020F, 0xFFFF_FF00));
        assert!(!ip_same_subnet(0x0B00_0201, 0x0A00_020F, 0xFFFF_FF00));
    }

    #[test]
    fn echo_request_produces_reply() {
        let our_mac = [0xAA; 6];
        let our_ip = 0x0A00_020Fu32;
        let peer_mac = [0xBB; 6];
        let peer_ip = 0x0A00_0201u32;

        let mut icmp = vec![0u8; IcmpHeader::LEN + 4];
        icmp[0] = ICMP_TYPE_ECHO_REQUEST;
        icmp[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
        icmp[6..8].copy_from_slice(&1u16.to_be_bytes());
        let cksum = checksum(&icmp);
        icmp[2..4].copy_from_slice(&cksum.to_be_bytes());

        let ip_hdr = Ipv4Header {
            ihl: 20,
            total_len: (20 + icmp.len()) as u16,
            ttl: 64,
            proto: PROTO_ICMP,
            src: peer_ip,
            dst: our_ip,
        };
        let mut frame = vec![0u8; EthHeader::LEN + 20 + icmp.len()];
        EthHeader {
            dst: our_mac,
            src: peer_mac,
            ethertype: ETHERTYPE_IPV4,
        }
        .write(&mut frame[..EthHeader::LEN]);
        ip_hdr.write(&mut frame[EthHeader::LEN..EthHeader::LEN + 20]);
        frame[EthHeader::LEN + 20..].copy_from_slice(&icmp);

        let mut dev = DeviceSim::new(our_mac);
        let mut ping_wait = PingWait::default();
        let mut stats = Stats::new();
        let event = process_frame(&frame, our_mac, our_ip, &mut ping_wait, &mut dev, &mut stats);
        assert!(matches!(event, Ipv4Event::None));

        let sent = dev.take_outbound();
        assert_eq!(sent.len(), 1);
        let reply_ip = Ipv4Header::parse(&sent[0][EthHeader::LEN..]).unwrap();
        assert_eq!(reply_ip.src, our_ip);
        assert_eq!(reply_ip.dst, peer_ip);
        let reply_icmp =
            IcmpHeader::parse(&sent[0][EthHeader::LEN + 20..]).unwrap();
        assert_eq!(reply_icmp.icmp_type, ICMP_TYPE_ECHO_REPLY);
    }
}
