//! Stateless UDP send (spec §4.4), RFC 768.

use tracing::trace;

use crate::config::ARP_TIMEOUT_MS;
use crate::error::NetError;
use crate::net::arp::ArpCache;
use crate::net::device::Device;
use crate::net::eth::{EthHeader, ETHERTYPE_IPV4};
use crate::net::ipv4::{ip_same_subnet, Ipv4Header, PROTO_UDP};
use crate::stats::Stats;

pub const HEADER_LEN: usize = 8;

/// Builds and sends one UDP/IPv4/Ethernet frame, resolving the next-hop MAC
/// via the ARP cache first (spec §4.4 `netd_udp_send`). The UDP checksum is
/// left at zero, matching the original (optional over IPv4).
#[allow(clippy::too_many_arguments)]
pub fn send(
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    our_mask: u32,
    gateway: u32,
    dst_ip: u32,
    dst_port: u16,
    src_port: u16,
    payload: &[u8],
    arp_cache: &mut ArpCache,
    stats: &mut Stats,
    process_tick: impl FnMut(&mut ArpCache, &mut dyn Device),
    sleep: impl FnMut(u64),
) -> Result<(), NetError> {
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
        process_tick,
        sleep,
    )?;

    let udp_len = HEADER_LEN + payload.len();
    let total_len = Ipv4Header::MIN_LEN + udp_len;

    let mut udp = vec![0u8; udp_len];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[6..8].copy_from_slice(&0u16.to_be_bytes());
    udp[HEADER_LEN..].copy_from_slice(payload);

    let ip_hdr = Ipv4Header {
        ihl: Ipv4Header::MIN_LEN as u8,
        total_len: total_len as u16,
        ttl: 64,
        proto: PROTO_UDP,
        src: our_ip,
        dst: dst_ip,
    };

    let mut frame = vec![0u8; EthHeader::LEN + total_len];
    EthHeader {
        dst: dst_mac,
        src: our_mac,
        ethertype: ETHERTYPE_IPV4,
    }
    .write(&mut frame[..EthHeader::LEN]);
    ip_hdr.write(&mut frame[EthHeader::LEN..EthHeader::LEN + Ipv4Header::MIN_LEN]);
    frame[EthHeader::LEN + Ipv4Header::MIN_LEN..].copy_from_slice(&udp);

    dev.write(&frame).map_err(|_| NetError::Unreachable)?;
    stats.ipv4_tx(total_len as u32, PROTO_UDP);
    trace!(dst_ip, dst_port, len = payload.len(), "sent UDP datagram");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::DeviceSim;

    #[test]
    fn builds_well_formed_datagram() {
        let our_mac = [0xAA; 6];
        let our_ip = 0x0A00_020Fu32;
        let our_mask = 0xFFFF_FF00u32;
        let peer_mac = [0xBB; 6];
        let peer_ip = 0x0A00_0201u32;

        let mut dev = DeviceSim::new(our_mac);
        let mut cache = ArpCache::new();
        cache.update(peer_ip, peer_mac);
        let mut stats = Stats::new();

        send(
            &mut dev,
            our_mac,
            our_ip,
            our_mask,
            0,
            peer_ip,
            53,
            49200,
            b"hello",
            &mut cache,
            &mut stats,
            |_, _| {},
            |_| {},
        )
        .unwrap();

        let sent = dev.take_outbound();
        assert_eq!(sent.len(), 1);
        let frame = &sent[0];
        let ip = Ipv4Header::parse(&frame[EthHeader::LEN..]).unwrap();
        assert_eq!(ip.proto, PROTO_UDP);
        assert_eq!(ip.src, our_ip);
        assert_eq!(ip.dst, peer_ip);

        let udp = &frame[EthHeader::LEN + Ipv4Header::MIN_LEN..];
        assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 49200);
        assert_eq!(u16::from_be_bytes([udp[2], udp[3]]), 53);
        assert_eq!(&udp[HEADER_LEN..], b"hello");
        assert_eq!(stats.ipv4_tx_packets, 1);
    }

    #[test]
    fn no_route_without_gateway() {
        let mut dev = DeviceSim::new([0xAA; 6]);
        let mut cache = ArpCache::new();
        let mut stats = Stats::new();
        let err = send(
            &mut dev,
            [0xAA; 6],
            0x0A00_020F,
            0xFFFF_FF00,
            0,
            0x0B00_0201,
            53,
            1234,
            b"x",
            &mut cache,
            &mut stats,
            |_, _| {},
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, NetError::Unreachable));
    }
}
