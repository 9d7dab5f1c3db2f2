//! Single-connection TCP client (spec §4.6): SYN_SENT → ESTABLISHED →
//! FIN_WAIT/CLOSE_WAIT → CLOSED, ring-buffered RX window, no retransmit on
//! loss, grounded in `netd_tcp.c`.

use tracing::{debug, trace};

use crate::config::{ARP_TIMEOUT_MS, TCP_MSS, TCP_RX_CAP};
use crate::error::NetError;
use crate::net::arp::ArpCache;
use crate::net::checksum::{checksum_with_pseudo, pseudo_header_sum};
use crate::net::device::Device;
use crate::net::eth::{EthHeader, ETHERTYPE_IPV4};
use crate::net::ipv4::{ip_same_subnet, Ipv4Header, PROTO_TCP};
use crate::stats::Stats;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;

pub const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynSent,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
}

pub struct TcpConn {
    pub state: TcpState,
    pub remote_ip: u32,
    pub remote_port: u16,
    pub local_port: u16,
    pub iss: u32,
    pub irs: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub fin_sent: bool,
    pub fin_acked: bool,
    pub remote_closed: bool,
    rx_buf: Vec<u8>,
    rx_r: usize,
    rx_w: usize,
}

impl TcpConn {
    pub fn new() -> Self {
        Self {
            state: TcpState::Closed,
            remote_ip: 0,
            remote_port: 0,
            local_port: 0,
            iss: 0,
            irs: 0,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            fin_sent: false,
            fin_acked: false,
            remote_closed: false,
            rx_buf: vec![0u8; TCP_RX_CAP],
            rx_r: 0,
            rx_w: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != TcpState::Closed
    }

    pub fn reset(&mut self) {
        self.state = TcpState::Closed;
        self.remote_ip = 0;
        self.remote_port = 0;
        self.local_port = 0;
        self.iss = 0;
        self.irs = 0;
        self.snd_una = 0;
        self.snd_nxt = 0;
        self.rcv_nxt = 0;
        self.fin_sent = false;
        self.fin_acked = false;
        self.remote_closed = false;
        self.rx_r = 0;
        self.rx_w = 0;
    }

    fn rx_count(&self) -> usize {
        if self.rx_w >= self.rx_r {
            self.rx_w - self.rx_r
        } else {
            TCP_RX_CAP - (self.rx_r - self.rx_w)
        }
    }

    fn rx_space(&self) -> usize {
        let used = self.rx_count();
        if used >= TCP_RX_CAP - 1 {
            0
        } else {
            TCP_RX_CAP - 1 - used
        }
    }

    fn window(&self) -> u16 {
        self.rx_space().min(0xFFFF) as u16
    }

    fn rx_write(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.rx_space());
        if len == 0 {
            return 0;
        }
        let first = (TCP_RX_CAP - self.rx_w).min(len);
        self.rx_buf[self.rx_w..self.rx_w + first].copy_from_slice(&data[..first]);
        if len > first {
            self.rx_buf[..len - first].copy_from_slice(&data[first..len]);
        }
        self.rx_w = (self.rx_w + len) % TCP_RX_CAP;
        len
    }

    fn rx_read(&mut self, out: &mut [u8]) -> usize {
        let avail = self.rx_count();
        let cap = out.len().min(avail);
        if cap == 0 {
            return 0;
        }
        let first = (TCP_RX_CAP - self.rx_r).min(cap);
        out[..first].copy_from_slice(&self.rx_buf[self.rx_r..self.rx_r + first]);
        if cap > first {
            out[first..cap].copy_from_slice(&self.rx_buf[..cap - first]);
        }
        self.rx_r = (self.rx_r + cap) % TCP_RX_CAP;
        cap
    }

    // ---- non-blocking step API (`netd_tcp.h`'s tcp_open_start/open_poll,
    // tcp_send_poll, tcp_close_start/close_poll, tcp_recv_nowait), mirroring
    // `DnsWaits::query_start`/`query_poll` in `net::dns` -------------------

    /// Resets the connection, allocates an ephemeral port/ISS, and sends one
    /// SYN. Returns as soon as the SYN is on the wire; poll `open_poll` after
    /// draining inbound frames through `process_segment` each tick.
    #[allow(clippy::too_many_arguments)]
    pub fn open_start(
        &mut self,
        dev: &mut dyn Device,
        our_mac: [u8; 6],
        our_ip: u32,
        our_mask: u32,
        gateway: u32,
        arp_cache: &mut ArpCache,
        dst_ip: u32,
        dst_port: u16,
        clock_ms: u32,
        stats: &mut Stats,
        mut process_tick: impl FnMut(&mut TcpConn, &mut ArpCache, &mut dyn Device),
        mut sleep: impl FnMut(u64),
    ) -> Result<(), NetError> {
        self.reset();

        let local_port = 49152u16.wrapping_add((clock_ms & 0x0FFF) as u16);
        let local_port = if local_port == 0 { 49152 } else { local_port };
        let mut iss = clock_ms.wrapping_mul(1_103_515_245).wrapping_add(12345);
        if iss == 0 {
            iss = 1;
        }

        self.state = TcpState::SynSent;
        self.remote_ip = dst_ip;
        self.remote_port = dst_port;
        self.local_port = local_port;
        self.iss = iss;
        self.snd_una = iss;
        self.snd_nxt = iss;
        self.rcv_nxt = 0;

        if let Err(e) = send_segment(
            dev,
            our_mac,
            our_ip,
            our_mask,
            gateway,
            arp_cache,
            self,
            FLAG_SYN,
            &[],
            &mut process_tick,
            &mut sleep,
        ) {
            self.reset();
            stats.tcp_failed += 1;
            return Err(e);
        }
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        Ok(())
    }

    /// Non-blocking: `Some(Ok(()))` once ESTABLISHED, `Some(Err(_))` if the
    /// attempt was aborted (RST, reset to `Closed` by the peer), `None`
    /// while still awaiting the SYN-ACK.
    pub fn open_poll(&self) -> Option<Result<(), NetError>> {
        match self.state {
            TcpState::SynSent => None,
            TcpState::Closed => Some(Err(NetError::ConnReset)),
            _ => Some(Ok(())),
        }
    }

    /// Non-blocking: sends the next `<= TCP_MSS` chunk of `data` once the
    /// previous one has been fully ACKed (or immediately on the first call),
    /// advancing `*off`. Returns `Ok(true)` once `*off == data.len()` and the
    /// last chunk has been ACKed.
    #[allow(clippy::too_many_arguments)]
    pub fn send_poll(
        &mut self,
        dev: &mut dyn Device,
        our_mac: [u8; 6],
        our_ip: u32,
        our_mask: u32,
        gateway: u32,
        arp_cache: &mut ArpCache,
        data: &[u8],
        off: &mut usize,
        stats: &mut Stats,
        mut process_tick: impl FnMut(&mut TcpConn, &mut ArpCache, &mut dyn Device),
        mut sleep: impl FnMut(u64),
    ) -> Result<bool, NetError> {
        if !self.is_active() || self.state != TcpState::Established {
            return Err(NetError::NotConnected);
        }
        if self.snd_una != self.snd_nxt {
            return Ok(false); // awaiting the ACK for the in-flight chunk
        }
        if *off >= data.len() {
            stats.tcp_tx_bytes += data.len() as u64;
            return Ok(true);
        }

        let chunk_len = (data.len() - *off).min(TCP_MSS);
        send_segment(
            dev,
            our_mac,
            our_ip,
            our_mask,
            gateway,
            arp_cache,
            self,
            FLAG_ACK | FLAG_PSH,
            &data[*off..*off + chunk_len],
            &mut process_tick,
            &mut sleep,
        )?;
        self.snd_nxt = self.snd_nxt.wrapping_add(chunk_len as u32);
        *off += chunk_len;
        Ok(false)
    }

    /// Non-blocking: sends FIN|ACK once if ESTABLISHED/CLOSE_WAIT, advancing
    /// to FIN_WAIT_1/LAST_ACK; a no-op once already closing or inactive.
    #[allow(clippy::too_many_arguments)]
    pub fn close_start(
        &mut self,
        dev: &mut dyn Device,
        our_mac: [u8; 6],
        our_ip: u32,
        our_mask: u32,
        gateway: u32,
        arp_cache: &mut ArpCache,
        mut process_tick: impl FnMut(&mut TcpConn, &mut ArpCache, &mut dyn Device),
        mut sleep: impl FnMut(u64),
    ) -> Result<(), NetError> {
        if !self.is_active() {
            return Ok(());
        }
        if matches!(self.state, TcpState::Established | TcpState::CloseWait) && !self.fin_sent {
            if let Err(e) = send_segment(
                dev,
                our_mac,
                our_ip,
                our_mask,
                gateway,
                arp_cache,
                self,
                FLAG_FIN | FLAG_ACK,
                &[],
                &mut process_tick,
                &mut sleep,
            ) {
                self.reset();
                return Err(e);
            }
            self.fin_sent = true;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.state = if self.state == TcpState::CloseWait {
                TcpState::LastAck
            } else {
                TcpState::FinWait1
            };
        }
        Ok(())
    }

    /// Non-blocking: `true` once our FIN has been ACKed and the peer's FIN
    /// has arrived (safe for the caller to reset and report closed), or the
    /// connection was already inactive.
    pub fn close_poll(&self) -> bool {
        !self.is_active() || (self.fin_sent && self.fin_acked && self.remote_closed)
    }

    /// Non-blocking: drains the ring into `out`, reopening the advertised
    /// window with an ACK if it had been full. `Ok(Some(0))` is clean EOF
    /// (`remote_closed` with an empty ring); `Ok(None)` means no data is
    /// available yet and the connection is still open.
    #[allow(clippy::too_many_arguments)]
    pub fn recv_nowait(
        &mut self,
        dev: &mut dyn Device,
        our_mac: [u8; 6],
        our_ip: u32,
        our_mask: u32,
        gateway: u32,
        arp_cache: &mut ArpCache,
        out: &mut [u8],
        stats: &mut Stats,
        mut process_tick: impl FnMut(&mut TcpConn, &mut ArpCache, &mut dyn Device),
        mut sleep: impl FnMut(u64),
    ) -> Result<Option<usize>, NetError> {
        if !self.is_active() {
            return Err(NetError::NotConnected);
        }

        let space_before = self.rx_space();
        let got = self.rx_read(out);
        if got > 0 {
            if space_before == 0 && self.rx_space() > 0 {
                send_ack(
                    dev, our_mac, our_ip, our_mask, gateway, arp_cache, self, &mut process_tick,
                    &mut sleep,
                );
            }
            stats.tcp_rx_bytes += got as u64;
            return Ok(Some(got));
        }

        if self.remote_closed {
            return Ok(Some(0));
        }

        Ok(None)
    }
}

impl Default for TcpConn {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds, checksums, and writes one TCP/IPv4/Ethernet frame, resolving the
/// next-hop MAC first.
#[allow(clippy::too_many_arguments)]
fn send_segment(
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    our_mask: u32,
    gateway: u32,
    arp_cache: &mut ArpCache,
    conn: &mut TcpConn,
    flags: u8,
    payload: &[u8],
    mut process_tick: impl FnMut(&mut TcpConn, &mut ArpCache, &mut dyn Device),
    mut sleep: impl FnMut(u64),
) -> Result<(), NetError> {
    let next_hop = if ip_same_subnet(conn.remote_ip, our_ip, our_mask) {
        conn.remote_ip
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
        |cache, dev| process_tick(conn, cache, dev),
        &mut sleep,
    )?;

    let tcp_len = HEADER_LEN + payload.len();
    let mut tcp = vec![0u8; tcp_len];
    tcp[0..2].copy_from_slice(&conn.local_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&conn.remote_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&conn.snd_nxt.to_be_bytes());
    tcp[8..12].copy_from_slice(&conn.rcv_nxt.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&conn.window().to_be_bytes());
    tcp[16..18].copy_from_slice(&0u16.to_be_bytes());
    tcp[18..20].copy_from_slice(&0u16.to_be_bytes());
    tcp[HEADER_LEN..].copy_from_slice(payload);

    let pseudo = pseudo_header_sum(our_ip, conn.remote_ip, PROTO_TCP, tcp_len as u16);
    let cksum = checksum_with_pseudo(pseudo, &tcp);
    tcp[16..18].copy_from_slice(&cksum.to_be_bytes());

    let total_len = Ipv4Header::MIN_LEN + tcp_len;
    let ip_hdr = Ipv4Header {
        ihl: Ipv4Header::MIN_LEN as u8,
        total_len: total_len as u16,
        ttl: 64,
        proto: PROTO_TCP,
        src: our_ip,
        dst: conn.remote_ip,
    };

    let mut frame = vec![0u8; EthHeader::LEN + total_len];
    EthHeader {
        dst: dst_mac,
        src: our_mac,
        ethertype: ETHERTYPE_IPV4,
    }
    .write(&mut frame[..EthHeader::LEN]);
    ip_hdr.write(&mut frame[EthHeader::LEN..EthHeader::LEN + Ipv4Header::MIN_LEN]);
    frame[EthHeader::LEN + Ipv4Header::MIN_LEN..].copy_from_slice(&tcp);

    dev.write(&frame).map_err(|_| NetError::Unreachable)
}

fn send_ack(
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    our_mask: u32,
    gateway: u32,
    arp_cache: &mut ArpCache,
    conn: &mut TcpConn,
    process_tick: impl FnMut(&mut TcpConn, &mut ArpCache, &mut dyn Device),
    sleep: impl FnMut(u64),
) {
    let _ = send_segment(
        dev,
        our_mac,
        our_ip,
        our_mask,
        gateway,
        arp_cache,
        conn,
        FLAG_ACK,
        &[],
        process_tick,
        sleep,
    );
}

/// Handles one inbound TCP segment for the active connection (spec §4.6
/// "Segment receive"). `segment` is the IPv4 payload (TCP header included);
/// its checksum must already have been verified by the caller... actually
/// verified here, since the pseudo-header needs the enclosing IP addresses.
#[allow(clippy::too_many_arguments)]
pub fn process_segment(
    conn: &mut TcpConn,
    src_ip: u32,
    dst_ip: u32,
    segment: &[u8],
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_mask: u32,
    gateway: u32,
    arp_cache: &mut ArpCache,
    stats: &mut Stats,
    mut process_tick: impl FnMut(&mut TcpConn, &mut ArpCache, &mut dyn Device),
    mut sleep: impl FnMut(u64),
) {
    if segment.len() < HEADER_LEN {
        return;
    }
    let data_offset = ((segment[12] >> 4) as usize) * 4;
    if data_offset < HEADER_LEN || data_offset > segment.len() {
        return;
    }

    let pseudo = pseudo_header_sum(src_ip, dst_ip, PROTO_TCP, segment.len() as u16);
    if checksum_with_pseudo(pseudo, segment) != 0 {
        stats.ipv4_checksum_errors += 1;
        return;
    }

    let src_port = u16::from_be_bytes([segment[0], segment[1]]);
    let dst_port = u16::from_be_bytes([segment[2], segment[3]]);

    if !conn.is_active() {
        return;
    }
    if src_ip != conn.remote_ip || src_port != conn.remote_port || dst_port != conn.local_port {
        return;
    }

    let flags = segment[13];
    let seq = u32::from_be_bytes(segment[4..8].try_into().unwrap());
    let ack = u32::from_be_bytes(segment[8..12].try_into().unwrap());
    let seg_data = &segment[data_offset..];
    let seg_data_len = seg_data.len() as u32;

    if flags & FLAG_RST != 0 {
        debug!("TCP RST received, resetting connection");
        conn.reset();
        return;
    }

    if ack.wrapping_sub(conn.snd_una) != 0
        && ack.wrapping_sub(conn.snd_una) <= conn.snd_nxt.wrapping_sub(conn.snd_una)
    {
        conn.snd_una = ack;
        if conn.fin_sent && conn.snd_una == conn.snd_nxt {
            conn.fin_acked = true;
        }
    }

    if conn.state == TcpState::SynSent {
        if flags & FLAG_SYN != 0 && flags & FLAG_ACK != 0 {
            if ack != conn.snd_nxt {
                return;
            }
            conn.irs = seq;
            conn.rcv_nxt = seq.wrapping_add(1);
            conn.snd_una = ack;
            conn.state = TcpState::Established;
            stats.tcp_connections += 1;
            send_ack(
                dev, our_mac, dst_ip, our_mask, gateway, arp_cache, conn, &mut process_tick,
                &mut sleep,
            );
        }
        return;
    }

    if matches!(
        conn.state,
        TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
    ) {
        if seg_data_len > 0 {
            if seq != conn.rcv_nxt {
                send_ack(
                    dev, our_mac, dst_ip, our_mask, gateway, arp_cache, conn, &mut process_tick,
                    &mut sleep,
                );
                return;
            }
            let space = conn.rx_space();
            if seg_data_len as usize > space {
                send_ack(
                    dev, our_mac, dst_ip, our_mask, gateway, arp_cache, conn, &mut process_tick,
                    &mut sleep,
                );
                return;
            }
            conn.rx_write(seg_data);
            conn.rcv_nxt = conn.rcv_nxt.wrapping_add(seg_data_len);
            stats.tcp_rx_bytes += seg_data_len as u64;
            send_ack(
                dev, our_mac, dst_ip, our_mask, gateway, arp_cache, conn, &mut process_tick,
                &mut sleep,
            );
        }

        if flags & FLAG_FIN != 0 {
            if seq == conn.rcv_nxt || seq.wrapping_add(seg_data_len) == conn.rcv_nxt {
                conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
            }
            conn.remote_closed = true;
            trace!("TCP FIN received");
            send_ack(
                dev, our_mac, dst_ip, our_mask, gateway, arp_cache, conn, &mut process_tick,
                &mut sleep,
            );

            if conn.state == TcpState::Established {
                conn.state = TcpState::CloseWait;
            }
            if conn.state == TcpState::FinWait1 && conn.fin_acked {
                conn.state = TcpState::FinWait2;
            }
        }
    }
}

/// Spec §4.6 `connect`: thin blocking wrapper over `open_start`/`open_poll`,
/// allocating an ephemeral port and ISS, sending SYN, and driving RX until
/// ESTABLISHED or timeout.
#[allow(clippy::too_many_arguments)]
pub fn connect(
    conn: &mut TcpConn,
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    our_mask: u32,
    gateway: u32,
    arp_cache: &mut ArpCache,
    dst_ip: u32,
    dst_port: u16,
    timeout_ms: u64,
    clock_ms: u32,
    stats: &mut Stats,
    mut process_tick: impl FnMut(&mut TcpConn, &mut ArpCache, &mut dyn Device),
    mut sleep: impl FnMut(u64),
) -> Result<(), NetError> {
    conn.open_start(
        dev,
        our_mac,
        our_ip,
        our_mask,
        gateway,
        arp_cache,
        dst_ip,
        dst_port,
        clock_ms,
        stats,
        &mut process_tick,
        &mut sleep,
    )?;

    let step = 10u64;
    let mut elapsed = 0u64;
    while elapsed < timeout_ms {
        process_tick(conn, arp_cache, dev);
        match conn.open_poll() {
            Some(Ok(())) => return Ok(()),
            Some(Err(e)) => {
                stats.tcp_failed += 1;
                return Err(e);
            }
            None => {}
        }
        sleep(step);
        elapsed += step;
    }

    conn.reset();
    stats.tcp_timeouts += 1;
    Err(NetError::Timeout)
}

/// Spec §4.6 `send`: thin blocking wrapper over `send_poll`, chunking `data`
/// into `<= TCP_MSS` segments, each awaiting its own ACK before the next is
/// sent (no pipelining, no retransmit).
#[allow(clippy::too_many_arguments)]
pub fn send(
    conn: &mut TcpConn,
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    our_mask: u32,
    gateway: u32,
    arp_cache: &mut ArpCache,
    data: &[u8],
    timeout_ms: u64,
    stats: &mut Stats,
    mut process_tick: impl FnMut(&mut TcpConn, &mut ArpCache, &mut dyn Device),
    mut sleep: impl FnMut(u64),
) -> Result<(), NetError> {
    if !conn.is_active() || conn.state != TcpState::Established {
        return Err(NetError::NotConnected);
    }

    let step = 10u64;
    let mut elapsed = 0u64;
    let mut off = 0usize;

    loop {
        if conn.send_poll(
            dev,
            our_mac,
            our_ip,
            our_mask,
            gateway,
            arp_cache,
            data,
            &mut off,
            stats,
            &mut process_tick,
            &mut sleep,
        )? {
            return Ok(());
        }
        if elapsed >= timeout_ms {
            stats.tcp_timeouts += 1;
            return Err(NetError::Timeout);
        }
        process_tick(conn, arp_cache, dev);
        sleep(step);
        elapsed += step;
    }
}

/// Spec §4.6 `recv`: thin blocking wrapper over `recv_nowait`; `remote_closed`
/// with an empty ring yields `Ok(0)` (clean EOF), matching the wire contract.
#[allow(clippy::too_many_arguments)]
pub fn recv(
    conn: &mut TcpConn,
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    our_mask: u32,
    gateway: u32,
    arp_cache: &mut ArpCache,
    out: &mut [u8],
    timeout_ms: u64,
    stats: &mut Stats,
    mut process_tick: impl FnMut(&mut TcpConn, &mut ArpCache, &mut dyn Device),
    mut sleep: impl FnMut(u64),
) -> Result<usize, NetError> {
    if !conn.is_active() {
        return Err(NetError::NotConnected);
    }

    let step = 10u64;
    let mut elapsed = 0u64;

    loop {
        if let Some(n) = conn.recv_nowait(
            dev,
            our_mac,
            our_ip,
            our_mask,
            gateway,
            arp_cache,
            out,
            stats,
            &mut process_tick,
            &mut sleep,
        )? {
            return Ok(n);
        }

        if elapsed >= timeout_ms {
            stats.tcp_timeouts += 1;
            return Err(NetError::Timeout);
        }
        process_tick(conn, arp_cache, dev);
        sleep(step);
        elapsed += step;
    }
}

/// Spec §4.6 `close`: thin blocking wrapper over `close_start`/`close_poll`.
/// ESTABLISHED/CLOSE_WAIT send FIN|ACK once and advance to
/// FIN_WAIT_1/LAST_ACK respectively, then drive RX until both our FIN has
/// been acked and the peer's FIN has arrived.
#[allow(clippy::too_many_arguments)]
pub fn close(
    conn: &mut TcpConn,
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    our_mask: u32,
    gateway: u32,
    arp_cache: &mut ArpCache,
    timeout_ms: u64,
    stats: &mut Stats,
    mut process_tick: impl FnMut(&mut TcpConn, &mut ArpCache, &mut dyn Device),
    mut sleep: impl FnMut(u64),
) -> Result<(), NetError> {
    if !conn.is_active() {
        return Ok(());
    }

    conn.close_start(
        dev,
        our_mac,
        our_ip,
        our_mask,
        gateway,
        arp_cache,
        &mut process_tick,
        &mut sleep,
    )?;

    let step = 10u64;
    let mut elapsed = 0u64;
    while elapsed < timeout_ms {
        process_tick(conn, arp_cache, dev);
        if conn.close_poll() {
            conn.reset();
            stats.tcp_closes += 1;
            return Ok(());
        }
        sleep(step);
        elapsed += step;
    }

    conn.reset();
    stats.tcp_timeouts += 1;
    Err(NetError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::device::DeviceSim;

    #[test]
    fn connect_times_out_and_sends_syn() {
        let mut conn = TcpConn::new();
        let mut dev = DeviceSim::new([0xAA; 6]);
        let mut arp_cache = ArpCache::new();
        let our_ip = 0x0A00_020Fu32;
        let dst_ip = 0x0A00_0201u32;
        arp_cache.update(dst_ip, [0xBB; 6]);
        let mut stats = Stats::new();

        let err = connect(
            &mut conn,
            &mut dev,
            [0xAA; 6],
            our_ip,
            0xFFFF_FF00,
            0,
            &mut arp_cache,
            dst_ip,
            80,
            20,
            12345,
            &mut stats,
            |_, _, _| {},
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, NetError::Timeout));
        assert_eq!(stats.tcp_timeouts, 1);
        assert_eq!(conn.state, TcpState::Closed);

        let sent = dev.take_outbound();
        assert_eq!(sent.len(), 1);
        let tcp = &sent[0][EthHeader::LEN + Ipv4Header::MIN_LEN..];
        assert_eq!(tcp[13], FLAG_SYN);
    }

    #[test]
    fn syn_sent_transitions_to_established_on_synack() {
        let our_ip = 0x0A00_020Fu32;
        let remote_ip = 0x0A00_0201u32;

        let mut conn = TcpConn::new();
        conn.state = TcpState::SynSent;
        conn.remote_ip = remote_ip;
        conn.remote_port = 80;
        conn.local_port = 50000;
        conn.iss = 1000;
        conn.snd_una = 1000;
        conn.snd_nxt = 1001;

        let mut reply = vec![0u8; HEADER_LEN];
        reply[0..2].copy_from_slice(&80u16.to_be_bytes());
        reply[2..4].copy_from_slice(&50000u16.to_be_bytes());
        reply[4..8].copy_from_slice(&500u32.to_be_bytes());
        reply[8..12].copy_from_slice(&1001u32.to_be_bytes());
        reply[12] = 5 << 4;
        reply[13] = FLAG_SYN | FLAG_ACK;
        reply[14..16].copy_from_slice(&4096u16.to_be_bytes());
        let pseudo = pseudo_header_sum(remote_ip, our_ip, PROTO_TCP, reply.len() as u16);
        let cksum = checksum_with_pseudo(pseudo, &reply);
        reply[16..18].copy_from_slice(&cksum.to_be_bytes());

        let mut dev = DeviceSim::new([0xAA; 6]);
        let mut arp_cache = ArpCache::new();
        arp_cache.update(remote_ip, [0xBB; 6]);
        let mut stats = Stats::new();

        process_segment(
            &mut conn,
            remote_ip,
            our_ip,
            &reply,
            &mut dev,
            [0xAA; 6],
            0xFFFF_FF00,
            0,
            &mut arp_cache,
            &mut stats,
            |_, _, _| {},
            |_| {},
        );

        assert_eq!(conn.state, TcpState::Established);
        assert_eq!(conn.rcv_nxt, 501);
        assert_eq!(conn.snd_una, 1001);
        assert_eq!(stats.tcp_connections, 1);

        let sent = dev.take_outbound();
        assert_eq!(sent.len(), 1);
        let tcp = &sent[0][EthHeader::LEN + Ipv4Header::MIN_LEN..];
        assert_eq!(tcp[13], FLAG_ACK);
    }

    #[test]
    fn rx_ring_wraps_correctly() {
        let mut conn = TcpConn::new();
        let data = vec![7u8; TCP_RX_CAP - 1];
        assert_eq!(conn.rx_write(&data), TCP_RX_CAP - 1);
        assert_eq!(conn.rx_space(), 0);
        let mut out = vec![0u8; 10];
        assert_eq!(conn.rx_read(&mut out), 10);
        assert_eq!(conn.rx_write(&[1, 2, 3]), 3);
        let mut rest = vec![0u8; TCP_RX_CAP - 1 - 10 + 3];
        let got = conn.rx_read(&mut rest);
        assert_eq!(got, rest.len());
    }

    #[test]
    fn close_from_close_wait_goes_to_last_ack() {
        let mut conn = TcpConn::new();
        conn.state = TcpState::CloseWait;
        conn.remote_closed = true;
        conn.snd_una = 1;
        conn.snd_nxt = 1;
        conn.remote_ip = 0x0A00_0201;
        conn.remote_port = 80;
        conn.local_port = 50000;

        let mut dev = DeviceSim::new([0xAA; 6]);
        let mut arp_cache = ArpCache::new();
        arp_cache.update(conn.remote_ip, [0xBB; 6]);
        let mut stats = Stats::new();
        let mut observed: Option<TcpState> = None;

        // Peer acks the FIN on the first tick so the call resolves with
        // Ok(()) instead of timing out and resetting the state we want to
        // observe.
        let result = close(
            &mut conn,
            &mut dev,
            [0xAA; 6],
            0x0A00_020F,
            0xFFFF_FF00,
            0,
            &mut arp_cache,
            50,
            &mut stats,
            |conn, _, _| {
                observed.get_or_insert(conn.state);
                conn.fin_acked = true;
            },
            |_| {},
        );

        assert_eq!(observed, Some(TcpState::LastAck));
        assert!(result.is_ok());
        assert_eq!(conn.state, TcpState::Closed);
        assert_eq!(stats.tcp_closes, 1);
    }

    #[test]
    fn close_from_established_goes_to_fin_wait_1() {
        let mut conn = TcpConn::new();
        conn.state = TcpState::Established;
        conn.remote_ip = 0x0A00_0201;
        conn.remote_port = 80;
        conn.local_port = 50000;
        conn.snd_una = 1;
        conn.snd_nxt = 1;

        let mut dev = DeviceSim::new([0xAA; 6]);
        let mut arp_cache = ArpCache::new();
        arp_cache.update(conn.remote_ip, [0xBB; 6]);
        let mut stats = Stats::new();
        let mut observed: Option<TcpState> = None;

        let _ = close(
            &mut conn,
            &mut dev,
            [0xAA; 6],
            0x0A00_020F,
            0xFFFF_FF00,
            0,
            &mut arp_cache,
            10,
            &mut stats,
            |conn, _, _| {
                observed.get_or_insert(conn.state);
            },
            |_| {},
        );

        assert_eq!(observed, Some(TcpState::FinWait1));
    }
}
