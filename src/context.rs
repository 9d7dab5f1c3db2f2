//! Daemon context: the aggregate of per-process network state (spec §3,
//! §9), grounded directly in `netd_types.h`'s `netd_ctx_t` — interface
//! config, ARP cache, ping/DNS wait state, the single active TCP
//! connection, the CSPRNG, and the counters, all driven by one cooperative
//! event loop (`main.rs`) that polls the device and the IPC client table on
//! a fixed tick.
//!
//! Every blocking operation here (`ping`, `resolve_host`, `tcp_connect`,
//! `tcp_send`, `tcp_recv`, `tcp_close`) is a thin wrapper around the
//! non-blocking step APIs in `net::{arp,ipv4,tcp,dns}`: it supplies a
//! `process_tick` closure that drains the device and feeds inbound frames
//! back into exactly the state that operation cares about. Frames outside
//! that scope (e.g. a TCP segment arriving mid-ping) are left for the next
//! full `tick()` — acceptable because the daemon drives at most one
//! blocking IPC request at a time (spec §3.1's single in-flight operation).
//! Counters touched only while such a wrapper polls are accumulated in a
//! scratch `Stats` and folded back with `Stats::merge` once the call
//! returns, so a wrapper never needs two independent mutable borrows of the
//! same `Stats` (one direct, one inside its closure).

use std::cell::RefCell;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::config::{FRAME_MAX, PING_ID};
use crate::crypto::Rand;
use crate::error::{NetError, StatusCode, TlsError};
use crate::net::arp::{self, ArpCache};
use crate::net::device::Device;
use crate::net::dns_cache::DnsCache;
use crate::net::eth::{EthHeader, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::net::http::{self, HttpEvent, HttpIo, StageEdge};
use crate::net::ipc::{self, encode_message, payload, IpcHeader, MsgType};
use crate::net::ipv4::{self, Ipv4Event, PingWait};
use crate::net::tcp::{self, TcpConn};
use crate::net::tls::{self, TlsClient};
use crate::net::udp;
use crate::stats::Stats;

/// `SPEC_FULL.md`'s DNS-wait-handle -> hostname side table: `DnsWaits`
/// itself only correlates wire IDs/ports, so the daemon tracks which name
/// each in-flight slot is resolving in order to populate the resolver cache
/// by name on a matching response.
const DNS_MAX_WAITS: usize = crate::config::DNS_MAX_WAITS;

fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

#[derive(Debug, Clone, Copy)]
pub struct IfaceConfig {
    pub ip: u32,
    pub mask: u32,
    pub gw: u32,
    pub dns: u32,
}

impl From<crate::config::IfaceConfig> for IfaceConfig {
    fn from(c: crate::config::IfaceConfig) -> Self {
        Self {
            ip: c.ip,
            mask: c.mask,
            gw: c.gw,
            dns: c.dns,
        }
    }
}

pub struct Context {
    pub our_mac: [u8; 6],
    pub iface: IfaceConfig,
    pub iface_up: bool,
    pub arp_cache: ArpCache,
    pub ping_wait: PingWait,
    pub dns_waits: crate::net::dns::DnsWaits,
    dns_names: [Option<String>; DNS_MAX_WAITS],
    pub dns_cache: DnsCache,
    pub tcp: TcpConn,
    pub rand: Rand,
    pub stats: Stats,
    pub clients: ipc::ClientTable,
    start: Instant,
}

impl Context {
    pub fn new(our_mac: [u8; 6], iface: crate::config::IfaceConfig) -> Self {
        Self {
            our_mac,
            iface: iface.into(),
            iface_up: true,
            arp_cache: ArpCache::new(),
            ping_wait: PingWait::default(),
            dns_waits: crate::net::dns::DnsWaits::new(),
            dns_names: Default::default(),
            dns_cache: DnsCache::new(),
            tcp: TcpConn::new(),
            rand: Rand::new(),
            stats: Stats::new(),
            clients: ipc::ClientTable::new(),
            start: Instant::now(),
        }
    }

    fn clock_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    /// The links `LINK_LIST_RESP` reports: `lo` (always up) plus the one
    /// physical interface this daemon owns (`netd_iface.c`'s `netd_links_init`).
    fn links(&self) -> Vec<payload::LinkInfo> {
        vec![
            payload::LinkInfo {
                name: "lo".to_string(),
                flags: payload::LINK_FLAG_PRESENT | payload::LINK_FLAG_UP | payload::LINK_FLAG_LOOPBACK,
                ipv4_addr: 0x7F00_0001,
                ipv4_mask: 0xFF00_0000,
            },
            payload::LinkInfo {
                name: "ne2k0".to_string(),
                flags: if self.iface_up {
                    payload::LINK_FLAG_PRESENT | payload::LINK_FLAG_UP
                } else {
                    payload::LINK_FLAG_PRESENT
                },
                ipv4_addr: self.iface.ip,
                ipv4_mask: self.iface.mask,
            },
        ]
    }

    // ---- full-stack dispatch, used by the main event loop -------------

    /// Drains every frame currently queued on `dev`, dispatching ARP to the
    /// cache, ICMP/ping-wait matching and UDP/TCP routing to their owning
    /// state, exactly as one iteration of the event loop (spec §9).
    pub fn tick(&mut self, dev: &mut dyn Device) {
        let our_mac = self.our_mac;
        let our_ip = self.iface.ip;
        let our_mask = self.iface.mask;
        let gateway = self.iface.gw;
        let dns_server = self.iface.dns;

        let mut buf = vec![0u8; FRAME_MAX];
        loop {
            match dev.try_read(&mut buf) {
                Ok(Some(n)) => {
                    let Some(eth) = EthHeader::parse(&buf[..n]) else {
                        continue;
                    };
                    match eth.ethertype {
                        ETHERTYPE_ARP => {
                            arp::process_frame(
                                &mut self.arp_cache,
                                dev,
                                our_mac,
                                our_ip,
                                &buf[EthHeader::LEN..n],
                            );
                        }
                        ETHERTYPE_IPV4 => {
                            let event = ipv4::process_frame(
                                &buf[..n],
                                our_mac,
                                our_ip,
                                &mut self.ping_wait,
                                dev,
                                &mut self.stats,
                            );
                            match event {
                                Ipv4Event::Udp { src, payload } => {
                                    let now = Instant::now();
                                    let names = &self.dns_names;
                                    self.dns_waits.process_udp(
                                        src,
                                        dns_server,
                                        payload,
                                        |i| names.get(i).and_then(|o| o.clone()),
                                        &mut self.dns_cache,
                                        now,
                                        &mut self.stats,
                                    );
                                }
                                Ipv4Event::Tcp { src, payload } => {
                                    tcp::process_segment(
                                        &mut self.tcp,
                                        src,
                                        our_ip,
                                        payload,
                                        dev,
                                        our_mac,
                                        our_mask,
                                        gateway,
                                        &mut self.arp_cache,
                                        &mut self.stats,
                                        |_, _, _| {},
                                        sleep_ms,
                                    );
                                }
                                Ipv4Event::None => {}
                            }
                        }
                        _ => {}
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        self.dns_cache.expire_old(Instant::now());
    }

    // ---- blocking operation wrappers -----------------------------------

    /// Spec §4.4/IPC `PING_REQ`. `127.0.0.0/8` is answered immediately
    /// without touching the device (the `lo` link never carries real
    /// frames), matching the IPC contract's expectation of a near-zero RTT.
    pub fn ping(&mut self, dev: &mut dyn Device, dst_ip: u32, seq: u16, timeout_ms: u64) -> Result<u64, NetError> {
        if (dst_ip >> 24) == 0x7F {
            return Ok(1);
        }

        let our_mac = self.our_mac;
        let our_ip = self.iface.ip;
        let our_mask = self.iface.mask;
        let gateway = self.iface.gw;
        let mut scratch = Stats::default();

        let result = ipv4::send_ping(
            dev,
            our_mac,
            our_ip,
            our_mask,
            gateway,
            dst_ip,
            seq,
            timeout_ms,
            &mut self.arp_cache,
            &mut self.ping_wait,
            |arp_cache, ping_wait, dev| {
                let mut buf = vec![0u8; FRAME_MAX];
                while let Ok(Some(n)) = dev.try_read(&mut buf) {
                    let Some(eth) = EthHeader::parse(&buf[..n]) else {
                        continue;
                    };
                    match eth.ethertype {
                        ETHERTYPE_ARP => {
                            arp::process_frame(arp_cache, dev, our_mac, our_ip, &buf[EthHeader::LEN..n]);
                        }
                        ETHERTYPE_IPV4 => {
                            let _ = ipv4::process_frame(&buf[..n], our_mac, our_ip, ping_wait, dev, &mut scratch);
                        }
                        _ => {}
                    }
                }
            },
            sleep_ms,
        );
        self.stats.merge(&scratch);
        result
    }

    /// Looks a name up (accepting a literal dotted-quad as itself), the
    /// resolver cache, and finally the stub resolver (spec §4.5).
    pub fn resolve_host(&mut self, dev: &mut dyn Device, host: &str, timeout_ms: u64) -> Result<u32, NetError> {
        if let Some(ip) = crate::config::parse_ipv4(host) {
            return Ok(ip);
        }

        let now = Instant::now();
        if let Some(addr) = self.dns_cache.lookup(host, now, &mut self.stats) {
            return Ok(addr);
        }

        let our_mac = self.our_mac;
        let our_ip = self.iface.ip;
        let our_mask = self.iface.mask;
        let gateway = self.iface.gw;
        let dns_server = self.iface.dns;
        if dns_server == 0 {
            return Err(NetError::Unreachable);
        }

        let handle = {
            let arp_cache = &mut self.arp_cache;
            let rand = &mut self.rand;
            let mut send_stats = Stats::default();
            let h = self.dns_waits.query_start(host, timeout_ms, now, rand, |port, query| {
                udp::send(
                    dev, our_mac, our_ip, our_mask, gateway, dns_server, 53, port, query, arp_cache,
                    &mut send_stats, |_, _| {}, sleep_ms,
                )
            }, &mut self.stats)?;
            self.stats.merge(&send_stats);
            h
        };
        self.dns_names[handle] = Some(host.to_string());

        let result = loop {
            let mut scratch = Stats::default();
            let mut buf = vec![0u8; FRAME_MAX];
            while let Ok(Some(n)) = dev.try_read(&mut buf) {
                let Some(eth) = EthHeader::parse(&buf[..n]) else {
                    continue;
                };
                if eth.ethertype != ETHERTYPE_IPV4 {
                    if eth.ethertype == ETHERTYPE_ARP {
                        arp::process_frame(&mut self.arp_cache, dev, our_mac, our_ip, &buf[EthHeader::LEN..n]);
                    }
                    continue;
                }
                let event = ipv4::process_frame(&buf[..n], our_mac, our_ip, &mut self.ping_wait, dev, &mut scratch);
                if let Ipv4Event::Udp { src, payload } = event {
                    let names = &self.dns_names;
                    self.dns_waits.process_udp(
                        src, dns_server, payload,
                        |i| names.get(i).and_then(|o| o.clone()),
                        &mut self.dns_cache, now, &mut scratch,
                    );
                }
            }
            self.stats.merge(&scratch);

            match self.dns_waits.query_poll(handle, Instant::now(), &mut self.stats) {
                Ok(Some(addr)) => break Ok(addr),
                Ok(None) => sleep_ms(10),
                Err(e) => break Err(e),
            }
        };

        self.dns_names[handle] = None;
        result
    }

    pub fn tcp_connect(&mut self, dev: &mut dyn Device, dst_ip: u32, dst_port: u16, timeout_ms: u64) -> Result<(), NetError> {
        let our_mac = self.our_mac;
        let our_ip = self.iface.ip;
        let our_mask = self.iface.mask;
        let gateway = self.iface.gw;
        let clock_ms = self.clock_ms();
        let mut scratch = Stats::default();

        let result = tcp::connect(
            &mut self.tcp,
            dev,
            our_mac,
            our_ip,
            our_mask,
            gateway,
            &mut self.arp_cache,
            dst_ip,
            dst_port,
            timeout_ms,
            clock_ms,
            &mut scratch,
            |conn, arp_cache, dev| drain_for_tcp(dev, our_mac, our_ip, our_mask, gateway, conn, arp_cache),
            sleep_ms,
        );
        self.stats.merge(&scratch);
        result
    }

    pub fn tcp_send(&mut self, dev: &mut dyn Device, data: &[u8], timeout_ms: u64) -> Result<(), NetError> {
        let our_mac = self.our_mac;
        let our_ip = self.iface.ip;
        let our_mask = self.iface.mask;
        let gateway = self.iface.gw;
        let mut scratch = Stats::default();

        let result = tcp::send(
            &mut self.tcp,
            dev,
            our_mac,
            our_ip,
            our_mask,
            gateway,
            &mut self.arp_cache,
            data,
            timeout_ms,
            &mut scratch,
            |conn, arp_cache, dev| drain_for_tcp(dev, our_mac, our_ip, our_mask, gateway, conn, arp_cache),
            sleep_ms,
        );
        self.stats.merge(&scratch);
        result
    }

    pub fn tcp_recv(&mut self, dev: &mut dyn Device, out: &mut [u8], timeout_ms: u64) -> Result<usize, NetError> {
        let our_mac = self.our_mac;
        let our_ip = self.iface.ip;
        let our_mask = self.iface.mask;
        let gateway = self.iface.gw;
        let mut scratch = Stats::default();

        let result = tcp::recv(
            &mut self.tcp,
            dev,
            our_mac,
            our_ip,
            our_mask,
            gateway,
            &mut self.arp_cache,
            out,
            timeout_ms,
            &mut scratch,
            |conn, arp_cache, dev| drain_for_tcp(dev, our_mac, our_ip, our_mask, gateway, conn, arp_cache),
            sleep_ms,
        );
        self.stats.merge(&scratch);
        result
    }

    pub fn tcp_close(&mut self, dev: &mut dyn Device, timeout_ms: u64) -> Result<(), NetError> {
        let our_mac = self.our_mac;
        let our_ip = self.iface.ip;
        let our_mask = self.iface.mask;
        let gateway = self.iface.gw;
        let mut scratch = Stats::default();

        let result = tcp::close(
            &mut self.tcp,
            dev,
            our_mac,
            our_ip,
            our_mask,
            gateway,
            &mut self.arp_cache,
            timeout_ms,
            &mut scratch,
            |conn, arp_cache, dev| drain_for_tcp(dev, our_mac, our_ip, our_mask, gateway, conn, arp_cache),
            sleep_ms,
        );
        self.stats.merge(&scratch);
        result
    }

    // ---- IPC dispatch ----------------------------------------------------

    /// Handles one complete IPC request, returning the wire frame(s) to
    /// write back (spec §4.9/§6.2, `netd_handle_msg`).
    pub fn handle_ipc(&mut self, dev: &mut dyn Device, hdr: &IpcHeader, body: &[u8]) -> Vec<Vec<u8>> {
        let seq = hdr.seq;
        let Some(msg_type) = MsgType::from_wire(hdr.msg_type) else {
            return vec![];
        };

        match msg_type {
            MsgType::Hello | MsgType::StatusReq => {
                let resp = payload::StatusResp {
                    status: StatusCode::Ok.as_u32(),
                    link_count: self.links().len() as u32,
                    flags: if self.iface_up { 1 } else { 0 },
                };
                vec![encode_message(MsgType::StatusResp, seq, &resp.to_bytes())]
            }

            MsgType::LinkListReq => {
                let links = self.links();
                vec![encode_message(MsgType::LinkListResp, seq, &payload::encode_link_list(&links))]
            }

            MsgType::PingReq => {
                let Some(req) = payload::PingReq::from_bytes(body) else {
                    return vec![];
                };
                let (status, rtt_ms) = match self.ping(dev, req.addr, req.seq as u16, req.timeout_ms as u64) {
                    Ok(elapsed) => (StatusCode::Ok, elapsed as u32),
                    Err(e) => (StatusCode::from(&e), 0),
                };
                let resp = payload::PingResp {
                    addr: req.addr,
                    seq: req.seq,
                    status: status.as_u32(),
                    rtt_ms,
                };
                vec![encode_message(MsgType::PingResp, seq, &resp.to_bytes())]
            }

            MsgType::DnsReq => {
                let Some(req) = payload::DnsReq::from_bytes(body) else {
                    return vec![];
                };
                let (status, addr) = match self.resolve_host(dev, &req.name, req.timeout_ms as u64) {
                    Ok(addr) => (StatusCode::Ok, addr),
                    Err(e) => (StatusCode::from(&e), 0),
                };
                let resp = payload::DnsResp {
                    status: status.as_u32(),
                    addr,
                };
                vec![encode_message(MsgType::DnsResp, seq, &resp.to_bytes())]
            }

            MsgType::CfgGetReq => {
                let resp = payload::CfgResp {
                    status: StatusCode::Ok.as_u32(),
                    ip: self.iface.ip,
                    mask: self.iface.mask,
                    gw: self.iface.gw,
                    dns: self.iface.dns,
                };
                vec![encode_message(MsgType::CfgGetResp, seq, &resp.to_bytes())]
            }

            MsgType::CfgSetReq => {
                let Some(req) = payload::CfgSetReq::from_bytes(body) else {
                    return vec![];
                };
                if req.flags & payload::CFG_F_IP != 0 {
                    self.iface.ip = req.ip;
                }
                if req.flags & payload::CFG_F_MASK != 0 {
                    self.iface.mask = req.mask;
                }
                if req.flags & payload::CFG_F_GW != 0 {
                    self.iface.gw = req.gw;
                }
                if req.flags & payload::CFG_F_DNS != 0 {
                    self.iface.dns = req.dns;
                }
                info!(ip = self.iface.ip, mask = self.iface.mask, gw = self.iface.gw, dns = self.iface.dns, "interface config updated");
                let resp = payload::CfgResp {
                    status: StatusCode::Ok.as_u32(),
                    ip: self.iface.ip,
                    mask: self.iface.mask,
                    gw: self.iface.gw,
                    dns: self.iface.dns,
                };
                vec![encode_message(MsgType::CfgSetResp, seq, &resp.to_bytes())]
            }

            MsgType::IfaceUpReq => {
                self.iface_up = true;
                debug!("interface brought up");
                let resp = payload::StatusResp {
                    status: StatusCode::Ok.as_u32(),
                    link_count: self.links().len() as u32,
                    flags: 1,
                };
                vec![encode_message(MsgType::IfaceUpResp, seq, &resp.to_bytes())]
            }

            MsgType::IfaceDownReq => {
                self.iface_up = false;
                debug!("interface brought down");
                let resp = payload::StatusResp {
                    status: StatusCode::Ok.as_u32(),
                    link_count: self.links().len() as u32,
                    flags: 0,
                };
                vec![encode_message(MsgType::IfaceDownResp, seq, &resp.to_bytes())]
            }

            MsgType::HttpGetReq => {
                let Some(req) = payload::HttpGetReq::from_bytes(body) else {
                    return vec![];
                };
                let mut frames = Vec::new();
                {
                    let mut io = DaemonHttpIo::new(self, dev);
                    let mut report = |event: HttpEvent| match event {
                        HttpEvent::Begin {
                            status,
                            http_status,
                            content_length,
                        } => {
                            let p = payload::HttpGetBegin {
                                status: status.as_u32(),
                                http_status,
                                content_length,
                            };
                            frames.push(encode_message(MsgType::HttpGetBegin, seq, &p.to_bytes()));
                        }
                        HttpEvent::Stage {
                            stage,
                            status,
                            detail,
                            edge,
                        } => {
                            let p = payload::HttpGetStage {
                                stage: stage as u32,
                                status: status.as_u32(),
                                detail,
                                flags: match edge {
                                    StageEdge::Begin => 0,
                                    StageEdge::End => 1,
                                },
                            };
                            frames.push(encode_message(MsgType::HttpGetStage, seq, &p.to_bytes()));
                        }
                        HttpEvent::Data(bytes) => {
                            frames.push(encode_message(MsgType::HttpGetData, seq, &payload::encode_http_data_payload(bytes)));
                        }
                        HttpEvent::End { status } => {
                            let p = payload::HttpGetEnd { status: status.as_u32() };
                            frames.push(encode_message(MsgType::HttpGetEnd, seq, &p.to_bytes()));
                        }
                    };
                    http::get(&mut io, &mut report, &req.url, req.timeout_ms as u64);
                }
                frames
            }

            // Response-only types never arrive as requests.
            MsgType::StatusResp
            | MsgType::LinkListResp
            | MsgType::PingResp
            | MsgType::DnsResp
            | MsgType::CfgGetResp
            | MsgType::CfgSetResp
            | MsgType::IfaceUpResp
            | MsgType::IfaceDownResp
            | MsgType::HttpGetBegin
            | MsgType::HttpGetStage
            | MsgType::HttpGetData
            | MsgType::HttpGetEnd => vec![],
        }
    }
}

/// Shared by `tcp_connect`/`tcp_send`/`tcp_recv`/`tcp_close`'s `process_tick`
/// closures: drains the device, updating the ARP cache and feeding TCP
/// segments to `conn`. ICMP/DNS traffic arriving during a TCP operation is
/// parsed (so the ARP cache and checksum counters stay current) but not
/// acted on — no ping or DNS query is ever in flight at the same time as a
/// TCP operation in this daemon's single-blocking-call model.
#[allow(clippy::too_many_arguments)]
fn drain_for_tcp(
    dev: &mut dyn Device,
    our_mac: [u8; 6],
    our_ip: u32,
    our_mask: u32,
    gateway: u32,
    conn: &mut TcpConn,
    arp_cache: &mut ArpCache,
) {
    let mut ping_wait = PingWait::default();
    let mut scratch = Stats::default();
    let mut buf = vec![0u8; FRAME_MAX];
    while let Ok(Some(n)) = dev.try_read(&mut buf) {
        let Some(eth) = EthHeader::parse(&buf[..n]) else {
            continue;
        };
        match eth.ethertype {
            ETHERTYPE_ARP => {
                arp::process_frame(arp_cache, dev, our_mac, our_ip, &buf[EthHeader::LEN..n]);
            }
            ETHERTYPE_IPV4 => {
                let event = ipv4::process_frame(&buf[..n], our_mac, our_ip, &mut ping_wait, dev, &mut scratch);
                if let Ipv4Event::Tcp { src, payload } = event {
                    tcp::process_segment(
                        conn, src, our_ip, payload, dev, our_mac, our_mask, gateway, arp_cache, &mut scratch,
                        |_, _, _| {}, sleep_ms,
                    );
                }
            }
            _ => {}
        }
    }
}

/// Wires `net::http`'s [`HttpIo`] seam to the real stack: DNS via the
/// resolver cache + stub resolver, TCP via the single connection slot, and
/// an optional TLS 1.3 upgrade. One instance is built per `HTTP_GET_REQ`.
struct DaemonHttpIo<'a> {
    ctx: &'a mut Context,
    dev: &'a mut dyn Device,
    tls: Option<TlsClient>,
}

impl<'a> DaemonHttpIo<'a> {
    fn new(ctx: &'a mut Context, dev: &'a mut dyn Device) -> Self {
        Self { ctx, dev, tls: None }
    }
}

impl<'a> HttpIo for DaemonHttpIo<'a> {
    fn resolve(&mut self, host: &str, timeout_ms: u64) -> Result<u32, NetError> {
        self.ctx.resolve_host(self.dev, host, timeout_ms)
    }

    fn tcp_connect(&mut self, ip: u32, port: u16, timeout_ms: u64) -> Result<(), NetError> {
        self.ctx.tcp_connect(self.dev, ip, port, timeout_ms)
    }

    /// Two closures (`send`/`recv_exact`) must each reach the same
    /// TCP/ARP/device state, but never at the same instant — `tls::handshake`
    /// calls them strictly in sequence. `RefCell` gives each one a runtime
    /// (never contended) borrow instead of two compile-time-impossible
    /// simultaneous `&mut` captures of the same fields.
    fn tls_handshake(&mut self, timeout_ms: u64) -> Result<(), TlsError> {
        let our_mac = self.ctx.our_mac;
        let our_ip = self.ctx.iface.ip;
        let our_mask = self.ctx.iface.mask;
        let gateway = self.ctx.iface.gw;

        let tcp = RefCell::new(&mut self.ctx.tcp);
        let arp_cache = RefCell::new(&mut self.ctx.arp_cache);
        let dev = RefCell::new(&mut *self.dev);
        let scratch = RefCell::new(Stats::default());

        let result = tls::handshake(
            &mut self.ctx.rand,
            |data| {
                tcp::send(
                    *tcp.borrow_mut(),
                    *dev.borrow_mut(),
                    our_mac,
                    our_ip,
                    our_mask,
                    gateway,
                    *arp_cache.borrow_mut(),
                    data,
                    timeout_ms,
                    &mut scratch.borrow_mut(),
                    |conn, arp_cache, dev| drain_for_tcp(dev, our_mac, our_ip, our_mask, gateway, conn, arp_cache),
                    sleep_ms,
                )
            },
            |buf| {
                let mut off = 0;
                while off < buf.len() {
                    let n = tcp::recv(
                        *tcp.borrow_mut(),
                        *dev.borrow_mut(),
                        our_mac,
                        our_ip,
                        our_mask,
                        gateway,
                        *arp_cache.borrow_mut(),
                        &mut buf[off..],
                        timeout_ms,
                        &mut scratch.borrow_mut(),
                        |conn, arp_cache, dev| drain_for_tcp(dev, our_mac, our_ip, our_mask, gateway, conn, arp_cache),
                        sleep_ms,
                    )?;
                    if n == 0 {
                        return Err(NetError::ConnReset);
                    }
                    off += n;
                }
                Ok(())
            },
            &mut self.ctx.stats,
        );
        self.ctx.stats.merge(&scratch.into_inner());

        match result {
            Ok(client) => {
                self.tls = Some(client);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, data: &[u8], timeout_ms: u64) -> Result<(), NetError> {
        if let Some(tls) = self.tls.as_mut() {
            let our_mac = self.ctx.our_mac;
            let our_ip = self.ctx.iface.ip;
            let our_mask = self.ctx.iface.mask;
            let gateway = self.ctx.iface.gw;
            let tcp = &mut self.ctx.tcp;
            let arp_cache = &mut self.ctx.arp_cache;
            let dev = &mut *self.dev;
            let mut scratch = Stats::default();

            let result = tls.send(
                |rec| {
                    tcp::send(
                        tcp, dev, our_mac, our_ip, our_mask, gateway, arp_cache, rec, timeout_ms, &mut scratch,
                        |_, _, _| {}, sleep_ms,
                    )
                },
                data,
                &mut scratch,
            );
            self.ctx.stats.merge(&scratch);
            result
        } else {
            self.ctx.tcp_send(self.dev, data, timeout_ms)
        }
    }

    fn recv(&mut self, out: &mut [u8], timeout_ms: u64) -> Result<usize, NetError> {
        if let Some(tls) = self.tls.as_mut() {
            let our_mac = self.ctx.our_mac;
            let our_ip = self.ctx.iface.ip;
            let our_mask = self.ctx.iface.mask;
            let gateway = self.ctx.iface.gw;
            let tcp = &mut self.ctx.tcp;
            let arp_cache = &mut self.ctx.arp_cache;
            let dev = &mut *self.dev;
            let mut scratch = Stats::default();

            let result = tls.recv(
                |buf| {
                    let mut off = 0;
                    while off < buf.len() {
                        let n = tcp::recv(
                            tcp, dev, our_mac, our_ip, our_mask, gateway, arp_cache, &mut buf[off..], timeout_ms,
                            &mut scratch, |_, _, _| {}, sleep_ms,
                        )?;
                        if n == 0 {
                            return Err(NetError::ConnReset);
                        }
                        off += n;
                    }
                    Ok(())
                },
                out,
                &mut scratch,
            );
            self.ctx.stats.merge(&scratch);
            result
        } else {
            self.ctx.tcp_recv(self.dev, out, timeout_ms)
        }
    }

    fn close(&mut self, timeout_ms: u64) {
        if let Some(tls) = self.tls.take() {
            tls.close();
        }
        let _ = self.ctx.tcp_close(self.dev, timeout_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IfaceConfig as CfgIfaceConfig;
    use crate::net::device::DeviceSim;

    fn test_ctx() -> Context {
        Context::new([0xAA; 6], CfgIfaceConfig::default())
    }

    #[test]
    fn loopback_ping_is_instant() {
        let mut ctx = test_ctx();
        let mut dev = DeviceSim::new(ctx.our_mac);
        let rtt = ctx.ping(&mut dev, 0x7F00_0001, 1, 1000).unwrap();
        assert_eq!(rtt, 1);
        assert!(dev.take_outbound().is_empty());
    }

    #[test]
    fn dns_req_accepts_literal_ip() {
        let mut ctx = test_ctx();
        let mut dev = DeviceSim::new(ctx.our_mac);
        let addr = ctx.resolve_host(&mut dev, "10.0.2.3", 1000).unwrap();
        assert_eq!(addr, 0x0A00_0203);
    }

    #[test]
    fn status_req_reports_two_links() {
        let mut ctx = test_ctx();
        let mut dev = DeviceSim::new(ctx.our_mac);
        let req = encode_message(MsgType::StatusReq, 1, &[]);
        let hdr = IpcHeader::from_bytes(req[..ipc::HEADER_LEN].try_into().unwrap()).unwrap();
        let frames = ctx.handle_ipc(&mut dev, &hdr, &[]);
        assert_eq!(frames.len(), 1);
        let resp_hdr = IpcHeader::from_bytes(frames[0][..ipc::HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(resp_hdr.msg_type, MsgType::StatusResp.wire());
        let resp = payload::StatusResp {
            status: u32::from_le_bytes(frames[0][ipc::HEADER_LEN..ipc::HEADER_LEN + 4].try_into().unwrap()),
            link_count: u32::from_le_bytes(frames[0][ipc::HEADER_LEN + 4..ipc::HEADER_LEN + 8].try_into().unwrap()),
            flags: u32::from_le_bytes(frames[0][ipc::HEADER_LEN + 8..ipc::HEADER_LEN + 12].try_into().unwrap()),
        };
        assert_eq!(resp.status, StatusCode::Ok.as_u32());
        assert_eq!(resp.link_count, 2);
    }

    #[test]
    fn cfg_set_updates_selected_fields_only() {
        let mut ctx = test_ctx();
        let mut dev = DeviceSim::new(ctx.our_mac);
        let req_payload = payload::CfgSetReq {
            flags: payload::CFG_F_GW,
            ip: 0,
            mask: 0,
            gw: 0x0A00_0205,
            dns: 0,
        };
        let bytes = {
            let mut out = Vec::new();
            out.extend_from_slice(&req_payload.flags.to_le_bytes());
            out.extend_from_slice(&req_payload.ip.to_le_bytes());
            out.extend_from_slice(&req_payload.mask.to_le_bytes());
            out.extend_from_slice(&req_payload.gw.to_le_bytes());
            out.extend_from_slice(&req_payload.dns.to_le_bytes());
            out
        };
        let req = encode_message(MsgType::CfgSetReq, 9, &bytes);
        let hdr = IpcHeader::from_bytes(req[..ipc::HEADER_LEN].try_into().unwrap()).unwrap();
        let original_ip = ctx.iface.ip;
        ctx.handle_ipc(&mut dev, &hdr, &req[ipc::HEADER_LEN..]);
        assert_eq!(ctx.iface.gw, 0x0A00_0205);
        assert_eq!(ctx.iface.ip, original_ip);
    }

    #[test]
    fn iface_down_then_up_flips_link_flags() {
        let mut ctx = test_ctx();
        let mut dev = DeviceSim::new(ctx.our_mac);
        let down = encode_message(MsgType::IfaceDownReq, 1, &[]);
        let hdr = IpcHeader::from_bytes(down[..ipc::HEADER_LEN].try_into().unwrap()).unwrap();
        ctx.handle_ipc(&mut dev, &hdr, &[]);
        assert!(!ctx.iface_up);

        let up = encode_message(MsgType::IfaceUpReq, 2, &[]);
        let hdr = IpcHeader::from_bytes(up[..ipc::HEADER_LEN].try_into().unwrap()).unwrap();
        ctx.handle_ipc(&mut dev, &hdr, &[]);
        assert!(ctx.iface_up);
    }
}
