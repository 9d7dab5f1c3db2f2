//! IPC wire protocol (spec §4.9, §6.2), grounded in `netd_ipc.c`.
//!
//! `net_ipc.h` itself — the header defining `net_ipc_hdr_t`, the
//! `NET_IPC_MSG_*` enum, and `NET_IPC_MAX_PAYLOAD` — is an external header
//! not present in the retrieved sources; the numeric message-type values
//! below are this crate's own assignment (recorded as an open question in
//! `DESIGN.md`), in the order `netd_handle_msg` dispatches them.

use std::collections::VecDeque;
use std::io;

use tracing::{debug, trace, warn};

use crate::config::{IPC_MAGIC, IPC_MAX_PAYLOAD, MAX_CLIENTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    Hello = 0,
    StatusReq = 1,
    StatusResp = 2,
    LinkListReq = 3,
    LinkListResp = 4,
    PingReq = 5,
    PingResp = 6,
    DnsReq = 7,
    DnsResp = 8,
    CfgGetReq = 9,
    CfgGetResp = 10,
    CfgSetReq = 11,
    CfgSetResp = 12,
    IfaceUpReq = 13,
    IfaceUpResp = 14,
    IfaceDownReq = 15,
    IfaceDownResp = 16,
    HttpGetReq = 17,
    HttpGetBegin = 18,
    HttpGetStage = 19,
    HttpGetData = 20,
    HttpGetEnd = 21,
}

impl MsgType {
    pub fn from_wire(v: u16) -> Option<Self> {
        use MsgType::*;
        Some(match v {
            0 => Hello,
            1 => StatusReq,
            2 => StatusResp,
            3 => LinkListReq,
            4 => LinkListResp,
            5 => PingReq,
            6 => PingResp,
            7 => DnsReq,
            8 => DnsResp,
            9 => CfgGetReq,
            10 => CfgGetResp,
            11 => CfgSetReq,
            12 => CfgSetResp,
            13 => IfaceUpReq,
            14 => IfaceUpResp,
            15 => IfaceDownReq,
            16 => IfaceDownResp,
            17 => HttpGetReq,
            18 => HttpGetBegin,
            19 => HttpGetStage,
            20 => HttpGetData,
            21 => HttpGetEnd,
            _ => return None,
        })
    }

    pub fn wire(self) -> u16 {
        self as u16
    }
}

/// 16-byte wire header (spec §6.2): `{magic, type, seq, len, flags}`, all
/// little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcHeader {
    pub magic: u16,
    pub msg_type: u16,
    pub seq: u32,
    pub len: u32,
    pub flags: u32,
}

pub const HEADER_LEN: usize = 16;

impl IpcHeader {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.magic.to_le_bytes());
        out[2..4].copy_from_slice(&self.msg_type.to_le_bytes());
        out[4..8].copy_from_slice(&self.seq.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; HEADER_LEN]) -> Option<Self> {
        let magic = u16::from_le_bytes([b[0], b[1]]);
        if magic != IPC_MAGIC {
            return None;
        }
        Some(Self {
            magic,
            msg_type: u16::from_le_bytes([b[2], b[3]]),
            seq: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            len: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
            flags: u32::from_le_bytes([b[12], b[13], b[14], b[15]]),
        })
    }
}

pub fn encode_message(msg_type: MsgType, seq: u32, payload: &[u8]) -> Vec<u8> {
    let hdr = IpcHeader {
        magic: IPC_MAGIC,
        msg_type: msg_type.wire(),
        seq,
        len: payload.len() as u32,
        flags: 0,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&hdr.to_bytes());
    out.extend_from_slice(payload);
    out
}

/// Splits an `HTTP_GET_DATA` body into frames no larger than
/// `IPC_MAX_PAYLOAD` each (spec §4.8's "split to fit the IPC payload cap"),
/// each wrapped in the `{len:u32, bytes:[u8]}` payload layout.
pub fn encode_http_data(seq: u32, body: &[u8]) -> Vec<Vec<u8>> {
    let chunk_cap = IPC_MAX_PAYLOAD - 4;
    body.chunks(chunk_cap)
        .map(|chunk| encode_message(MsgType::HttpGetData, seq, &payload::encode_http_data_payload(chunk)))
        .collect()
}

/// Fixed-layout payload structs for each message type (`SPEC_FULL.md`'s IPC
/// message catalogue), little-endian packed exactly as the original's C
/// structs are laid out. `NET_LINK_FLAG_*` and the `CFG_SET` field-select
/// flags are this crate's own values — the header defining them
/// (`net_ipc.h`) is external to the retrieved sources; see `DESIGN.md`.
pub mod payload {
    pub const LINK_NAME_LEN: usize = 16;
    pub const DNS_NAME_LEN: usize = 256;
    pub const HTTP_URL_LEN: usize = 512;
    pub const MAX_LINKS: usize = 4;

    pub const LINK_FLAG_PRESENT: u32 = 1;
    pub const LINK_FLAG_UP: u32 = 2;
    pub const LINK_FLAG_LOOPBACK: u32 = 4;

    pub const CFG_F_IP: u32 = 1;
    pub const CFG_F_MASK: u32 = 2;
    pub const CFG_F_GW: u32 = 4;
    pub const CFG_F_DNS: u32 = 8;

    fn fixed_name(src: &str, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let bytes = src.as_bytes();
        let n = bytes.len().min(len - 1);
        out[..n].copy_from_slice(&bytes[..n]);
        out
    }

    fn read_cstr(buf: &[u8]) -> String {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusResp {
        pub status: u32,
        pub link_count: u32,
        pub flags: u32,
    }

    impl StatusResp {
        pub fn to_bytes(self) -> [u8; 12] {
            let mut out = [0u8; 12];
            out[0..4].copy_from_slice(&self.status.to_le_bytes());
            out[4..8].copy_from_slice(&self.link_count.to_le_bytes());
            out[8..12].copy_from_slice(&self.flags.to_le_bytes());
            out
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LinkInfo {
        pub name: String,
        pub flags: u32,
        pub ipv4_addr: u32,
        pub ipv4_mask: u32,
    }

    impl LinkInfo {
        pub const WIRE_LEN: usize = LINK_NAME_LEN + 12;

        pub fn to_bytes(&self) -> Vec<u8> {
            let mut out = fixed_name(&self.name, LINK_NAME_LEN);
            out.extend_from_slice(&self.flags.to_le_bytes());
            out.extend_from_slice(&self.ipv4_addr.to_le_bytes());
            out.extend_from_slice(&self.ipv4_mask.to_le_bytes());
            out
        }

        pub fn from_bytes(b: &[u8]) -> Option<Self> {
            if b.len() < Self::WIRE_LEN {
                return None;
            }
            Some(Self {
                name: read_cstr(&b[0..LINK_NAME_LEN]),
                flags: u32::from_le_bytes(b[16..20].try_into().ok()?),
                ipv4_addr: u32::from_le_bytes(b[20..24].try_into().ok()?),
                ipv4_mask: u32::from_le_bytes(b[24..28].try_into().ok()?),
            })
        }
    }

    /// `{count:u32, links:[LinkInfo; count]}`, clamped to [`MAX_LINKS`]
    /// before serializing (the original clamps `ctx->state.count` to 4).
    pub fn encode_link_list(links: &[LinkInfo]) -> Vec<u8> {
        let links = &links[..links.len().min(MAX_LINKS)];
        let mut out = Vec::with_capacity(4 + links.len() * LinkInfo::WIRE_LEN);
        out.extend_from_slice(&(links.len() as u32).to_le_bytes());
        for link in links {
            out.extend_from_slice(&link.to_bytes());
        }
        out
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PingReq {
        pub addr: u32,
        pub seq: u32,
        pub timeout_ms: u32,
    }

    impl PingReq {
        pub const WIRE_LEN: usize = 12;

        pub fn from_bytes(b: &[u8]) -> Option<Self> {
            if b.len() != Self::WIRE_LEN {
                return None;
            }
            Some(Self {
                addr: u32::from_le_bytes(b[0..4].try_into().ok()?),
                seq: u32::from_le_bytes(b[4..8].try_into().ok()?),
                timeout_ms: u32::from_le_bytes(b[8..12].try_into().ok()?),
            })
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PingResp {
        pub addr: u32,
        pub seq: u32,
        pub status: u32,
        pub rtt_ms: u32,
    }

    impl PingResp {
        pub fn to_bytes(self) -> [u8; 16] {
            let mut out = [0u8; 16];
            out[0..4].copy_from_slice(&self.addr.to_le_bytes());
            out[4..8].copy_from_slice(&self.seq.to_le_bytes());
            out[8..12].copy_from_slice(&self.status.to_le_bytes());
            out[12..16].copy_from_slice(&self.rtt_ms.to_le_bytes());
            out
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DnsReq {
        pub name: String,
        pub timeout_ms: u32,
    }

    impl DnsReq {
        pub const WIRE_LEN: usize = DNS_NAME_LEN + 4;

        pub fn from_bytes(b: &[u8]) -> Option<Self> {
            if b.len() != Self::WIRE_LEN {
                return None;
            }
            Some(Self {
                name: read_cstr(&b[0..DNS_NAME_LEN]),
                timeout_ms: u32::from_le_bytes(b[DNS_NAME_LEN..DNS_NAME_LEN + 4].try_into().ok()?),
            })
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DnsResp {
        pub status: u32,
        pub addr: u32,
    }

    impl DnsResp {
        pub fn to_bytes(self) -> [u8; 8] {
            let mut out = [0u8; 8];
            out[0..4].copy_from_slice(&self.status.to_le_bytes());
            out[4..8].copy_from_slice(&self.addr.to_le_bytes());
            out
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CfgResp {
        pub status: u32,
        pub ip: u32,
        pub mask: u32,
        pub gw: u32,
        pub dns: u32,
    }

    impl CfgResp {
        pub fn to_bytes(self) -> [u8; 20] {
            let mut out = [0u8; 20];
            out[0..4].copy_from_slice(&self.status.to_le_bytes());
            out[4..8].copy_from_slice(&self.ip.to_le_bytes());
            out[8..12].copy_from_slice(&self.mask.to_le_bytes());
            out[12..16].copy_from_slice(&self.gw.to_le_bytes());
            out[16..20].copy_from_slice(&self.dns.to_le_bytes());
            out
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CfgSetReq {
        pub flags: u32,
        pub ip: u32,
        pub mask: u32,
        pub gw: u32,
        pub dns: u32,
    }

    impl CfgSetReq {
        pub const WIRE_LEN: usize = 20;

        pub fn from_bytes(b: &[u8]) -> Option<Self> {
            if b.len() != Self::WIRE_LEN {
                return None;
            }
            Some(Self {
                flags: u32::from_le_bytes(b[0..4].try_into().ok()?),
                ip: u32::from_le_bytes(b[4..8].try_into().ok()?),
                mask: u32::from_le_bytes(b[8..12].try_into().ok()?),
                gw: u32::from_le_bytes(b[12..16].try_into().ok()?),
                dns: u32::from_le_bytes(b[16..20].try_into().ok()?),
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct HttpGetReq {
        pub url: String,
        pub timeout_ms: u32,
    }

    impl HttpGetReq {
        pub const WIRE_LEN: usize = HTTP_URL_LEN + 4;

        pub fn from_bytes(b: &[u8]) -> Option<Self> {
            if b.len() != Self::WIRE_LEN {
                return None;
            }
            Some(Self {
                url: read_cstr(&b[0..HTTP_URL_LEN]),
                timeout_ms: u32::from_le_bytes(b[HTTP_URL_LEN..HTTP_URL_LEN + 4].try_into().ok()?),
            })
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HttpGetBegin {
        pub status: u32,
        pub http_status: u32,
        pub content_length: u32,
    }

    impl HttpGetBegin {
        pub fn to_bytes(self) -> [u8; 12] {
            let mut out = [0u8; 12];
            out[0..4].copy_from_slice(&self.status.to_le_bytes());
            out[4..8].copy_from_slice(&self.http_status.to_le_bytes());
            out[8..12].copy_from_slice(&self.content_length.to_le_bytes());
            out
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HttpGetStage {
        pub stage: u32,
        pub status: u32,
        pub detail: u32,
        pub flags: u32,
    }

    impl HttpGetStage {
        pub fn to_bytes(self) -> [u8; 16] {
            let mut out = [0u8; 16];
            out[0..4].copy_from_slice(&self.stage.to_le_bytes());
            out[4..8].copy_from_slice(&self.status.to_le_bytes());
            out[8..12].copy_from_slice(&self.detail.to_le_bytes());
            out[12..16].copy_from_slice(&self.flags.to_le_bytes());
            out
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HttpGetEnd {
        pub status: u32,
    }

    impl HttpGetEnd {
        pub fn to_bytes(self) -> [u8; 4] {
            self.status.to_le_bytes()
        }
    }

    /// `HTTP_GET_DATA{len:u32, bytes:[u8]}` — the length prefix is
    /// redundant with the outer frame `len` but mirrors the original's
    /// struct layout exactly.
    pub fn encode_http_data_payload(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + bytes.len());
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(bytes);
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn link_info_round_trips() {
            let link = LinkInfo {
                name: "ne2k0".to_string(),
                flags: LINK_FLAG_PRESENT | LINK_FLAG_UP,
                ipv4_addr: 0x0A00_020F,
                ipv4_mask: 0xFFFF_FF00,
            };
            let bytes = link.to_bytes();
            assert_eq!(bytes.len(), LinkInfo::WIRE_LEN);
            let back = LinkInfo::from_bytes(&bytes).unwrap();
            assert_eq!(back, link);
        }

        #[test]
        fn link_list_clamps_to_four() {
            let links: Vec<LinkInfo> = (0..6)
                .map(|i| LinkInfo {
                    name: format!("l{i}"),
                    flags: 0,
                    ipv4_addr: 0,
                    ipv4_mask: 0,
                })
                .collect();
            let encoded = encode_link_list(&links);
            let count = u32::from_le_bytes(encoded[0..4].try_into().unwrap());
            assert_eq!(count, MAX_LINKS as u32);
        }

        #[test]
        fn ping_req_rejects_wrong_length() {
            assert!(PingReq::from_bytes(&[0u8; 11]).is_none());
            assert!(PingReq::from_bytes(&[0u8; 12]).is_some());
        }

        #[test]
        fn dns_req_reads_null_terminated_name() {
            let mut buf = [0u8; DnsReq::WIRE_LEN];
            buf[..5].copy_from_slice(b"a.com");
            buf[DNS_NAME_LEN..].copy_from_slice(&500u32.to_le_bytes());
            let req = DnsReq::from_bytes(&buf).unwrap();
            assert_eq!(req.name, "a.com");
            assert_eq!(req.timeout_ms, 500);
        }

        #[test]
        fn http_get_data_payload_carries_length_prefix() {
            let payload = encode_http_data_payload(b"hello");
            let len = u32::from_le_bytes(payload[0..4].try_into().unwrap());
            assert_eq!(len, 5);
            assert_eq!(&payload[4..], b"hello");
        }
    }
}

/// Per-connection receive-state machine (`net_ipc_rx_t`): accumulates
/// partial headers and bodies across reads and yields one complete
/// `(header, payload)` pair at a time.
#[derive(Debug, Default)]
pub struct RxState {
    buf: VecDeque<u8>,
}

#[derive(Debug)]
pub enum RxError {
    /// Header failed to parse (bad magic) or declared a payload over the
    /// cap — the connection must be closed (spec: wire-parse errors are
    /// dropped at the layer that detected them, but a corrupt stream can't
    /// be resynchronized, so the caller tears the client down).
    Malformed,
}

impl RxState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend(data.iter().copied());
    }

    /// Pops one complete message if the buffer holds enough bytes.
    /// Returns `Ok(None)` when more data is needed, mirroring
    /// `net_ipc_try_recv`'s `r == 0` ("no more data this tick") case.
    pub fn try_take(&mut self) -> Result<Option<(IpcHeader, Vec<u8>)>, RxError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut hdr_bytes = [0u8; HEADER_LEN];
        for (slot, byte) in hdr_bytes.iter_mut().zip(self.buf.iter()) {
            *slot = *byte;
        }
        let hdr = IpcHeader::from_bytes(&hdr_bytes).ok_or(RxError::Malformed)?;
        if hdr.len as usize > IPC_MAX_PAYLOAD {
            return Err(RxError::Malformed);
        }

        let total = HEADER_LEN + hdr.len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        for _ in 0..HEADER_LEN {
            self.buf.pop_front();
        }
        let payload: Vec<u8> = self.buf.drain(..hdr.len as usize).collect();
        Ok(Some((hdr, payload)))
    }
}

/// Abstraction over a connected client's pair of message file descriptors
/// (spec §6.1/§4.9's `{fd_in, fd_out}`), so the dispatcher runs against a
/// scripted transport in tests the same way `Device` does for frames.
pub trait ClientIo {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Listener boundary: produces newly accepted client transports, one per
/// call, until none remain pending (`ipc_accept`).
pub trait ListenIo {
    fn try_accept(&mut self) -> io::Result<Option<Box<dyn ClientIo>>>;
}

/// Production transport: a Unix domain socket stands in for the host IPC
/// endpoint spec §6.1 leaves external (pairs of message file descriptors).
/// Bind failure here is the daemon's one fatal startup condition (spec §7).
pub struct UnixListenIo {
    listener: std::os::unix::net::UnixListener,
}

impl UnixListenIo {
    /// `path` is removed first if present — a stale socket file from a
    /// previous run would otherwise make `bind` fail with `AddrInUse`.
    pub fn bind(path: &str) -> io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }
}

impl ListenIo for UnixListenIo {
    fn try_accept(&mut self) -> io::Result<Option<Box<dyn ClientIo>>> {
        match self.listener.accept() {
            Ok((stream, _addr)) => {
                stream.set_nonblocking(true)?;
                Ok(Some(Box::new(UnixClientIo { stream }) as Box<dyn ClientIo>))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

struct UnixClientIo {
    stream: std::os::unix::net::UnixStream,
}

impl ClientIo for UnixClientIo {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        use std::io::Read;
        match self.stream.read(buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.stream.write_all(data)
    }
}

struct Client {
    io: Box<dyn ClientIo>,
    rx: RxState,
}

/// Fixed-capacity client table (`NETD_MAX_CLIENTS` = [`MAX_CLIENTS`]):
/// accept-and-assign-to-a-free-slot, excess connections are closed
/// immediately by simply dropping them.
pub struct ClientTable {
    slots: Vec<Option<Client>>,
}

impl ClientTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_CLIENTS);
        slots.resize_with(MAX_CLIENTS, || None);
        Self { slots }
    }

    pub fn accept_pending(&mut self, listener: &mut dyn ListenIo) {
        loop {
            let accepted = match listener.try_accept() {
                Ok(Some(io)) => io,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "IPC accept failed");
                    break;
                }
            };

            match self.slots.iter_mut().find(|s| s.is_none()) {
                Some(slot) => {
                    *slot = Some(Client {
                        io: accepted,
                        rx: RxState::new(),
                    });
                    debug!("accepted IPC client");
                }
                None => {
                    warn!("IPC client table full, dropping new connection");
                }
            }
        }
    }

    /// Drains every connected client's readable bytes and dispatches each
    /// complete request through `handle`. `handle` returns the encoded
    /// response frame(s) to write back to that same client, if any.
    pub fn process<F>(&mut self, mut handle: F)
    where
        F: FnMut(&IpcHeader, &[u8]) -> Vec<Vec<u8>>,
    {
        let mut read_buf = [0u8; IPC_MAX_PAYLOAD + HEADER_LEN];

        for slot in self.slots.iter_mut() {
            let Some(client) = slot.as_mut() else {
                continue;
            };

            let mut closed = false;
            loop {
                match client.io.try_read(&mut read_buf) {
                    Ok(Some(0)) | Ok(None) => break,
                    Ok(Some(n)) => client.rx.feed(&read_buf[..n]),
                    Err(e) => {
                        trace!(error = %e, "IPC client read failed, closing");
                        closed = true;
                        break;
                    }
                }
            }

            if !closed {
                loop {
                    match client.rx.try_take() {
                        Ok(Some((hdr, payload))) => {
                            for frame in handle(&hdr, &payload) {
                                if client.io.write(&frame).is_err() {
                                    closed = true;
                                    break;
                                }
                            }
                            if closed {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(RxError::Malformed) => {
                            closed = true;
                            break;
                        }
                    }
                }
            }

            if closed {
                *slot = None;
            }
        }
    }
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque as Queue;

    #[test]
    fn header_round_trips() {
        let hdr = IpcHeader {
            magic: IPC_MAGIC,
            msg_type: MsgType::PingReq.wire(),
            seq: 7,
            len: 3,
            flags: 0,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(IpcHeader::from_bytes(&bytes), Some(hdr));
    }

    #[test]
    fn from_bytes_rejects_bad_magic() {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..2].copy_from_slice(&0x1234u16.to_le_bytes());
        assert_eq!(IpcHeader::from_bytes(&bytes), None);
    }

    #[test]
    fn rx_state_accumulates_partial_frames() {
        let full = encode_message(MsgType::Hello, 1, b"abc");
        let mut rx = RxState::new();

        rx.feed(&full[..5]);
        assert!(matches!(rx.try_take(), Ok(None)));

        rx.feed(&full[5..]);
        let (hdr, payload) = rx.try_take().unwrap().unwrap();
        assert_eq!(hdr.msg_type, MsgType::Hello.wire());
        assert_eq!(hdr.seq, 1);
        assert_eq!(payload, b"abc");
        assert!(matches!(rx.try_take(), Ok(None)));
    }

    #[test]
    fn rx_state_pops_multiple_queued_frames() {
        let a = encode_message(MsgType::StatusReq, 1, &[]);
        let b = encode_message(MsgType::PingReq, 2, &[9, 9]);
        let mut rx = RxState::new();
        rx.feed(&a);
        rx.feed(&b);

        let (h1, p1) = rx.try_take().unwrap().unwrap();
        assert_eq!(h1.seq, 1);
        assert!(p1.is_empty());
        let (h2, p2) = rx.try_take().unwrap().unwrap();
        assert_eq!(h2.seq, 2);
        assert_eq!(p2, vec![9, 9]);
    }

    #[test]
    fn rx_state_rejects_oversized_len() {
        let mut hdr = IpcHeader {
            magic: IPC_MAGIC,
            msg_type: MsgType::Hello.wire(),
            seq: 0,
            len: (IPC_MAX_PAYLOAD + 1) as u32,
            flags: 0,
        };
        let mut rx = RxState::new();
        rx.feed(&hdr.to_bytes());
        assert!(matches!(rx.try_take(), Err(RxError::Malformed)));
        hdr.len = 0;
        let _ = hdr;
    }

    #[test]
    fn encode_http_data_splits_to_payload_cap() {
        let body = vec![0xAB; IPC_MAX_PAYLOAD * 2 + 10];
        let frames = encode_http_data(42, &body);
        assert_eq!(frames.len(), 3);
        for frame in &frames[..2] {
            assert_eq!(frame.len(), HEADER_LEN + IPC_MAX_PAYLOAD);
        }
        assert_eq!(frames[2].len(), HEADER_LEN + 4 + 18);
    }

    struct ScriptedClient {
        inbound: Queue<u8>,
        outbound: std::rc::Rc<std::cell::RefCell<Vec<u8>>>,
    }

    impl ClientIo for ScriptedClient {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            if self.inbound.is_empty() {
                return Ok(None);
            }
            let n = buf.len().min(self.inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(Some(n))
        }

        fn write(&mut self, data: &[u8]) -> io::Result<()> {
            self.outbound.borrow_mut().extend_from_slice(data);
            Ok(())
        }
    }

    struct OneShotListener {
        pending: Option<ScriptedClient>,
    }

    impl ListenIo for OneShotListener {
        fn try_accept(&mut self) -> io::Result<Option<Box<dyn ClientIo>>> {
            Ok(self.pending.take().map(|c| Box::new(c) as Box<dyn ClientIo>))
        }
    }

    #[test]
    fn client_table_dispatches_and_echoes_status() {
        let req = encode_message(MsgType::StatusReq, 5, &[]);
        let outbound = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut listener = OneShotListener {
            pending: Some(ScriptedClient {
                inbound: req.into_iter().collect(),
                outbound: outbound.clone(),
            }),
        };

        let mut table = ClientTable::new();
        table.accept_pending(&mut listener);

        table.process(|hdr, _payload| {
            assert_eq!(hdr.msg_type, MsgType::StatusReq.wire());
            vec![encode_message(MsgType::StatusResp, hdr.seq, &0u32.to_le_bytes())]
        });

        let sent = outbound.borrow();
        let resp_hdr = IpcHeader::from_bytes(sent[..HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(resp_hdr.msg_type, MsgType::StatusResp.wire());
        assert_eq!(resp_hdr.seq, 5);
    }
}
