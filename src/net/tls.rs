//! TLS 1.3 client handshake (spec §4.7), RFC 8446, scoped to the minimum
//! needed for HTTPS GET: X25519 only, `TLS_AES_128_GCM_SHA256` and
//! `TLS_CHACHA20_POLY1305_SHA256`, one HelloRetryRequest round trip, server
//! certificate accepted without signature verification (the peer is trusted
//! by construction — this daemon talks to a fixed, operator-chosen target).

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::config::TLS_RX_CAP;
use crate::crypto::aead_aes128gcm;
use crate::crypto::aead_chacha20poly1305;
use crate::crypto::hkdf;
use crate::crypto::poly1305::ct_eq;
use crate::crypto::sha256::{sha256, sha256_empty};
use crate::crypto::x25519::{x25519, x25519_public_key};
use crate::crypto::{hmac_sha256, selftest, Rand};
use crate::error::{
    NetError, StatusCode, TlsError, TlsStep, TLS_ALERT_INTERNAL_DECRYPT, TLS_ALERT_INTERNAL_EOF,
    TLS_ALERT_INTERNAL_HRR_VIOLATION, TLS_ALERT_INTERNAL_IO, TLS_ALERT_INTERNAL_SELFTEST,
    TLS_ALERT_INTERNAL_UNSUPPORTED,
};
use crate::stats::Stats;

const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
const CONTENT_ALERT: u8 = 21;
const CONTENT_HANDSHAKE: u8 = 22;
const CONTENT_APPLICATION_DATA: u8 = 23;

const HS_CLIENT_HELLO: u8 = 1;
const HS_SERVER_HELLO: u8 = 2;
const HS_ENCRYPTED_EXTENSIONS: u8 = 8;
const HS_CERTIFICATE: u8 = 11;
const HS_CERTIFICATE_VERIFY: u8 = 15;
const HS_FINISHED: u8 = 20;
const HS_MESSAGE_HASH: u8 = 254;

const EXT_SUPPORTED_GROUPS: u16 = 10;
const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
const EXT_SUPPORTED_VERSIONS: u16 = 43;
const EXT_COOKIE: u16 = 44;
const EXT_KEY_SHARE: u16 = 51;

const GROUP_SECP256R1: u16 = 0x0017;
const GROUP_X25519: u16 = 0x001D;

pub const APP_DATA_CHUNK: usize = 1200;

/// RFC 8446 §4.1.3: the magic ServerHello.random that marks a HelloRetryRequest.
const HRR_RANDOM: [u8; 32] = [
    0xCF, 0x21, 0xAD, 0x74, 0xE5, 0x9A, 0x61, 0x11, 0xBE, 0x1D, 0x8C, 0x02, 0x1E, 0x65, 0xB8, 0x91,
    0xC2, 0xA2, 0x11, 0x16, 0x7A, 0xBB, 0x8C, 0x5E, 0x07, 0x9E, 0x09, 0xE2, 0xC8, 0xA8, 0x33, 0x9C,
];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CipherSuite {
    Aes128GcmSha256,
    ChaCha20Poly1305Sha256,
}

impl CipherSuite {
    fn wire(self) -> u16 {
        match self {
            CipherSuite::Aes128GcmSha256 => 0x1301,
            CipherSuite::ChaCha20Poly1305Sha256 => 0x1303,
        }
    }

    fn from_wire(v: u16) -> Option<Self> {
        match v {
            0x1301 => Some(CipherSuite::Aes128GcmSha256),
            0x1303 => Some(CipherSuite::ChaCha20Poly1305Sha256),
            _ => None,
        }
    }

    fn key_len(self) -> usize {
        match self {
            CipherSuite::Aes128GcmSha256 => 16,
            CipherSuite::ChaCha20Poly1305Sha256 => 32,
        }
    }
}

fn aead_seal(
    suite: CipherSuite,
    key: &[u8],
    nonce: &[u8; 12],
    aad: &[u8],
    pt: &[u8],
) -> (Vec<u8>, [u8; 16]) {
    match suite {
        CipherSuite::Aes128GcmSha256 => {
            let mut k = [0u8; 16];
            k.copy_from_slice(key);
            aead_aes128gcm::seal(&k, nonce, aad, pt)
        }
        CipherSuite::ChaCha20Poly1305Sha256 => {
            let mut k = [0u8; 32];
            k.copy_from_slice(key);
            aead_chacha20poly1305::seal(&k, nonce, aad, pt)
        }
    }
}

fn aead_open(
    suite: CipherSuite,
    key: &[u8],
    nonce: &[u8; 12],
    aad: &[u8],
    ct: &[u8],
    tag: &[u8; 16],
) -> Result<Vec<u8>, ()> {
    match suite {
        CipherSuite::Aes128GcmSha256 => {
            let mut k = [0u8; 16];
            k.copy_from_slice(key);
            aead_aes128gcm::open(&k, nonce, aad, ct, tag).map_err(|_| ())
        }
        CipherSuite::ChaCha20Poly1305Sha256 => {
            let mut k = [0u8; 32];
            k.copy_from_slice(key);
            aead_chacha20poly1305::open(&k, nonce, aad, ct, tag).map_err(|_| ())
        }
    }
}

struct TrafficKeys {
    key: Vec<u8>,
    iv: [u8; 12],
    seq: u64,
}

impl TrafficKeys {
    fn derive(suite: CipherSuite, secret: &[u8; 32]) -> Self {
        let key = hkdf::expand_label(secret, "key", &[], suite.key_len());
        let iv_vec = hkdf::expand_label(secret, "iv", &[], 12);
        let mut iv = [0u8; 12];
        iv.copy_from_slice(&iv_vec);
        Self { key, iv, seq: 0 }
    }

    /// `nonce = iv XOR seq` with `seq` placed in the low 8 bytes, big-endian
    /// (spec §4.2); advances `seq` after use.
    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = self.iv;
        let seq_bytes = self.seq.to_be_bytes();
        for i in 0..8 {
            nonce[4 + i] ^= seq_bytes[i];
        }
        self.seq += 1;
        nonce
    }

    fn wipe(&mut self) {
        self.key.iter_mut().for_each(|b| *b = 0);
        self.iv = [0u8; 12];
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Protection {
    None,
    Handshake,
    Application,
}

fn u24(n: usize) -> [u8; 3] {
    [(n >> 16) as u8, (n >> 8) as u8, n as u8]
}

fn write_ext(out: &mut Vec<u8>, ext_type: u16, body: &[u8]) {
    out.extend_from_slice(&ext_type.to_be_bytes());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
}

/// Builds one ClientHello handshake message (type + 3-byte length + body).
fn build_client_hello(
    client_random: &[u8; 32],
    session_id: &[u8; 32],
    client_pub_x25519: &[u8; 32],
    cookie: Option<&[u8]>,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0x0303u16.to_be_bytes());
    body.extend_from_slice(client_random);
    body.push(32);
    body.extend_from_slice(session_id);

    let suites = [
        CipherSuite::Aes128GcmSha256.wire(),
        CipherSuite::ChaCha20Poly1305Sha256.wire(),
    ];
    body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
    for s in suites {
        body.extend_from_slice(&s.to_be_bytes());
    }

    body.push(1);
    body.push(0); // legacy_compression_methods = { null }

    let mut exts = Vec::new();

    write_ext(
        &mut exts,
        EXT_SUPPORTED_VERSIONS,
        &[2, 0x03, 0x04],
    );

    let mut groups = vec![0u8; 2];
    groups[0..2].copy_from_slice(&4u16.to_be_bytes());
    groups.extend_from_slice(&GROUP_X25519.to_be_bytes());
    groups.extend_from_slice(&GROUP_SECP256R1.to_be_bytes());
    write_ext(&mut exts, EXT_SUPPORTED_GROUPS, &groups);

    let sig_algs: [u16; 3] = [0x0403, 0x0804, 0x0401];
    let mut sa = (sig_algs.len() as u16 * 2).to_be_bytes().to_vec();
    for a in sig_algs {
        sa.extend_from_slice(&a.to_be_bytes());
    }
    write_ext(&mut exts, EXT_SIGNATURE_ALGORITHMS, &sa);

    let mut ks_entry = Vec::new();
    ks_entry.extend_from_slice(&GROUP_X25519.to_be_bytes());
    ks_entry.extend_from_slice(&32u16.to_be_bytes());
    ks_entry.extend_from_slice(client_pub_x25519);
    let mut ks = (ks_entry.len() as u16).to_be_bytes().to_vec();
    ks.extend_from_slice(&ks_entry);
    write_ext(&mut exts, EXT_KEY_SHARE, &ks);

    if let Some(c) = cookie {
        let mut cbody = (c.len() as u16).to_be_bytes().to_vec();
        cbody.extend_from_slice(c);
        write_ext(&mut exts, EXT_COOKIE, &cbody);
    }

    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut msg = vec![HS_CLIENT_HELLO];
    msg.extend_from_slice(&u24(body.len()));
    msg.extend_from_slice(&body);
    msg
}

struct ServerHello {
    random: [u8; 32],
    cipher_suite: CipherSuite,
    selected_version: u16,
    key_share_group: Option<u16>,
    key_share: Option<[u8; 32]>,
    cookie: Option<Vec<u8>>,
}

fn parse_server_hello(body: &[u8]) -> Option<ServerHello> {
    if body.len() < 2 + 32 + 1 {
        return None;
    }
    let mut off = 2;
    let mut random = [0u8; 32];
    random.copy_from_slice(&body[off..off + 32]);
    off += 32;
    let sid_len = body[off] as usize;
    off += 1;
    if body.len() < off + sid_len + 2 + 1 + 2 {
        return None;
    }
    off += sid_len;
    let cipher_suite = CipherSuite::from_wire(u16::from_be_bytes([body[off], body[off + 1]]))?;
    off += 2;
    off += 1; // legacy_compression_method
    let ext_len = u16::from_be_bytes([body[off], body[off + 1]]) as usize;
    off += 2;
    if body.len() < off + ext_len {
        return None;
    }
    let ext_buf = &body[off..off + ext_len];

    let mut selected_version = 0u16;
    let mut key_share_group = None;
    let mut key_share = None;
    let mut cookie = None;

    let mut p = 0;
    while p + 4 <= ext_buf.len() {
        let etype = u16::from_be_bytes([ext_buf[p], ext_buf[p + 1]]);
        let elen = u16::from_be_bytes([ext_buf[p + 2], ext_buf[p + 3]]) as usize;
        p += 4;
        if p + elen > ext_buf.len() {
            return None;
        }
        let edata = &ext_buf[p..p + elen];
        match etype {
            EXT_SUPPORTED_VERSIONS if edata.len() >= 2 => {
                selected_version = u16::from_be_bytes([edata[0], edata[1]]);
            }
            EXT_KEY_SHARE if edata.len() >= 2 => {
                let group = u16::from_be_bytes([edata[0], edata[1]]);
                key_share_group = Some(group);
                if edata.len() >= 4 {
                    let klen = u16::from_be_bytes([edata[2], edata[3]]) as usize;
                    if klen == 32 && edata.len() >= 4 + klen {
                        let mut k = [0u8; 32];
                        k.copy_from_slice(&edata[4..4 + 32]);
                        key_share = Some(k);
                    }
                }
            }
            EXT_COOKIE if edata.len() >= 2 => {
                let clen = u16::from_be_bytes([edata[0], edata[1]]) as usize;
                if edata.len() >= 2 + clen {
                    cookie = Some(edata[2..2 + clen].to_vec());
                }
            }
            _ => {}
        }
        p += elen;
    }

    Some(ServerHello {
        random,
        cipher_suite,
        selected_version,
        key_share_group,
        key_share,
        cookie,
    })
}

fn write_record(
    send: &mut dyn FnMut(&[u8]) -> Result<(), NetError>,
    content_type: u8,
    body: &[u8],
) -> Result<(), NetError> {
    let mut rec = Vec::with_capacity(5 + body.len());
    rec.push(content_type);
    rec.extend_from_slice(&0x0303u16.to_be_bytes());
    rec.extend_from_slice(&(body.len() as u16).to_be_bytes());
    rec.extend_from_slice(body);
    send(&rec)
}

fn read_record(
    recv_exact: &mut dyn FnMut(&mut [u8]) -> Result<(), NetError>,
) -> Result<(u8, [u8; 5], Vec<u8>), NetError> {
    let mut header = [0u8; 5];
    recv_exact(&mut header)?;
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut body = vec![0u8; len];
    if len > 0 {
        recv_exact(&mut body)?;
    }
    Ok((header[0], header, body))
}

/// Decrypts one record, returning the inner content type and de-padded
/// payload (spec §4.2).
fn open_record(
    suite: CipherSuite,
    keys: &mut TrafficKeys,
    header: &[u8; 5],
    body: &[u8],
) -> Option<(u8, Vec<u8>)> {
    if body.len() < 16 {
        return None;
    }
    let (ct, tag_slice) = body.split_at(body.len() - 16);
    let mut tag = [0u8; 16];
    tag.copy_from_slice(tag_slice);
    let nonce = keys.next_nonce();
    let plain = aead_open(suite, &keys.key, &nonce, header, ct, &tag).ok()?;

    let mut end = plain.len();
    while end > 0 && plain[end - 1] == 0 {
        end -= 1;
    }
    if end == 0 {
        return None;
    }
    let inner_type = plain[end - 1];
    Some((inner_type, plain[..end - 1].to_vec()))
}

fn seal_record(suite: CipherSuite, keys: &mut TrafficKeys, inner_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut inner = payload.to_vec();
    inner.push(inner_type);
    let total_len = payload.len() + 1 + 16;

    let mut header = [0u8; 5];
    header[0] = CONTENT_APPLICATION_DATA;
    header[1] = 0x03;
    header[2] = 0x03;
    header[3..5].copy_from_slice(&(total_len as u16).to_be_bytes());

    let nonce = keys.next_nonce();
    let (ct, tag) = aead_seal(suite, &keys.key, &nonce, &header, &inner);

    let mut rec = header.to_vec();
    rec.extend_from_slice(&ct);
    rec.extend_from_slice(&tag);
    rec
}

struct Transcript(Vec<u8>);

impl Transcript {
    fn new() -> Self {
        Self(Vec::new())
    }
    fn push(&mut self, msg: &[u8]) {
        self.0.extend_from_slice(msg);
    }
    fn replace(&mut self, bytes: Vec<u8>) {
        self.0 = bytes;
    }
    fn hash(&self) -> [u8; 32] {
        sha256(&self.0)
    }
}

/// Accumulates decrypted/plaintext handshake bytes and pops off complete
/// `type(1) || length(3) || body` messages, since one record's payload can
/// hold a partial or several handshake messages.
struct HsBuf {
    buf: Vec<u8>,
}

impl HsBuf {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }
    fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }
    fn try_take(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 4 {
            return None;
        }
        let len = ((self.buf[1] as usize) << 16) | ((self.buf[2] as usize) << 8) | self.buf[3] as usize;
        if self.buf.len() < 4 + len {
            return None;
        }
        Some(self.buf.drain(0..4 + len).collect())
    }
}

fn next_handshake_message(
    recv_exact: &mut dyn FnMut(&mut [u8]) -> Result<(), NetError>,
    protection: Protection,
    suite: CipherSuite,
    read_keys: &mut Option<TrafficKeys>,
    hs_buf: &mut HsBuf,
    step: TlsStep,
) -> Result<Vec<u8>, TlsError> {
    loop {
        if let Some(msg) = hs_buf.try_take() {
            return Ok(msg);
        }

        let (outer_type, header, body) = read_record(recv_exact)
            .map_err(|e| TlsError::new(step, StatusCode::from(&e), TLS_ALERT_INTERNAL_IO))?;

        match protection {
            Protection::None => {
                if outer_type == CONTENT_CHANGE_CIPHER_SPEC {
                    continue;
                }
                if outer_type == CONTENT_ALERT {
                    let level = body.first().copied().unwrap_or(0);
                    let desc = body.get(1).copied().unwrap_or(0);
                    return Err(TlsError::new(
                        step,
                        StatusCode::Error,
                        ((level as u16) << 8) | desc as u16,
                    ));
                }
                if outer_type != CONTENT_HANDSHAKE {
                    return Err(TlsError::new(
                        step,
                        StatusCode::Error,
                        TLS_ALERT_INTERNAL_IO,
                    ));
                }
                hs_buf.feed(&body);
            }
            Protection::Handshake | Protection::Application => {
                let keys = read_keys.as_mut().expect("read keys set once protection upgrades");
                let (inner_type, plain) = open_record(suite, keys, &header, &body).ok_or_else(|| {
                    TlsError::new(step, StatusCode::Error, TLS_ALERT_INTERNAL_DECRYPT)
                })?;
                match inner_type {
                    CONTENT_HANDSHAKE => hs_buf.feed(&plain),
                    CONTENT_ALERT => {
                        let level = plain.first().copied().unwrap_or(0);
                        let desc = plain.get(1).copied().unwrap_or(0);
                        if desc == 0 {
                            return Err(TlsError::new(step, StatusCode::Ok, TLS_ALERT_INTERNAL_EOF));
                        }
                        return Err(TlsError::new(
                            step,
                            StatusCode::Error,
                            ((level as u16) << 8) | desc as u16,
                        ));
                    }
                    _ => {
                        return Err(TlsError::new(step, StatusCode::Error, TLS_ALERT_INTERNAL_IO));
                    }
                }
            }
        }
    }
}

/// Established TLS 1.3 connection: post-handshake send/recv over the
/// application traffic keys.
pub struct TlsClient {
    suite: CipherSuite,
    read_keys: TrafficKeys,
    write_keys: TrafficKeys,
    rx_buf: VecDeque<u8>,
    closed: bool,
}

impl TlsClient {
    /// Seals `data` as application-data records of at most `APP_DATA_CHUNK`
    /// bytes each (spec §4.7 "Send path").
    pub fn send(
        &mut self,
        mut send: impl FnMut(&[u8]) -> Result<(), NetError>,
        data: &[u8],
        stats: &mut Stats,
    ) -> Result<(), NetError> {
        for chunk in data.chunks(APP_DATA_CHUNK) {
            let rec = seal_record(self.suite, &mut self.write_keys, CONTENT_APPLICATION_DATA, chunk);
            send(&rec)?;
        }
        stats.tls_tx_bytes += data.len() as u64;
        Ok(())
    }

    /// Drains already-buffered application data, then reads and decrypts
    /// records until some is available, the peer sends `close_notify`
    /// (returns `Ok(0)`), or `recv_exact` errors.
    pub fn recv(
        &mut self,
        mut recv_exact: impl FnMut(&mut [u8]) -> Result<(), NetError>,
        out: &mut [u8],
        stats: &mut Stats,
    ) -> Result<usize, NetError> {
        loop {
            if !self.rx_buf.is_empty() {
                let n = out.len().min(self.rx_buf.len());
                for slot in out.iter_mut().take(n) {
                    *slot = self.rx_buf.pop_front().unwrap();
                }
                stats.tls_rx_bytes += n as u64;
                return Ok(n);
            }
            if self.closed {
                return Ok(0);
            }

            let (_outer_type, header, body) = read_record(&mut recv_exact)?;
            let Some((inner_type, plain)) = open_record(self.suite, &mut self.read_keys, &header, &body)
            else {
                return Err(NetError::ConnReset);
            };

            match inner_type {
                CONTENT_APPLICATION_DATA => {
                    self.rx_buf.extend(plain);
                }
                CONTENT_ALERT => {
                    stats.tls_alerts += 1;
                    let desc = plain.get(1).copied().unwrap_or(0);
                    if desc == 0 {
                        self.closed = true;
                    } else {
                        return Err(NetError::ConnReset);
                    }
                }
                CONTENT_HANDSHAKE => {
                    // Post-handshake messages (NewSessionTicket, KeyUpdate)
                    // are accepted and ignored; this client never resumes or
                    // rekeys.
                    trace!("ignoring post-handshake TLS message");
                }
                _ => return Err(NetError::Malformed("unexpected TLS record type")),
            }
        }
    }

    /// Wipes both traffic keys; the caller is responsible for closing the
    /// underlying TCP connection. No outgoing `close_notify` is sent.
    pub fn close(mut self) {
        self.read_keys.wipe();
        self.write_keys.wipe();
    }
}

/// Runs the full client handshake over an already-established TCP
/// connection, driven entirely through the supplied `send`/`recv_exact`
/// closures (spec §4.7). `recv_exact` must block until exactly `buf.len()`
/// bytes have arrived, returning `Err(NetError::Timeout)` on stall or
/// `Err(NetError::ConnReset)` on a clean peer close mid-handshake.
pub fn handshake(
    rand: &mut Rand,
    mut send: impl FnMut(&[u8]) -> Result<(), NetError>,
    mut recv_exact: impl FnMut(&mut [u8]) -> Result<(), NetError>,
    stats: &mut Stats,
) -> Result<TlsClient, TlsError> {
    if !selftest::run() {
        warn!("TLS self-test failed, refusing to handshake");
        stats.tls_handshake_failures += 1;
        return Err(TlsError::new(
            TlsStep::BuildClientHello,
            StatusCode::Error,
            TLS_ALERT_INTERNAL_SELFTEST,
        ));
    }

    match handshake_inner(rand, &mut send, &mut recv_exact) {
        Ok(client) => {
            stats.tls_handshakes += 1;
            Ok(client)
        }
        Err(e) => {
            stats.tls_handshake_failures += 1;
            Err(e)
        }
    }
}

fn handshake_inner(
    rand: &mut Rand,
    send: &mut dyn FnMut(&[u8]) -> Result<(), NetError>,
    recv_exact: &mut dyn FnMut(&mut [u8]) -> Result<(), NetError>,
) -> Result<TlsClient, TlsError> {
    let mut client_priv = rand.bytes32();
    let client_pub = x25519_public_key(&client_priv);
    let client_random = rand.bytes32();
    let session_id = rand.bytes32();

    let ch1 = build_client_hello(&client_random, &session_id, &client_pub, None);
    let mut transcript = Transcript::new();
    transcript.push(&ch1);

    debug!("sending ClientHello");
    write_record(send, CONTENT_HANDSHAKE, &ch1)
        .map_err(|e| TlsError::new(TlsStep::SendClientHello, StatusCode::from(&e), TLS_ALERT_INTERNAL_IO))?;
    write_record(send, CONTENT_CHANGE_CIPHER_SPEC, &[0x01])
        .map_err(|e| TlsError::new(TlsStep::SendClientHello, StatusCode::from(&e), TLS_ALERT_INTERNAL_IO))?;

    let mut hs_buf = HsBuf::new();
    let mut read_keys: Option<TrafficKeys> = None;

    let mut msg = next_handshake_message(
        recv_exact,
        Protection::None,
        CipherSuite::Aes128GcmSha256,
        &mut read_keys,
        &mut hs_buf,
        TlsStep::RecvServerHello,
    )?;
    if msg.first() != Some(&HS_SERVER_HELLO) {
        return Err(TlsError::new(TlsStep::RecvServerHello, StatusCode::Error, TLS_ALERT_INTERNAL_IO));
    }

    let mut sh = parse_server_hello(&msg[4..])
        .ok_or_else(|| TlsError::new(TlsStep::ParseServerHello, StatusCode::Error, TLS_ALERT_INTERNAL_IO))?;

    let mut hrr_suite = None;
    if sh.random == HRR_RANDOM {
        debug!("received HelloRetryRequest");
        if sh.key_share_group != Some(GROUP_X25519) {
            return Err(TlsError::new(
                TlsStep::ParseServerHello,
                StatusCode::Unsupported,
                TLS_ALERT_INTERNAL_UNSUPPORTED,
            ));
        }
        hrr_suite = Some(sh.cipher_suite);

        let ch1_hash = sha256(&ch1);
        let mut synthetic = vec![HS_MESSAGE_HASH, 0, 0, 32];
        synthetic.extend_from_slice(&ch1_hash);
        transcript.replace(synthetic);
        transcript.push(&msg);

        let ch2 = build_client_hello(&client_random, &session_id, &client_pub, sh.cookie.as_deref());
        transcript.push(&ch2);
        write_record(send, CONTENT_HANDSHAKE, &ch2).map_err(|e| {
            TlsError::new(TlsStep::SendClientHello, StatusCode::from(&e), TLS_ALERT_INTERNAL_IO)
        })?;

        msg = next_handshake_message(
            recv_exact,
            Protection::None,
            CipherSuite::Aes128GcmSha256,
            &mut read_keys,
            &mut hs_buf,
            TlsStep::RecvServerHello,
        )?;
        if msg.first() != Some(&HS_SERVER_HELLO) {
            return Err(TlsError::new(TlsStep::RecvServerHello, StatusCode::Error, TLS_ALERT_INTERNAL_IO));
        }
        sh = parse_server_hello(&msg[4..]).ok_or_else(|| {
            TlsError::new(TlsStep::ParseServerHello, StatusCode::Error, TLS_ALERT_INTERNAL_IO)
        })?;
        if sh.random == HRR_RANDOM {
            return Err(TlsError::new(
                TlsStep::ParseServerHello,
                StatusCode::Error,
                TLS_ALERT_INTERNAL_HRR_VIOLATION,
            ));
        }
    }
    transcript.push(&msg);

    if sh.selected_version != 0x0304 {
        return Err(TlsError::new(
            TlsStep::ParseServerHello,
            StatusCode::Unsupported,
            TLS_ALERT_INTERNAL_UNSUPPORTED,
        ));
    }
    if sh.key_share_group != Some(GROUP_X25519) || sh.key_share.is_none() {
        return Err(TlsError::new(
            TlsStep::ParseServerHello,
            StatusCode::Unsupported,
            TLS_ALERT_INTERNAL_UNSUPPORTED,
        ));
    }
    if let Some(expect) = hrr_suite {
        if sh.cipher_suite != expect {
            return Err(TlsError::new(
                TlsStep::ParseServerHello,
                StatusCode::Error,
                TLS_ALERT_INTERNAL_HRR_VIOLATION,
            ));
        }
    }

    let suite = sh.cipher_suite;
    let server_pub = sh.key_share.unwrap();
    let shared = x25519(&client_priv, &server_pub);
    client_priv.fill(0);

    let zero32 = [0u8; 32];
    let early = hkdf::extract(&zero32, &zero32);
    let derived1 = hkdf::derive_secret(&early, "derived", &sha256_empty());
    let hs_secret = hkdf::extract(&derived1, &shared);

    let ch_sh_hash = transcript.hash();
    let c_hs_ts = hkdf::derive_secret(&hs_secret, "c hs traffic", &ch_sh_hash);
    let s_hs_ts = hkdf::derive_secret(&hs_secret, "s hs traffic", &ch_sh_hash);
    let derived2 = hkdf::derive_secret(&hs_secret, "derived", &sha256_empty());
    let master = hkdf::extract(&derived2, &zero32);

    read_keys = Some(TrafficKeys::derive(suite, &s_hs_ts));

    loop {
        let msg = next_handshake_message(
            recv_exact,
            Protection::Handshake,
            suite,
            &mut read_keys,
            &mut hs_buf,
            TlsStep::RecvServerFinished,
        )?;
        let msg_type = *msg.first().unwrap_or(&0);

        if msg_type == HS_FINISHED {
            let th = transcript.hash();
            let finished_key_s = hkdf::expand_label(&s_hs_ts, "finished", &[], 32);
            let expected = hmac_sha256(&finished_key_s, &th);
            let body = &msg[4..];
            if body.len() != 32 || !ct_eq(&expected, body) {
                return Err(TlsError::new(
                    TlsStep::RecvServerFinished,
                    StatusCode::Error,
                    TLS_ALERT_INTERNAL_DECRYPT,
                ));
            }
            transcript.push(&msg);
            break;
        }

        if !matches!(msg_type, HS_ENCRYPTED_EXTENSIONS | HS_CERTIFICATE | HS_CERTIFICATE_VERIFY) {
            return Err(TlsError::new(
                TlsStep::RecvServerFinished,
                StatusCode::Error,
                TLS_ALERT_INTERNAL_IO,
            ));
        }
        transcript.push(&msg);
    }

    let th_server_finished = transcript.hash();
    let c_ap_ts = hkdf::derive_secret(&master, "c ap traffic", &th_server_finished);
    let s_ap_ts = hkdf::derive_secret(&master, "s ap traffic", &th_server_finished);

    read_keys = Some(TrafficKeys::derive(suite, &s_ap_ts));

    let mut write_keys_hs = TrafficKeys::derive(suite, &c_hs_ts);
    let finished_key_c = hkdf::expand_label(&c_hs_ts, "finished", &[], 32);
    let verify_data_c = hmac_sha256(&finished_key_c, &th_server_finished);
    let mut client_finished = vec![HS_FINISHED, 0, 0, 32];
    client_finished.extend_from_slice(&verify_data_c);

    let rec = seal_record(suite, &mut write_keys_hs, CONTENT_HANDSHAKE, &client_finished);
    send(&rec).map_err(|e| {
        TlsError::new(TlsStep::SendClientFinished, StatusCode::from(&e), TLS_ALERT_INTERNAL_IO)
    })?;
    write_keys_hs.wipe();

    let write_keys = TrafficKeys::derive(suite, &c_ap_ts);

    debug!(suite = ?suite, "TLS 1.3 handshake complete");

    Ok(TlsClient {
        suite,
        read_keys: read_keys.unwrap(),
        write_keys,
        rx_buf: VecDeque::with_capacity(TLS_RX_CAP),
        closed: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_round_trips_key_share() {
        let random = [0x11u8; 32];
        let sid = [0x22u8; 32];
        let pubkey = [0x33u8; 32];
        let msg = build_client_hello(&random, &sid, &pubkey, None);

        assert_eq!(msg[0], HS_CLIENT_HELLO);
        let len = ((msg[1] as usize) << 16) | ((msg[2] as usize) << 8) | msg[3] as usize;
        assert_eq!(msg.len(), 4 + len);

        // Locate the key_share extension and confirm the public key round-trips.
        let body = &msg[4..];
        let sid_len = body[34] as usize;
        let mut off = 35 + sid_len;
        let cs_len = u16::from_be_bytes([body[off], body[off + 1]]) as usize;
        off += 2 + cs_len;
        off += 1; // compression methods length byte
        off += 1; // compression methods (single null byte)
        let ext_len = u16::from_be_bytes([body[off], body[off + 1]]) as usize;
        off += 2;
        let ext_buf = &body[off..off + ext_len];

        let mut p = 0;
        let mut found = false;
        while p + 4 <= ext_buf.len() {
            let etype = u16::from_be_bytes([ext_buf[p], ext_buf[p + 1]]);
            let elen = u16::from_be_bytes([ext_buf[p + 2], ext_buf[p + 3]]) as usize;
            p += 4;
            if etype == EXT_KEY_SHARE {
                let edata = &ext_buf[p..p + elen];
                assert_eq!(u16::from_be_bytes([edata[0], edata[1]]), GROUP_X25519);
                assert_eq!(&edata[4..4 + 32], &pubkey[..]);
                found = true;
            }
            p += elen;
        }
        assert!(found, "key_share extension missing");
    }

    fn build_server_hello(
        random: [u8; 32],
        suite: CipherSuite,
        key_share: [u8; 32],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes());
        body.extend_from_slice(&random);
        body.push(0); // legacy_session_id_echo, empty
        body.extend_from_slice(&suite.wire().to_be_bytes());
        body.push(0); // legacy_compression_method

        let mut exts = Vec::new();
        write_ext(&mut exts, EXT_SUPPORTED_VERSIONS, &0x0304u16.to_be_bytes());
        let mut ks = Vec::new();
        ks.extend_from_slice(&GROUP_X25519.to_be_bytes());
        ks.extend_from_slice(&32u16.to_be_bytes());
        ks.extend_from_slice(&key_share);
        write_ext(&mut exts, EXT_KEY_SHARE, &ks);

        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut msg = vec![HS_SERVER_HELLO];
        msg.extend_from_slice(&u24(body.len()));
        msg.extend_from_slice(&body);
        msg
    }

    #[test]
    fn server_hello_parses_key_share_and_version() {
        let server_priv = [0x44u8; 32];
        let server_pub = x25519_public_key(&server_priv);
        let msg = build_server_hello([0x55; 32], CipherSuite::ChaCha20Poly1305Sha256, server_pub);
        let sh = parse_server_hello(&msg[4..]).unwrap();
        assert_eq!(sh.selected_version, 0x0304);
        assert_eq!(sh.cipher_suite, CipherSuite::ChaCha20Poly1305Sha256);
        assert_eq!(sh.key_share_group, Some(GROUP_X25519));
        assert_eq!(sh.key_share, Some(server_pub));
    }

    #[test]
    fn full_handshake_round_trip_in_process() {
        // Plays both client and server roles through this module's own
        // wire/key-schedule primitives to validate the end-to-end math
        // without a real peer (the daemon never verifies server identity,
        // so a consenting in-process "server" is a faithful stand-in).
        let mut client_rand = Rand::new();
        let mut server_rand = Rand::new();

        let client_priv = client_rand.bytes32();
        let client_pub = x25519_public_key(&client_priv);
        let client_random = client_rand.bytes32();
        let session_id = client_rand.bytes32();
        let ch1 = build_client_hello(&client_random, &session_id, &client_pub, None);

        let server_priv = server_rand.bytes32();
        let server_pub = x25519_public_key(&server_priv);
        let sh = build_server_hello(server_rand.bytes32(), CipherSuite::Aes128GcmSha256, server_pub);

        let mut transcript = Vec::new();
        transcript.extend_from_slice(&ch1);
        transcript.extend_from_slice(&sh);
        let ch_sh_hash = sha256(&transcript);

        let shared_client = x25519(&client_priv, &server_pub);
        let shared_server = x25519(&server_priv, &client_pub);
        assert_eq!(shared_client, shared_server);

        let zero32 = [0u8; 32];
        let early = hkdf::extract(&zero32, &zero32);
        let derived1 = hkdf::derive_secret(&early, "derived", &sha256_empty());
        let hs_secret = hkdf::extract(&derived1, &shared_client);
        let s_hs_ts = hkdf::derive_secret(&hs_secret, "s hs traffic", &ch_sh_hash);

        // Server "sends" EncryptedExtensions + Finished, sealed under s_hs_ts.
        let mut server_write = TrafficKeys::derive(CipherSuite::Aes128GcmSha256, &s_hs_ts);
        let ee = {
            let mut m = vec![HS_ENCRYPTED_EXTENSIONS, 0, 0, 2];
            m.extend_from_slice(&[0, 0]); // empty extensions list
            m
        };
        transcript.extend_from_slice(&ee);
        let th_before_finished = sha256(&transcript);
        let finished_key_s = hkdf::expand_label(&s_hs_ts, "finished", &[], 32);
        let verify_data_s = hmac_sha256(&finished_key_s, &th_before_finished);
        let mut server_finished = vec![HS_FINISHED, 0, 0, 32];
        server_finished.extend_from_slice(&verify_data_s);

        let rec1 = seal_record(
            CipherSuite::Aes128GcmSha256,
            &mut server_write,
            CONTENT_HANDSHAKE,
            &ee,
        );
        let rec2 = seal_record(
            CipherSuite::Aes128GcmSha256,
            &mut server_write,
            CONTENT_HANDSHAKE,
            &server_finished,
        );

        let mut inbound: VecDeque<u8> = VecDeque::new();
        inbound.extend(rec1);
        inbound.extend(rec2);

        let mut client_read = TrafficKeys::derive(CipherSuite::Aes128GcmSha256, &s_hs_ts);
        let mut hs_buf = HsBuf::new();
        let recv = |buf: &mut [u8]| -> Result<(), NetError> {
            for slot in buf.iter_mut() {
                *slot = inbound.pop_front().ok_or(NetError::Timeout)?;
            }
            Ok(())
        };
        let mut recv = recv;

        let mut got_finished = false;
        loop {
            if let Some(msg) = hs_buf.try_take() {
                if msg[0] == HS_FINISHED {
                    let th = sha256(&transcript);
                    let expect = hmac_sha256(&finished_key_s, &th);
                    assert_eq!(&expect[..], &msg[4..]);
                    got_finished = true;
                    break;
                }
                transcript.extend_from_slice(&msg);
                continue;
            }
            let (_t, header, body) = read_record(&mut recv).unwrap();
            let (inner_type, plain) = open_record(CipherSuite::Aes128GcmSha256, &mut client_read, &header, &body).unwrap();
            assert_eq!(inner_type, CONTENT_HANDSHAKE);
            hs_buf.feed(&plain);
        }
        assert!(got_finished);
    }
}
