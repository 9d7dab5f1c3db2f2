//! HTTP/1.0 GET client (spec §4.8), grounded in `netd_http.c`.
//!
//! The TCP/TLS/DNS plumbing lives behind the [`HttpIo`] trait so this module
//! never touches a `Device` or `ArpCache` directly — the caller (the daemon
//! context) supplies an implementation wired to the real stack, matching the
//! seam `net::device::Device` already draws at the bottom of the stack.

use tracing::{debug, warn};

use crate::config::{
    HTTP_BODY_CHUNK_CAP, HTTP_HEADER_BUF_CAP, HTTP_HOST_CAP, HTTP_LINE_CAP, HTTP_LOCATION_CAP,
    HTTP_MAX_REDIRECTS,
};
use crate::error::{NetError, StatusCode, TlsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HttpStage {
    ParseUrl = 0,
    Dns = 1,
    Connect = 2,
    TlsHandshake = 3,
    SendRequest = 4,
    RecvHeaders = 5,
    RecvBody = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEdge {
    Begin,
    End,
}

/// One line of the live status stream `http_get` writes (spec §4.8); the
/// IPC layer translates these into `HTTP_GET_*` wire messages.
#[derive(Debug)]
pub enum HttpEvent<'a> {
    Begin {
        status: StatusCode,
        http_status: u32,
        content_length: u32,
    },
    Stage {
        stage: HttpStage,
        status: StatusCode,
        detail: u32,
        edge: StageEdge,
    },
    Data(&'a [u8]),
    End {
        status: StatusCode,
    },
}

/// The blocking capabilities `http_get` drives: DNS resolution, TCP
/// connect/send/recv/close, and an optional TLS upgrade. One `HttpIo`
/// instance is used per `get()` call and is not reused across redirects —
/// each redirect target gets its own DNS + TCP + TLS cycle (spec §4.8).
pub trait HttpIo {
    fn resolve(&mut self, host: &str, timeout_ms: u64) -> Result<u32, NetError>;
    fn tcp_connect(&mut self, ip: u32, port: u16, timeout_ms: u64) -> Result<(), NetError>;
    /// Performs the TLS handshake over the already-open TCP connection; all
    /// subsequent `send`/`recv` calls are sealed/opened under it.
    fn tls_handshake(&mut self, timeout_ms: u64) -> Result<(), TlsError>;
    fn send(&mut self, data: &[u8], timeout_ms: u64) -> Result<(), NetError>;
    fn recv(&mut self, out: &mut [u8], timeout_ms: u64) -> Result<usize, NetError>;
    fn close(&mut self, timeout_ms: u64);
}

pub struct ParsedUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub is_https: bool,
}

/// Accepts `http://` / `https://`, optional `:port`, path default `/`.
pub fn parse_url(url: &str) -> Option<ParsedUrl> {
    let (rest, is_https, default_port) = if let Some(r) = url.strip_prefix("http://") {
        (r, false, 80u16)
    } else if let Some(r) = url.strip_prefix("https://") {
        (r, true, 443u16)
    } else {
        (url, false, 80u16)
    };

    let rest = rest.trim_start_matches('/');
    let (host_port, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if host_port.is_empty() {
        return None;
    }

    let (host, port) = match host_port.rfind(':') {
        Some(i) => {
            let port: u16 = host_port[i + 1..].parse().ok().filter(|&p| p != 0)?;
            (&host_port[..i], port)
        }
        None => (host_port, default_port),
    };
    if host.is_empty() || host.len() > HTTP_HOST_CAP {
        return None;
    }

    Some(ParsedUrl {
        host: host.to_string(),
        port,
        path: path.to_string(),
        is_https,
    })
}

pub struct ParsedHeaders {
    pub content_length: Option<u32>,
    pub chunked: bool,
    pub location: Option<String>,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Returns the offset just past the header-terminating blank line, if the
/// buffer contains one yet.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    (0..=buf.len() - 4).find(|&i| &buf[i..i + 4] == b"\r\n\r\n").map(|i| i + 4)
}

pub fn parse_status_line(hdr: &[u8]) -> Option<u32> {
    let line_end = find_crlf(hdr)?;
    let line = std::str::from_utf8(&hdr[..line_end]).ok()?;
    let mut parts = line.splitn(3, ' ');
    parts.next()?;
    parts.next()?.parse().ok()
}

pub fn parse_headers(hdr: &[u8]) -> Option<ParsedHeaders> {
    let first = find_crlf(hdr)?;
    let mut rest = &hdr[first + 2..];

    let mut content_length = None;
    let mut chunked = false;
    let mut location = None;

    loop {
        if rest.starts_with(b"\r\n") {
            return Some(ParsedHeaders {
                content_length,
                chunked,
                location,
            });
        }
        let line_end = find_crlf(rest)?;
        let line = std::str::from_utf8(&rest[..line_end]).ok()?;
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value.parse().ok();
            } else if name.eq_ignore_ascii_case("Transfer-Encoding") && value.eq_ignore_ascii_case("chunked") {
                chunked = true;
            } else if name.eq_ignore_ascii_case("Location") {
                location = Some(value.chars().take(HTTP_LOCATION_CAP - 1).collect());
            }
        }
        rest = &rest[line_end + 2..];
    }
}

fn parse_hex_u32(line: &str) -> Option<u32> {
    let digits = line.split(';').next().unwrap_or("").trim();
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// Holds header bytes already read past the CRLFCRLF boundary so the body
/// reader doesn't re-request them from the wire (`netd_http_prefetch_t`).
struct Prefetch {
    buf: Vec<u8>,
    r: usize,
}

fn read_some(
    io: &mut dyn HttpIo,
    pf: &mut Prefetch,
    out: &mut [u8],
    timeout_ms: u64,
) -> Result<usize, NetError> {
    if pf.r < pf.buf.len() {
        let avail = pf.buf.len() - pf.r;
        let n = out.len().min(avail);
        out[..n].copy_from_slice(&pf.buf[pf.r..pf.r + n]);
        pf.r += n;
        return Ok(n);
    }
    io.recv(out, timeout_ms)
}

fn read_exact(
    io: &mut dyn HttpIo,
    pf: &mut Prefetch,
    buf: &mut [u8],
    timeout_ms: u64,
) -> Result<(), NetError> {
    let mut off = 0;
    while off < buf.len() {
        let got = read_some(io, pf, &mut buf[off..], timeout_ms)?;
        if got == 0 {
            return Err(NetError::ConnReset);
        }
        off += got;
    }
    Ok(())
}

fn read_line(
    io: &mut dyn HttpIo,
    pf: &mut Prefetch,
    timeout_ms: u64,
) -> Result<String, NetError> {
    let mut line = Vec::with_capacity(HTTP_LINE_CAP);
    loop {
        if line.len() + 1 >= HTTP_LINE_CAP {
            return Err(NetError::Malformed("chunk header line too long"));
        }
        let mut b = [0u8];
        read_exact(io, pf, &mut b, timeout_ms)?;
        line.push(b[0]);
        if line.len() >= 2 && line[line.len() - 2] == b'\r' && line[line.len() - 1] == b'\n' {
            line.truncate(line.len() - 2);
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
    }
}

fn drain_crlf(io: &mut dyn HttpIo, pf: &mut Prefetch, timeout_ms: u64) -> Result<(), NetError> {
    let mut crlf = [0u8; 2];
    read_exact(io, pf, &mut crlf, timeout_ms)?;
    if crlf != *b"\r\n" {
        return Err(NetError::Malformed("expected CRLF after chunk body"));
    }
    Ok(())
}

fn status_of(e: &NetError) -> StatusCode {
    StatusCode::from(e)
}

/// Outcome of one redirect hop: either terminal, or a location to follow.
/// `get` loops over this instead of `get_one` recursing on redirect.
enum GetOutcome {
    Done(StatusCode),
    Redirect(String),
}

/// Drives a single GET (one redirect hop), emitting every event through
/// `report`. Returns the terminal status, or the location to follow next.
fn get_one(
    io: &mut dyn HttpIo,
    report: &mut dyn FnMut(HttpEvent),
    url: &str,
    timeout_ms: u64,
    redirects_left: u32,
) -> GetOutcome {
    report(HttpEvent::Stage {
        stage: HttpStage::ParseUrl,
        status: StatusCode::Ok,
        detail: 0,
        edge: StageEdge::Begin,
    });
    let parsed = match parse_url(url) {
        Some(p) => p,
        None => {
            report(HttpEvent::Stage {
                stage: HttpStage::ParseUrl,
                status: StatusCode::Unsupported,
                detail: 0,
                edge: StageEdge::End,
            });
            report(HttpEvent::Begin {
                status: StatusCode::Unsupported,
                http_status: 0,
                content_length: 0,
            });
            report(HttpEvent::End {
                status: StatusCode::Unsupported,
            });
            return GetOutcome::Done(StatusCode::Unsupported);
        }
    };
    report(HttpEvent::Stage {
        stage: HttpStage::ParseUrl,
        status: StatusCode::Ok,
        detail: parsed.is_https as u32,
        edge: StageEdge::End,
    });

    report(HttpEvent::Stage {
        stage: HttpStage::Dns,
        status: StatusCode::Ok,
        detail: 0,
        edge: StageEdge::Begin,
    });
    let ip = match io.resolve(&parsed.host, timeout_ms) {
        Ok(ip) => ip,
        Err(e) => {
            let st = status_of(&e);
            report(HttpEvent::Stage {
                stage: HttpStage::Dns,
                status: st,
                detail: 0,
                edge: StageEdge::End,
            });
            report(HttpEvent::Begin {
                status: st,
                http_status: 0,
                content_length: 0,
            });
            report(HttpEvent::End { status: st });
            return GetOutcome::Done(st);
        }
    };
    report(HttpEvent::Stage {
        stage: HttpStage::Dns,
        status: StatusCode::Ok,
        detail: ip,
        edge: StageEdge::End,
    });

    report(HttpEvent::Stage {
        stage: HttpStage::Connect,
        status: StatusCode::Ok,
        detail: parsed.port as u32,
        edge: StageEdge::Begin,
    });
    if let Err(e) = io.tcp_connect(ip, parsed.port, timeout_ms) {
        let st = status_of(&e);
        report(HttpEvent::Stage {
            stage: HttpStage::Connect,
            status: st,
            detail: parsed.port as u32,
            edge: StageEdge::End,
        });
        report(HttpEvent::Begin {
            status: st,
            http_status: 0,
            content_length: 0,
        });
        report(HttpEvent::End { status: st });
        return GetOutcome::Done(st);
    }
    report(HttpEvent::Stage {
        stage: HttpStage::Connect,
        status: StatusCode::Ok,
        detail: parsed.port as u32,
        edge: StageEdge::End,
    });

    if parsed.is_https {
        report(HttpEvent::Stage {
            stage: HttpStage::TlsHandshake,
            status: StatusCode::Ok,
            detail: 0,
            edge: StageEdge::Begin,
        });
        if let Err(e) = io.tls_handshake(timeout_ms) {
            io.close(timeout_ms);
            let st = if e.status == StatusCode::Ok {
                StatusCode::Error
            } else {
                e.status
            };
            let detail = ((e.step as u32) << 16) | e.alert as u32;
            warn!(step = ?e.step, alert = e.alert, "TLS handshake failed during HTTP GET");
            report(HttpEvent::Stage {
                stage: HttpStage::TlsHandshake,
                status: st,
                detail,
                edge: StageEdge::End,
            });
            report(HttpEvent::Begin {
                status: st,
                http_status: 0,
                content_length: 0,
            });
            report(HttpEvent::End { status: st });
            return GetOutcome::Done(st);
        }
        report(HttpEvent::Stage {
            stage: HttpStage::TlsHandshake,
            status: StatusCode::Ok,
            detail: 0,
            edge: StageEdge::End,
        });
    }

    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: yulaos-wget/1\r\nConnection: close\r\n\r\n",
        parsed.path, parsed.host
    );

    report(HttpEvent::Stage {
        stage: HttpStage::SendRequest,
        status: StatusCode::Ok,
        detail: 0,
        edge: StageEdge::Begin,
    });
    if let Err(e) = io.send(request.as_bytes(), timeout_ms) {
        io.close(timeout_ms);
        let st = status_of(&e);
        report(HttpEvent::Stage {
            stage: HttpStage::SendRequest,
            status: st,
            detail: 0,
            edge: StageEdge::End,
        });
        report(HttpEvent::Begin {
            status: st,
            http_status: 0,
            content_length: 0,
        });
        report(HttpEvent::End { status: st });
        return GetOutcome::Done(st);
    }
    report(HttpEvent::Stage {
        stage: HttpStage::SendRequest,
        status: StatusCode::Ok,
        detail: 0,
        edge: StageEdge::End,
    });

    let mut pf = Prefetch { buf: Vec::new(), r: 0 };
    let mut hdr_buf = vec![0u8; HTTP_HEADER_BUF_CAP];
    let mut hdr_w = 0usize;
    let mut body_off = None;

    report(HttpEvent::Stage {
        stage: HttpStage::RecvHeaders,
        status: StatusCode::Ok,
        detail: 0,
        edge: StageEdge::Begin,
    });
    while hdr_w < hdr_buf.len() {
        let got = match io.recv(&mut hdr_buf[hdr_w..], timeout_ms) {
            Ok(n) => n,
            Err(e) => {
                io.close(timeout_ms);
                let st = status_of(&e);
                report(HttpEvent::Stage {
                    stage: HttpStage::RecvHeaders,
                    status: st,
                    detail: 0,
                    edge: StageEdge::End,
                });
                report(HttpEvent::Begin {
                    status: st,
                    http_status: 0,
                    content_length: 0,
                });
                report(HttpEvent::End { status: st });
                return GetOutcome::Done(st);
            }
        };
        if got == 0 {
            io.close(timeout_ms);
            report(HttpEvent::Stage {
                stage: HttpStage::RecvHeaders,
                status: StatusCode::Error,
                detail: 0,
                edge: StageEdge::End,
            });
            report(HttpEvent::Begin {
                status: StatusCode::Error,
                http_status: 0,
                content_length: 0,
            });
            report(HttpEvent::End {
                status: StatusCode::Error,
            });
            return GetOutcome::Done(StatusCode::Error);
        }
        hdr_w += got;
        if let Some(off) = find_header_end(&hdr_buf[..hdr_w]) {
            body_off = Some(off);
            break;
        }
    }

    let Some(body_off) = body_off else {
        io.close(timeout_ms);
        report(HttpEvent::Stage {
            stage: HttpStage::RecvHeaders,
            status: StatusCode::Error,
            detail: 0,
            edge: StageEdge::End,
        });
        report(HttpEvent::Begin {
            status: StatusCode::Error,
            http_status: 0,
            content_length: 0,
        });
        report(HttpEvent::End {
            status: StatusCode::Error,
        });
        return GetOutcome::Done(StatusCode::Error);
    };

    let header_bytes = &hdr_buf[..body_off];
    let http_status = match parse_status_line(header_bytes) {
        Some(s) => s,
        None => {
            io.close(timeout_ms);
            report(HttpEvent::Stage {
                stage: HttpStage::RecvHeaders,
                status: StatusCode::Error,
                detail: 0,
                edge: StageEdge::End,
            });
            report(HttpEvent::Begin {
                status: StatusCode::Error,
                http_status: 0,
                content_length: 0,
            });
            report(HttpEvent::End {
                status: StatusCode::Error,
            });
            return GetOutcome::Done(StatusCode::Error);
        }
    };

    let headers = match parse_headers(header_bytes) {
        Some(h) => h,
        None => {
            io.close(timeout_ms);
            report(HttpEvent::Stage {
                stage: HttpStage::RecvHeaders,
                status: StatusCode::Error,
                detail: http_status,
                edge: StageEdge::End,
            });
            report(HttpEvent::Begin {
                status: StatusCode::Error,
                http_status,
                content_length: 0,
            });
            report(HttpEvent::End {
                status: StatusCode::Error,
            });
            return GetOutcome::Done(StatusCode::Error);
        }
    };

    report(HttpEvent::Stage {
        stage: HttpStage::RecvHeaders,
        status: StatusCode::Ok,
        detail: http_status,
        edge: StageEdge::End,
    });

    if matches!(http_status, 301 | 302 | 303 | 307 | 308) && redirects_left > 0 {
        if let Some(location) = headers.location.filter(|l| !l.is_empty()) {
            io.close(timeout_ms);
            debug!(location, redirects_left, "following HTTP redirect");
            return GetOutcome::Redirect(location);
        }
    }

    if !(200..300).contains(&http_status) {
        io.close(timeout_ms);
        report(HttpEvent::Begin {
            status: StatusCode::Error,
            http_status,
            content_length: 0,
        });
        report(HttpEvent::End {
            status: StatusCode::Error,
        });
        return GetOutcome::Done(StatusCode::Error);
    }

    let content_length = headers.content_length.unwrap_or(0);
    report(HttpEvent::Begin {
        status: StatusCode::Ok,
        http_status,
        content_length: if headers.chunked { 0 } else { content_length },
    });
    report(HttpEvent::Stage {
        stage: HttpStage::RecvBody,
        status: StatusCode::Ok,
        detail: headers.chunked as u32,
        edge: StageEdge::Begin,
    });

    pf.buf = hdr_buf[body_off..hdr_w].to_vec();

    let body_status = if !headers.chunked {
        read_body_by_length(io, &mut pf, report, content_length, timeout_ms)
    } else {
        read_body_chunked(io, &mut pf, report, timeout_ms)
    };

    io.close(timeout_ms);
    report(HttpEvent::Stage {
        stage: HttpStage::RecvBody,
        status: body_status,
        detail: headers.chunked as u32,
        edge: StageEdge::End,
    });
    report(HttpEvent::End { status: body_status });
    GetOutcome::Done(body_status)
}

fn read_body_by_length(
    io: &mut dyn HttpIo,
    pf: &mut Prefetch,
    report: &mut dyn FnMut(HttpEvent),
    content_length: u32,
    timeout_ms: u64,
) -> StatusCode {
    let mut remaining: Option<u32> = if content_length == 0 { None } else { Some(content_length) };
    let mut buf = [0u8; HTTP_BODY_CHUNK_CAP];

    loop {
        let cap = match remaining {
            Some(0) => break,
            Some(r) => (r as usize).min(buf.len()),
            None => buf.len(),
        };
        let got = match read_some(io, pf, &mut buf[..cap], timeout_ms) {
            Ok(n) => n,
            Err(e) => return status_of(&e),
        };
        if got == 0 {
            break;
        }
        report(HttpEvent::Data(&buf[..got]));
        if let Some(r) = remaining.as_mut() {
            if got as u32 >= *r {
                break;
            }
            *r -= got as u32;
        }
    }
    StatusCode::Ok
}

fn read_body_chunked(
    io: &mut dyn HttpIo,
    pf: &mut Prefetch,
    report: &mut dyn FnMut(HttpEvent),
    timeout_ms: u64,
) -> StatusCode {
    let mut buf = [0u8; HTTP_BODY_CHUNK_CAP];

    loop {
        let line = match read_line(io, pf, timeout_ms) {
            Ok(l) => l,
            Err(e) => return status_of(&e),
        };
        let chunk_size = match parse_hex_u32(&line) {
            Some(n) => n,
            None => return StatusCode::Error,
        };

        if chunk_size == 0 {
            loop {
                match read_line(io, pf, timeout_ms) {
                    Ok(l) if l.is_empty() => break,
                    Ok(_) => continue,
                    Err(e) => return status_of(&e),
                }
            }
            break;
        }

        let mut remaining = chunk_size;
        while remaining > 0 {
            let cap = (remaining as usize).min(buf.len());
            let got = match read_some(io, pf, &mut buf[..cap], timeout_ms) {
                Ok(n) => n,
                Err(e) => return status_of(&e),
            };
            if got == 0 {
                return StatusCode::Timeout;
            }
            report(HttpEvent::Data(&buf[..got]));
            remaining -= got as u32;
        }

        if let Err(e) = drain_crlf(io, pf, timeout_ms) {
            return status_of(&e);
        }
    }
    StatusCode::Ok
}

/// Entry point: `http_get(fd_out, seq, req)` (spec §4.8), minus the IPC
/// framing — `report` receives the same event sequence the wire protocol
/// encodes. Redirects are followed as a bounded loop over `(url,
/// redirects_left)` rather than by recursing into `get_one`.
pub fn get(io: &mut dyn HttpIo, report: &mut dyn FnMut(HttpEvent), url: &str, timeout_ms: u64) -> StatusCode {
    let timeout_ms = if timeout_ms == 0 { 5000 } else { timeout_ms };
    let mut url = url.to_string();
    let mut redirects_left = HTTP_MAX_REDIRECTS;
    loop {
        match get_one(io, report, &url, timeout_ms, redirects_left) {
            GetOutcome::Done(status) => return status,
            GetOutcome::Redirect(location) => {
                url = location;
                redirects_left -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn parse_url_defaults_path_and_port() {
        let p = parse_url("http://example.com").unwrap();
        assert_eq!(p.host, "example.com");
        assert_eq!(p.port, 80);
        assert_eq!(p.path, "/");
        assert!(!p.is_https);
    }

    #[test]
    fn parse_url_with_port_and_path_and_https() {
        let p = parse_url("https://example.com:8443/a/b").unwrap();
        assert_eq!(p.host, "example.com");
        assert_eq!(p.port, 8443);
        assert_eq!(p.path, "/a/b");
        assert!(p.is_https);
    }

    #[test]
    fn parse_url_rejects_empty_host() {
        assert!(parse_url("http://").is_none());
        assert!(parse_url("http://:80/").is_none());
    }

    #[test]
    fn parse_headers_reads_content_length_and_location() {
        let raw = b"HTTP/1.0 301 Moved\r\nLocation: http://other/\r\nContent-Length: 0\r\n\r\n";
        let status = parse_status_line(raw).unwrap();
        assert_eq!(status, 301);
        let h = parse_headers(raw).unwrap();
        assert_eq!(h.content_length, Some(0));
        assert_eq!(h.location.as_deref(), Some("http://other/"));
        assert!(!h.chunked);
    }

    #[test]
    fn parse_headers_detects_chunked() {
        let raw = b"HTTP/1.0 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let h = parse_headers(raw).unwrap();
        assert!(h.chunked);
    }

    struct ScriptedIo {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
        connected: bool,
    }

    impl HttpIo for ScriptedIo {
        fn resolve(&mut self, _host: &str, _timeout_ms: u64) -> Result<u32, NetError> {
            Ok(0x0A00_0202)
        }
        fn tcp_connect(&mut self, _ip: u32, _port: u16, _timeout_ms: u64) -> Result<(), NetError> {
            self.connected = true;
            Ok(())
        }
        fn tls_handshake(&mut self, _timeout_ms: u64) -> Result<(), TlsError> {
            unreachable!("plain-HTTP test never upgrades to TLS")
        }
        fn send(&mut self, data: &[u8], _timeout_ms: u64) -> Result<(), NetError> {
            self.outbound.extend_from_slice(data);
            Ok(())
        }
        fn recv(&mut self, out: &mut [u8], _timeout_ms: u64) -> Result<usize, NetError> {
            let n = out.len().min(self.inbound.len());
            for slot in out.iter_mut().take(n) {
                *slot = self.inbound.pop_front().unwrap();
            }
            Ok(n)
        }
        fn close(&mut self, _timeout_ms: u64) {
            self.connected = false;
        }
    }

    #[test]
    fn get_over_plain_tcp_reports_full_trace() {
        let response = b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut io = ScriptedIo {
            inbound: response.iter().copied().collect(),
            outbound: Vec::new(),
            connected: false,
        };

        let mut events: Vec<String> = Vec::new();
        let mut report = |e: HttpEvent| {
            let label = match e {
                HttpEvent::Begin { status, http_status, content_length } => {
                    format!("BEGIN status={status:?} http={http_status} len={content_length}")
                }
                HttpEvent::Stage { stage, edge, .. } => format!("STAGE {stage:?} {edge:?}"),
                HttpEvent::Data(d) => format!("DATA {:?}", String::from_utf8_lossy(d)),
                HttpEvent::End { status } => format!("END {status:?}"),
            };
            events.push(label);
        };

        let status = get(&mut io, &mut report, "http://10.0.2.2:8080/hello", 1000);
        assert_eq!(status, StatusCode::Ok);
        assert!(events.contains(&"BEGIN status=Ok http=200 len=5".to_string()));
        assert!(events.iter().any(|e| e.contains("DATA") && e.contains("hello")));
        assert!(events.last().unwrap().starts_with("END Ok"));
        assert!(String::from_utf8_lossy(&io.outbound).starts_with("GET /hello HTTP/1.0\r\n"));
    }

    #[test]
    fn get_handles_chunked_body() {
        let response = b"HTTP/1.0 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut io = ScriptedIo {
            inbound: response.iter().copied().collect(),
            outbound: Vec::new(),
            connected: false,
        };

        let mut body = Vec::new();
        let mut report = |e: HttpEvent| {
            if let HttpEvent::Data(d) = e {
                body.extend_from_slice(d);
            }
        };

        let status = get(&mut io, &mut report, "http://10.0.2.2:8080/hello", 1000);
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(body, b"hello world");
    }
}
