//! Status codes and internal error taxonomy.
//!
//! `StatusCode` is the only thing that crosses the IPC wire (spec 6.3); every
//! other error type here is internal and gets folded down to one of its five
//! values at the boundary. Internal errors carry whatever detail `tracing`
//! and the HTTP/TLS stage-reporting paths need.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Error = 1,
    Timeout = 2,
    Unreachable = 3,
    Unsupported = 4,
}

impl StatusCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("known-answer self-test failed: {0}")]
    SelfTestFailed(&'static str),
    #[error("AEAD tag verification failed")]
    TagMismatch,
    #[error("invalid key or nonce length")]
    InvalidLength,
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error("device not open")]
    DeviceDown,
    #[error("ARP resolution timed out")]
    ArpTimeout,
    #[error("no route to host")]
    Unreachable,
    #[error("operation timed out")]
    Timeout,
    #[error("connection reset by peer")]
    ConnReset,
    #[error("no active connection")]
    NotConnected,
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

impl From<&NetError> for StatusCode {
    fn from(e: &NetError) -> StatusCode {
        match e {
            NetError::ArpTimeout | NetError::Timeout => StatusCode::Timeout,
            NetError::DeviceDown | NetError::Unreachable => StatusCode::Unreachable,
            NetError::ConnReset | NetError::NotConnected | NetError::Malformed(_) => {
                StatusCode::Error
            }
        }
    }
}

/// TLS handshake step, reported to HTTP/IPC callers on failure (spec 4.7, 9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TlsStep {
    BuildClientHello = 0,
    SendClientHello = 1,
    RecvServerHello = 2,
    ParseServerHello = 3,
    RecvServerFinished = 4,
    SendClientFinished = 5,
    Done = 6,
}

/// High bit set on `hs_alert` distinguishes an internal failure code from a
/// peer-sent `(level << 8) | description` alert pair (spec 4.7/9).
pub const TLS_ALERT_INTERNAL_FLAG: u16 = 0x8000;

pub const TLS_ALERT_INTERNAL_IO: u16 = TLS_ALERT_INTERNAL_FLAG | 1;
pub const TLS_ALERT_INTERNAL_EOF: u16 = TLS_ALERT_INTERNAL_FLAG | 2;
pub const TLS_ALERT_INTERNAL_DECRYPT: u16 = TLS_ALERT_INTERNAL_FLAG | 3;
pub const TLS_ALERT_INTERNAL_HRR_VIOLATION: u16 = TLS_ALERT_INTERNAL_FLAG | 4;
pub const TLS_ALERT_INTERNAL_SELFTEST: u16 = TLS_ALERT_INTERNAL_FLAG | 5;
pub const TLS_ALERT_INTERNAL_UNSUPPORTED: u16 = TLS_ALERT_INTERNAL_FLAG | 6;
pub const TLS_ALERT_INTERNAL_TIMEOUT: u16 = TLS_ALERT_INTERNAL_FLAG | 7;

#[derive(Error, Debug)]
#[error("TLS handshake failed at step {step:?}: status={status:?} alert={alert:#06x}")]
pub struct TlsError {
    pub step: TlsStep,
    pub status: StatusCode,
    pub alert: u16,
}

impl TlsError {
    pub fn new(step: TlsStep, status: StatusCode, alert: u16) -> Self {
        Self { step, status, alert }
    }
}

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("malformed URL")]
    BadUrl,
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error("malformed HTTP response")]
    BadResponse,
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("HTTP status {0}")]
    HttpStatus(u32),
}

/// The fatal (process-ending) startup conditions. Spec 7 names only the IPC
/// listen socket as a hard error; a device that can't be opened is equally
/// unrecoverable in practice (the daemon has nothing to drive its event loop
/// with), so it's folded into the same taxonomy rather than left to panic.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("failed to open IPC listen socket: {0}")]
    IpcListenFailed(std::io::Error),
    #[error("failed to open device {path}: {source}")]
    DeviceOpenFailed { path: String, source: std::io::Error },
    #[error("out of memory for scratch buffers")]
    ScratchAllocFailed,
}
