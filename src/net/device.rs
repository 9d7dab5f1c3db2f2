//! Raw Ethernet device boundary (spec §6.1, out of scope for wire
//! correctness but needed as an internal trait so the core can run against
//! a scripted device in tests, per `SPEC_FULL.md`'s `[MODULE: tests]`).

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;

/// Abstraction over "open a raw Ethernet handle, fetch its MAC, read/write
/// one frame at a time, non-blocking". The production implementation is a
/// thin wrapper over the host device file; tests use `DeviceSim`.
pub trait Device {
    fn mac(&self) -> [u8; 6];

    /// Non-blocking: returns `Ok(None)` if no frame is currently available.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    fn write(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// In-memory device for tests: a queue of inbound frames and a log of
/// outbound ones, standing in for spec §6.1's file-like handle.
pub struct DeviceSim {
    mac: [u8; 6],
    inbound: std::collections::VecDeque<Vec<u8>>,
    pub outbound: Vec<Vec<u8>>,
}

impl DeviceSim {
    pub fn new(mac: [u8; 6]) -> Self {
        Self {
            mac,
            inbound: std::collections::VecDeque::new(),
            outbound: Vec::new(),
        }
    }

    pub fn push_inbound(&mut self, frame: Vec<u8>) {
        self.inbound.push_back(frame);
    }

    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound)
    }
}

impl Device for DeviceSim {
    fn mac(&self) -> [u8; 6] {
        self.mac
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.inbound.pop_front() {
            Some(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(Some(n))
            }
            None => Ok(None),
        }
    }

    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        self.outbound.push(frame.to_vec());
        Ok(())
    }
}

/// Opens the raw-Ethernet handle as a plain file, `O_NONBLOCK` set at open
/// time so `try_read` never stalls the event loop (spec §6.1: "read/write
/// blocks of up to ~1500 bytes"). The MAC address ioctl the original source
/// performs (`SIOCGIFHWADDR`) is host-specific and out of scope here per
/// the module doc above; the daemon is handed a MAC at construction instead
/// (see `main.rs`).
pub struct FileDevice {
    file: File,
    mac: [u8; 6],
}

impl FileDevice {
    pub fn open(path: &str, mac: [u8; 6]) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc_o_nonblock())
            .open(path)?;
        Ok(Self { file, mac })
    }
}

/// `O_NONBLOCK` on every target this daemon runs on (Linux, the hobby OS's
/// host). Spelled out rather than pulled from a `libc` crate dependency the
/// rest of the stack has no other use for.
const fn libc_o_nonblock() -> i32 {
    0o4000
}

impl Device for FileDevice {
    fn mac(&self) -> [u8; 6] {
        self.mac
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.file.read(buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        self.file.write_all(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_frames_in_order() {
        let mut dev = DeviceSim::new([0; 6]);
        dev.push_inbound(vec![1, 2, 3]);
        dev.push_inbound(vec![4, 5]);

        let mut buf = [0u8; 16];
        assert_eq!(dev.try_read(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(dev.try_read(&mut buf).unwrap(), Some(2));
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(dev.try_read(&mut buf).unwrap(), None);
    }
}
