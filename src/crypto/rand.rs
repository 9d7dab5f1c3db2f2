//! SHA-256-backed CSPRNG, seeded from timing jitter (RDTSC where available,
//! otherwise a monotonic clock) plus uptime. Not cryptographically strong in
//! the academic sense — it exists to make nonces and TLS key shares
//! unpredictable to an on-path observer, not to resist a state-level
//! adversary with access to the host.

use super::sha256::sha256;

pub struct Rand {
    state: [u8; 32],
    ctr: u32,
    seeded: bool,
}

fn timing_jitter() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: rdtsc has no preconditions and is available on all
        // x86_64 hosts this daemon targets.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}

fn uptime_ms() -> u32 {
    use std::time::Instant;
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u32
}

impl Rand {
    pub fn new() -> Self {
        Self {
            state: [0u8; 32],
            ctr: 0,
            seeded: false,
        }
    }

    pub fn stir(&mut self, data: &[u8]) {
        let mut buf = Vec::with_capacity(32 + data.len() + 4);
        buf.extend_from_slice(&self.state);
        buf.extend_from_slice(data);
        buf.extend_from_slice(&self.ctr.to_le_bytes());
        self.state = sha256(&buf);
        self.ctr = self.ctr.wrapping_add(1);
        self.seeded = true;
    }

    fn seed_if_needed(&mut self) {
        if self.seeded {
            return;
        }
        let mut seed = [0u8; 40];
        seed[0..4].copy_from_slice(&uptime_ms().to_le_bytes());
        for i in 0..4 {
            let t = timing_jitter();
            seed[8 + i * 8..16 + i * 8].copy_from_slice(&t.to_le_bytes());
        }
        self.stir(&seed);
    }

    pub fn bytes(&mut self, out: &mut [u8]) {
        self.seed_if_needed();

        let mut off = 0;
        while off < out.len() {
            let mut buf = Vec::with_capacity(32 + 4 + 8);
            buf.extend_from_slice(&self.state);
            buf.extend_from_slice(&self.ctr.to_le_bytes());
            buf.extend_from_slice(&timing_jitter().to_le_bytes());
            let block = sha256(&buf);

            let take = (out.len() - off).min(block.len());
            out[off..off + take].copy_from_slice(&block[..take]);
            off += take;

            self.stir(&block);
        }
    }

    pub fn bytes32(&mut self) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.bytes(&mut out);
        out
    }
}

impl Default for Rand {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_on_first_use() {
        let mut r = Rand::new();
        assert!(!r.seeded);
        let mut buf = [0u8; 16];
        r.bytes(&mut buf);
        assert!(r.seeded);
        assert_ne!(buf, [0u8; 16]);
    }

    #[test]
    fn successive_draws_differ() {
        let mut r = Rand::new();
        let a = r.bytes32();
        let b = r.bytes32();
        assert_ne!(a, b);
    }

    #[test]
    fn stir_changes_future_output() {
        let mut r1 = Rand::new();
        let mut r2 = Rand::new();
        r1.seed_if_needed();
        r2.seed_if_needed();
        r2.state = r1.state;
        r2.ctr = r1.ctr;
        r2.seeded = true;

        r2.stir(b"extra entropy");
        let a = r1.bytes32();
        let b = r2.bytes32();
        assert_ne!(a, b);
    }
}
