//! Counters mirroring `netd_stats.c`. Single-threaded event loop, so these
//! are plain `u64` fields rather than atomics.

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub ipv4_rx_packets: u64,
    pub ipv4_tx_packets: u64,
    pub ipv4_errors: u64,
    pub ipv4_checksum_errors: u64,
    pub ipv4_dropped: u64,

    pub arp_requests: u64,
    pub arp_replies: u64,
    pub arp_timeouts: u64,
    pub arp_cache_hits: u64,
    pub arp_cache_misses: u64,

    pub dns_queries: u64,
    pub dns_responses: u64,
    pub dns_timeouts: u64,
    pub dns_cache_hits: u64,
    pub dns_cache_misses: u64,

    pub tcp_connections: u64,
    pub tcp_closes: u64,
    pub tcp_failed: u64,
    pub tcp_rx_bytes: u64,
    pub tcp_tx_bytes: u64,
    pub tcp_retransmits: u64,
    pub tcp_timeouts: u64,

    pub tls_handshakes: u64,
    pub tls_handshake_failures: u64,
    pub tls_rx_bytes: u64,
    pub tls_tx_bytes: u64,
    pub tls_alerts: u64,

    pub http_requests: u64,
    pub http_completed: u64,
    pub http_failed: u64,
    pub http_timeouts: u64,
    pub http_redirects: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn ipv4_rx(&mut self, bytes: u32, _proto: u8) {
        self.ipv4_rx_packets += 1;
        let _ = bytes;
    }

    pub fn ipv4_tx(&mut self, bytes: u32, _proto: u8) {
        self.ipv4_tx_packets += 1;
        let _ = bytes;
    }

    /// Folds counters accumulated against a scratch `Stats` (used while a
    /// blocking call polls the device with its own local accumulator) back
    /// into this one.
    pub fn merge(&mut self, other: &Stats) {
        self.ipv4_rx_packets += other.ipv4_rx_packets;
        self.ipv4_tx_packets += other.ipv4_tx_packets;
        self.ipv4_errors += other.ipv4_errors;
        self.ipv4_checksum_errors += other.ipv4_checksum_errors;
        self.ipv4_dropped += other.ipv4_dropped;

        self.arp_requests += other.arp_requests;
        self.arp_replies += other.arp_replies;
        self.arp_timeouts += other.arp_timeouts;
        self.arp_cache_hits += other.arp_cache_hits;
        self.arp_cache_misses += other.arp_cache_misses;

        self.dns_queries += other.dns_queries;
        self.dns_responses += other.dns_responses;
        self.dns_timeouts += other.dns_timeouts;
        self.dns_cache_hits += other.dns_cache_hits;
        self.dns_cache_misses += other.dns_cache_misses;

        self.tcp_connections += other.tcp_connections;
        self.tcp_closes += other.tcp_closes;
        self.tcp_failed += other.tcp_failed;
        self.tcp_rx_bytes += other.tcp_rx_bytes;
        self.tcp_tx_bytes += other.tcp_tx_bytes;
        self.tcp_retransmits += other.tcp_retransmits;
        self.tcp_timeouts += other.tcp_timeouts;

        self.tls_handshakes += other.tls_handshakes;
        self.tls_handshake_failures += other.tls_handshake_failures;
        self.tls_rx_bytes += other.tls_rx_bytes;
        self.tls_tx_bytes += other.tls_tx_bytes;
        self.tls_alerts += other.tls_alerts;

        self.http_requests += other.http_requests;
        self.http_completed += other.http_completed;
        self.http_failed += other.http_failed;
        self.http_timeouts += other.http_timeouts;
        self.http_redirects += other.http_redirects;
    }
}
