//! DNS resolver cache: lowercase-name hash table with TTL expiry, fronting
//! the stub resolver (`SPEC_FULL.md`'s `[MODULE: dns_cache]`), grounded in
//! `netd_dns_cache.c`.

use std::time::Instant;

use crate::config::{DNS_CACHE_DEFAULT_TTL_MS, DNS_CACHE_SIZE};
use crate::stats::Stats;

struct Entry {
    name: String,
    addr: u32,
    inserted_at: Instant,
    ttl_ms: u32,
}

/// FNV/djb2-style case-insensitive name hash, matching
/// `netd_dns_cache_hash` (kept for parity; lookups use name comparison, the
/// hash itself isn't load-bearing in this port since `Vec` scan replaces the
/// original's open table).
pub fn hash_name(name: &str) -> u32 {
    let mut hash: u32 = 5381;
    for b in name.bytes() {
        let c = b.to_ascii_lowercase();
        hash = hash.wrapping_mul(33).wrapping_add(c as u32);
    }
    hash
}

fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

pub struct DnsCache {
    entries: Vec<Entry>,
    hits: u64,
    misses: u64,
}

impl DnsCache {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(DNS_CACHE_SIZE),
            hits: 0,
            misses: 0,
        }
    }

    /// Drops entries whose TTL has elapsed (`netd_dns_cache_expire_old`).
    pub fn expire_old(&mut self, now: Instant) {
        self.entries
            .retain(|e| now.duration_since(e.inserted_at).as_millis() < e.ttl_ms as u128);
    }

    pub fn lookup(&mut self, name: &str, now: Instant, stats: &mut Stats) -> Option<u32> {
        self.expire_old(now);
        if let Some(e) = self.entries.iter().find(|e| names_equal(&e.name, name)) {
            self.hits += 1;
            stats.dns_cache_hits += 1;
            return Some(e.addr);
        }
        self.misses += 1;
        stats.dns_cache_misses += 1;
        None
    }

    /// `ttl_ms` of 0 falls back to the default TTL, matching the original.
    pub fn insert(&mut self, name: &str, addr: u32, ttl_ms: u32, now: Instant) {
        if name.is_empty() {
            return;
        }
        let ttl_ms = if ttl_ms == 0 {
            DNS_CACHE_DEFAULT_TTL_MS
        } else {
            ttl_ms
        };

        if let Some(e) = self.entries.iter_mut().find(|e| names_equal(&e.name, name)) {
            e.addr = addr;
            e.inserted_at = now;
            e.ttl_ms = ttl_ms;
            return;
        }

        self.expire_old(now);
        if self.entries.len() >= DNS_CACHE_SIZE * 4 {
            self.entries.remove(0);
        }
        self.entries.push(Entry {
            name: name.to_string(),
            addr,
            inserted_at: now,
            ttl_ms,
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}
