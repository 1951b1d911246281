//! TTL bounded response cache with LRU eviction
//!
//! One mutex guards the LRU container, which keeps the hash index and the
//! recency list consistent as a unit. Expiry is tracked on the monotonic
//! clock; expired entries are dropped on lookup and by the sweeper.

use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::dns::protocol::{DnsRecord, QueryType};

/// Floor applied to every TTL entering or leaving the cache.
pub const MIN_TTL: u32 = 1;

/// Hard ceiling on how long an upstream answer may be cached.
pub const MAX_TTL: u32 = 86_400;

/// Cache entries are keyed by the question tuple, with the name lowercased
/// so lookups are case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub qname: String,
    pub qtype: QueryType,
    pub qclass: u16,
}

impl CacheKey {
    pub fn new(qname: &str, qtype: QueryType, qclass: u16) -> CacheKey {
        CacheKey {
            qname: qname.to_lowercase(),
            qtype,
            qclass,
        }
    }
}

struct CacheEntry {
    answers: Vec<DnsRecord>,
    expires_at: Instant,
}

/// An answer served from the cache, along with the time the entry has
/// left. The caller stamps the remaining TTL onto the records it sends.
pub struct CachedAnswer {
    pub answers: Vec<DnsRecord>,
    pub remaining_ttl: u32,
}

pub struct RecordCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl RecordCache {
    pub fn new(capacity: usize) -> RecordCache {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        RecordCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Look up an entry. Hits refresh the entry's recency; an expired
    /// entry found here is removed and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<CachedAnswer> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired = match entries.peek(key) {
            Some(entry) => entry.expires_at <= now,
            None => return None,
        };

        if expired {
            entries.pop(key);
            return None;
        }

        let entry = entries.get(key)?;
        let remaining = entry.expires_at.duration_since(now).as_secs() as u32;

        Some(CachedAnswer {
            answers: entry.answers.clone(),
            remaining_ttl: remaining.max(MIN_TTL),
        })
    }

    /// Store an answer for `ttl` seconds. When the cache is full the least
    /// recently used entry makes room.
    pub fn put(&self, key: CacheKey, answers: Vec<DnsRecord>, ttl: u32) {
        let ttl = ttl.max(MIN_TTL);
        let entry = CacheEntry {
            answers,
            expires_at: Instant::now() + Duration::from_secs(u64::from(ttl)),
        };

        self.entries.lock().push(key, entry);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }

        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Start the background thread that sweeps expired entries on a fixed
/// interval until shutdown is requested.
pub fn spawn_sweeper(
    cache: Arc<RecordCache>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    Builder::new()
        .name("RecordCache-sweeper".into())
        .spawn(move || {
            let slice = Duration::from_millis(500);
            loop {
                let mut slept = Duration::ZERO;
                while slept < interval {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(slice.min(interval - slept));
                    slept += slice;
                }

                let removed = cache.sweep();
                if removed > 0 {
                    log::debug!("cache sweep removed {} expired entries", removed);
                }
            }
        })
}

#[cfg(test)]
mod tests {

    use super::*;

    use std::net::Ipv4Addr;
    use std::thread::sleep;

    use crate::dns::protocol::TransientTtl;

    fn a_record(domain: &str, addr: Ipv4Addr) -> DnsRecord {
        DnsRecord::A {
            domain: domain.to_string(),
            addr,
            ttl: TransientTtl(60),
        }
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, QueryType::A, 1)
    }

    #[test]
    fn test_get_returns_stored_answer() {
        let cache = RecordCache::new(16);
        let answers = vec![a_record("www.example.com", Ipv4Addr::new(10, 0, 0, 1))];

        cache.put(key("www.example.com"), answers.clone(), 60);

        let hit = cache.get(&key("www.example.com")).unwrap();
        assert_eq!(answers, hit.answers);
        assert!(hit.remaining_ttl >= 1 && hit.remaining_ttl <= 60);
    }

    #[test]
    fn test_miss_on_unknown_key() {
        let cache = RecordCache::new(16);

        assert!(cache.get(&key("nope.example.com")).is_none());
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let cache = RecordCache::new(16);
        cache.put(
            key("WWW.Example.COM"),
            vec![a_record("www.example.com", Ipv4Addr::new(10, 0, 0, 1))],
            60,
        );

        assert!(cache.get(&key("www.example.com")).is_some());
    }

    #[test]
    fn test_qtype_distinguishes_entries() {
        let cache = RecordCache::new(16);
        cache.put(
            key("www.example.com"),
            vec![a_record("www.example.com", Ipv4Addr::new(10, 0, 0, 1))],
            60,
        );

        let aaaa_key = CacheKey::new("www.example.com", QueryType::Aaaa, 1);
        assert!(cache.get(&aaaa_key).is_none());
    }

    #[test]
    fn test_entries_expire() {
        let cache = RecordCache::new(16);
        cache.put(
            key("www.example.com"),
            vec![a_record("www.example.com", Ipv4Addr::new(10, 0, 0, 1))],
            1,
        );

        assert!(cache.get(&key("www.example.com")).is_some());

        sleep(Duration::from_millis(1100));

        assert!(cache.get(&key("www.example.com")).is_none());
        // the expired entry was removed on lookup
        assert_eq!(0, cache.len());
    }

    #[test]
    fn test_capacity_bound_evicts_lru() {
        let cache = RecordCache::new(2);

        cache.put(key("a.example"), vec![a_record("a.example", Ipv4Addr::new(1, 1, 1, 1))], 60);
        cache.put(key("b.example"), vec![a_record("b.example", Ipv4Addr::new(2, 2, 2, 2))], 60);

        // touch a so that b becomes the eviction candidate
        assert!(cache.get(&key("a.example")).is_some());

        cache.put(key("c.example"), vec![a_record("c.example", Ipv4Addr::new(3, 3, 3, 3))], 60);

        assert_eq!(2, cache.len());
        assert!(cache.get(&key("a.example")).is_some());
        assert!(cache.get(&key("b.example")).is_none());
        assert!(cache.get(&key("c.example")).is_some());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let cache = RecordCache::new(16);

        cache.put(key("short.example"), vec![a_record("short.example", Ipv4Addr::new(1, 1, 1, 1))], 1);
        cache.put(key("long.example"), vec![a_record("long.example", Ipv4Addr::new(2, 2, 2, 2))], 300);

        sleep(Duration::from_millis(1100));

        assert_eq!(1, cache.sweep());
        assert_eq!(1, cache.len());
        assert!(cache.get(&key("long.example")).is_some());
    }

    #[test]
    fn test_put_overwrites() {
        let cache = RecordCache::new(16);

        cache.put(key("www.example.com"), vec![a_record("www.example.com", Ipv4Addr::new(1, 1, 1, 1))], 60);
        cache.put(key("www.example.com"), vec![a_record("www.example.com", Ipv4Addr::new(9, 9, 9, 9))], 60);

        let hit = cache.get(&key("www.example.com")).unwrap();
        assert_eq!(1, hit.answers.len());
        match &hit.answers[0] {
            DnsRecord::A { addr, .. } => assert_eq!(Ipv4Addr::new(9, 9, 9, 9), *addr),
            other => panic!("expected A record, got {:?}", other),
        }
    }
}
